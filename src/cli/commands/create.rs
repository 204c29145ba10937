use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use arcstream::{Entry, FilterSpec, Format, IntoFilter, IntoFormat, Sink, WriteOptions, Writer};

pub struct Options<'a> {
    pub filter: &'a str,
    pub program: Option<&'a str>,
    pub format: &'a str,
    pub verbose: bool,
}

/// Archives `inputs` (directories recursively) into `output`, `-` meaning
/// stdout.
pub fn run(output: &Path, inputs: &[PathBuf], options: &Options<'_>) -> Result<()> {
    let filter = match options.program {
        Some(command) => FilterSpec::program(command),
        None => options.filter.into_filter()?,
    };
    let format: Format = options.format.into_format()?;
    let sink = if output == Path::new("-") {
        Sink::stream(arcstream::StreamWriter::new(std::io::stdout()))
    } else {
        Sink::File(output.to_path_buf())
    };
    let mut writer = Writer::open(sink, filter, format, WriteOptions::default())
        .with_context(|| format!("Failed to create {}", output.display()))?;

    // (dev, ino) of files already stored, for hard links
    let mut seen: HashMap<(u64, u64), String> = HashMap::new();
    for input in inputs {
        for item in WalkDir::new(input).sort_by_file_name() {
            let item = item.with_context(|| format!("Walking {}", input.display()))?;
            add_path(&mut writer, item.path(), &mut seen, options.verbose)?;
        }
    }
    writer.close().context("Failed to finish archive")?;
    Ok(())
}

fn archive_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    let name = name.trim_start_matches("./").trim_start_matches('/');
    if name.is_empty() { ".".to_string() } else { name.to_string() }
}

fn add_path(writer: &mut Writer, path: &Path, seen: &mut HashMap<(u64, u64), String>, verbose: bool) -> Result<()> {
    let mut entry = Entry::new();
    entry
        .copy_lstat(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let name = archive_name(path);
    entry.set_pathname(name.clone());
    if verbose {
        eprintln!("a {name}");
    }

    if entry.is_symlink() {
        let target = std::fs::read_link(path).with_context(|| format!("Failed to read link {}", path.display()))?;
        entry.set_symlink(target.to_string_lossy().into_owned());
        entry.set_size(0);
    } else if entry.is_directory() {
        entry.set_size(0);
    } else if entry.is_regular_file() && entry.nlink() > 1 {
        let key = (entry.dev(), entry.ino());
        if let Some(first) = seen.get(&key) {
            entry.set_hardlink(first.clone());
            entry.set_size(0);
            writer.write_header(&entry)?;
            return Ok(());
        }
        seen.insert(key, name);
    }

    writer.write_header(&entry)?;
    if entry.is_regular_file() && entry.size() > 0 {
        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).with_context(|| format!("Failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            writer.write_data(&buf[..n])?;
        }
    }
    Ok(())
}
