use std::path::Path;

use anyhow::{Context, Result};

use super::open_archive;
use arcstream::ExtractFlags;

pub struct Options<'a> {
    pub directory: Option<&'a Path>,
    pub preserve: bool,
    pub keep: bool,
    pub verbose: bool,
}

pub fn run(archive: &Path, program: Option<&str>, options: &Options<'_>) -> Result<()> {
    let mut flags =
        ExtractFlags::SECURE_SYMLINKS | ExtractFlags::SECURE_NODOTDOT | ExtractFlags::SECURE_NOABSOLUTEPATHS;
    if options.preserve {
        flags |= ExtractFlags::PERM | ExtractFlags::TIME | ExtractFlags::ACL | ExtractFlags::XATTR;
    }
    if options.keep {
        flags |= ExtractFlags::NO_OVERWRITE;
    }
    let base = options.directory.unwrap_or(Path::new("."));
    if let Some(dir) = options.directory {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let mut reader = open_archive(archive, program)?;
    while let Some(entry) = reader.next_header()? {
        if options.verbose {
            eprintln!("x {}", entry.pathname().unwrap_or(""));
        }
        reader.extract_to(&entry, base, flags)?;
    }
    reader.close()?;
    Ok(())
}
