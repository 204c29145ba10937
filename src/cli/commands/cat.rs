use std::io;
use std::path::Path;

use anyhow::{Result, bail};

use super::open_archive;
use crate::cli::output::write_stdout;

/// Writes the data of every member named `member` to stdout.
pub fn run(archive: &Path, program: Option<&str>, member: &str) -> Result<()> {
    let mut reader = open_archive(archive, program)?;
    let mut found = false;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    while let Some(entry) = reader.next_header()? {
        if entry.pathname().map(|p| p.trim_end_matches('/')) != Some(member.trim_end_matches('/')) {
            continue;
        }
        found = true;
        for chunk in reader.data_chunks(64 * 1024) {
            if !write_stdout(&mut out, &chunk?)? {
                return Ok(());
            }
        }
    }
    reader.close()?;
    if !found {
        bail!("{member}: not found in archive");
    }
    Ok(())
}
