use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use colored::*;
use humansize::{DECIMAL, format_size};

use super::open_archive;
use crate::cli::output::print_line;
use arcstream::Entry;

pub fn run(archive: &Path, program: Option<&str>, verbose: bool) -> Result<()> {
    let mut reader = open_archive(archive, program)?;
    while let Some(entry) = reader
        .next_header()
        .with_context(|| format!("Reading {}", archive.display()))?
    {
        if verbose {
            print_line!("{}", long_line(&entry));
        } else {
            print_line!("{}", entry.pathname().unwrap_or(""));
        }
    }
    log::debug!(
        "format {}, filters [{}]",
        reader.format().map(|f| f.description()).unwrap_or("none"),
        reader.filters().iter().map(|f| f.name()).collect::<Vec<_>>().join(", ")
    );
    reader.close()?;
    Ok(())
}

fn owner(name: Option<&str>, id: i64) -> String {
    name.map(str::to_string).unwrap_or_else(|| id.to_string())
}

fn long_line(entry: &Entry) -> String {
    let size = if entry.size_is_set() {
        format_size(entry.size(), DECIMAL)
    } else {
        "-".to_string()
    };
    let mtime = entry
        .mtime()
        .and_then(|t| DateTime::from_timestamp(t.secs, t.nsec))
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16));
    let name = entry.pathname().unwrap_or("");
    let name = if entry.is_directory() {
        name.blue().bold().to_string()
    } else if entry.is_symlink() {
        name.cyan().to_string()
    } else {
        name.to_string()
    };
    let mut line = format!(
        "{} {:>8}/{:<8} {:>10} {} {}",
        entry.strmode().trim_end(),
        owner(entry.uname(), entry.uid()),
        owner(entry.gname(), entry.gid()),
        size,
        mtime,
        name
    );
    if let Some(target) = entry.symlink() {
        line.push_str(&format!(" -> {target}"));
    } else if let Some(target) = entry.hardlink() {
        line.push_str(&format!(" link to {target}"));
    }
    line
}
