//! One module per subcommand.

pub mod cat;
pub mod create;
pub mod extract;
pub mod list;

use std::path::Path;

use anyhow::{Context, Result};
use arcstream::Reader;

/// Opens an archive for reading, `-` meaning stdin.
pub(crate) fn open_archive(path: &Path, program: Option<&str>) -> Result<Reader> {
    let reader = if path == Path::new("-") {
        Reader::open_stream(arcstream::StreamReader::new(std::io::stdin()), program)
    } else {
        Reader::open_filename(path, program)
    };
    reader.with_context(|| format!("Failed to open {}", path.display()))
}
