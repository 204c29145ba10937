//! The "raw" pseudo-format: the whole (filter-decoded) stream is the data
//! of a single entry.

use std::io::{Read, Write};

use crate::codes::Format;
use crate::entry::{Entry, FileType};
use crate::error::{Error, Result};
use crate::io::stream::DecodeStream;

use super::{FormatReader, FormatWriter, Header, require_basics};

pub(crate) struct RawReader {
    served: bool,
    done: bool,
}

impl RawReader {
    pub(crate) fn new() -> Self {
        RawReader {
            served: false,
            done: false,
        }
    }
}

impl FormatReader for RawReader {
    fn format(&self) -> Format {
        Format::Raw
    }

    fn next_header(&mut self, s: &mut DecodeStream) -> Result<Option<Header>> {
        if self.served {
            return Ok(None);
        }
        self.served = true;
        let mut entry = Entry::new();
        entry.set_pathname("data");
        entry.set_filetype(FileType::Regular);
        entry.set_perm(0o644);
        // The length is unknown until the stream is drained.
        entry.unset_size();
        Ok(Some(Header {
            entry,
            position: s.position(),
        }))
    }

    fn read_data(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let n = s.read(buf).map_err(|e| Error::body(e, "raw"))?;
        if n == 0 {
            self.done = true;
        }
        Ok(n)
    }

    fn skip_data(&mut self, _s: &mut DecodeStream) -> Result<()> {
        // Nothing follows the single entry, so there is no need to read it.
        self.done = true;
        Ok(())
    }
}

pub(crate) struct RawWriter {
    entries: usize,
}

impl RawWriter {
    pub(crate) fn new() -> Self {
        RawWriter { entries: 0 }
    }
}

impl FormatWriter for RawWriter {
    fn write_header(&mut self, _out: &mut dyn Write, entry: &Entry) -> Result<()> {
        let path = require_basics(entry)?;
        if !entry.is_regular_file() {
            return Err(Error::format(format!("{path}: raw format only supports regular files")));
        }
        if self.entries > 0 {
            return Err(Error::format("raw format only supports one entry per archive"));
        }
        self.entries += 1;
        Ok(())
    }

    fn write_data(&mut self, out: &mut dyn Write, data: &[u8]) -> Result<usize> {
        if self.entries == 0 {
            return Err(Error::format("raw format needs a header before data"));
        }
        out.write_all(data)?;
        Ok(data.len())
    }

    fn finish(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }
}
