//! Container codecs. Each format frames entries inside the (already
//! filter-decoded) byte stream; readers pull through a [`DecodeStream`],
//! writers push into whatever [`Write`] the session stacked below them.

pub mod cpio;
pub mod raw;
pub mod tar;
pub mod zip;

use std::io::{self, Write};

use crate::codes::Format;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::io::stream::DecodeStream;

/// How many leading bytes format detection looks at.
const DETECT_BYTES: usize = 512;

/// An entry as decoded, plus where its first header byte sat in the
/// decoded stream.
pub(crate) struct Header {
    pub entry: Entry,
    pub position: u64,
}

/// Decoding half of a container format.
pub(crate) trait FormatReader: Send {
    /// The format as currently known. Tar refines this once it has seen
    /// the first header.
    fn format(&self) -> Format;

    /// Moves past whatever is left of the current entry and decodes the
    /// next header. `None` is a clean end of archive.
    fn next_header(&mut self, s: &mut DecodeStream) -> Result<Option<Header>>;

    /// Reads current entry data; 0 once the entry is exhausted.
    fn read_data(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize>;

    fn skip_data(&mut self, s: &mut DecodeStream) -> Result<()>;
}

/// Encoding half of a container format.
pub(crate) trait FormatWriter: Send {
    /// Completes the previous entry and writes a header for `entry`.
    fn write_header(&mut self, out: &mut dyn Write, entry: &Entry) -> Result<()>;

    /// Writes data for the current entry; returns how much was accepted.
    fn write_data(&mut self, out: &mut dyn Write, data: &[u8]) -> Result<usize>;

    /// Completes the last entry and writes the trailer.
    fn finish(&mut self, out: &mut dyn Write) -> Result<()>;
}

/// Sniffs the start of `s` and picks a reader for it.
pub(crate) fn detect(s: &mut DecodeStream) -> Result<Box<dyn FormatReader>> {
    let seekable = s.can_seek();
    let head = s.peek(DETECT_BYTES).map_err(Error::Io)?;

    if head.is_empty() {
        return Ok(Box::new(EmptyReader));
    }
    if tar::is_tar(head) {
        return Ok(Box::new(tar::TarReader::new()));
    }
    if zip::is_zip(head) {
        return Ok(Box::new(zip::ZipReader::new(seekable)));
    }
    if let Some(format) = cpio::detect(head) {
        return Ok(Box::new(cpio::CpioReader::new(format)));
    }
    if let Some(name) = unsupported_format(head) {
        return Err(Error::format(format!("{name} archives are not supported on this build")));
    }
    Err(Error::format("Unrecognized archive format"))
}

/// A reader for a format the caller insisted on, skipping detection.
pub(crate) fn reader_for(format: Format, s: &mut DecodeStream) -> Result<Box<dyn FormatReader>> {
    match format {
        Format::Raw => Ok(Box::new(raw::RawReader::new())),
        Format::Empty => Ok(Box::new(EmptyReader)),
        Format::Zip => Ok(Box::new(zip::ZipReader::new(s.can_seek()))),
        f if f.is_tar() => Ok(Box::new(tar::TarReader::new())),
        f if f.is_cpio() => {
            let head = s.peek(DETECT_BYTES).map_err(Error::Io)?;
            let variant = cpio::detect(head).unwrap_or(f);
            Ok(Box::new(cpio::CpioReader::new(variant)))
        }
        other => Err(Error::open(format!(
            "Reading {} is not supported on this build",
            other.description()
        ))),
    }
}

pub(crate) fn writer_for(format: Format) -> Result<Box<dyn FormatWriter>> {
    match format {
        Format::Zip => Ok(Box::new(zip::ZipWriter::new())),
        Format::Raw => Ok(Box::new(raw::RawWriter::new())),
        Format::Tar => Ok(Box::new(tar::TarWriter::new(Format::TarPaxRestricted))),
        f if f.is_tar() => Ok(Box::new(tar::TarWriter::new(f))),
        Format::Cpio => Ok(Box::new(cpio::CpioWriter::new(Format::CpioPosix)?)),
        f if f.is_cpio() => Ok(Box::new(cpio::CpioWriter::new(f)?)),
        other => Err(Error::open(format!(
            "Writing {} is not supported on this build",
            other.description()
        ))),
    }
}

/// Block-structured formats get their final block padded on close.
pub(crate) fn pads_last_block(format: Format) -> bool {
    format.is_tar() || format.is_cpio()
}

fn unsupported_format(head: &[u8]) -> Option<&'static str> {
    const MAGICS: [(&[u8], &str); 9] = [
        (b"7z\xBC\xAF\x27\x1C", "7-Zip"),
        (b"Rar!\x1A\x07\x01\x00", "RAR5"),
        (b"Rar!\x1A\x07", "RAR"),
        (b"!<arch>\n", "ar"),
        (b"xar!", "xar"),
        (b"MSCF", "cab"),
        (b"WARC/", "WARC"),
        (b"#mtree", "mtree"),
        (b"#!/bin/sh\n# This is a shell archive", "shar"),
    ];
    MAGICS.iter().find(|(magic, _)| head.starts_with(magic)).map(|(_, name)| *name)
}

/// Zero-length input: a valid archive with no entries.
struct EmptyReader;

impl FormatReader for EmptyReader {
    fn format(&self) -> Format {
        Format::Empty
    }

    fn next_header(&mut self, _s: &mut DecodeStream) -> Result<Option<Header>> {
        Ok(None)
    }

    fn read_data(&mut self, _s: &mut DecodeStream, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn skip_data(&mut self, _s: &mut DecodeStream) -> Result<()> {
        Ok(())
    }
}

/// Tracks the declared size of the entry being written: writes past it
/// are truncated, and a shortfall is zero-filled when the entry ends.
#[derive(Debug, Default)]
pub(crate) struct DataBudget {
    pathname: String,
    remaining: u64,
}

impl DataBudget {
    pub(crate) fn start(&mut self, pathname: &str, size: u64) {
        self.pathname = pathname.to_string();
        self.remaining = size;
    }

    /// How much of a `len`-byte write fits.
    pub(crate) fn accept(&mut self, len: usize) -> usize {
        let n = (len as u64).min(self.remaining) as usize;
        self.remaining -= n as u64;
        n
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Pads out whatever the caller never wrote.
    pub(crate) fn fill(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if self.remaining > 0 {
            log::warn!(
                "{}: {} bytes of data missing, padding with zeros",
                self.pathname,
                self.remaining
            );
            write_zeros(out, self.remaining)?;
            self.remaining = 0;
        }
        Ok(())
    }
}

pub(crate) fn write_zeros(out: &mut dyn Write, mut n: u64) -> io::Result<()> {
    const ZEROS: [u8; 4096] = [0; 4096];
    while n > 0 {
        let chunk = n.min(ZEROS.len() as u64) as usize;
        out.write_all(&ZEROS[..chunk])?;
        n -= chunk as u64;
    }
    Ok(())
}

/// Rejects entries a writer cannot describe at all.
pub(crate) fn require_basics(entry: &Entry) -> Result<&str> {
    let path = entry
        .pathname()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::format("Can't write an entry without a pathname"))?;
    if entry.filetype().is_none() {
        return Err(Error::format(format!("{path}: entry has no file type")));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FileType;
    use crate::io::source::{Source, SourceReader};
    use bytes::Bytes;

    fn stream(data: Vec<u8>) -> DecodeStream {
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        DecodeStream::new(Box::new(src), 512)
    }

    #[test]
    fn test_detect_empty_input() {
        let mut s = stream(Vec::new());
        let mut reader = detect(&mut s).unwrap();
        assert_eq!(reader.format(), Format::Empty);
        assert!(reader.next_header(&mut s).unwrap().is_none());
    }

    #[test]
    fn test_detect_rejects_garbage() {
        let mut s = stream(b"this is not an archive at all".to_vec());
        let err = detect(&mut s).err().unwrap();
        assert_eq!(err.to_string(), "Unrecognized archive format");
    }

    #[test]
    fn test_detect_names_known_unsupported_format() {
        let mut s = stream(b"7z\xBC\xAF\x27\x1C\x00\x04".to_vec());
        let err = detect(&mut s).err().unwrap();
        assert!(err.to_string().starts_with("7-Zip"));
    }

    #[test]
    fn test_budget_truncates_and_fills() {
        let mut budget = DataBudget::default();
        budget.start("a", 5);
        assert_eq!(budget.accept(3), 3);
        assert_eq!(budget.accept(3), 2);
        assert_eq!(budget.accept(1), 0);

        budget.start("b", 4);
        budget.accept(1);
        let mut out = Vec::new();
        budget.fill(&mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0]);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_require_basics() {
        let mut e = Entry::new();
        assert!(require_basics(&e).is_err());
        e.set_pathname("x");
        assert!(require_basics(&e).is_err());
        e.set_filetype(FileType::Regular);
        assert_eq!(require_basics(&e).unwrap(), "x");
    }
}
