//! Decode sessions: a byte source in, a sequence of entries and their data
//! out.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::Bytes;

use crate::archive::{self, FormatReader};
use crate::codes::{Filter, Format, features};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::extract::{ExtractFlags, extract_entry};
use crate::filter::{self, DETECT_BYTES, LAYER_BUFFER, MAX_FILTERS};
use crate::io::source::{ReadStream, Source, SourceReader};
use crate::io::stream::DecodeStream;

/// Block size used for file sources.
pub const DEFAULT_BLOCK_SIZE: usize = 10240;

/// How a reader session is set up.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// External decompression command; replaces built-in filter detection.
    pub program: Option<String>,
    /// Skips format detection. The only way to read `raw`.
    pub format: Option<Format>,
    pub block_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            program: None,
            format: None,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ReadOptions {
    pub fn program(mut self, command: impl Into<String>) -> Self {
        self.program = Some(command.into());
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }
}

struct Session {
    stream: DecodeStream,
    codec: Option<Box<dyn FormatReader>>,
    detect_filters: bool,
    forced: Option<Format>,
    /// Negotiation failures are sticky; the stream is gone by then.
    broken: Option<String>,
}

/// A decode session bound to one byte source.
///
/// Filters and format are detected on the first [`next_header`] call and
/// stay fixed for the life of the session.
///
/// [`next_header`]: Reader::next_header
pub struct Reader {
    session: Option<Session>,
    filters: Vec<Filter>,
    format: Option<Format>,
    header_position: u64,
}

impl Reader {
    pub fn open(source: Source, options: ReadOptions) -> Result<Reader> {
        let description = source.describe();
        if let Some(format) = options.format {
            if !features().can_read_format(format) {
                return Err(Error::open(format!(
                    "Reading {} is not supported on this build",
                    format.description()
                )));
            }
        }
        let capacity = match source {
            Source::File(_) => options.block_size.max(512),
            _ => LAYER_BUFFER,
        };
        let binding = SourceReader::open(source)
            .map_err(|e| Error::open_io(format!("Failed to open {description}"), e))?;
        let mut stream = DecodeStream::new(Box::new(binding), capacity);

        let mut filters = Vec::new();
        if let Some(command) = &options.program {
            if !features().program_filters {
                return Err(Error::open("External programs are not supported on this build"));
            }
            stream = DecodeStream::new(filter::program_decoder(command, stream)?, LAYER_BUFFER);
            filters.push(Filter::Program);
        }
        log::debug!("reader opened on {description}");

        Ok(Reader {
            session: Some(Session {
                stream,
                codec: None,
                detect_filters: options.program.is_none(),
                forced: options.format,
                broken: None,
            }),
            filters,
            format: None,
            header_position: 0,
        })
    }

    pub fn open_filename(path: impl AsRef<Path>, program: Option<&str>) -> Result<Reader> {
        Reader::open(
            Source::File(path.as_ref().to_path_buf()),
            ReadOptions {
                program: program.map(str::to_string),
                ..ReadOptions::default()
            },
        )
    }

    pub fn open_memory(data: impl Into<Bytes>, program: Option<&str>) -> Result<Reader> {
        Reader::open(
            Source::Memory(data.into()),
            ReadOptions {
                program: program.map(str::to_string),
                ..ReadOptions::default()
            },
        )
    }

    pub fn open_stream(stream: impl ReadStream + 'static, program: Option<&str>) -> Result<Reader> {
        Reader::open(
            Source::stream(stream),
            ReadOptions {
                program: program.map(str::to_string),
                ..ReadOptions::default()
            },
        )
    }

    /// Runs `body` on a reader that is closed on every exit path. A close
    /// failure is reported only when `body` succeeded.
    pub fn with<T>(source: Source, options: ReadOptions, body: impl FnOnce(&mut Reader) -> Result<T>) -> Result<T> {
        scoped(Reader::open(source, options)?, body)
    }

    pub fn with_filename<T>(
        path: impl AsRef<Path>,
        program: Option<&str>,
        body: impl FnOnce(&mut Reader) -> Result<T>,
    ) -> Result<T> {
        scoped(Reader::open_filename(path, program)?, body)
    }

    pub fn with_memory<T>(
        data: impl Into<Bytes>,
        program: Option<&str>,
        body: impl FnOnce(&mut Reader) -> Result<T>,
    ) -> Result<T> {
        scoped(Reader::open_memory(data, program)?, body)
    }

    pub fn with_stream<T>(
        stream: impl ReadStream + 'static,
        program: Option<&str>,
        body: impl FnOnce(&mut Reader) -> Result<T>,
    ) -> Result<T> {
        scoped(Reader::open_stream(stream, program)?, body)
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(Error::Closed)
    }

    /// Stacks decoders until the data no longer looks compressed, then
    /// picks the container format.
    fn negotiate(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::Closed)?;
        if session.codec.is_some() {
            return Ok(());
        }
        if let Some(message) = &session.broken {
            return Err(Error::format(message.clone()));
        }

        let result = (|| -> Result<Box<dyn FormatReader>> {
            if session.detect_filters {
                while self.filters.len() < MAX_FILTERS {
                    let head = session.stream.peek(DETECT_BYTES).map_err(Error::Io)?;
                    let Some(found) = filter::detect(head) else {
                        break;
                    };
                    let below = std::mem::replace(
                        &mut session.stream,
                        DecodeStream::new(Box::new(io::empty()), 0),
                    );
                    session.stream = DecodeStream::new(filter::decoder(found, below)?, LAYER_BUFFER);
                    self.filters.push(found);
                }
            }
            match session.forced {
                Some(format) => archive::reader_for(format, &mut session.stream),
                None => archive::detect(&mut session.stream),
            }
        })();

        match result {
            Ok(codec) => {
                log::debug!(
                    "negotiated filters [{}], format {}",
                    self.filters.iter().map(|f| f.name()).collect::<Vec<_>>().join(", "),
                    codec.format()
                );
                self.format = Some(codec.format());
                session.codec = Some(codec);
                Ok(())
            }
            Err(e) => {
                session.broken = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Advances past the rest of the current entry and decodes the next
    /// header. `None` marks a clean end of archive; asking again keeps
    /// returning `None`.
    ///
    /// The returned entry is a detached copy and stays valid after later
    /// calls.
    pub fn next_header(&mut self) -> Result<Option<Entry>> {
        self.negotiate()?;
        let session = self.session()?;
        let Some(codec) = session.codec.as_mut() else {
            return Ok(None);
        };
        let header = codec.next_header(&mut session.stream)?;
        let format = codec.format();
        self.format = Some(format);
        Ok(header.map(|h| {
            self.header_position = h.position;
            h.entry
        }))
    }

    /// Reads the next piece of the current entry's data into `buf`.
    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        let session = self.session()?;
        match session.codec.as_mut() {
            Some(codec) => codec.read_data(&mut session.stream, buf),
            None => Ok(0),
        }
    }

    /// Reads the rest of the current entry's data, `size` bytes at a time.
    pub fn read_data(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read_data_with(size, |chunk| data.extend_from_slice(chunk))?;
        Ok(data)
    }

    /// Streams the rest of the current entry to `f` in chunks of at most
    /// `size` bytes. Returns the total length.
    pub fn read_data_with(&mut self, size: usize, mut f: impl FnMut(&[u8])) -> Result<u64> {
        if size == 0 {
            return Err(Error::Argument("buffer size must be positive".to_string()));
        }
        let mut buf = vec![0u8; size];
        let mut total = 0u64;
        loop {
            let n = self.read_block(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            f(&buf[..n]);
            total += n as u64;
        }
    }

    /// The current entry's data as an iterator of owned chunks.
    pub fn data_chunks(&mut self, size: usize) -> DataChunks<'_> {
        DataChunks {
            reader: self,
            buf: vec![0u8; size],
            done: false,
        }
    }

    /// The current entry's data as a [`Read`].
    pub fn data(&mut self) -> EntryData<'_> {
        EntryData { reader: self }
    }

    /// Writes the current entry's data to a new file at `path`.
    pub fn save_data(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| Error::extract_io(path, "Can't create", e))?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read_block(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| Error::extract_io(path, "Write failed", e))?;
            total += n as u64;
        }
        file.flush().map_err(|e| Error::extract_io(path, "Write failed", e))?;
        Ok(total)
    }

    pub fn skip_data(&mut self) -> Result<()> {
        let session = self.session()?;
        match session.codec.as_mut() {
            Some(codec) => codec.skip_data(&mut session.stream),
            None => Ok(()),
        }
    }

    /// Offset in the decoded stream where the current entry's header began.
    pub fn header_position(&self) -> u64 {
        self.header_position
    }

    /// The detected (or forced) format, once negotiated.
    pub fn format(&self) -> Option<Format> {
        self.format
    }

    /// Filters detected on the way in, outermost first.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Calls `f` for every remaining entry.
    pub fn each_entry(&mut self, mut f: impl FnMut(&mut Reader, &Entry) -> Result<()>) -> Result<()> {
        while let Some(entry) = self.next_header()? {
            f(self, &entry)?;
        }
        Ok(())
    }

    /// Calls `f` with every remaining entry and its full data.
    pub fn each_entry_with_data(
        &mut self,
        size: usize,
        mut f: impl FnMut(&Entry, Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        while let Some(entry) = self.next_header()? {
            let data = self.read_data(size)?;
            f(&entry, data)?;
        }
        Ok(())
    }

    /// Calls `f` for every remaining entry, skipping its data afterwards
    /// even when `f` fails.
    pub fn each_entry_skip_data(&mut self, mut f: impl FnMut(&Entry) -> Result<()>) -> Result<()> {
        while let Some(entry) = self.next_header()? {
            let result = f(&entry);
            self.skip_data()?;
            result?;
        }
        Ok(())
    }

    /// Extracts `entry` (the current one) relative to the working
    /// directory.
    pub fn extract(&mut self, entry: &Entry, flags: ExtractFlags) -> Result<()> {
        self.extract_to(entry, Path::new("."), flags)
    }

    /// Extracts `entry` (the current one) below `base`. File-attribute
    /// flags are always restored.
    pub fn extract_to(&mut self, entry: &Entry, base: impl AsRef<Path>, flags: ExtractFlags) -> Result<()> {
        self.session()?;
        let flags = flags | ExtractFlags::FFLAGS;
        extract_entry(entry, base.as_ref(), flags, &mut |buf: &mut [u8]| self.read_block(buf))
    }

    /// Releases the session. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.session.take().is_some() {
            log::debug!("reader closed");
        }
        Ok(())
    }
}

fn scoped<T>(mut reader: Reader, body: impl FnOnce(&mut Reader) -> Result<T>) -> Result<T> {
    let result = body(&mut reader);
    let closed = reader.close();
    let value = result?;
    closed?;
    Ok(value)
}

/// Iterator over the current entry's data; see [`Reader::data_chunks`].
pub struct DataChunks<'a> {
    reader: &'a mut Reader,
    buf: Vec<u8>,
    done: bool,
}

impl Iterator for DataChunks<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.buf.is_empty() {
            self.done = true;
            return Some(Err(Error::Argument("buffer size must be positive".to_string())));
        }
        match self.reader.read_block(&mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => Some(Ok(self.buf[..n].to_vec())),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// [`Read`] adapter over the current entry's data.
pub struct EntryData<'a> {
    reader: &'a mut Reader,
}

impl Read for EntryData<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read_block(buf).map_err(|e| match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = ::tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = ::tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_reads_entries_and_positions() {
        let data = tar_with(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let mut reader = Reader::open_memory(data, None).unwrap();

        let first = reader.next_header().unwrap().unwrap();
        assert_eq!(first.pathname(), Some("a.txt"));
        assert_eq!(reader.header_position(), 0);
        assert_eq!(reader.read_data(2).unwrap(), b"alpha");

        let second = reader.next_header().unwrap().unwrap();
        assert_eq!(second.pathname(), Some("b.txt"));
        assert_eq!(reader.header_position(), 1024);
        assert!(reader.next_header().unwrap().is_none());
        assert!(reader.next_header().unwrap().is_none());
        assert_eq!(reader.format(), Some(Format::TarUstar));
        assert!(reader.filters().is_empty());
    }

    #[test]
    fn test_zero_buffer_is_argument_error() {
        let mut reader = Reader::open_memory(tar_with(&[("a", b"x")]), None).unwrap();
        reader.next_header().unwrap();
        assert_eq!(reader.read_data(0).unwrap_err().kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_closed_reader_refuses_work() {
        let mut reader = Reader::open_memory(tar_with(&[("a", b"x")]), None).unwrap();
        reader.close().unwrap();
        reader.close().unwrap();
        assert!(reader.is_closed());
        assert_eq!(reader.next_header().unwrap_err().kind(), ErrorKind::Closed);
        assert_eq!(reader.read_data(16).unwrap_err().kind(), ErrorKind::Closed);
    }

    #[test]
    fn test_garbage_fails_on_first_header_and_stays_failed() {
        let mut reader = Reader::open_memory(&b"definitely not an archive"[..], None).unwrap();
        let err = reader.next_header().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(reader.next_header().unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn test_each_entry_skip_data_skips_after_failure() {
        let data = tar_with(&[("a", b"1"), ("b", b"2")]);
        let mut seen = Vec::new();
        let mut reader = Reader::open_memory(data, None).unwrap();
        let err = reader
            .each_entry_skip_data(|e| {
                seen.push(e.pathname().unwrap_or("").to_string());
                Err(Error::Argument("stop".to_string()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(seen, ["a"]);
        assert_eq!(reader.next_header().unwrap().unwrap().pathname(), Some("b"));
    }

    #[test]
    fn test_data_chunks_and_read_adapter() {
        let payload = b"0123456789".repeat(30);
        let data = tar_with(&[("a", &payload), ("b", &payload)]);
        let mut reader = Reader::open_memory(data, None).unwrap();

        reader.next_header().unwrap();
        let chunks: Vec<Vec<u8>> = reader.data_chunks(7).collect::<Result<_>>().unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 7));
        assert_eq!(chunks.concat(), payload);

        reader.next_header().unwrap();
        let mut out = Vec::new();
        reader.data().read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_forced_raw_format() {
        let options = ReadOptions::default().format(Format::Raw);
        let mut reader = Reader::open(Source::Memory(Bytes::from_static(b"just bytes")), options).unwrap();
        let entry = reader.next_header().unwrap().unwrap();
        assert_eq!(entry.pathname(), Some("data"));
        assert_eq!(reader.read_data(3).unwrap(), b"just bytes");
        assert!(reader.next_header().unwrap().is_none());
    }

    #[test]
    fn test_scoped_reader_surfaces_body_error() {
        let err = Reader::with_memory(tar_with(&[("a", b"")]), None, |r| {
            r.next_header()?;
            Err::<(), _>(Error::Argument("body".to_string()))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: body");
    }
}
