//! Encode sessions: entries and their data in, a filtered container
//! stream out.

use std::io::{self, Write};
use std::path::Path;

use crate::archive::{self, FormatWriter};
use crate::codes::{Filter, FilterSpec, Format, IntoFilter, IntoFormat, features};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::filter::FilterWriter;
use crate::io::sink::{MemoryBuffer, Sink, SinkWriter, WriteStream};

pub const DEFAULT_BYTES_PER_BLOCK: usize = 10240;

/// Output blocking for the block-structured formats.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub bytes_per_block: usize,
    /// Granularity the final block is padded to; 0 pads to a full block.
    pub bytes_in_last_block: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            bytes_per_block: DEFAULT_BYTES_PER_BLOCK,
            bytes_in_last_block: 0,
        }
    }
}

impl WriteOptions {
    fn padding_unit(&self) -> u64 {
        let unit = if self.bytes_in_last_block == 0 {
            self.bytes_per_block
        } else {
            self.bytes_in_last_block
        };
        unit.max(1) as u64
    }
}

/// The filter stack plus a count of the container bytes pushed into it.
struct Output {
    inner: FilterWriter,
    written: u64,
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct Session {
    codec: Box<dyn FormatWriter>,
    out: Output,
}

/// An encode session bound to one byte sink.
pub struct Writer {
    session: Option<Session>,
    format: Format,
    filter: FilterSpec,
    options: WriteOptions,
}

impl Writer {
    /// Opens a session. Filter and format are resolved and checked before
    /// the sink is touched, so a bad name never leaves partial output.
    pub fn open(
        sink: Sink,
        filter: impl IntoFilter,
        format: impl IntoFormat,
        mut options: WriteOptions,
    ) -> Result<Writer> {
        let filter = filter.into_filter()?;
        let format = format.into_format()?;
        match &filter {
            FilterSpec::Program(_) if !features().program_filters => {
                return Err(Error::open("External programs are not supported on this build"));
            }
            FilterSpec::Program(_) => {}
            FilterSpec::Builtin(Filter::Program) => {
                return Err(Error::open("The program filter needs a command to run"));
            }
            FilterSpec::Builtin(other) => features().require_write_filter(*other)?,
        }
        features().require_write_format(format)?;
        let codec = archive::writer_for(format)?;

        if sink.is_memory() {
            options.bytes_in_last_block = 1;
        }
        let sink = SinkWriter::open(sink).map_err(|e| Error::open_io("Failed to open output", e))?;
        let inner = FilterWriter::new(&filter, sink)?;
        log::debug!("writer opened: filter {}, format {}", filter.filter(), format);

        Ok(Writer {
            session: Some(Session {
                codec,
                out: Output { inner, written: 0 },
            }),
            format,
            filter,
            options,
        })
    }

    pub fn open_filename(
        path: impl AsRef<Path>,
        filter: impl IntoFilter,
        format: impl IntoFormat,
    ) -> Result<Writer> {
        Writer::open(
            Sink::File(path.as_ref().to_path_buf()),
            filter,
            format,
            WriteOptions::default(),
        )
    }

    /// Writes into `buffer`, which the caller keeps a clone of.
    pub fn open_memory(buffer: &MemoryBuffer, filter: impl IntoFilter, format: impl IntoFormat) -> Result<Writer> {
        Writer::open(Sink::Memory(buffer.clone()), filter, format, WriteOptions::default())
    }

    pub fn open_stream(
        stream: impl WriteStream + 'static,
        filter: impl IntoFilter,
        format: impl IntoFormat,
    ) -> Result<Writer> {
        Writer::open(Sink::stream(stream), filter, format, WriteOptions::default())
    }

    /// Runs `body` on a writer that is closed on every exit path. A close
    /// failure is reported only when `body` succeeded.
    pub fn with<T>(
        sink: Sink,
        filter: impl IntoFilter,
        format: impl IntoFormat,
        options: WriteOptions,
        body: impl FnOnce(&mut Writer) -> Result<T>,
    ) -> Result<T> {
        scoped(Writer::open(sink, filter, format, options)?, body)
    }

    pub fn with_filename<T>(
        path: impl AsRef<Path>,
        filter: impl IntoFilter,
        format: impl IntoFormat,
        body: impl FnOnce(&mut Writer) -> Result<T>,
    ) -> Result<T> {
        scoped(Writer::open_filename(path, filter, format)?, body)
    }

    pub fn with_memory<T>(
        buffer: &MemoryBuffer,
        filter: impl IntoFilter,
        format: impl IntoFormat,
        body: impl FnOnce(&mut Writer) -> Result<T>,
    ) -> Result<T> {
        scoped(Writer::open_memory(buffer, filter, format)?, body)
    }

    pub fn with_stream<T>(
        stream: impl WriteStream + 'static,
        filter: impl IntoFilter,
        format: impl IntoFormat,
        body: impl FnOnce(&mut Writer) -> Result<T>,
    ) -> Result<T> {
        scoped(Writer::open_stream(stream, filter, format)?, body)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// A fresh entry for the caller to fill in. It needs at least a
    /// pathname and a file type before [`write_header`](Writer::write_header).
    pub fn new_entry(&self) -> Entry {
        Entry::new()
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(Error::Closed)
    }

    pub fn write_header(&mut self, entry: &Entry) -> Result<()> {
        let session = self.session()?;
        session.codec.write_header(&mut session.out, entry)
    }

    /// Writes data for the current entry. Bytes past the entry's declared
    /// size are dropped; the return value counts what was kept.
    pub fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        let session = self.session()?;
        session.codec.write_data(&mut session.out, data)
    }

    /// Pulls chunks from `next` until it returns `None` or an empty chunk,
    /// or a write is refused. Returns the total accepted.
    pub fn write_data_with(&mut self, mut next: impl FnMut() -> Option<Vec<u8>>) -> Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = next() {
            if chunk.is_empty() {
                break;
            }
            let n = self.write_data(&chunk)?;
            total += n as u64;
            if n == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Builds an entry with `fill` and writes it. When `fill` returns data,
    /// the entry's size is set from it and the data follows the header.
    pub fn add_entry(&mut self, fill: impl FnOnce(&mut Entry) -> Option<Vec<u8>>) -> Result<()> {
        let mut entry = self.new_entry();
        let data = fill(&mut entry);
        if let Some(data) = &data {
            entry.set_size(data.len() as u64);
        }
        self.write_header(&entry)?;
        if let Some(data) = data {
            self.write_data(&data)?;
        }
        Ok(())
    }

    /// Writes the trailer, pads the last block and releases the sink. The
    /// session is gone afterwards even if finishing failed; later calls do
    /// nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let trailer = session.codec.finish(&mut session.out).and_then(|()| {
            if archive::pads_last_block(self.format) {
                let unit = self.options.padding_unit();
                let short = session.out.written % unit;
                if short != 0 {
                    archive::write_zeros(&mut session.out, unit - short)?;
                }
            }
            Ok(())
        });
        let finished = session.out.inner.finish();
        log::debug!("writer closed after {} bytes", session.out.written);
        trailer?;
        finished
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("closing archive writer failed: {e}");
        }
    }
}

fn scoped<T>(mut writer: Writer, body: impl FnOnce(&mut Writer) -> Result<T>) -> Result<T> {
    let result = body(&mut writer);
    let closed = writer.close();
    let value = result?;
    closed?;
    Ok(value)
}
