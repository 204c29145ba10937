//! Where archive bytes go.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

/// Caller-supplied push sink.
pub trait WriteStream: Send {
    /// Accepts some prefix of `buf` and returns its length. Returning 0
    /// for a non-empty buffer means the sink refuses more bytes.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called once after the last byte has been written.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A [`WriteStream`] over any [`Write`].
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: Write + Send> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        StreamWriter { inner }
    }
}

impl<W: Write + Send> WriteStream for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Growable in-memory sink shared between a writer and the caller.
///
/// Clones refer to the same buffer, so the caller keeps one handle and
/// gives another to [`Writer::open_memory`](crate::Writer::open_memory).
#[derive(Clone, Default)]
pub struct MemoryBuffer {
    inner: Arc<Mutex<BytesMut>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the bytes written so far.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().to_vec()
    }

    /// Removes and returns everything written so far.
    pub fn take(&self) -> Bytes {
        self.lock().split().freeze()
    }

    fn append(&self, buf: &[u8]) {
        self.lock().extend_from_slice(buf);
    }
}

impl std::fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer").field("len", &self.len()).finish()
    }
}

/// The binding a writer session is attached to.
pub enum Sink {
    File(PathBuf),
    Memory(MemoryBuffer),
    Stream(Box<dyn WriteStream>),
}

impl Sink {
    pub fn stream(stream: impl WriteStream + 'static) -> Self {
        Sink::Stream(Box::new(stream))
    }

    pub(crate) fn is_memory(&self) -> bool {
        matches!(self, Sink::Memory(_))
    }
}

enum Binding {
    File(BufWriter<File>),
    Memory(MemoryBuffer),
    Stream(Box<dyn WriteStream>),
}

/// An opened [`Sink`]: the last layer of a writer's pipeline.
pub(crate) struct SinkWriter {
    binding: Binding,
}

impl SinkWriter {
    pub(crate) fn open(sink: Sink) -> io::Result<Self> {
        let binding = match sink {
            Sink::File(path) => Binding::File(BufWriter::with_capacity(64 * 1024, File::create(path)?)),
            Sink::Memory(buffer) => Binding::Memory(buffer),
            Sink::Stream(stream) => Binding::Stream(stream),
        };
        Ok(SinkWriter { binding })
    }

    /// Flushes and releases the binding.
    pub(crate) fn close(mut self) -> io::Result<()> {
        match &mut self.binding {
            Binding::File(f) => {
                f.flush()?;
                f.get_ref().sync_data().or_else(|e| {
                    // Special files (pipes, /dev/stdout) cannot be synced.
                    if e.kind() == io::ErrorKind::InvalidInput { Ok(()) } else { Err(e) }
                })
            }
            Binding::Memory(_) => Ok(()),
            Binding::Stream(s) => {
                s.flush()?;
                s.close()
            }
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut self.binding {
            Binding::File(f) => f.write(buf),
            Binding::Memory(m) => {
                m.append(buf);
                Ok(buf.len())
            }
            Binding::Stream(s) => {
                let n = s.write(buf)?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "sink rejected bytes"));
                }
                Ok(n.min(buf.len()))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.binding {
            Binding::File(f) => f.flush(),
            Binding::Memory(_) => Ok(()),
            Binding::Stream(s) => s.flush(),
        }
    }
}
