//! Where archive bytes come from.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;

/// Optional abilities of a [`ReadStream`], queried once when a reader binds
/// to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub skip: bool,
    pub seek: bool,
}

/// Caller-supplied pull source.
///
/// `read` is required. `skip` and `seek` are only called when
/// [`capabilities`](ReadStream::capabilities) advertises them; without them
/// the reader falls back to sequential read-and-discard.
pub trait ReadStream: Send {
    /// Fills `buf` with the next bytes. `Ok(0)` is a clean end of stream,
    /// which also serves as the way to cancel a read in progress.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Moves forward by up to `n` bytes, returning how far it got.
    fn skip(&mut self, _n: u64) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream cannot skip"))
    }

    /// Repositions the stream, returning the new absolute offset.
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream cannot seek"))
    }
}

/// A sequential [`ReadStream`] over any [`Read`].
pub struct StreamReader<R> {
    inner: R,
}

impl<R: Read + Send> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        StreamReader { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Send> ReadStream for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// A [`ReadStream`] over a seekable reader that offers both skip and seek.
pub struct SeekableReader<R> {
    inner: R,
}

impl<R: Read + Seek + Send> SeekableReader<R> {
    pub fn new(inner: R) -> Self {
        SeekableReader { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> ReadStream for SeekableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            skip: true,
            seek: true,
        }
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let start = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        let target = start.saturating_add(n).min(end);
        self.inner.seek(SeekFrom::Start(target))?;
        Ok(target - start)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// A [`ReadStream`] driven by a closure that hands out whole chunks and
/// returns `None` once exhausted.
pub struct ChunkFn<F> {
    next: F,
    pending: Bytes,
}

impl<F> ChunkFn<F>
where
    F: FnMut() -> Option<Vec<u8>> + Send,
{
    pub fn new(next: F) -> Self {
        ChunkFn {
            next,
            pending: Bytes::new(),
        }
    }
}

impl<F> ReadStream for ChunkFn<F>
where
    F: FnMut() -> Option<Vec<u8>> + Send,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match (self.next)() {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => self.pending = Bytes::from(chunk),
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

/// The binding a reader session is attached to.
pub enum Source {
    File(PathBuf),
    Memory(Bytes),
    Stream(Box<dyn ReadStream>),
}

impl Source {
    pub fn stream(stream: impl ReadStream + 'static) -> Self {
        Source::Stream(Box::new(stream))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Source::File(path) => path.display().to_string(),
            Source::Memory(bytes) => format!("<memory: {} bytes>", bytes.len()),
            Source::Stream(_) => "<stream>".to_string(),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

enum Binding {
    File(File),
    Memory(Cursor<Bytes>),
    Stream(Box<dyn ReadStream>, Capabilities),
}

/// An opened [`Source`]: the lowest layer of a reader's pipeline.
pub(crate) struct SourceReader {
    binding: Binding,
}

impl SourceReader {
    pub(crate) fn open(source: Source) -> io::Result<Self> {
        let binding = match source {
            Source::File(path) => Binding::File(File::open(path)?),
            Source::Memory(bytes) => Binding::Memory(Cursor::new(bytes)),
            Source::Stream(stream) => {
                let caps = stream.capabilities();
                Binding::Stream(stream, caps)
            }
        };
        Ok(SourceReader { binding })
    }

    pub(crate) fn can_seek(&self) -> bool {
        match &self.binding {
            Binding::File(_) | Binding::Memory(_) => true,
            Binding::Stream(_, caps) => caps.seek,
        }
    }

    pub(crate) fn can_skip(&self) -> bool {
        match &self.binding {
            Binding::File(_) | Binding::Memory(_) => true,
            Binding::Stream(_, caps) => caps.skip,
        }
    }

    /// Advances up to `n` bytes without reading them. Returns how many were
    /// skipped; the caller discards the rest by reading.
    pub(crate) fn skip(&mut self, n: u64) -> io::Result<u64> {
        match &mut self.binding {
            Binding::File(f) => skip_seekable(f, n),
            Binding::Memory(c) => skip_seekable(c, n),
            Binding::Stream(s, caps) if caps.skip => s.skip(n),
            Binding::Stream(..) => Ok(0),
        }
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.binding {
            Binding::File(f) => f.seek(pos),
            Binding::Memory(c) => c.seek(pos),
            Binding::Stream(s, caps) if caps.seek => s.seek(pos),
            Binding::Stream(..) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "source does not support seeking",
            )),
        }
    }
}

fn skip_seekable<S: Seek>(s: &mut S, n: u64) -> io::Result<u64> {
    let start = s.stream_position()?;
    let end = s.seek(SeekFrom::End(0))?;
    let target = start.saturating_add(n).min(end);
    s.seek(SeekFrom::Start(target))?;
    Ok(target - start)
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.binding {
            Binding::File(f) => f.read(buf),
            Binding::Memory(c) => c.read(buf),
            Binding::Stream(s, _) => {
                let n = s.read(buf)?;
                if n > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("read callback reported {n} bytes for a {} byte buffer", buf.len()),
                    ));
                }
                Ok(n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_fn_splits_chunks() {
        let mut chunks = vec![b"hello".to_vec(), Vec::new(), b" world".to_vec()].into_iter();
        let mut stream = ChunkFn::new(move || chunks.next());
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_memory_source_skip_is_bounded() {
        let mut src = SourceReader::open(Source::Memory(Bytes::from_static(b"0123456789"))).unwrap();
        assert_eq!(src.skip(4).unwrap(), 4);
        let mut buf = [0u8; 2];
        src.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"45");
        assert_eq!(src.skip(100).unwrap(), 4);
    }

    #[test]
    fn test_sequential_stream_cannot_seek() {
        let stream = StreamReader::new(Cursor::new(vec![1u8, 2, 3]));
        let mut src = SourceReader::open(Source::stream(stream)).unwrap();
        assert!(!src.can_seek());
        assert_eq!(src.skip(2).unwrap(), 0);
        assert!(src.seek(SeekFrom::Start(0)).is_err());
    }
}
