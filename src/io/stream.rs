use std::io::{self, BufRead, Read, SeekFrom};

use super::source::SourceReader;

/// One stage of a reader pipeline: the raw binding or a filter decoder.
pub(crate) trait Layer: Read + Send {
    /// Skips natively, returning how many bytes were passed over. Layers
    /// that cannot skip return 0 and the caller reads instead.
    fn skip(&mut self, _n: u64) -> io::Result<u64> {
        Ok(0)
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream is not seekable"))
    }

    fn can_seek(&self) -> bool {
        false
    }
}

impl Layer for SourceReader {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        if self.can_skip() { SourceReader::skip(self, n) } else { Ok(0) }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        SourceReader::seek(self, pos)
    }

    fn can_seek(&self) -> bool {
        SourceReader::can_seek(self)
    }
}

/// Output of a filter decoder; sequential only.
pub(crate) struct Decoded<R>(pub R);

impl<R: Read + Send> Read for Decoded<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Send> Layer for Decoded<R> {}

/// Stands in for a layer that has been moved up into a decoder.
impl Layer for io::Empty {}

/// Buffered, peekable view of a [`Layer`] that tracks its logical offset.
///
/// Format codecs read through this type. It never reads further ahead
/// than its buffer, so a codec can stop exactly at a record boundary.
pub(crate) struct DecodeStream {
    inner: Box<dyn Layer>,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    offset: u64,
}

impl DecodeStream {
    pub(crate) fn new(inner: Box<dyn Layer>, capacity: usize) -> Self {
        DecodeStream {
            inner,
            buf: vec![0; capacity.max(512)],
            pos: 0,
            filled: 0,
            offset: 0,
        }
    }

    /// Offset of the next unread byte in this stream's (decoded) data.
    pub(crate) fn position(&self) -> u64 {
        self.offset
    }

    pub(crate) fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }

    fn buffered(&self) -> usize {
        self.filled - self.pos
    }

    /// Returns up to `n` upcoming bytes without consuming them. Fewer are
    /// returned only at end of stream.
    pub(crate) fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.buffered() < n {
            if self.pos > 0 {
                self.buf.copy_within(self.pos..self.filled, 0);
                self.filled -= self.pos;
                self.pos = 0;
            }
            if self.buf.len() < n {
                self.buf.resize(n, 0);
            }
            while self.filled < n {
                let read = self.inner.read(&mut self.buf[self.filled..])?;
                if read == 0 {
                    break;
                }
                self.filled += read;
            }
        }
        let end = self.filled.min(self.pos + n);
        Ok(&self.buf[self.pos..end])
    }

    /// Reads until `buf` is full or the stream ends; returns bytes read.
    pub(crate) fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Moves forward exactly `n` bytes, using the layer's native skip when
    /// it has one. Running out of input is `UnexpectedEof`.
    pub(crate) fn skip_exact(&mut self, n: u64) -> io::Result<()> {
        let from_buf = (self.buffered() as u64).min(n) as usize;
        self.consume(from_buf);
        let mut remaining = n - from_buf as u64;
        if remaining == 0 {
            return Ok(());
        }

        let skipped = self.inner.skip(remaining)?.min(remaining);
        self.offset += skipped;
        remaining -= skipped;

        while remaining > 0 {
            let want = remaining.min(self.buf.len() as u64) as usize;
            let read = self.inner.read(&mut self.buf[..want])?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF while skipping entry data",
                ));
            }
            self.offset += read as u64;
            remaining -= read as u64;
        }
        Ok(())
    }

    /// Repositions the underlying binding and discards the buffer.
    pub(crate) fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            SeekFrom::Current(delta) => SeekFrom::Current(delta - self.buffered() as i64),
            other => other,
        };
        self.offset = self.inner.seek(pos)?;
        self.pos = 0;
        self.filled = 0;
        Ok(self.offset)
    }
}

impl Read for DecodeStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buffered() == 0 && out.len() >= self.buf.len() {
            let n = self.inner.read(out)?;
            self.offset += n as u64;
            return Ok(n);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for DecodeStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos == self.filled {
            self.pos = 0;
            self.filled = self.inner.read(&mut self.buf)?;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.buffered());
        self.pos += amt;
        self.offset += amt as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::{Source, SourceReader};
    use bytes::Bytes;

    fn memory(data: &'static [u8], capacity: usize) -> DecodeStream {
        let src = SourceReader::open(Source::Memory(Bytes::from_static(data))).unwrap();
        DecodeStream::new(Box::new(src), capacity)
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut s = memory(b"abcdefgh", 512);
        assert_eq!(s.peek(3).unwrap(), b"abc");
        let mut out = [0u8; 5];
        assert_eq!(s.read_full(&mut out).unwrap(), 5);
        assert_eq!(&out, b"abcde");
        assert_eq!(s.position(), 5);
    }

    #[test]
    fn test_peek_past_end_is_short() {
        let mut s = memory(b"ab", 512);
        assert_eq!(s.peek(10).unwrap(), b"ab");
    }

    #[test]
    fn test_peek_grows_buffer() {
        let data: &'static [u8] = &[7u8; 2000];
        let mut s = memory(data, 512);
        assert_eq!(s.peek(1500).unwrap().len(), 1500);
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn test_skip_exact_tracks_position() {
        let mut s = memory(b"0123456789", 512);
        s.peek(2).unwrap();
        s.skip_exact(7).unwrap();
        assert_eq!(s.position(), 7);
        let mut out = [0u8; 3];
        s.read_full(&mut out).unwrap();
        assert_eq!(&out, b"789");
        assert!(s.skip_exact(1).is_err());
    }

    #[test]
    fn test_seek_resets_buffer() {
        let mut s = memory(b"0123456789", 512);
        s.peek(4).unwrap();
        assert_eq!(s.seek(SeekFrom::End(-2)).unwrap(), 8);
        let mut out = [0u8; 2];
        s.read_full(&mut out).unwrap();
        assert_eq!(&out, b"89");
    }
}
