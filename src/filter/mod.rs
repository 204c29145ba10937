//! Compression filters: magic-byte detection, decoder layers for the read
//! pipeline and the encoder stack in front of a writer's sink.

pub(crate) mod program;

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::codes::{Filter, FilterSpec};
use crate::error::{Error, Result};
use crate::io::sink::SinkWriter;
use crate::io::stream::{DecodeStream, Decoded, Layer};

use program::{ProgramReader, ProgramWriter};

/// Bytes of lookahead filter detection needs.
pub(crate) const DETECT_BYTES: usize = 16;

/// Buffer size for layers stacked above a decoder.
pub(crate) const LAYER_BUFFER: usize = 64 * 1024;

/// Upper bound on stacked filters, so hostile input cannot nest forever.
pub(crate) const MAX_FILTERS: usize = 16;

const MAGICS: [(&[u8], Filter); 11] = [
    (b"\x1f\x8b", Filter::Gzip),
    (b"\xfd7zXZ\x00", Filter::Xz),
    (b"\x28\xb5\x2f\xfd", Filter::Zstd),
    (b"\x1f\x9d", Filter::Compress),
    (b"LZIP", Filter::Lzip),
    (b"LRZI", Filter::Lrzip),
    (b"\x89LZO\x00\r\n\x1a\n", Filter::Lzop),
    (b"GRZipII\x00\x02\x04:)", Filter::Grzip),
    (b"\x04\x22\x4d\x18", Filter::Lz4),
    (b"\xed\xab\xee\xdb", Filter::Rpm),
    (b"begin ", Filter::Uu),
];

/// Identifies the filter whose output `head` starts with.
pub(crate) fn detect(head: &[u8]) -> Option<Filter> {
    if let Some((_, filter)) = MAGICS.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Some(*filter);
    }
    if head.len() >= 4 && head.starts_with(b"BZh") && (b'1'..=b'9').contains(&head[3]) {
        return Some(Filter::Bzip2);
    }
    if looks_like_lzma(head) {
        return Some(Filter::Lzma);
    }
    None
}

/// Legacy lzma has no magic; accept the common properties byte with a
/// plausible dictionary size and uncompressed length.
fn looks_like_lzma(head: &[u8]) -> bool {
    if head.len() < 13 || head[0] != 0x5d {
        return false;
    }
    let dict = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
    let mut size = [0u8; 8];
    size.copy_from_slice(&head[5..13]);
    let size = u64::from_le_bytes(size);
    dict >= 1 << 12 && dict.count_ones() <= 2 && (size == u64::MAX || size < 1 << 48)
}

fn unsupported(filter: Filter) -> Error {
    Error::format(format!("{filter} compression not supported on this build"))
}

/// Stacks the decoder for `filter` on top of `s`.
pub(crate) fn decoder(filter: Filter, s: DecodeStream) -> Result<Box<dyn Layer>> {
    Ok(match filter {
        Filter::Gzip => Box::new(Decoded(flate2::bufread::MultiGzDecoder::new(s))),
        #[cfg(feature = "bzip2")]
        Filter::Bzip2 => Box::new(Decoded(bzip2::bufread::MultiBzDecoder::new(s))),
        #[cfg(feature = "xz")]
        Filter::Xz => Box::new(Decoded(xz2::bufread::XzDecoder::new_multi_decoder(s))),
        #[cfg(feature = "xz")]
        Filter::Lzma => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| Error::open(format!("lzma decoder: {e}")))?;
            Box::new(Decoded(xz2::bufread::XzDecoder::new_stream(s, stream)))
        }
        #[cfg(feature = "zstd")]
        Filter::Zstd => Box::new(Decoded(zstd::stream::read::Decoder::with_buffer(s).map_err(Error::Io)?)),
        other => return Err(unsupported(other)),
    })
}

/// Runs the read side of an external program over `s`.
pub(crate) fn program_decoder(command: &str, s: DecodeStream) -> Result<Box<dyn Layer>> {
    Ok(Box::new(ProgramReader::spawn(command, s)?))
}

/// The encoder stack between a format writer and its sink.
pub(crate) enum FilterWriter {
    None(SinkWriter),
    Gzip(GzEncoder<SinkWriter>),
    #[cfg(feature = "bzip2")]
    Bzip2(bzip2::write::BzEncoder<SinkWriter>),
    #[cfg(feature = "xz")]
    Xz(xz2::write::XzEncoder<SinkWriter>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::write::Encoder<'static, SinkWriter>),
    Program(ProgramWriter),
}

impl FilterWriter {
    pub(crate) fn new(spec: &FilterSpec, sink: SinkWriter) -> Result<Self> {
        let filter = match spec {
            FilterSpec::Program(command) => return Ok(FilterWriter::Program(ProgramWriter::spawn(command, sink)?)),
            FilterSpec::Builtin(filter) => *filter,
        };
        Ok(match filter {
            Filter::None => FilterWriter::None(sink),
            Filter::Gzip => FilterWriter::Gzip(GzEncoder::new(sink, Compression::default())),
            #[cfg(feature = "bzip2")]
            Filter::Bzip2 => FilterWriter::Bzip2(bzip2::write::BzEncoder::new(sink, bzip2::Compression::default())),
            #[cfg(feature = "xz")]
            Filter::Xz => FilterWriter::Xz(xz2::write::XzEncoder::new(sink, 6)),
            #[cfg(feature = "xz")]
            Filter::Lzma => {
                let options = xz2::stream::LzmaOptions::new_preset(6)
                    .map_err(|e| Error::open(format!("lzma encoder: {e}")))?;
                let stream = xz2::stream::Stream::new_lzma_encoder(&options)
                    .map_err(|e| Error::open(format!("lzma encoder: {e}")))?;
                FilterWriter::Xz(xz2::write::XzEncoder::new_stream(sink, stream))
            }
            #[cfg(feature = "zstd")]
            Filter::Zstd => FilterWriter::Zstd(
                zstd::stream::write::Encoder::new(sink, 0).map_err(|e| Error::open_io("zstd encoder", e))?,
            ),
            other => {
                return Err(Error::open(format!(
                    "{other} compression not supported on this build"
                )));
            }
        })
    }

    /// Flushes the encoder's trailer and closes the sink. The sink is
    /// released whether or not that succeeds.
    pub(crate) fn finish(self) -> Result<()> {
        let sink = match self {
            FilterWriter::None(sink) => sink,
            FilterWriter::Gzip(e) => e.finish()?,
            #[cfg(feature = "bzip2")]
            FilterWriter::Bzip2(e) => e.finish()?,
            #[cfg(feature = "xz")]
            FilterWriter::Xz(e) => e.finish()?,
            #[cfg(feature = "zstd")]
            FilterWriter::Zstd(e) => e.finish()?,
            FilterWriter::Program(p) => p.finish()?,
        };
        sink.close()?;
        Ok(())
    }

    fn inner(&mut self) -> &mut dyn Write {
        match self {
            FilterWriter::None(w) => w,
            FilterWriter::Gzip(w) => w,
            #[cfg(feature = "bzip2")]
            FilterWriter::Bzip2(w) => w,
            #[cfg(feature = "xz")]
            FilterWriter::Xz(w) => w,
            #[cfg(feature = "zstd")]
            FilterWriter::Zstd(w) => w,
            FilterWriter::Program(w) => w,
        }
    }
}

impl Write for FilterWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner().flush()
    }
}
