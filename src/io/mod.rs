//! Byte sources and sinks a session binds to, and the buffered stream
//! format codecs read through.

pub mod sink;
pub mod source;
pub(crate) mod stream;

pub use sink::{MemoryBuffer, Sink, StreamWriter, WriteStream};
pub use source::{Capabilities, ChunkFn, ReadStream, SeekableReader, Source, StreamReader};
