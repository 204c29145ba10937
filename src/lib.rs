//! Streaming archive reader and writer.
//!
//! A [`Reader`] binds to a file, a memory buffer or a caller-supplied
//! stream, detects compression filters and the container format on its
//! own, and hands out entries one at a time. A [`Writer`] does the
//! reverse for an explicitly chosen filter and format.
//!
//! ```no_run
//! use arcstream::{MemoryBuffer, Reader, Writer, FileType};
//!
//! # fn main() -> arcstream::Result<()> {
//! let buffer = MemoryBuffer::new();
//! Writer::with_memory(&buffer, "gzip", "pax", |w| {
//!     w.add_entry(|e| {
//!         e.set_pathname("hello.txt");
//!         e.set_filetype(FileType::Regular);
//!         Some(b"hello".to_vec())
//!     })
//! })?;
//!
//! Reader::with_memory(buffer.to_vec(), None, |r| {
//!     while let Some(entry) = r.next_header()? {
//!         println!("{:?} {}", entry.pathname(), entry.size());
//!     }
//!     Ok(())
//! })
//! # }
//! ```

pub(crate) mod archive;
pub mod codes;
pub mod entry;
pub mod error;
pub mod extract;
pub(crate) mod filter;
pub mod io;
pub mod reader;
pub mod writer;

pub use codes::{Features, Filter, FilterSpec, Format, IntoFilter, IntoFormat, features};
pub use entry::{Entry, FileType, Stat, Timestamp, Xattr};
pub use error::{Error, ErrorKind, Result};
pub use extract::ExtractFlags;
pub use io::{
    Capabilities, ChunkFn, MemoryBuffer, ReadStream, SeekableReader, Sink, Source, StreamReader, StreamWriter,
    WriteStream,
};
pub use reader::{ReadOptions, Reader};
pub use writer::{WriteOptions, Writer};

const VERSION_PARTS: [&str; 3] = [
    env!("CARGO_PKG_VERSION_MAJOR"),
    env!("CARGO_PKG_VERSION_MINOR"),
    env!("CARGO_PKG_VERSION_PATCH"),
];

/// The crate version as `major * 1_000_000 + minor * 1_000 + patch`.
pub fn version_number() -> u32 {
    VERSION_PARTS
        .iter()
        .fold(0, |acc, part| acc * 1000 + part.parse::<u32>().unwrap_or(0))
}

/// `"arcstream X.Y.Z"` followed by the compression codecs compiled in.
pub fn version_string() -> String {
    let mut version = format!("arcstream {}", env!("CARGO_PKG_VERSION"));
    for filter in &features().read_filters {
        let codec = match filter {
            Filter::Gzip => "zlib",
            Filter::Bzip2 => "bz2lib",
            Filter::Xz => "liblzma",
            Filter::Zstd => "libzstd",
            _ => continue,
        };
        version.push(' ');
        version.push_str(codec);
    }
    version
}
