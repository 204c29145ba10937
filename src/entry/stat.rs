//! Metadata captured from a live filesystem path.

use std::fs::{self, Metadata};
use std::io;
use std::path::Path;

use super::Timestamp;

/// A snapshot of `stat(2)`-style metadata, ready to be copied into an
/// [`Entry`](super::Entry). `Stat::default()` is an all-zero record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub dev: u64,
    pub rdev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub birthtime: Option<Timestamp>,
}

impl Stat {
    /// Captures metadata, following symlinks.
    pub fn capture(path: impl AsRef<Path>) -> io::Result<Stat> {
        fs::metadata(path).map(|m| Stat::from_metadata(&m))
    }

    /// Captures metadata of the path itself, not a symlink's target.
    pub fn capture_lstat(path: impl AsRef<Path>) -> io::Result<Stat> {
        fs::symlink_metadata(path).map(|m| Stat::from_metadata(&m))
    }

    #[cfg(unix)]
    pub fn from_metadata(m: &Metadata) -> Stat {
        use std::os::unix::fs::MetadataExt;

        Stat {
            mode: m.mode(),
            uid: m.uid(),
            gid: m.gid(),
            size: m.size(),
            dev: m.dev(),
            rdev: m.rdev(),
            ino: m.ino(),
            nlink: m.nlink(),
            atime: Timestamp::new(m.atime(), m.atime_nsec() as u32),
            mtime: Timestamp::new(m.mtime(), m.mtime_nsec() as u32),
            ctime: Timestamp::new(m.ctime(), m.ctime_nsec() as u32),
            birthtime: m.created().ok().map(Timestamp::from),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(m: &Metadata) -> Stat {
        let stamp = |t: io::Result<std::time::SystemTime>| t.map(Timestamp::from).unwrap_or_default();
        let file_type = m.file_type();
        let mode = if file_type.is_dir() {
            super::S_IFDIR | 0o755
        } else if file_type.is_symlink() {
            super::S_IFLNK | 0o777
        } else if m.permissions().readonly() {
            super::S_IFREG | 0o444
        } else {
            super::S_IFREG | 0o644
        };

        Stat {
            mode,
            size: m.len(),
            nlink: 1,
            atime: stamp(m.accessed()),
            mtime: stamp(m.modified()),
            ctime: stamp(m.modified()),
            birthtime: m.created().ok().map(Timestamp::from),
            ..Stat::default()
        }
    }
}
