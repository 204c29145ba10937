//! The metadata record shared by readers and writers.

pub mod fflags;
pub mod stat;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use stat::Stat;

use crate::error::{Error, Result};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// The kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

const FILE_TYPES: [(FileType, u32, &str); 7] = [
    (FileType::Socket, S_IFSOCK, "socket"),
    (FileType::Symlink, S_IFLNK, "symbolic_link"),
    (FileType::Regular, S_IFREG, "file"),
    (FileType::BlockDevice, S_IFBLK, "block_device"),
    (FileType::Directory, S_IFDIR, "directory"),
    (FileType::CharDevice, S_IFCHR, "character_device"),
    (FileType::Fifo, S_IFIFO, "fifo"),
];

impl FileType {
    /// The type selected by `mode`'s high bits; `None` for a bit pattern
    /// that is not a known type.
    pub fn from_mode(mode: u32) -> Option<FileType> {
        let bits = mode & S_IFMT;
        FILE_TYPES.iter().find(|(_, b, _)| *b == bits).map(|e| e.0)
    }

    pub fn mode_bits(self) -> u32 {
        FILE_TYPES.iter().find(|(t, _, _)| *t == self).map(|e| e.1).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        FILE_TYPES.iter().find(|(t, _, _)| *t == self).map(|e| e.2).unwrap_or("unknown")
    }

    pub fn from_name(name: &str) -> Result<FileType> {
        let wanted = name.to_ascii_lowercase();
        let wanted = match wanted.as_str() {
            "regular" => "file",
            "symlink" => "symbolic_link",
            "block_special" => "block_device",
            "character_special" => "character_device",
            other => other,
        };
        FILE_TYPES
            .iter()
            .find(|(_, _, n)| *n == wanted)
            .map(|e| e.0)
            .ok_or(Error::Naming {
                kind: "file type",
                name: name.to_string(),
            })
    }
}

/// Seconds since the Unix epoch plus a nanosecond part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: i64,
    pub nsec: u32,
}

impl Timestamp {
    /// Builds a timestamp, carrying whole seconds out of `nsec`.
    pub fn new(secs: i64, nsec: u32) -> Self {
        Timestamp {
            secs: secs + (nsec / 1_000_000_000) as i64,
            nsec: nsec % 1_000_000_000,
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        let nanos = Duration::from_nanos(self.nsec as u64);
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.secs as u64) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(self.secs.unsigned_abs()) + nanos
        }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Timestamp::new(-(d.as_secs() as i64), 0)
                } else {
                    Timestamp::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

/// One extended attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

/// Metadata describing one archive member.
///
/// Every optional field has a distinct "not set" state; a format that
/// cannot carry a field leaves it unset instead of writing zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pathname: Option<String>,
    sourcepath: Option<PathBuf>,
    hardlink: Option<String>,
    symlink: Option<String>,
    mode: u32,
    size: Option<u64>,
    uid: i64,
    gid: i64,
    uname: Option<String>,
    gname: Option<String>,
    atime: Option<Timestamp>,
    mtime: Option<Timestamp>,
    ctime: Option<Timestamp>,
    birthtime: Option<Timestamp>,
    dev: Option<u64>,
    rdev: Option<u64>,
    ino: Option<u64>,
    nlink: u32,
    fflags_set: u64,
    fflags_clear: u64,
    xattrs: Vec<Xattr>,
    xattr_cursor: usize,
}

macro_rules! timestamp_accessors {
    ($field:ident, $set:ident, $is_set:ident, $unset:ident) => {
        pub fn $field(&self) -> Option<Timestamp> {
            self.$field
        }

        pub fn $set(&mut self, secs: i64, nsec: u32) {
            self.$field = Some(Timestamp::new(secs, nsec));
        }

        pub fn $is_set(&self) -> bool {
            self.$field.is_some()
        }

        pub fn $unset(&mut self) {
            self.$field = None;
        }
    };
}

/// glibc's `makedev` encoding of a (major, minor) pair.
pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (major as u64, minor as u64);
    ((major & 0xffff_f000) << 32) | ((major & 0xfff) << 8) | ((minor & 0xffff_ff00) << 12) | (minor & 0xff)
}

pub fn major(dev: u64) -> u32 {
    (((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0xfff)) as u32
}

pub fn minor(dev: u64) -> u32 {
    (((dev >> 12) & 0xffff_ff00) | (dev & 0xff)) as u32
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    // Identity

    pub fn pathname(&self) -> Option<&str> {
        self.pathname.as_deref()
    }

    pub fn set_pathname(&mut self, path: impl Into<String>) {
        self.pathname = Some(path.into());
    }

    pub fn sourcepath(&self) -> Option<&Path> {
        self.sourcepath.as_deref()
    }

    pub fn set_sourcepath(&mut self, path: impl Into<PathBuf>) {
        self.sourcepath = Some(path.into());
    }

    pub fn hardlink(&self) -> Option<&str> {
        self.hardlink.as_deref()
    }

    pub fn set_hardlink(&mut self, target: impl Into<String>) {
        self.hardlink = Some(target.into());
    }

    pub fn symlink(&self) -> Option<&str> {
        self.symlink.as_deref()
    }

    pub fn set_symlink(&mut self, target: impl Into<String>) {
        self.symlink = Some(target.into());
    }

    /// Sets the symlink target if the entry already has one, the hardlink
    /// target otherwise.
    pub fn set_link(&mut self, target: impl Into<String>) {
        if self.symlink.is_some() {
            self.set_symlink(target);
        } else {
            self.set_hardlink(target);
        }
    }

    pub fn is_hardlink(&self) -> bool {
        self.hardlink.is_some()
    }

    // Mode, permissions and type

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
    }

    /// Permission bits including setuid/setgid/sticky.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn set_perm(&mut self, perm: u32) {
        self.mode = (self.mode & S_IFMT) | (perm & 0o7777);
    }

    /// Raw type bits of the mode (`mode & S_IFMT`).
    pub fn filetype_bits(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn filetype(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn set_filetype(&mut self, kind: FileType) {
        self.mode = (self.mode & !S_IFMT) | kind.mode_bits();
    }

    pub fn filetype_name(&self) -> Option<&'static str> {
        self.filetype().map(FileType::name)
    }

    pub fn is_regular_file(&self) -> bool {
        self.filetype() == Some(FileType::Regular)
    }

    pub fn is_directory(&self) -> bool {
        self.filetype() == Some(FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.filetype() == Some(FileType::Symlink)
    }

    pub fn is_char_device(&self) -> bool {
        self.filetype() == Some(FileType::CharDevice)
    }

    pub fn is_block_device(&self) -> bool {
        self.filetype() == Some(FileType::BlockDevice)
    }

    pub fn is_fifo(&self) -> bool {
        self.filetype() == Some(FileType::Fifo)
    }

    pub fn is_socket(&self) -> bool {
        self.filetype() == Some(FileType::Socket)
    }

    /// `ls -l` style mode string, e.g. `"-rw-r--r-- "`.
    pub fn strmode(&self) -> String {
        let mut s = String::with_capacity(11);
        s.push(match self.filetype() {
            _ if self.hardlink.is_some() => 'h',
            Some(FileType::Regular) | None => '-',
            Some(FileType::Directory) => 'd',
            Some(FileType::Symlink) => 'l',
            Some(FileType::CharDevice) => 'c',
            Some(FileType::BlockDevice) => 'b',
            Some(FileType::Fifo) => 'p',
            Some(FileType::Socket) => 's',
        });
        let m = self.mode;
        let special = [(0o4000, 's', 'S'), (0o2000, 's', 'S'), (0o1000, 't', 'T')];
        for (i, shift) in [6u32, 3, 0].into_iter().enumerate() {
            let bits = (m >> shift) & 0o7;
            s.push(if bits & 4 != 0 { 'r' } else { '-' });
            s.push(if bits & 2 != 0 { 'w' } else { '-' });
            let (flag, on, off) = special[i];
            s.push(match (bits & 1 != 0, m & flag != 0) {
                (true, true) => on,
                (false, true) => off,
                (true, false) => 'x',
                (false, false) => '-',
            });
        }
        s.push(' ');
        s
    }

    // Size

    /// Declared size; 0 when unset.
    pub fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
    }

    pub fn size_is_set(&self) -> bool {
        self.size.is_some()
    }

    pub fn unset_size(&mut self) {
        self.size = None;
    }

    // Ownership

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn set_uid(&mut self, uid: i64) {
        self.uid = uid;
    }

    pub fn gid(&self) -> i64 {
        self.gid
    }

    pub fn set_gid(&mut self, gid: i64) {
        self.gid = gid;
    }

    pub fn uname(&self) -> Option<&str> {
        self.uname.as_deref()
    }

    pub fn set_uname(&mut self, name: impl Into<String>) {
        self.uname = Some(name.into());
    }

    pub fn gname(&self) -> Option<&str> {
        self.gname.as_deref()
    }

    pub fn set_gname(&mut self, name: impl Into<String>) {
        self.gname = Some(name.into());
    }

    // Timestamps

    timestamp_accessors!(atime, set_atime, atime_is_set, unset_atime);
    timestamp_accessors!(mtime, set_mtime, mtime_is_set, unset_mtime);
    timestamp_accessors!(ctime, set_ctime, ctime_is_set, unset_ctime);
    timestamp_accessors!(birthtime, set_birthtime, birthtime_is_set, unset_birthtime);

    // Devices

    pub fn dev(&self) -> u64 {
        self.dev.unwrap_or(0)
    }

    pub fn set_dev(&mut self, dev: u64) {
        self.dev = Some(dev);
    }

    pub fn dev_is_set(&self) -> bool {
        self.dev.is_some()
    }

    pub fn devmajor(&self) -> u32 {
        major(self.dev())
    }

    pub fn set_devmajor(&mut self, value: u32) {
        self.dev = Some(makedev(value, self.devminor()));
    }

    pub fn devminor(&self) -> u32 {
        minor(self.dev())
    }

    pub fn set_devminor(&mut self, value: u32) {
        self.dev = Some(makedev(self.devmajor(), value));
    }

    pub fn rdev(&self) -> u64 {
        self.rdev.unwrap_or(0)
    }

    pub fn set_rdev(&mut self, rdev: u64) {
        self.rdev = Some(rdev);
    }

    pub fn rdev_is_set(&self) -> bool {
        self.rdev.is_some()
    }

    pub fn rdevmajor(&self) -> u32 {
        major(self.rdev())
    }

    pub fn set_rdevmajor(&mut self, value: u32) {
        self.rdev = Some(makedev(value, self.rdevminor()));
    }

    pub fn rdevminor(&self) -> u32 {
        minor(self.rdev())
    }

    pub fn set_rdevminor(&mut self, value: u32) {
        self.rdev = Some(makedev(self.rdevmajor(), value));
    }

    // Informational counters

    pub fn ino(&self) -> u64 {
        self.ino.unwrap_or(0)
    }

    pub fn set_ino(&mut self, ino: u64) {
        self.ino = Some(ino);
    }

    pub fn ino_is_set(&self) -> bool {
        self.ino.is_some()
    }

    pub fn nlink(&self) -> u32 {
        self.nlink
    }

    pub fn set_nlink(&mut self, nlink: u32) {
        self.nlink = nlink;
    }

    // File attribute flags

    /// `(set, clear)` flag bits.
    pub fn fflags(&self) -> (u64, u64) {
        (self.fflags_set, self.fflags_clear)
    }

    pub fn set_fflags(&mut self, set: u64, clear: u64) {
        self.fflags_set = set;
        self.fflags_clear = clear;
    }

    pub fn fflags_text(&self) -> Option<String> {
        fflags::render(self.fflags_set, self.fflags_clear)
    }

    /// Parses a textual flag list into the set/clear bits. Valid tokens
    /// are applied even when some are not; the first unknown token is
    /// returned.
    pub fn copy_fflags_text(&mut self, text: &str) -> Option<String> {
        let mut set = 0;
        let mut clear = 0;
        let mut invalid = None;
        for token in text.split(|c: char| c == ',' || c.is_whitespace()) {
            match fflags::parse(token) {
                Ok((s, c)) => {
                    set = (set | s) & !c;
                    clear = (clear | c) & !s;
                }
                Err(bad) => {
                    invalid.get_or_insert(bad);
                }
            }
        }
        self.set_fflags(set, clear);
        invalid
    }

    // Extended attributes

    pub fn xattr_add_entry(&mut self, name: impl Into<String>, value: impl AsRef<[u8]>) {
        self.xattrs.push(Xattr {
            name: name.into(),
            value: value.as_ref().to_vec(),
        });
    }

    pub fn xattr_clear(&mut self) {
        self.xattrs.clear();
        self.xattr_cursor = 0;
    }

    pub fn xattr_count(&self) -> usize {
        self.xattrs.len()
    }

    /// Rewinds the attribute cursor; returns the number of attributes.
    pub fn xattr_reset(&mut self) -> usize {
        self.xattr_cursor = 0;
        self.xattrs.len()
    }

    /// Next attribute under the cursor, or `None` once all were visited.
    pub fn xattr_next(&mut self) -> Option<&Xattr> {
        let xattr = self.xattrs.get(self.xattr_cursor)?;
        self.xattr_cursor += 1;
        Some(xattr)
    }

    /// Drains the cursor from the start into a list.
    pub fn xattrs(&mut self) -> Vec<Xattr> {
        self.xattr_reset();
        let mut all = Vec::with_capacity(self.xattrs.len());
        while let Some(x) = self.xattr_next() {
            all.push(x.clone());
        }
        all
    }

    pub(crate) fn xattr_iter(&self) -> impl Iterator<Item = &Xattr> {
        self.xattrs.iter()
    }

    // Filesystem metadata

    /// Overwrites ownership, mode, size, device numbers and times from a
    /// captured [`Stat`].
    pub fn copy_stat(&mut self, st: &Stat) {
        self.mode = st.mode;
        self.uid = st.uid as i64;
        self.gid = st.gid as i64;
        self.size = Some(st.size);
        self.dev = Some(st.dev);
        self.rdev = Some(st.rdev);
        self.ino = Some(st.ino);
        self.nlink = st.nlink.min(u32::MAX as u64) as u32;
        self.atime = Some(st.atime);
        self.mtime = Some(st.mtime);
        self.ctime = Some(st.ctime);
        self.birthtime = st.birthtime;
    }

    /// Populates from `path`, following symlinks.
    pub fn copy_stat_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let st = Stat::capture(path).map_err(Error::Io)?;
        self.copy_stat(&st);
        self.set_sourcepath(path);
        Ok(())
    }

    /// Populates from `path` itself, without following a final symlink.
    pub fn copy_lstat(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let st = Stat::capture_lstat(path).map_err(Error::Io)?;
        self.copy_stat(&st);
        self.set_sourcepath(path);
        Ok(())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.strmode(), self.pathname().unwrap_or(""))?;
        if let Some(target) = &self.symlink {
            write!(f, " -> {target}")?;
        } else if let Some(target) = &self.hardlink {
            write!(f, " link to {target}")?;
        }
        Ok(())
    }
}
