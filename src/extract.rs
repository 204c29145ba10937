//! Materializes entries on the local filesystem.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::ops::{BitOr, BitOrAssign};
use std::path::{Component, Path, PathBuf};

use crate::entry::{Entry, FileType};
use crate::error::{Error, Result};

/// Behaviors requested of an extraction, combinable with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExtractFlags(u32);

impl ExtractFlags {
    pub const NONE: ExtractFlags = ExtractFlags(0);
    pub const OWNER: ExtractFlags = ExtractFlags(0x1);
    pub const PERM: ExtractFlags = ExtractFlags(0x2);
    pub const TIME: ExtractFlags = ExtractFlags(0x4);
    pub const NO_OVERWRITE: ExtractFlags = ExtractFlags(0x8);
    pub const UNLINK: ExtractFlags = ExtractFlags(0x10);
    pub const ACL: ExtractFlags = ExtractFlags(0x20);
    pub const FFLAGS: ExtractFlags = ExtractFlags(0x40);
    pub const XATTR: ExtractFlags = ExtractFlags(0x80);
    pub const SECURE_SYMLINKS: ExtractFlags = ExtractFlags(0x100);
    pub const SECURE_NODOTDOT: ExtractFlags = ExtractFlags(0x200);
    pub const NO_AUTODIR: ExtractFlags = ExtractFlags(0x400);
    pub const NO_OVERWRITE_NEWER: ExtractFlags = ExtractFlags(0x800);
    pub const SPARSE: ExtractFlags = ExtractFlags(0x1000);
    pub const MAC_METADATA: ExtractFlags = ExtractFlags(0x2000);
    pub const NO_HFS_COMPRESSION: ExtractFlags = ExtractFlags(0x4000);
    pub const HFS_COMPRESSION_FORCED: ExtractFlags = ExtractFlags(0x8000);
    pub const SECURE_NOABSOLUTEPATHS: ExtractFlags = ExtractFlags(0x10000);
    pub const CLEAR_NOCHANGE_FFLAGS: ExtractFlags = ExtractFlags(0x20000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        ExtractFlags(bits)
    }

    pub const fn contains(self, other: ExtractFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExtractFlags {
    type Output = ExtractFlags;

    fn bitor(self, rhs: ExtractFlags) -> ExtractFlags {
        ExtractFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExtractFlags {
    fn bitor_assign(&mut self, rhs: ExtractFlags) {
        self.0 |= rhs.0;
    }
}

/// Pulls entry data into a buffer; 0 at the end of the entry.
pub(crate) type DataSource<'a> = dyn FnMut(&mut [u8]) -> Result<usize> + 'a;

/// Resolves an archive path below `base`, applying the path-safety flags.
fn resolve(base: &Path, name: &str, flags: ExtractFlags) -> Result<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() && flags.contains(ExtractFlags::SECURE_NOABSOLUTEPATHS) {
        return Err(Error::extract(path, "Path is absolute"));
    }
    if flags.contains(ExtractFlags::SECURE_NODOTDOT)
        && path.components().any(|c| c == Component::ParentDir)
    {
        return Err(Error::extract(path, "Path contains '..'"));
    }
    Ok(if path.is_absolute() { path.to_path_buf() } else { base.join(path) })
}

/// Refuses (or with UNLINK, removes) symlinks among the directories
/// between `base` and the entry.
fn check_symlinks(base: &Path, name: &str, flags: ExtractFlags) -> Result<()> {
    let relative = Path::new(name);
    if relative.is_absolute() {
        return Ok(());
    }
    let mut current = base.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if !flags.contains(ExtractFlags::UNLINK) {
                    return Err(Error::extract(&current, "Cannot extract through symlink"));
                }
                fs::remove_file(&current)
                    .map_err(|e| Error::extract_io(&current, "Can't remove symlink", e))?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(Error::extract_io(&current, "Can't stat", e)),
        }
    }
    Ok(())
}

/// Whether whatever exists at `target` should be replaced. `Ok(false)`
/// leaves it in place and skips the entry.
fn clear_existing(target: &Path, entry: &Entry, flags: ExtractFlags) -> Result<bool> {
    let existing = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(Error::extract_io(target, "Can't stat", e)),
    };
    if existing.is_dir() && entry.is_directory() {
        return Ok(true);
    }
    if flags.contains(ExtractFlags::NO_OVERWRITE) {
        return Err(Error::extract(target, "Already exists"));
    }
    if flags.contains(ExtractFlags::NO_OVERWRITE_NEWER) {
        if let (Ok(on_disk), Some(mtime)) = (existing.modified(), entry.mtime()) {
            if on_disk >= mtime.to_system_time() {
                log::warn!("{}: file on disk is not older; skipping", target.display());
                return Ok(false);
            }
        }
    }
    if flags.contains(ExtractFlags::CLEAR_NOCHANGE_FFLAGS) {
        platform::clear_nochange_flags(target);
    }
    let removed = if existing.is_dir() {
        fs::remove_dir(target)
    } else {
        fs::remove_file(target)
    };
    removed.map_err(|e| Error::extract_io(target, "Can't replace existing file", e))?;
    Ok(true)
}

fn write_contents(file: &mut File, target: &Path, read: &mut DataSource<'_>, sparse: bool) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut length = 0u64;
    let mut holes = false;
    loop {
        let n = read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        let written = if sparse && chunk.iter().all(|&b| b == 0) {
            holes = true;
            file.seek(SeekFrom::Current(n as i64)).map(|_| ())
        } else {
            file.write_all(chunk)
        };
        written.map_err(|e| Error::extract_io(target, "Write failed", e))?;
        length += n as u64;
    }
    if holes {
        file.set_len(length)
            .map_err(|e| Error::extract_io(target, "Write failed", e))?;
    }
    Ok(())
}

/// Creates `entry` below `base`, reading its data through `read`.
pub(crate) fn extract_entry(
    entry: &Entry,
    base: &Path,
    flags: ExtractFlags,
    read: &mut DataSource<'_>,
) -> Result<()> {
    let name = entry
        .pathname()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::extract(base, "Entry has no pathname"))?;
    let target = resolve(base, name, flags)?;
    if flags.contains(ExtractFlags::SECURE_SYMLINKS) {
        check_symlinks(base, name, flags)?;
    }

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        if flags.contains(ExtractFlags::NO_AUTODIR) {
            if !parent.is_dir() {
                return Err(Error::extract(&target, "Parent directory does not exist"));
            }
        } else {
            fs::create_dir_all(parent)
                .map_err(|e| Error::extract_io(parent, "Can't create directory", e))?;
        }
    }

    if !clear_existing(&target, entry, flags)? {
        return Ok(());
    }
    log::debug!("extracting {}", target.display());

    let kind = entry.filetype().unwrap_or(FileType::Regular);
    if let Some(link) = entry.hardlink() {
        let source = resolve(base, link, flags)?;
        fs::hard_link(&source, &target)
            .map_err(|e| Error::extract_io(&target, format!("Can't create hard link to {link}"), e))?;
        if entry.size() > 0 {
            let mut file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&target)
                .map_err(|e| Error::extract_io(&target, "Can't open", e))?;
            write_contents(&mut file, &target, read, flags.contains(ExtractFlags::SPARSE))?;
        }
    } else {
        match kind {
            FileType::Directory => match fs::create_dir(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && target.is_dir() => {}
                Err(e) => return Err(Error::extract_io(&target, "Can't create directory", e)),
            },
            FileType::Symlink => {
                let link = entry.symlink().unwrap_or("");
                platform::symlink(link, &target)
                    .map_err(|e| Error::extract_io(&target, "Can't create symlink", e))?;
            }
            FileType::Regular => {
                let mut file = File::create(&target)
                    .map_err(|e| Error::extract_io(&target, "Can't create", e))?;
                write_contents(&mut file, &target, read, flags.contains(ExtractFlags::SPARSE))?;
            }
            FileType::Fifo | FileType::CharDevice | FileType::BlockDevice => {
                platform::make_node(&target, entry.mode(), entry.rdev())
                    .map_err(|e| Error::extract_io(&target, "Can't create special file", e))?;
            }
            FileType::Socket => {
                return Err(Error::extract(&target, "Cannot extract a socket"));
            }
        }
    }

    apply_metadata(entry, &target, flags)
}

fn apply_metadata(entry: &Entry, target: &Path, flags: ExtractFlags) -> Result<()> {
    let is_symlink = entry.is_symlink() && entry.hardlink().is_none();
    if flags.contains(ExtractFlags::OWNER) {
        platform::chown(target, entry.uid(), entry.gid())
            .map_err(|e| Error::extract_io(target, "Can't set owner", e))?;
    }
    if flags.contains(ExtractFlags::PERM) && !is_symlink {
        platform::chmod(target, entry.perm())
            .map_err(|e| Error::extract_io(target, "Can't set permissions", e))?;
    }
    if flags.contains(ExtractFlags::XATTR) {
        for xattr in entry.xattr_iter() {
            platform::set_xattr(target, &xattr.name, &xattr.value)
                .map_err(|e| Error::extract_io(target, format!("Can't restore xattr {}", xattr.name), e))?;
        }
    }
    if flags.contains(ExtractFlags::TIME) && (entry.mtime().is_some() || entry.atime().is_some()) {
        platform::set_times(target, entry)
            .map_err(|e| Error::extract_io(target, "Can't restore time", e))?;
    }
    if flags.contains(ExtractFlags::FFLAGS) && !is_symlink {
        let (set, clear) = entry.fflags();
        if set != 0 || clear != 0 {
            platform::set_fflags(target, set, clear);
        }
    }
    if flags.contains(ExtractFlags::ACL) || flags.contains(ExtractFlags::MAC_METADATA) {
        log::debug!("ACL and Mac metadata restore are not available; ignoring");
    }
    Ok(())
}

#[cfg(unix)]
mod platform {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use crate::entry::Entry;

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
    }

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    pub(super) fn symlink(link: &str, target: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(link, target)
    }

    pub(super) fn make_node(target: &Path, mode: u32, rdev: u64) -> io::Result<()> {
        let path = c_path(target)?;
        // SAFETY: `path` is a valid NUL-terminated string for the call.
        check(unsafe { libc::mknod(path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
    }

    pub(super) fn chown(target: &Path, uid: i64, gid: i64) -> io::Result<()> {
        std::os::unix::fs::lchown(target, Some(uid as u32), Some(gid as u32))
    }

    pub(super) fn chmod(target: &Path, perm: u32) -> io::Result<()> {
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(perm))
    }

    pub(super) fn set_times(target: &Path, entry: &Entry) -> io::Result<()> {
        let spec = |t: Option<crate::entry::Timestamp>| match t {
            Some(t) => libc::timespec {
                tv_sec: t.secs as libc::time_t,
                tv_nsec: t.nsec as _,
            },
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT as _,
            },
        };
        let times = [spec(entry.atime()), spec(entry.mtime())];
        let path = c_path(target)?;
        // SAFETY: `path` is NUL-terminated and `times` holds two timespecs.
        check(unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })
    }

    #[cfg(target_os = "linux")]
    pub(super) fn set_xattr(target: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let path = c_path(target)?;
        let name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains a NUL byte"))?;
        // SAFETY: both strings are NUL-terminated; `value` is valid for its length.
        check(unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn set_xattr(target: &Path, name: &str, _value: &[u8]) -> io::Result<()> {
        log::warn!("{}: xattr {name} not restored on this platform", target.display());
        Ok(())
    }

    #[cfg(target_os = "linux")]
    mod inode_flags {
        use std::fs::File;
        use std::os::unix::io::AsRawFd;
        use std::path::Path;

        const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
        const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;

        pub(super) fn update(target: &Path, set: u64, clear: u64) -> std::io::Result<()> {
            let file = File::open(target)?;
            let mut flags: libc::c_long = 0;
            // SAFETY: the fd is open for the duration and `flags` outlives the call.
            if unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_GETFLAGS as _, &mut flags) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            flags = (flags | set as libc::c_long) & !(clear as libc::c_long);
            // SAFETY: as above.
            if unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_SETFLAGS as _, &flags) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        }
    }

    #[cfg(target_os = "linux")]
    pub(super) fn set_fflags(target: &Path, set: u64, clear: u64) {
        if let Err(e) = inode_flags::update(target, set, clear) {
            log::warn!("{}: can't set file flags: {e}", target.display());
        }
    }

    #[cfg(target_os = "linux")]
    pub(super) fn clear_nochange_flags(target: &Path) {
        inode_flags::update(target, 0, crate::entry::fflags::NOCHANGE_FLAGS).ok();
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn set_fflags(target: &Path, _set: u64, _clear: u64) {
        log::warn!("{}: file flags ignored on this platform", target.display());
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn clear_nochange_flags(_target: &Path) {}
}

#[cfg(not(unix))]
mod platform {
    use std::io;
    use std::path::Path;

    use crate::entry::Entry;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "not supported on this platform")
    }

    pub(super) fn symlink(_link: &str, _target: &Path) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) fn make_node(_target: &Path, _mode: u32, _rdev: u64) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) fn chown(_target: &Path, _uid: i64, _gid: i64) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn chmod(target: &Path, perm: u32) -> io::Result<()> {
        let mut permissions = std::fs::metadata(target)?.permissions();
        permissions.set_readonly(perm & 0o222 == 0);
        std::fs::set_permissions(target, permissions)
    }

    pub(super) fn set_times(target: &Path, entry: &Entry) -> io::Result<()> {
        let mut times = std::fs::FileTimes::new();
        if let Some(t) = entry.mtime() {
            times = times.set_modified(t.to_system_time());
        }
        if let Some(t) = entry.atime() {
            times = times.set_accessed(t.to_system_time());
        }
        std::fs::File::options().write(true).open(target)?.set_times(times)
    }

    pub(super) fn set_xattr(_target: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn set_fflags(_target: &Path, _set: u64, _clear: u64) {}

    pub(super) fn clear_nochange_flags(_target: &Path) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::os::unix::fs::PermissionsExt;

    fn file(path: &str) -> Entry {
        let mut e = Entry::new();
        e.set_pathname(path);
        e.set_filetype(FileType::Regular);
        e.set_perm(0o640);
        e.set_mtime(1_500_000_000, 0);
        e
    }

    fn feed(data: &[u8]) -> impl FnMut(&mut [u8]) -> Result<usize> + '_ {
        let mut pos = 0;
        move |buf: &mut [u8]| {
            let n = (data.len() - pos).min(buf.len());
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_flags_combine() {
        let flags = ExtractFlags::PERM | ExtractFlags::TIME;
        assert!(flags.contains(ExtractFlags::PERM));
        assert!(!flags.contains(ExtractFlags::OWNER));
        assert_eq!(flags.bits(), 0x6);
        assert_eq!(ExtractFlags::from_bits(0x20000), ExtractFlags::CLEAR_NOCHANGE_FFLAGS);
    }

    #[test]
    fn test_regular_file_with_perm_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let flags = ExtractFlags::PERM | ExtractFlags::TIME;
        extract_entry(&file("a/b.txt"), dir.path(), flags, &mut feed(b"contents")).unwrap();

        let path = dir.path().join("a/b.txt");
        assert_eq!(fs::read(&path).unwrap(), b"contents");
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
        let mtime = meta.modified().unwrap();
        assert_eq!(mtime, crate::entry::Timestamp::new(1_500_000_000, 0).to_system_time());
    }

    #[test]
    fn test_dotdot_and_absolute_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_entry(
            &file("../escape"),
            dir.path(),
            ExtractFlags::SECURE_NODOTDOT,
            &mut feed(b""),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extract);

        let err = extract_entry(
            &file("/tmp/abs"),
            dir.path(),
            ExtractFlags::SECURE_NOABSOLUTEPATHS,
            &mut feed(b""),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extract);
    }

    #[test]
    fn test_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep"), b"old").unwrap();
        let err = extract_entry(&file("keep"), dir.path(), ExtractFlags::NO_OVERWRITE, &mut feed(b"new"))
            .unwrap_err();
        assert!(err.to_string().contains("Already exists"));
        assert_eq!(fs::read(dir.path().join("keep")).unwrap(), b"old");

        extract_entry(&file("keep"), dir.path(), ExtractFlags::NONE, &mut feed(b"new")).unwrap();
        assert_eq!(fs::read(dir.path().join("keep")).unwrap(), b"new");
    }

    #[test]
    fn test_secure_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = extract_entry(
            &file("link/x"),
            dir.path(),
            ExtractFlags::SECURE_SYMLINKS,
            &mut feed(b"x"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extract);
        assert!(!outside.path().join("x").exists());
    }

    #[test]
    fn test_symlink_hardlink_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = Entry::new();
        d.set_pathname("d");
        d.set_filetype(FileType::Directory);
        d.set_perm(0o755);
        extract_entry(&d, dir.path(), ExtractFlags::PERM, &mut feed(b"")).unwrap();

        extract_entry(&file("d/target"), dir.path(), ExtractFlags::NONE, &mut feed(b"T")).unwrap();

        let mut sym = Entry::new();
        sym.set_pathname("d/sym");
        sym.set_filetype(FileType::Symlink);
        sym.set_symlink("target");
        extract_entry(&sym, dir.path(), ExtractFlags::NONE, &mut feed(b"")).unwrap();
        assert_eq!(fs::read_link(dir.path().join("d/sym")).unwrap(), Path::new("target"));

        let mut hard = file("d/hard");
        hard.set_hardlink("d/target");
        extract_entry(&hard, dir.path(), ExtractFlags::NONE, &mut feed(b"")).unwrap();
        assert_eq!(fs::read(dir.path().join("d/hard")).unwrap(), b"T");
    }

    #[test]
    fn test_sparse_file_keeps_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0u8; 200 * 1024];
        data.extend_from_slice(b"tail");
        extract_entry(&file("sparse"), dir.path(), ExtractFlags::SPARSE, &mut feed(&data)).unwrap();
        assert_eq!(fs::read(dir.path().join("sparse")).unwrap(), data);
    }
}
