use std::io::{Read, Write};

use ::tar::{EntryType, Header as RawHeader};

use crate::codes::Format;
use crate::entry::{Entry, FileType, Timestamp, makedev};
use crate::error::{Error, Result};
use crate::io::stream::DecodeStream;

use super::{DataBudget, FormatReader, FormatWriter, Header, require_basics, write_zeros};

const TAR_BLOCK: usize = 512;

/// Largest extension record (pax header, GNU long name) we will buffer.
const MAX_EXTENSION: u64 = 16 * 1024 * 1024;

const LONG_LINK_NAME: &str = "././@LongLink";

/// Whether `head` starts with a tar header: a block with a valid checksum,
/// or the zero block of an empty archive.
pub(crate) fn is_tar(head: &[u8]) -> bool {
    if head.len() < TAR_BLOCK {
        return false;
    }
    let block = &head[..TAR_BLOCK];
    block.iter().all(|&b| b == 0) || checksum_ok(block)
}

fn checksum_ok(block: &[u8]) -> bool {
    let Some(stored) = parse_octal_u64(&block[148..156]) else {
        return false;
    };
    let mut unsigned = 0u64;
    let mut signed = 0i64;
    for (i, &b) in block.iter().enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += b as u64;
        signed += b as i8 as i64;
    }
    stored == unsigned || stored as i64 == signed
}

/// Parse a null-terminated C string from a tar header field
fn parse_cstr(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Parse an octal number from a tar header field
fn parse_octal_u64(field: &[u8]) -> Option<u64> {
    let s = String::from_utf8_lossy(parse_cstr(field)).trim().to_string();
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(&s, 8).ok()
}

/// Round up to next 512-byte boundary
fn round_up_512(n: u64) -> u64 {
    n.div_ceil(TAR_BLOCK as u64) * TAR_BLOCK as u64
}

fn padding(n: u64) -> u64 {
    round_up_512(n) - n
}

fn damaged(what: impl std::fmt::Display) -> Error {
    Error::format(format!("Damaged tar archive: {what}"))
}

/// Splits pax extended header data into its `key=value` records.
fn parse_pax(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.iter().all(|&b| b == 0) {
            break;
        }
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| damaged("malformed pax record"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| damaged("malformed pax record length"))?;
        if len <= space + 1 || len > rest.len() || rest[len - 1] != b'\n' {
            return Err(damaged("malformed pax record length"));
        }
        let record = &rest[space + 1..len - 1];
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| damaged("pax record without '='"))?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        records.push((key, record[eq + 1..].to_vec()));
        rest = &rest[len..];
    }
    Ok(records)
}

fn pax_record(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    let base = key.len() + value.len() + 3;
    let mut len = base + base.to_string().len();
    if len.to_string().len() > base.to_string().len() {
        len += 1;
    }
    out.extend_from_slice(format!("{len} {key}=").as_bytes());
    out.extend_from_slice(value);
    out.push(b'\n');
}

/// Decimal seconds with an optional fraction, e.g. `1578226739.5` or `-1.25`.
fn parse_pax_time(text: &str) -> Option<Timestamp> {
    let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
    let negative = whole.starts_with('-');
    let secs: i64 = whole.parse().ok()?;
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
    let nsec: u32 = digits.parse().ok()?;
    if negative && nsec > 0 {
        Some(Timestamp::new(secs - 1, 1_000_000_000 - nsec))
    } else {
        Some(Timestamp::new(secs, nsec))
    }
}

fn format_pax_time(t: Timestamp) -> String {
    if t.nsec == 0 {
        return t.secs.to_string();
    }
    let (sign, secs, nsec) = if t.secs < 0 {
        ("-", (t.secs + 1).unsigned_abs(), 1_000_000_000 - t.nsec)
    } else {
        ("", t.secs as u64, t.nsec)
    };
    let frac = format!("{nsec:09}");
    format!("{sign}{secs}.{}", frac.trim_end_matches('0'))
}

/// Path, link and size as they stand after extension headers are applied.
struct Fields {
    path: Vec<u8>,
    link: Option<Vec<u8>>,
    size: u64,
}

fn apply_pax(entry: &mut Entry, fields: &mut Fields, key: &str, value: &[u8]) {
    let text = String::from_utf8_lossy(value);
    let number = || text.trim().parse::<i64>().ok();
    match key {
        "path" => fields.path = value.to_vec(),
        "linkpath" => fields.link = Some(value.to_vec()),
        "size" => {
            if let Ok(size) = text.trim().parse::<u64>() {
                fields.size = size;
            }
        }
        "uid" => {
            if let Some(uid) = number() {
                entry.set_uid(uid);
            }
        }
        "gid" => {
            if let Some(gid) = number() {
                entry.set_gid(gid);
            }
        }
        "uname" => entry.set_uname(text.to_string()),
        "gname" => entry.set_gname(text.to_string()),
        "mtime" | "atime" | "ctime" | "LIBARCHIVE.creationtime" => {
            let Some(t) = parse_pax_time(text.trim()) else {
                log::warn!("ignoring malformed pax {key} value {text:?}");
                return;
            };
            match key {
                "mtime" => entry.set_mtime(t.secs, t.nsec),
                "atime" => entry.set_atime(t.secs, t.nsec),
                "ctime" => entry.set_ctime(t.secs, t.nsec),
                _ => entry.set_birthtime(t.secs, t.nsec),
            }
        }
        "SCHILY.fflags" => {
            if let Some(bad) = entry.copy_fflags_text(&text) {
                log::warn!("ignoring unknown file flag {bad:?}");
            }
        }
        "SCHILY.dev" => {
            if let Some(v) = number() {
                entry.set_dev(v as u64);
            }
        }
        "SCHILY.ino" => {
            if let Some(v) = number() {
                entry.set_ino(v as u64);
            }
        }
        "SCHILY.nlink" => {
            if let Some(v) = number() {
                entry.set_nlink(v as u32);
            }
        }
        "SCHILY.devmajor" => {
            if let Some(v) = number() {
                entry.set_rdevmajor(v as u32);
            }
        }
        "SCHILY.devminor" => {
            if let Some(v) = number() {
                entry.set_rdevminor(v as u32);
            }
        }
        other => {
            if let Some(name) = other.strip_prefix("SCHILY.xattr.") {
                entry.xattr_add_entry(name, value);
            } else {
                log::trace!("ignoring pax key {other}");
            }
        }
    }
}

/// Extension records collected ahead of the header they apply to.
#[derive(Default)]
struct Pending {
    pax: Vec<(String, Vec<u8>)>,
    long_name: Option<Vec<u8>>,
    long_link: Option<Vec<u8>>,
    seen: bool,
}

pub(crate) struct TarReader {
    format: Format,
    saw_pax: bool,
    remaining: u64,
    padding: u64,
    global: Vec<(String, Vec<u8>)>,
    finished: bool,
}

impl TarReader {
    pub(crate) fn new() -> Self {
        TarReader {
            format: Format::Tar,
            saw_pax: false,
            remaining: 0,
            padding: 0,
            global: Vec::new(),
            finished: false,
        }
    }

    fn read_extension(&mut self, s: &mut DecodeStream, size: u64) -> Result<Vec<u8>> {
        if size > MAX_EXTENSION {
            return Err(damaged(format!("{size} byte extension header")));
        }
        let mut data = vec![0u8; size as usize];
        if s.read_full(&mut data).map_err(Error::Io)? < data.len() {
            return Err(Error::format("Truncated tar archive"));
        }
        s.skip_exact(padding(size)).map_err(|e| Error::body(e, "tar"))?;
        Ok(data)
    }

    fn decode(&mut self, block: &[u8; TAR_BLOCK], pending: Pending) -> Result<(Entry, u64)> {
        let raw = RawHeader::from_byte_slice(block);
        let size = raw.entry_size().map_err(damaged)?;
        let typeflag = block[156];

        let mut fields = Fields {
            path: match pending.long_name {
                Some(name) => name,
                None => raw.path_bytes().into_owned(),
            },
            link: match pending.long_link {
                Some(link) => Some(link),
                None => raw.link_name_bytes().map(|l| l.into_owned()),
            },
            size,
        };

        let mut entry = Entry::new();
        entry.set_mode(raw.mode().map_err(damaged)? & 0o7777);
        entry.set_uid(raw.uid().map_err(damaged)? as i64);
        entry.set_gid(raw.gid().map_err(damaged)? as i64);
        entry.set_mtime(raw.mtime().map_err(damaged)? as i64, 0);
        if let Some(name) = raw.username_bytes().filter(|n| !n.is_empty()) {
            entry.set_uname(String::from_utf8_lossy(name).into_owned());
        }
        if let Some(name) = raw.groupname_bytes().filter(|n| !n.is_empty()) {
            entry.set_gname(String::from_utf8_lossy(name).into_owned());
        }
        if let Some(gnu) = raw.as_gnu() {
            if let Ok(atime) = gnu.atime() {
                if atime > 0 {
                    entry.set_atime(atime as i64, 0);
                }
            }
            if let Ok(ctime) = gnu.ctime() {
                if ctime > 0 {
                    entry.set_ctime(ctime as i64, 0);
                }
            }
        }

        let kind = match typeflag {
            b'1' => FileType::Regular,
            b'2' => FileType::Symlink,
            b'3' => FileType::CharDevice,
            b'4' => FileType::BlockDevice,
            b'5' => FileType::Directory,
            b'6' => FileType::Fifo,
            b'S' => return Err(Error::format("GNU sparse files are not supported")),
            _ if fields.path.ends_with(b"/") => FileType::Directory,
            _ => FileType::Regular,
        };
        entry.set_filetype(kind);

        if matches!(kind, FileType::CharDevice | FileType::BlockDevice) {
            if let (Ok(Some(major)), Ok(Some(minor))) = (raw.device_major(), raw.device_minor()) {
                entry.set_rdev(makedev(major, minor));
            }
        }

        for (key, value) in self.global.iter().chain(pending.pax.iter()) {
            apply_pax(&mut entry, &mut fields, key, value);
        }

        entry.set_pathname(String::from_utf8_lossy(&fields.path).into_owned());
        if let Some(link) = fields.link.filter(|l| !l.is_empty()) {
            let link = String::from_utf8_lossy(&link).into_owned();
            match typeflag {
                b'1' => entry.set_hardlink(link),
                b'2' => entry.set_symlink(link),
                _ => {}
            }
        }
        entry.set_size(fields.size);

        self.format = if self.saw_pax {
            Format::TarPaxInterchange
        } else if raw.as_gnu().is_some() {
            Format::TarGnutar
        } else if raw.as_ustar().is_some() {
            Format::TarUstar
        } else {
            Format::Tar
        };
        Ok((entry, fields.size))
    }
}

impl FormatReader for TarReader {
    fn format(&self) -> Format {
        self.format
    }

    fn next_header(&mut self, s: &mut DecodeStream) -> Result<Option<Header>> {
        if self.finished {
            return Ok(None);
        }
        s.skip_exact(self.remaining + self.padding)
            .map_err(|e| Error::body(e, "tar"))?;
        self.remaining = 0;
        self.padding = 0;

        let mut block = [0u8; TAR_BLOCK];
        let mut pending = Pending::default();
        let mut zero_blocks = 0u8;
        let mut position = s.position();

        loop {
            if !pending.seen {
                position = s.position();
            }
            let n = s.read_full(&mut block).map_err(Error::Io)?;
            if n == 0 && !pending.seen {
                // Lenient about archives cut short of their trailer, as long
                // as the cut falls on a header boundary.
                if zero_blocks < 2 {
                    log::warn!("tar archive ends without an end-of-archive marker");
                }
                self.finished = true;
                return Ok(None);
            }
            if n < TAR_BLOCK {
                return Err(Error::format("Truncated tar archive"));
            }

            // Check for end-of-archive marker (two consecutive zero blocks)
            if block.iter().all(|&b| b == 0) {
                if pending.seen {
                    return Err(damaged("extension header without an entry"));
                }
                zero_blocks += 1;
                if zero_blocks >= 2 {
                    self.finished = true;
                    return Ok(None);
                }
                continue;
            }
            zero_blocks = 0;

            if !checksum_ok(&block) {
                return Err(Error::format("Damaged tar archive"));
            }

            let size = RawHeader::from_byte_slice(&block)
                .entry_size()
                .map_err(damaged)?;
            match block[156] {
                b'x' => {
                    let data = self.read_extension(s, size)?;
                    pending.pax.extend(parse_pax(&data)?);
                    self.saw_pax = true;
                }
                b'g' => {
                    let data = self.read_extension(s, size)?;
                    for (key, value) in parse_pax(&data)? {
                        self.global.retain(|(k, _)| *k != key);
                        self.global.push((key, value));
                    }
                    self.saw_pax = true;
                }
                b'L' => {
                    let data = self.read_extension(s, size)?;
                    pending.long_name = Some(parse_cstr(&data).to_vec());
                }
                b'K' => {
                    let data = self.read_extension(s, size)?;
                    pending.long_link = Some(parse_cstr(&data).to_vec());
                }
                b'V' => {
                    // GNU volume label
                    s.skip_exact(round_up_512(size))
                        .map_err(|e| Error::body(e, "tar"))?;
                    continue;
                }
                _ => {
                    let (entry, data_size) = self.decode(&block, pending)?;
                    self.remaining = data_size;
                    self.padding = padding(data_size);
                    log::trace!(
                        "tar header for {:?} at offset {position}",
                        entry.pathname().unwrap_or("")
                    );
                    return Ok(Some(Header { entry, position }));
                }
            }
            pending.seen = true;
        }
    }

    fn read_data(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = s.read(&mut buf[..want]).map_err(|e| Error::body(e, "tar"))?;
        if n == 0 {
            return Err(Error::format("Truncated tar archive"));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    fn skip_data(&mut self, s: &mut DecodeStream) -> Result<()> {
        s.skip_exact(self.remaining)
            .map_err(|e| Error::body(e, "tar"))?;
        self.remaining = 0;
        Ok(())
    }
}

/// Largest value an octal header field of `width` bytes holds.
fn octal_max(width: u32) -> u64 {
    (1u64 << (3 * (width - 1))) - 1
}

fn put(field: &mut [u8], bytes: &[u8]) {
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    field[n..].fill(0);
}

/// Splits a path into ustar `(prefix, name)` when it fits the two fields.
fn split_ustar(path: &[u8]) -> Option<(&[u8], &[u8])> {
    if path.len() <= 100 {
        return Some((&[], path));
    }
    path.iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'/')
        .map(|(i, _)| (&path[..i], &path[i + 1..]))
        .find(|(prefix, name)| prefix.len() <= 155 && !name.is_empty() && name.len() <= 100)
}

pub(crate) struct TarWriter {
    format: Format,
    budget: DataBudget,
    padding: u64,
}

impl TarWriter {
    pub(crate) fn new(format: Format) -> Self {
        TarWriter {
            format,
            budget: DataBudget::default(),
            padding: 0,
        }
    }

    fn end_entry(&mut self, out: &mut dyn Write) -> Result<()> {
        self.budget.fill(out)?;
        write_zeros(out, self.padding)?;
        self.padding = 0;
        Ok(())
    }

    fn raw_header(&self) -> RawHeader {
        match self.format {
            Format::TarGnutar => RawHeader::new_gnu(),
            _ => RawHeader::new_ustar(),
        }
    }

    /// Writes a header-plus-payload pseudo entry (pax or GNU long name).
    fn write_extension(
        &self,
        out: &mut dyn Write,
        name: &[u8],
        flag: u8,
        payload: &[u8],
        mtime: u64,
    ) -> Result<()> {
        let mut raw = self.raw_header();
        put(&mut raw.as_old_mut().name, name);
        raw.set_mode(0o644);
        raw.set_uid(0);
        raw.set_gid(0);
        raw.set_mtime(mtime);
        raw.set_size(payload.len() as u64);
        raw.set_entry_type(EntryType::new(flag));
        raw.set_cksum();
        out.write_all(raw.as_bytes())?;
        out.write_all(payload)?;
        write_zeros(out, padding(payload.len() as u64))?;
        Ok(())
    }

    /// Builds the pax records `entry` needs; empty when none are.
    fn pax_records(&self, entry: &Entry, path: &[u8], link: Option<&[u8]>, size: u64) -> Vec<u8> {
        let mut needed = Vec::new();
        let ascii = |b: &[u8]| b.is_ascii();

        if !ascii(path) || split_ustar(path).is_none() {
            pax_record(&mut needed, "path", path);
        }
        if let Some(link) = link {
            if !ascii(link) || link.len() > 100 {
                pax_record(&mut needed, "linkpath", link);
            }
        }
        if entry.uid() < 0 || entry.uid() as u64 > octal_max(8) {
            pax_record(&mut needed, "uid", entry.uid().to_string().as_bytes());
        }
        if entry.gid() < 0 || entry.gid() as u64 > octal_max(8) {
            pax_record(&mut needed, "gid", entry.gid().to_string().as_bytes());
        }
        for (key, name) in [("uname", entry.uname()), ("gname", entry.gname())] {
            if let Some(name) = name.filter(|n| !n.is_ascii() || n.len() > 32) {
                pax_record(&mut needed, key, name.as_bytes());
            }
        }
        if size > octal_max(12) {
            pax_record(&mut needed, "size", size.to_string().as_bytes());
        }
        if let Some(mtime) = entry.mtime() {
            if mtime.nsec != 0 || mtime.secs < 0 || mtime.secs as u64 > octal_max(12) {
                pax_record(&mut needed, "mtime", format_pax_time(mtime).as_bytes());
            }
        }
        if matches!(entry.filetype(), Some(FileType::CharDevice | FileType::BlockDevice)) {
            if entry.rdevmajor() as u64 > octal_max(8) {
                pax_record(&mut needed, "SCHILY.devmajor", entry.rdevmajor().to_string().as_bytes());
            }
            if entry.rdevminor() as u64 > octal_max(8) {
                pax_record(&mut needed, "SCHILY.devminor", entry.rdevminor().to_string().as_bytes());
            }
        }
        if let Some(flags) = entry.fflags_text() {
            pax_record(&mut needed, "SCHILY.fflags", flags.as_bytes());
        }
        for xattr in entry.xattr_iter() {
            pax_record(&mut needed, &format!("SCHILY.xattr.{}", xattr.name), &xattr.value);
        }

        let extended_times = [
            ("atime", entry.atime()),
            ("ctime", entry.ctime()),
            ("LIBARCHIVE.creationtime", entry.birthtime()),
        ];
        let any_time = extended_times.iter().any(|(_, t)| t.is_some());
        let emit = !needed.is_empty() || (self.format == Format::TarPaxInterchange && any_time);
        if !emit {
            return needed;
        }
        for (key, time) in extended_times {
            if let Some(t) = time {
                pax_record(&mut needed, key, format_pax_time(t).as_bytes());
            }
        }
        needed
    }
}

impl FormatWriter for TarWriter {
    fn write_header(&mut self, out: &mut dyn Write, entry: &Entry) -> Result<()> {
        self.end_entry(out)?;
        let path = require_basics(entry)?;
        let kind = entry.filetype().unwrap_or(FileType::Regular);

        let mut path = path.as_bytes().to_vec();
        if kind == FileType::Directory && !path.ends_with(b"/") {
            path.push(b'/');
        }
        let (flag, link) = match (kind, entry.hardlink(), entry.symlink()) {
            (_, Some(target), _) if kind != FileType::Directory => (b'1', Some(target)),
            (FileType::Symlink, _, target) => (b'2', Some(target.unwrap_or(""))),
            (FileType::Regular, ..) => (b'0', None),
            (FileType::CharDevice, ..) => (b'3', None),
            (FileType::BlockDevice, ..) => (b'4', None),
            (FileType::Directory, ..) => (b'5', None),
            (FileType::Fifo, ..) => (b'6', None),
            (FileType::Socket, ..) => {
                return Err(Error::format(format!(
                    "{}: tar format cannot archive socket",
                    String::from_utf8_lossy(&path)
                )));
            }
        };
        let link = link.map(str::as_bytes);
        let size = if flag == b'0' { entry.size() } else { 0 };
        let device = matches!(flag, b'3' | b'4');
        if device && !entry.rdev_is_set() {
            return Err(Error::format(format!(
                "{}: device entry has no device number",
                String::from_utf8_lossy(&path)
            )));
        }
        let mtime = entry.mtime().map(|t| t.secs.max(0) as u64).unwrap_or(0);
        let display = String::from_utf8_lossy(&path).into_owned();

        let mut name: &[u8] = &path;
        let mut prefix: &[u8] = &[];
        match self.format {
            Format::TarUstar => {
                (prefix, name) = split_ustar(&path).ok_or_else(|| {
                    Error::format(format!("{display}: pathname too long for ustar format"))
                })?;
                if link.is_some_and(|l| l.len() > 100) {
                    return Err(Error::format(format!("{display}: link name too long for ustar format")));
                }
                if entry.uid() < 0 || entry.uid() as u64 > octal_max(8) || entry.gid() < 0 || entry.gid() as u64 > octal_max(8) {
                    return Err(Error::format(format!("{display}: numeric owner too large for ustar format")));
                }
                if size > octal_max(12) {
                    return Err(Error::format(format!("{display}: file too large for ustar format")));
                }
            }
            Format::TarGnutar => {
                if path.len() > 100 {
                    let mut payload = path.clone();
                    payload.push(0);
                    self.write_extension(out, LONG_LINK_NAME.as_bytes(), b'L', &payload, 0)?;
                }
                if let Some(link) = link.filter(|l| l.len() > 100) {
                    let mut payload = link.to_vec();
                    payload.push(0);
                    self.write_extension(out, LONG_LINK_NAME.as_bytes(), b'K', &payload, 0)?;
                }
            }
            _ => {
                let records = self.pax_records(entry, &path, link, size);
                if !records.is_empty() {
                    let base = path
                        .strip_suffix(b"/")
                        .unwrap_or(&path[..])
                        .rsplit(|&b| b == b'/')
                        .next()
                        .unwrap_or_default();
                    let mut pax_name = b"PaxHeader/".to_vec();
                    pax_name.extend_from_slice(base);
                    self.write_extension(out, &pax_name, b'x', &records, mtime)?;
                }
                if let Some(split) = split_ustar(&path) {
                    (prefix, name) = split;
                }
            }
        }

        let mut raw = self.raw_header();
        put(&mut raw.as_old_mut().name, name);
        if let Some(ustar) = raw.as_ustar_mut() {
            put(&mut ustar.prefix, prefix);
        }
        if let Some(link) = link {
            put(&mut raw.as_old_mut().linkname, link);
        }
        raw.set_mode(entry.perm());
        raw.set_uid(entry.uid().clamp(0, octal_max(8) as i64) as u64);
        raw.set_gid(entry.gid().clamp(0, octal_max(8) as i64) as u64);
        raw.set_mtime(mtime.min(octal_max(12)));
        raw.set_size(if self.format == Format::TarGnutar { size } else { size.min(octal_max(12)) });

        let uname = entry.uname().unwrap_or("").as_bytes();
        let gname = entry.gname().unwrap_or("").as_bytes();
        if let Some(ustar) = raw.as_ustar_mut() {
            put(&mut ustar.uname, uname);
            put(&mut ustar.gname, gname);
        } else if let Some(gnu) = raw.as_gnu_mut() {
            put(&mut gnu.uname, uname);
            put(&mut gnu.gname, gname);
            if let Some(atime) = entry.atime() {
                gnu.set_atime(atime.secs.max(0) as u64);
            }
            if let Some(ctime) = entry.ctime() {
                gnu.set_ctime(ctime.secs.max(0) as u64);
            }
        }
        if device {
            let major = (entry.rdevmajor() as u64).min(octal_max(8)) as u32;
            let minor = (entry.rdevminor() as u64).min(octal_max(8)) as u32;
            raw.set_device_major(major)?;
            raw.set_device_minor(minor)?;
        }
        raw.set_entry_type(EntryType::new(flag));
        raw.set_cksum();
        out.write_all(raw.as_bytes())?;

        self.budget.start(&display, size);
        self.padding = padding(size);
        Ok(())
    }

    fn write_data(&mut self, out: &mut dyn Write, data: &[u8]) -> Result<usize> {
        let n = self.budget.accept(data.len());
        out.write_all(&data[..n])?;
        Ok(n)
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        self.end_entry(out)?;
        write_zeros(out, 2 * TAR_BLOCK as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::io::source::{Source, SourceReader};
    use bytes::Bytes;

    fn write_archive(format: Format, entries: &[(Entry, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = TarWriter::new(format);
        for (entry, data) in entries {
            writer.write_header(&mut out, entry).unwrap();
            writer.write_data(&mut out, data).unwrap();
        }
        writer.finish(&mut out).unwrap();
        out
    }

    fn read_archive(data: Vec<u8>) -> (Format, Vec<(Entry, Vec<u8>)>) {
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let mut reader = TarReader::new();
        let mut out = Vec::new();
        while let Some(header) = reader.next_header(&mut s).unwrap() {
            let mut data = Vec::new();
            let mut buf = [0u8; 100];
            loop {
                let n = reader.read_data(&mut s, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            out.push((header.entry, data));
        }
        (reader.format(), out)
    }

    fn file(path: &str, data: &[u8]) -> Entry {
        let mut e = Entry::new();
        e.set_pathname(path);
        e.set_filetype(FileType::Regular);
        e.set_perm(0o644);
        e.set_size(data.len() as u64);
        e.set_mtime(1_578_226_739, 0);
        e
    }

    #[test]
    fn test_parse_cstr() {
        assert_eq!(parse_cstr(b"test.txt\0\0\0\0"), b"test.txt");
        assert_eq!(parse_cstr(b"\0\0\0\0"), b"");
    }

    #[test]
    fn test_parse_octal_u64() {
        assert_eq!(parse_octal_u64(b"0000644\0"), Some(420));
        assert_eq!(parse_octal_u64(b"04000000\0"), Some(1048576));
        assert_eq!(parse_octal_u64(b"\0\0\0\0"), None);
    }

    #[test]
    fn test_round_up_512() {
        assert_eq!(round_up_512(0), 0);
        assert_eq!(round_up_512(1), 512);
        assert_eq!(round_up_512(512), 512);
        assert_eq!(round_up_512(513), 1024);
    }

    #[test]
    fn test_pax_record_length_counts_itself() {
        let mut out = Vec::new();
        pax_record(&mut out, "mtime", b"1578226739.123456789");
        assert_eq!(out, b"30 mtime=1578226739.123456789\n");
        let parsed = parse_pax(&out).unwrap();
        assert_eq!(parsed, vec![("mtime".to_string(), b"1578226739.123456789".to_vec())]);

        let mut out = Vec::new();
        pax_record(&mut out, "path", &[b'a'; 91]);
        assert_eq!(&out[..4], b"101 ");
        assert_eq!(out.len(), 101);
    }

    #[test]
    fn test_pax_time_fractions() {
        assert_eq!(parse_pax_time("12.5"), Some(Timestamp::new(12, 500_000_000)));
        assert_eq!(parse_pax_time("-1.25"), Some(Timestamp::new(-2, 750_000_000)));
        assert_eq!(parse_pax_time("7"), Some(Timestamp::new(7, 0)));
        assert_eq!(format_pax_time(Timestamp::new(-2, 750_000_000)), "-1.25");
        assert_eq!(format_pax_time(Timestamp::new(12, 500_000_000)), "12.5");
    }

    #[test]
    fn test_written_header_is_detected() {
        let data = write_archive(Format::TarUstar, &[(file("a.txt", b"hi"), b"hi")]);
        assert!(is_tar(&data));
        assert_eq!(data.len() % 512, 0);
        assert!(!is_tar(b"not a tar"));
    }

    #[test]
    fn test_ustar_round_trip() {
        let mut dir = Entry::new();
        dir.set_pathname("test/");
        dir.set_filetype(FileType::Directory);
        dir.set_perm(0o755);
        let mut link = Entry::new();
        link.set_pathname("test/l.dat");
        link.set_filetype(FileType::Symlink);
        link.set_perm(0o777);
        link.set_symlink("../c.dat");

        let data = write_archive(
            Format::TarUstar,
            &[(dir, b""), (file("test/a.dat", b"hello"), b"hello"), (link, b"")],
        );
        let (format, entries) = read_archive(data);
        assert_eq!(format, Format::TarUstar);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0.pathname(), Some("test/"));
        assert!(entries[0].0.is_directory());
        assert_eq!(entries[1].1, b"hello");
        assert_eq!(entries[1].0.perm(), 0o644);
        assert!(!entries[1].0.atime_is_set());
        assert_eq!(entries[2].0.symlink(), Some("../c.dat"));
    }

    #[test]
    fn test_ustar_rejects_long_names() {
        let long = "x".repeat(120);
        let mut writer = TarWriter::new(Format::TarUstar);
        let err = writer.write_header(&mut Vec::new(), &file(&long, b"")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_ustar_splits_prefix() {
        let path = format!("{}/{}", "d".repeat(120), "f".repeat(90));
        let data = write_archive(Format::TarUstar, &[(file(&path, b""), b"")]);
        let (_, entries) = read_archive(data);
        assert_eq!(entries[0].0.pathname(), Some(path.as_str()));
    }

    #[test]
    fn test_gnu_long_names() {
        let path = format!("{}/file.txt", "deep".repeat(40));
        let data = write_archive(Format::TarGnutar, &[(file(&path, b"abc"), b"abc")]);
        let (format, entries) = read_archive(data);
        assert_eq!(format, Format::TarGnutar);
        assert_eq!(entries[0].0.pathname(), Some(path.as_str()));
        assert_eq!(entries[0].1, b"abc");
    }

    #[test]
    fn test_pax_carries_extended_fields() {
        let path = format!("{}/ταБЬℓσ.dat", "p".repeat(200));
        let mut e = file(&path, b"xyz");
        e.set_mtime(1_578_226_739, 250_000_000);
        e.set_atime(1_578_226_000, 0);
        e.set_uid(5_000_000);
        e.xattr_add_entry("user.foo", "bar");
        let data = write_archive(Format::TarPaxRestricted, &[(e, b"xyz")]);
        let (format, entries) = read_archive(data);
        assert_eq!(format, Format::TarPaxInterchange);
        let mut got = entries[0].0.clone();
        assert_eq!(got.pathname(), Some(path.as_str()));
        assert_eq!(got.mtime(), Some(Timestamp::new(1_578_226_739, 250_000_000)));
        assert_eq!(got.atime(), Some(Timestamp::new(1_578_226_000, 0)));
        assert_eq!(got.uid(), 5_000_000);
        assert_eq!(got.xattr_count(), 1);
        assert_eq!(got.xattr_next().unwrap().value, b"bar");
        assert_eq!(entries[0].1, b"xyz");
    }

    #[test]
    fn test_pax_restricted_skips_header_when_unneeded() {
        let mut e = file("plain.txt", b"");
        e.set_atime(1_000, 0);
        let restricted = write_archive(Format::TarPaxRestricted, &[(e.clone(), b"")]);
        let (_, entries) = read_archive(restricted);
        assert!(!entries[0].0.atime_is_set());

        let interchange = write_archive(Format::TarPaxInterchange, &[(e, b"")]);
        let (_, entries) = read_archive(interchange);
        assert_eq!(entries[0].0.atime(), Some(Timestamp::new(1_000, 0)));
        assert!(!entries[0].0.birthtime_is_set());
    }

    #[test]
    fn test_device_without_number_fails() {
        let mut e = Entry::new();
        e.set_pathname("dev/null");
        e.set_filetype(FileType::CharDevice);
        let mut writer = TarWriter::new(Format::TarUstar);
        let err = writer.write_header(&mut Vec::new(), &e).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);

        e.set_rdev(makedev(1, 3));
        let data = write_archive(Format::TarUstar, &[(e, b"")]);
        let (_, entries) = read_archive(data);
        assert_eq!(entries[0].0.rdevmajor(), 1);
        assert_eq!(entries[0].0.rdevminor(), 3);
    }

    #[test]
    fn test_short_data_is_zero_filled_and_long_truncated() {
        let data = write_archive(
            Format::TarUstar,
            &[(file("short", b"abcdef"), b"abc"), (file("long", b"ab"), b"abcdef")],
        );
        let (_, entries) = read_archive(data);
        assert_eq!(entries[0].1, b"abc\0\0\0");
        assert_eq!(entries[1].1, b"ab");
    }

    #[test]
    fn test_truncated_archive_is_format_error() {
        let mut data = write_archive(Format::TarUstar, &[(file("a", &[1; 1000]), &[1; 1000])]);
        data.truncate(700);
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let mut reader = TarReader::new();
        reader.next_header(&mut s).unwrap().unwrap();
        let err = reader.next_header(&mut s).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_empty_archive() {
        let (_, entries) = read_archive(vec![0u8; 1024]);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_header_positions_include_extensions() {
        let long = format!("{}/x", "n".repeat(150));
        let data = write_archive(
            Format::TarGnutar,
            &[(file("a", b"1"), b"1"), (file(&long, b"2"), b"2")],
        );
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let mut reader = TarReader::new();
        assert_eq!(reader.next_header(&mut s).unwrap().unwrap().position, 0);
        assert_eq!(reader.next_header(&mut s).unwrap().unwrap().position, 1024);
    }
}
