use std::collections::VecDeque;
use std::io::{BufRead, Read, SeekFrom, Write};

use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};
use crc32fast::Hasher;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::codes::Format;
use crate::entry::{Entry, FileType, S_IFMT, Timestamp};
use crate::error::{Error, Result};
use crate::io::stream::DecodeStream;

use super::{DataBudget, FormatReader, FormatWriter, Header, require_basics};

const LOCAL_SIGNATURE: &[u8; 4] = b"PK\x03\x04";
const CENTRAL_SIGNATURE: &[u8; 4] = b"PK\x01\x02";
const DESCRIPTOR_SIGNATURE: &[u8; 4] = b"PK\x07\x08";
const EOCD_SIGNATURE: &[u8; 4] = b"PK\x05\x06";
const ZIP64_EOCD_SIGNATURE: &[u8; 4] = b"PK\x06\x06";
const ZIP64_LOCATOR_SIGNATURE: &[u8; 4] = b"PK\x06\x07";

/// Minimum size for EOCD (4 bytes signature + 18 bytes data)
const MIN_EOCD_SIZE: usize = 22;

/// Central Directory File Header minimum size (fixed portion)
const CDFH_MIN_SIZE: usize = 46;

/// Local File Header minimum size (fixed portion)
const LOCAL_HEADER_MIN_SIZE: usize = 30;

/// ZIP compression methods
const COMPRESSION_STORED: u16 = 0;
const COMPRESSION_DEFLATE: u16 = 8;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8: u16 = 1 << 11;

const EXTRA_ZIP64: u16 = 0x0001;
const EXTRA_TIMESTAMP: u16 = 0x5455;
const EXTRA_INFOZIP_UNIX: u16 = 0x5855;
const EXTRA_UNIX_OWNER: u16 = 0x7875;

/// Central directories larger than this are treated as damage.
const MAX_CENTRAL_DIRECTORY: u64 = 256 * 1024 * 1024;

const UNIX_CREATOR: u16 = 3;

pub(crate) fn is_zip(head: &[u8]) -> bool {
    head.starts_with(LOCAL_SIGNATURE)
        || head.starts_with(EOCD_SIGNATURE)
        || (head.starts_with(DESCRIPTOR_SIGNATURE) && head[4..].starts_with(LOCAL_SIGNATURE))
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn damaged(what: impl std::fmt::Display) -> Error {
    Error::format(format!("Damaged zip archive: {what}"))
}

fn read_exact(s: &mut DecodeStream, buf: &mut [u8]) -> Result<()> {
    if s.read_full(buf).map_err(Error::Io)? < buf.len() {
        return Err(Error::format("Truncated zip archive"));
    }
    Ok(())
}

fn decode_name(bytes: &[u8], flags: u16) -> String {
    if flags & FLAG_UTF8 != 0 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            // Legacy encoding - preserve byte values as chars
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// DOS time and date written for an entry with no mtime: 1980-01-01 00:00.
const DOS_NO_TIME: (u16, u16) = (0, (1 << 5) | 1);

/// `None` for the placeholder written when no mtime was set.
fn from_dos_time(time: u16, date: u16) -> Option<i64> {
    if (time, date) == DOS_NO_TIME {
        return None;
    }
    let naive = NaiveDate::from_ymd_opt(
        1980 + (date >> 9) as i32,
        ((date >> 5) & 0xf) as u32,
        (date & 0x1f) as u32,
    )?
    .and_hms_opt(
        (time >> 11) as u32,
        ((time >> 5) & 0x3f) as u32,
        ((time & 0x1f) * 2) as u32,
    )?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

fn to_dos_time(mtime: Option<Timestamp>) -> (u16, u16) {
    let local = mtime.and_then(|t| Local.timestamp_opt(t.secs, 0).single());
    match local {
        Some(dt) if (1980..=2107).contains(&dt.year()) => {
            let time = (dt.hour() << 11) | (dt.minute() << 5) | (dt.second() / 2);
            let date = (((dt.year() - 1980) as u32) << 9) | (dt.month() << 5) | dt.day();
            (time as u16, date as u16)
        }
        _ => DOS_NO_TIME,
    }
}

/// Sizes and offset that a zip64 extra field may override.
#[derive(Debug, Clone, Copy)]
struct Sizes {
    compressed: u64,
    uncompressed: u64,
    offset: u64,
}

/// Applies the extra fields this reader understands. Returns whether a
/// zip64 field was present.
fn apply_extra(entry: &mut Entry, sizes: &mut Sizes, extra: &[u8]) -> bool {
    let mut zip64 = false;
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = le16(extra, pos);
        let len = le16(extra, pos + 2) as usize;
        let Some(field) = extra.get(pos + 4..pos + 4 + len) else {
            break;
        };
        match id {
            EXTRA_ZIP64 => {
                zip64 = true;
                let mut at = 0;
                let mut take = |slot: &mut u64| {
                    if *slot == u32::MAX as u64 && at + 8 <= field.len() {
                        *slot = le64(field, at);
                        at += 8;
                    }
                };
                take(&mut sizes.uncompressed);
                take(&mut sizes.compressed);
                take(&mut sizes.offset);
            }
            EXTRA_TIMESTAMP if !field.is_empty() => {
                let flags = field[0];
                let mut at = 1;
                for bit in 0..3 {
                    if flags & (1 << bit) == 0 {
                        continue;
                    }
                    if at + 4 > field.len() {
                        break;
                    }
                    let secs = le32(field, at) as i32 as i64;
                    at += 4;
                    match bit {
                        0 => entry.set_mtime(secs, 0),
                        1 => entry.set_atime(secs, 0),
                        _ => entry.set_ctime(secs, 0),
                    }
                }
            }
            EXTRA_INFOZIP_UNIX if field.len() >= 8 => {
                entry.set_atime(le32(field, 0) as i32 as i64, 0);
                entry.set_mtime(le32(field, 4) as i32 as i64, 0);
                if field.len() >= 12 {
                    entry.set_uid(le16(field, 8) as i64);
                    entry.set_gid(le16(field, 10) as i64);
                }
            }
            EXTRA_UNIX_OWNER if field.len() >= 3 && field[0] == 1 => {
                let read_id = |at: usize| -> Option<(i64, usize)> {
                    let size = *field.get(at)? as usize;
                    let bytes = field.get(at + 1..at + 1 + size)?;
                    let mut value = 0u64;
                    for (i, &b) in bytes.iter().take(8).enumerate() {
                        value |= (b as u64) << (8 * i);
                    }
                    Some((value as i64, at + 1 + size))
                };
                if let Some((uid, next)) = read_id(1) {
                    entry.set_uid(uid);
                    if let Some((gid, _)) = read_id(next) {
                        entry.set_gid(gid);
                    }
                }
            }
            _ => {}
        }
        pos += 4 + len;
    }
    zip64
}

/// Type and permissions from the creator's attributes, falling back to
/// the name and DOS attributes for archives made elsewhere.
fn apply_mode(entry: &mut Entry, made_by: u16, external: u32, name: &str) {
    let unix_mode = external >> 16;
    if made_by >> 8 == UNIX_CREATOR && unix_mode & S_IFMT != 0 {
        entry.set_mode(unix_mode);
        if !entry.is_directory() && name.ends_with('/') {
            entry.set_filetype(FileType::Directory);
        }
        return;
    }
    if name.ends_with('/') || external & 0x10 != 0 {
        entry.set_filetype(FileType::Directory);
        entry.set_perm(if made_by >> 8 == UNIX_CREATOR && unix_mode != 0 { unix_mode } else { 0o755 });
    } else {
        entry.set_filetype(FileType::Regular);
        entry.set_perm(if made_by >> 8 == UNIX_CREATOR && unix_mode != 0 { unix_mode } else { 0o644 });
    }
}

/// One central directory record.
struct CentralRecord {
    entry: Entry,
    flags: u16,
    method: u16,
    crc: u32,
    sizes: Sizes,
}

/// Parse central directory file headers into records, in archive order.
fn parse_central_directory(data: &[u8]) -> Result<VecDeque<CentralRecord>> {
    let mut records = VecDeque::new();
    let mut pos = 0;

    while pos + CDFH_MIN_SIZE <= data.len() {
        if !data[pos..].starts_with(CENTRAL_SIGNATURE) {
            // Reached end of central directory entries
            break;
        }
        let made_by = le16(data, pos + 4);
        let flags = le16(data, pos + 8);
        let method = le16(data, pos + 10);
        let (time, date) = (le16(data, pos + 12), le16(data, pos + 14));
        let crc = le32(data, pos + 16);
        let mut sizes = Sizes {
            compressed: le32(data, pos + 20) as u64,
            uncompressed: le32(data, pos + 24) as u64,
            offset: le32(data, pos + 42) as u64,
        };
        let name_len = le16(data, pos + 28) as usize;
        let extra_len = le16(data, pos + 30) as usize;
        let comment_len = le16(data, pos + 32) as usize;
        let external = le32(data, pos + 38);

        let name_start = pos + CDFH_MIN_SIZE;
        let extra_start = name_start + name_len;
        let end = extra_start + extra_len + comment_len;
        if end > data.len() {
            return Err(damaged(format!("truncated central directory entry at {pos}")));
        }

        let name = decode_name(&data[name_start..extra_start], flags);
        let mut entry = Entry::new();
        if let Some(mtime) = from_dos_time(time, date) {
            entry.set_mtime(mtime, 0);
        }
        apply_mode(&mut entry, made_by, external, &name);
        apply_extra(&mut entry, &mut sizes, &data[extra_start..extra_start + extra_len]);
        entry.set_size(if entry.is_regular_file() { sizes.uncompressed } else { 0 });
        entry.set_pathname(name);

        records.push_back(CentralRecord {
            entry,
            flags,
            method,
            crc,
            sizes,
        });
        pos = end;
    }
    Ok(records)
}

/// Locates and reads the central directory of a seekable stream.
fn load_central_directory(s: &mut DecodeStream) -> Result<VecDeque<CentralRecord>> {
    let len = s.seek(SeekFrom::End(0)).map_err(Error::Io)?;
    let tail_len = len.min((MIN_EOCD_SIZE + u16::MAX as usize) as u64);
    s.seek(SeekFrom::Start(len - tail_len)).map_err(Error::Io)?;
    let mut tail = vec![0u8; tail_len as usize];
    read_exact(s, &mut tail)?;

    // Search backwards from the end for the EOCD signature
    let eocd = (0..=tail.len().saturating_sub(MIN_EOCD_SIZE))
        .rev()
        .find(|&i| tail[i..].starts_with(EOCD_SIGNATURE))
        .ok_or_else(|| damaged("could not find end of central directory"))?;
    let record = &tail[eocd..];
    if le16(record, 4) != 0 || le16(record, 6) != 0 {
        return Err(Error::format("Multi-disk ZIP archives are not supported"));
    }
    let mut count = le16(record, 10) as u64;
    let mut cd_size = le32(record, 12) as u64;
    let mut cd_offset = le32(record, 16) as u64;

    let needs_zip64 = count == u16::MAX as u64 || cd_size == u32::MAX as u64 || cd_offset == u32::MAX as u64;
    if needs_zip64 && eocd >= 20 && tail[eocd - 20..].starts_with(ZIP64_LOCATOR_SIGNATURE) {
        let at = le64(&tail, eocd - 20 + 8);
        s.seek(SeekFrom::Start(at)).map_err(Error::Io)?;
        let mut zip64 = [0u8; 56];
        read_exact(s, &mut zip64)?;
        if !zip64.starts_with(ZIP64_EOCD_SIGNATURE) {
            return Err(damaged("bad zip64 end of central directory"));
        }
        count = le64(&zip64, 32);
        cd_size = le64(&zip64, 40);
        cd_offset = le64(&zip64, 48);
    }
    if cd_size > MAX_CENTRAL_DIRECTORY || cd_offset.saturating_add(cd_size) > len {
        return Err(damaged("central directory out of range"));
    }

    s.seek(SeekFrom::Start(cd_offset)).map_err(Error::Io)?;
    let mut cd = vec![0u8; cd_size as usize];
    read_exact(s, &mut cd)?;
    let records = parse_central_directory(&cd)?;
    if records.len() as u64 != count {
        log::warn!("zip central directory lists {} entries, expected {count}", records.len());
    }
    log::debug!("zip central directory at {cd_offset}: {} entries", records.len());
    Ok(records)
}

/// Data-reading state of the entry under the cursor.
struct Current {
    name: String,
    method: u16,
    encrypted: bool,
    compressed_left: Option<u64>,
    expected_crc: u32,
    descriptor: bool,
    zip64: bool,
    inflater: Decompress,
    hasher: Hasher,
    done: bool,
    /// Integrity failure found after the last bytes went out.
    pending: Option<Error>,
}

impl Current {
    fn read(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.encrypted {
            return Err(Error::format(format!("{}: encrypted zip entries are not supported", self.name)));
        }
        let n = match self.method {
            COMPRESSION_STORED => self.read_stored(s, buf)?,
            COMPRESSION_DEFLATE => self.inflate(s, buf)?,
            other => {
                return Err(Error::format(format!(
                    "{}: unsupported ZIP compression method ({other})",
                    self.name
                )));
            }
        };
        self.hasher.update(&buf[..n]);
        if self.done {
            if let Err(err) = self.finish(s) {
                if n == 0 {
                    return Err(err);
                }
                self.pending = Some(err);
            }
        }
        Ok(n)
    }

    fn read_stored(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        let left = self.compressed_left.ok_or_else(|| {
            Error::format(format!(
                "{}: stored entry of unknown length cannot be read from a stream",
                self.name
            ))
        })?;
        let want = (buf.len() as u64).min(left) as usize;
        let n = if want == 0 { 0 } else { s.read(&mut buf[..want]).map_err(|e| Error::body(e, "zip"))? };
        if want > 0 && n == 0 {
            return Err(Error::format("Truncated zip archive"));
        }
        self.compressed_left = Some(left - n as u64);
        if left == n as u64 {
            self.done = true;
        }
        Ok(n)
    }

    fn inflate(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        loop {
            let input = s.fill_buf().map_err(|e| Error::body(e, "zip"))?;
            let limit = match self.compressed_left {
                Some(left) => (input.len() as u64).min(left) as usize,
                None => input.len(),
            };
            let exhausted = limit == 0;
            let (before_in, before_out) = (self.inflater.total_in(), self.inflater.total_out());
            let status = self
                .inflater
                .decompress(&input[..limit], buf, FlushDecompress::None)
                .map_err(|e| damaged(format!("{}: {e}", self.name)))?;
            let consumed = (self.inflater.total_in() - before_in) as usize;
            let produced = (self.inflater.total_out() - before_out) as usize;
            s.consume(consumed);
            if let Some(left) = self.compressed_left.as_mut() {
                *left -= consumed as u64;
            }
            if status == Status::StreamEnd {
                self.done = true;
                return Ok(produced);
            }
            if produced > 0 {
                return Ok(produced);
            }
            if exhausted && consumed == 0 {
                return Err(Error::format("Truncated zip archive"));
            }
        }
    }

    /// Consumes trailing bytes and the data descriptor, then checks the CRC.
    fn finish(&mut self, s: &mut DecodeStream) -> Result<()> {
        self.skip_trailing(s)?;
        let actual = std::mem::take(&mut self.hasher).finalize();
        if actual != self.expected_crc {
            return Err(Error::format(format!("{}: ZIP bad CRC", self.name)));
        }
        Ok(())
    }

    fn skip_trailing(&mut self, s: &mut DecodeStream) -> Result<()> {
        if let Some(left) = self.compressed_left.take() {
            s.skip_exact(left).map_err(|e| Error::body(e, "zip"))?;
        }
        self.compressed_left = Some(0);
        if self.descriptor {
            self.descriptor = false;
            if s.peek(4).map_err(Error::Io)? == DESCRIPTOR_SIGNATURE {
                s.consume(4);
            }
            let mut record = [0u8; 20];
            let len = if self.zip64 { 20 } else { 12 };
            read_exact(s, &mut record[..len])?;
            self.expected_crc = le32(&record, 0);
        }
        Ok(())
    }

    /// Moves past the rest of the entry without checking it.
    fn skip(&mut self, s: &mut DecodeStream) -> Result<()> {
        if self.done {
            return Ok(());
        }
        if self.compressed_left.is_none() {
            // Deflate of unknown length: the only way to its end is through it.
            let mut scratch = vec![0u8; 16 * 1024];
            while !self.done {
                self.inflate(s, &mut scratch)?;
            }
        }
        self.done = true;
        self.skip_trailing(s)
    }
}

pub(crate) struct ZipReader {
    seekable: bool,
    central: Option<VecDeque<CentralRecord>>,
    current: Option<Current>,
    finished: bool,
}

impl ZipReader {
    pub(crate) fn new(seekable: bool) -> Self {
        ZipReader {
            seekable,
            central: None,
            current: None,
            finished: false,
        }
    }

    fn read_local(&mut self, s: &mut DecodeStream) -> Result<(Vec<u8>, [u8; LOCAL_HEADER_MIN_SIZE])> {
        let mut fixed = [0u8; LOCAL_HEADER_MIN_SIZE];
        read_exact(s, &mut fixed)?;
        if !fixed.starts_with(LOCAL_SIGNATURE) {
            return Err(damaged("bad local file header signature"));
        }
        let mut variable = vec![0u8; le16(&fixed, 26) as usize + le16(&fixed, 28) as usize];
        read_exact(s, &mut variable)?;
        Ok((variable, fixed))
    }

    fn next_seeking(&mut self, s: &mut DecodeStream) -> Result<Option<Header>> {
        if self.central.is_none() {
            self.central = Some(load_central_directory(s)?);
        }
        let Some(record) = self.central.as_mut().and_then(VecDeque::pop_front) else {
            self.finished = true;
            return Ok(None);
        };

        let offset = record.sizes.offset;
        let here = s.position();
        if offset >= here {
            s.skip_exact(offset - here).map_err(|e| Error::body(e, "zip"))?;
        } else {
            s.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        }

        let (variable, fixed) = self.read_local(s)?;
        let name_len = le16(&fixed, 26) as usize;
        let mut entry = record.entry;
        let mut local_sizes = record.sizes;
        apply_extra(&mut entry, &mut local_sizes, &variable[name_len..]);

        self.current = Some(Current {
            name: entry.pathname().unwrap_or("").to_string(),
            method: record.method,
            encrypted: record.flags & FLAG_ENCRYPTED != 0,
            compressed_left: Some(record.sizes.compressed),
            expected_crc: record.crc,
            descriptor: false,
            zip64: false,
            inflater: Decompress::new(false),
            hasher: Hasher::new(),
            done: false,
            pending: None,
        });
        self.finish_header(s, entry, offset)
    }

    fn next_streaming(&mut self, s: &mut DecodeStream) -> Result<Option<Header>> {
        if let Some(mut current) = self.current.take() {
            current.skip(s)?;
        }
        let head = s.peek(8).map_err(Error::Io)?;
        if head.starts_with(DESCRIPTOR_SIGNATURE) && head[4..].starts_with(LOCAL_SIGNATURE) {
            // Spanned-archive marker ahead of the first entry.
            s.consume(4);
        }
        let head = s.peek(4).map_err(Error::Io)?;
        if head.is_empty()
            || head == CENTRAL_SIGNATURE
            || head == EOCD_SIGNATURE
            || head == ZIP64_EOCD_SIGNATURE
        {
            self.finished = true;
            return Ok(None);
        }

        let position = s.position();
        let (variable, fixed) = self.read_local(s)?;
        let flags = le16(&fixed, 6);
        let method = le16(&fixed, 8);
        let name_len = le16(&fixed, 26) as usize;
        let name = decode_name(&variable[..name_len], flags);

        let mut entry = Entry::new();
        if let Some(mtime) = from_dos_time(le16(&fixed, 10), le16(&fixed, 12)) {
            entry.set_mtime(mtime, 0);
        }
        let mut sizes = Sizes {
            compressed: le32(&fixed, 18) as u64,
            uncompressed: le32(&fixed, 22) as u64,
            offset: position,
        };
        let zip64 = apply_extra(&mut entry, &mut sizes, &variable[name_len..]);
        apply_mode(&mut entry, 0, 0, &name);

        let descriptor = flags & FLAG_DESCRIPTOR != 0;
        if descriptor && method == COMPRESSION_STORED && sizes.compressed == 0 {
            // Only an empty member can be delimited without a length here.
            let next = s.peek(4).map_err(Error::Io)?;
            if !(next.is_empty() || next == DESCRIPTOR_SIGNATURE || next == LOCAL_SIGNATURE || next == CENTRAL_SIGNATURE) {
                return Err(Error::format(format!(
                    "{name}: stored entry with a data descriptor can't be read from a non-seekable stream"
                )));
            }
        }
        let sizes_known = !descriptor || sizes.compressed != 0 || method == COMPRESSION_STORED;
        if entry.is_regular_file() && sizes_known {
            entry.set_size(sizes.uncompressed);
        } else if !entry.is_regular_file() {
            entry.set_size(0);
        }
        entry.set_pathname(name);

        self.current = Some(Current {
            name: entry.pathname().unwrap_or("").to_string(),
            method,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            compressed_left: if sizes_known { Some(sizes.compressed) } else { None },
            expected_crc: le32(&fixed, 14),
            descriptor,
            zip64,
            inflater: Decompress::new(false),
            hasher: Hasher::new(),
            done: false,
            pending: None,
        });
        self.finish_header(s, entry, position)
    }

    /// Symlink targets live in the member data; pull them into the entry.
    fn finish_header(&mut self, s: &mut DecodeStream, mut entry: Entry, position: u64) -> Result<Option<Header>> {
        if entry.is_symlink() {
            if let Some(current) = self.current.as_mut() {
                let mut target = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = current.read(s, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    target.extend_from_slice(&buf[..n]);
                }
                entry.set_symlink(String::from_utf8_lossy(&target).into_owned());
                entry.set_size(0);
            }
        }
        log::trace!("zip header for {:?} at offset {position}", entry.pathname().unwrap_or(""));
        Ok(Some(Header { entry, position }))
    }
}

impl FormatReader for ZipReader {
    fn format(&self) -> Format {
        Format::Zip
    }

    fn next_header(&mut self, s: &mut DecodeStream) -> Result<Option<Header>> {
        if self.finished {
            return Ok(None);
        }
        if self.seekable {
            self.next_seeking(s)
        } else {
            self.next_streaming(s)
        }
    }

    fn read_data(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        match self.current.as_mut() {
            Some(current) => current.read(s, buf),
            None => Ok(0),
        }
    }

    fn skip_data(&mut self, s: &mut DecodeStream) -> Result<()> {
        match self.current.as_mut() {
            // Seeking mode finds the next entry through the central directory.
            Some(current) if self.seekable => {
                current.done = true;
                Ok(())
            }
            Some(current) => current.skip(s),
            None => Ok(()),
        }
    }
}

/// An entry whose local header has been written.
struct OpenEntry {
    name: Vec<u8>,
    flags: u16,
    method: u16,
    dos_time: (u16, u16),
    offset: u64,
    external: u32,
    central_extra: Vec<u8>,
    crc: Hasher,
    compressed: u64,
    uncompressed: u64,
    encoder: Option<DeflateEncoder<Vec<u8>>>,
    budget: Option<DataBudget>,
    /// Stored entries have their sizes in the local header already.
    stored: Option<(u32, u64)>,
}

pub(crate) struct ZipWriter {
    offset: u64,
    central: Vec<u8>,
    count: u64,
    current: Option<OpenEntry>,
}

impl ZipWriter {
    pub(crate) fn new() -> Self {
        ZipWriter {
            offset: 0,
            central: Vec::new(),
            count: 0,
            current: None,
        }
    }

    fn emit(&mut self, out: &mut dyn Write, bytes: &[u8]) -> Result<()> {
        out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn deflate(&mut self, out: &mut dyn Write, data: &[u8]) -> Result<()> {
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        let Some(encoder) = open.encoder.as_mut() else {
            return Ok(());
        };
        open.crc.update(data);
        open.uncompressed += data.len() as u64;
        encoder.write_all(data)?;
        let produced = std::mem::take(encoder.get_mut());
        open.compressed += produced.len() as u64;
        self.emit(out, &produced)
    }

    fn end_entry(&mut self, out: &mut dyn Write) -> Result<()> {
        let missing = self
            .current
            .as_ref()
            .and_then(|open| open.budget.as_ref())
            .map(DataBudget::remaining)
            .unwrap_or(0);
        if missing > 0 {
            let name = self.current.as_ref().map(|o| String::from_utf8_lossy(&o.name).into_owned());
            log::warn!("{}: {missing} bytes of data missing, padding with zeros", name.unwrap_or_default());
            let zeros = vec![0u8; 64 * 1024];
            let mut left = missing;
            while left > 0 {
                let n = left.min(zeros.len() as u64) as usize;
                self.deflate(out, &zeros[..n])?;
                left -= n as u64;
            }
        }

        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        let (crc, compressed, uncompressed) = match open.stored {
            Some((crc, size)) => (crc, size, size),
            None => {
                if let Some(encoder) = open.encoder.take() {
                    let tail = encoder.finish()?;
                    open.compressed += tail.len() as u64;
                    self.emit(out, &tail)?;
                }
                (open.crc.clone().finalize(), open.compressed, open.uncompressed)
            }
        };
        if compressed > u32::MAX as u64 || uncompressed > u32::MAX as u64 || open.offset > u32::MAX as u64 {
            return Err(Error::format(format!(
                "{}: entries over 4 GiB are not supported by this zip writer",
                String::from_utf8_lossy(&open.name)
            )));
        }
        if open.flags & FLAG_DESCRIPTOR != 0 {
            let mut descriptor = Vec::with_capacity(16);
            descriptor.extend_from_slice(DESCRIPTOR_SIGNATURE);
            descriptor.extend_from_slice(&crc.to_le_bytes());
            descriptor.extend_from_slice(&(compressed as u32).to_le_bytes());
            descriptor.extend_from_slice(&(uncompressed as u32).to_le_bytes());
            self.emit(out, &descriptor)?;
        }

        let c = &mut self.central;
        c.extend_from_slice(CENTRAL_SIGNATURE);
        c.extend_from_slice(&((UNIX_CREATOR << 8) | 30).to_le_bytes());
        c.extend_from_slice(&20u16.to_le_bytes());
        c.extend_from_slice(&open.flags.to_le_bytes());
        c.extend_from_slice(&open.method.to_le_bytes());
        c.extend_from_slice(&open.dos_time.0.to_le_bytes());
        c.extend_from_slice(&open.dos_time.1.to_le_bytes());
        c.extend_from_slice(&crc.to_le_bytes());
        c.extend_from_slice(&(compressed as u32).to_le_bytes());
        c.extend_from_slice(&(uncompressed as u32).to_le_bytes());
        c.extend_from_slice(&(open.name.len() as u16).to_le_bytes());
        c.extend_from_slice(&(open.central_extra.len() as u16).to_le_bytes());
        c.extend_from_slice(&0u16.to_le_bytes()); // comment
        c.extend_from_slice(&0u16.to_le_bytes()); // disk
        c.extend_from_slice(&0u16.to_le_bytes()); // internal attributes
        c.extend_from_slice(&open.external.to_le_bytes());
        c.extend_from_slice(&(open.offset as u32).to_le_bytes());
        c.extend_from_slice(&open.name);
        c.extend_from_slice(&open.central_extra);
        self.count += 1;
        Ok(())
    }
}

fn timestamp_extra(entry: &Entry, central: bool) -> Vec<u8> {
    let clamp = |t: Timestamp| t.secs.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    let times = [entry.mtime(), entry.atime(), entry.ctime()];
    let mut flags = 0u8;
    let mut values = Vec::new();
    for (bit, time) in times.iter().enumerate() {
        if let Some(t) = time {
            flags |= 1 << bit;
            if !central || bit == 0 {
                values.extend_from_slice(&clamp(*t).to_le_bytes());
            }
        }
    }
    if flags == 0 {
        return Vec::new();
    }
    let mut extra = Vec::with_capacity(5 + values.len());
    extra.extend_from_slice(&EXTRA_TIMESTAMP.to_le_bytes());
    extra.extend_from_slice(&(1 + values.len() as u16).to_le_bytes());
    extra.push(flags);
    extra.extend_from_slice(&values);
    extra
}

fn owner_extra(entry: &Entry) -> Vec<u8> {
    let mut extra = Vec::with_capacity(15);
    extra.extend_from_slice(&EXTRA_UNIX_OWNER.to_le_bytes());
    extra.extend_from_slice(&11u16.to_le_bytes());
    extra.push(1);
    extra.push(4);
    extra.extend_from_slice(&(entry.uid() as u32).to_le_bytes());
    extra.push(4);
    extra.extend_from_slice(&(entry.gid() as u32).to_le_bytes());
    extra
}

impl FormatWriter for ZipWriter {
    fn write_header(&mut self, out: &mut dyn Write, entry: &Entry) -> Result<()> {
        self.end_entry(out)?;
        let path = require_basics(entry)?;
        let kind = entry.filetype().unwrap_or(FileType::Regular);
        let mut name = path.as_bytes().to_vec();
        match kind {
            FileType::Directory if !name.ends_with(b"/") => name.push(b'/'),
            FileType::Regular | FileType::Directory | FileType::Symlink => {}
            other => {
                return Err(Error::format(format!(
                    "{path}: zip format cannot archive {}",
                    other.name()
                )));
            }
        }
        if name.len() > u16::MAX as usize {
            return Err(Error::format(format!("{path}: pathname too long for zip format")));
        }
        if kind == FileType::Regular && entry.size_is_set() && entry.size() > u32::MAX as u64 {
            return Err(Error::format(format!(
                "{path}: entries over 4 GiB are not supported by this zip writer"
            )));
        }

        let mut flags = if name.is_ascii() { 0 } else { FLAG_UTF8 };
        let symlink_data = match kind {
            FileType::Symlink => Some(entry.symlink().unwrap_or("").as_bytes().to_vec()),
            FileType::Directory => Some(Vec::new()),
            _ => None,
        };
        let (method, stored) = match &symlink_data {
            Some(data) => (COMPRESSION_STORED, Some((crc32fast::hash(data), data.len() as u64))),
            None => {
                flags |= FLAG_DESCRIPTOR;
                (COMPRESSION_DEFLATE, None)
            }
        };
        let dos_time = to_dos_time(entry.mtime());

        let mut local_extra = timestamp_extra(entry, false);
        local_extra.extend_from_slice(&owner_extra(entry));
        let mut central_extra = timestamp_extra(entry, true);
        central_extra.extend_from_slice(&owner_extra(entry));

        let (crc, size) = stored.unwrap_or((0, 0));
        let mut local = Vec::with_capacity(LOCAL_HEADER_MIN_SIZE + name.len() + local_extra.len());
        local.extend_from_slice(LOCAL_SIGNATURE);
        local.extend_from_slice(&20u16.to_le_bytes());
        local.extend_from_slice(&flags.to_le_bytes());
        local.extend_from_slice(&method.to_le_bytes());
        local.extend_from_slice(&dos_time.0.to_le_bytes());
        local.extend_from_slice(&dos_time.1.to_le_bytes());
        local.extend_from_slice(&crc.to_le_bytes());
        local.extend_from_slice(&(size as u32).to_le_bytes());
        local.extend_from_slice(&(size as u32).to_le_bytes());
        local.extend_from_slice(&(name.len() as u16).to_le_bytes());
        local.extend_from_slice(&(local_extra.len() as u16).to_le_bytes());
        local.extend_from_slice(&name);
        local.extend_from_slice(&local_extra);

        let offset = self.offset;
        self.emit(out, &local)?;
        if let Some(data) = &symlink_data {
            self.emit(out, data)?;
        }

        let mut external = entry.mode() << 16;
        if kind == FileType::Directory {
            external |= 0x10;
        }
        let budget = (kind == FileType::Regular && entry.size_is_set()).then(|| {
            let mut budget = DataBudget::default();
            budget.start(path, entry.size());
            budget
        });
        self.current = Some(OpenEntry {
            name,
            flags,
            method,
            dos_time,
            offset,
            external,
            central_extra,
            crc: Hasher::new(),
            compressed: 0,
            uncompressed: 0,
            encoder: (method == COMPRESSION_DEFLATE).then(|| DeflateEncoder::new(Vec::new(), Compression::default())),
            budget,
            stored,
        });
        Ok(())
    }

    fn write_data(&mut self, out: &mut dyn Write, data: &[u8]) -> Result<usize> {
        let accepted = match self.current.as_mut() {
            Some(open) if open.encoder.is_some() => match open.budget.as_mut() {
                Some(budget) => budget.accept(data.len()),
                None => data.len(),
            },
            _ => 0,
        };
        if let Some(open) = &self.current {
            if open.uncompressed + accepted as u64 > u32::MAX as u64 {
                return Err(Error::format(format!(
                    "{}: entries over 4 GiB are not supported by this zip writer",
                    String::from_utf8_lossy(&open.name)
                )));
            }
        }
        self.deflate(out, &data[..accepted])?;
        Ok(accepted)
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        self.end_entry(out)?;
        if self.count > u16::MAX as u64 || self.offset > u32::MAX as u64 {
            return Err(Error::format("archive too large for a zip writer without zip64"));
        }
        let cd_offset = self.offset;
        let central = std::mem::take(&mut self.central);
        self.emit(out, &central)?;

        let mut eocd = Vec::with_capacity(MIN_EOCD_SIZE);
        eocd.extend_from_slice(EOCD_SIGNATURE);
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&(self.count as u16).to_le_bytes());
        eocd.extend_from_slice(&(self.count as u16).to_le_bytes());
        eocd.extend_from_slice(&(central.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        self.emit(out, &eocd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::io::source::{Source, SourceReader, StreamReader};
    use bytes::Bytes;
    use std::io::Cursor;

    fn file(path: &str, data: &[u8]) -> Entry {
        let mut e = Entry::new();
        e.set_pathname(path);
        e.set_filetype(FileType::Regular);
        e.set_perm(0o640);
        e.set_size(data.len() as u64);
        e.set_mtime(1_578_226_739, 0);
        e.set_atime(1_578_226_000, 0);
        e
    }

    fn sample() -> Vec<u8> {
        let mut dir = Entry::new();
        dir.set_pathname("test");
        dir.set_filetype(FileType::Directory);
        dir.set_perm(0o755);
        let mut link = Entry::new();
        link.set_pathname("test/link");
        link.set_filetype(FileType::Symlink);
        link.set_perm(0o777);
        link.set_symlink("../a.dat");

        let payload = b"hello hello hello hello zip".repeat(40);
        let mut out = Vec::new();
        let mut writer = ZipWriter::new();
        writer.write_header(&mut out, &dir).unwrap();
        writer.write_header(&mut out, &file("test/a.dat", &payload)).unwrap();
        for chunk in payload.chunks(100) {
            assert_eq!(writer.write_data(&mut out, chunk).unwrap(), chunk.len());
        }
        writer.write_header(&mut out, &link).unwrap();
        writer.finish(&mut out).unwrap();
        out
    }

    fn read_all(s: &mut DecodeStream, seekable: bool) -> Vec<(Entry, Vec<u8>)> {
        let mut reader = ZipReader::new(seekable);
        let mut out = Vec::new();
        while let Some(header) = reader.next_header(s).unwrap() {
            let mut data = Vec::new();
            let mut buf = [0u8; 7];
            loop {
                let n = reader.read_data(s, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            out.push((header.entry, data));
        }
        out
    }

    fn check(entries: &[(Entry, Vec<u8>)]) {
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0.pathname(), Some("test/"));
        assert!(entries[0].0.is_directory());
        assert_eq!(entries[1].0.mtime(), Some(Timestamp::new(1_578_226_739, 0)));
        assert_eq!(entries[1].1, b"hello hello hello hello zip".repeat(40));
    }

    #[test]
    fn test_seeking_round_trip() {
        let src = SourceReader::open(Source::Memory(Bytes::from(sample()))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let entries = read_all(&mut s, true);
        check(&entries);
        assert_eq!(entries[1].0.perm(), 0o640);
        assert_eq!(entries[1].0.size(), 1080);
        assert_eq!(entries[2].0.symlink(), Some("../a.dat"));
        assert!(entries[2].0.is_symlink());
        assert_eq!(entries[1].0.atime(), Some(Timestamp::new(1_578_226_000, 0)));
    }

    #[test]
    fn test_streaming_round_trip() {
        let stream = StreamReader::new(Cursor::new(sample()));
        let src = SourceReader::open(Source::stream(stream)).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let entries = read_all(&mut s, false);
        check(&entries);
        // Size is only in the data descriptor when streaming, and the
        // type bits only in the central directory.
        assert!(!entries[1].0.size_is_set());
        assert!(entries[2].0.is_regular_file());
        assert_eq!(entries[2].1, b"../a.dat");
    }

    #[test]
    fn test_streaming_skip_uses_descriptor() {
        let stream = StreamReader::new(Cursor::new(sample()));
        let src = SourceReader::open(Source::stream(stream)).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let mut reader = ZipReader::new(false);
        let mut names = Vec::new();
        while let Some(header) = reader.next_header(&mut s).unwrap() {
            names.push(header.entry.pathname().unwrap().to_string());
            reader.skip_data(&mut s).unwrap();
        }
        assert_eq!(names, ["test/", "test/a.dat", "test/link"]);
    }

    #[test]
    fn test_bad_crc_is_detected() {
        let mut data = sample();
        let pos = data
            .windows(4)
            .enumerate()
            .filter(|(_, w)| *w == CENTRAL_SIGNATURE)
            .map(|(i, _)| i)
            .nth(1)
            .unwrap();
        data[pos + 16] ^= 0xff;
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let mut reader = ZipReader::new(true);
        reader.next_header(&mut s).unwrap();
        reader.next_header(&mut s).unwrap();
        let mut buf = vec![0u8; 4096];
        let mut delivered = 0;
        let err = loop {
            match reader.read_data(&mut s, &mut buf) {
                Ok(0) => panic!("corruption not detected"),
                Ok(n) => delivered += n,
                Err(e) => break e,
            }
        };
        // Every byte reaches the caller before the failure does.
        assert_eq!(delivered, 1080);
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.to_string().contains("bad CRC"));
    }

    #[test]
    fn test_missing_eocd() {
        let mut data = sample();
        data.truncate(data.len() - 10);
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let err = ZipReader::new(true).next_header(&mut s).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_dos_time_round_trip() {
        let (time, date) = to_dos_time(Some(Timestamp::new(1_578_226_738, 0)));
        assert_eq!(from_dos_time(time, date), Some(1_578_226_738));
        assert_eq!(to_dos_time(None), (0, 33));
        assert_eq!(from_dos_time(0, 33), None);
    }

    #[test]
    fn test_unset_mtime_stays_unset() {
        let mut out = Vec::new();
        let mut writer = ZipWriter::new();
        let mut e = Entry::new();
        e.set_pathname("undated");
        e.set_filetype(FileType::Regular);
        e.set_size(1);
        writer.write_header(&mut out, &e).unwrap();
        writer.write_data(&mut out, b"x").unwrap();
        writer.finish(&mut out).unwrap();

        for seekable in [true, false] {
            let src = if seekable {
                SourceReader::open(Source::Memory(Bytes::from(out.clone()))).unwrap()
            } else {
                SourceReader::open(Source::stream(StreamReader::new(Cursor::new(out.clone())))).unwrap()
            };
            let mut s = DecodeStream::new(Box::new(src), 512);
            let entries = read_all(&mut s, seekable);
            assert_eq!(entries[0].0.mtime(), None);
            assert_eq!(entries[0].1, b"x");
        }
    }

    #[test]
    fn test_rejects_devices() {
        let mut e = Entry::new();
        e.set_pathname("null");
        e.set_filetype(FileType::CharDevice);
        let err = ZipWriter::new().write_header(&mut Vec::new(), &e).unwrap_err();
        assert!(err.to_string().contains("cannot archive character_device"));
    }

    #[test]
    fn test_extra_field_parsing() {
        let mut e = file("x", b"");
        let mut sizes = Sizes {
            compressed: u32::MAX as u64,
            uncompressed: u32::MAX as u64,
            offset: 7,
        };
        let mut extra = Vec::new();
        extra.extend_from_slice(&EXTRA_ZIP64.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&(5u64 << 32).to_le_bytes());
        extra.extend_from_slice(&(3u64 << 32).to_le_bytes());
        extra.extend_from_slice(&owner_extra(&{
            let mut o = Entry::new();
            o.set_uid(1000);
            o.set_gid(100);
            o
        }));
        assert!(apply_extra(&mut e, &mut sizes, &extra));
        assert_eq!(sizes.uncompressed, 5u64 << 32);
        assert_eq!(sizes.compressed, 3u64 << 32);
        assert_eq!(sizes.offset, 7);
        assert_eq!((e.uid(), e.gid()), (1000, 100));
    }
}
