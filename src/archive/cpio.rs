use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::codes::Format;
use crate::entry::{Entry, FileType, S_IFREG, major, makedev, minor};
use crate::error::{Error, Result};
use crate::io::stream::DecodeStream;

use super::{DataBudget, FormatReader, FormatWriter, Header, require_basics, write_zeros};

const ODC_MAGIC: &[u8; 6] = b"070707";
const NEWC_MAGIC: &[u8; 6] = b"070701";
const CRC_MAGIC: &[u8; 6] = b"070702";
const BINARY_MAGIC: u16 = 0o070707;

const ODC_HEADER: usize = 76;
const NEWC_HEADER: usize = 110;
const BINARY_HEADER: usize = 26;

const TRAILER: &str = "TRAILER!!!";

/// Names and symlink targets longer than this are treated as damage.
const MAX_NAME: u64 = 1024 * 1024;

/// Which cpio variant starts `head`, if any.
pub(crate) fn detect(head: &[u8]) -> Option<Format> {
    if head.starts_with(ODC_MAGIC) {
        Some(Format::CpioPosix)
    } else if head.starts_with(NEWC_MAGIC) {
        Some(Format::CpioSvr4Nocrc)
    } else if head.starts_with(CRC_MAGIC) {
        Some(Format::CpioSvr4Crc)
    } else if head.len() >= BINARY_HEADER && u16::from_le_bytes([head[0], head[1]]) == BINARY_MAGIC {
        Some(Format::CpioBinLe)
    } else if head.len() >= BINARY_HEADER && u16::from_be_bytes([head[0], head[1]]) == BINARY_MAGIC {
        Some(Format::CpioBinBe)
    } else {
        None
    }
}

fn damaged(what: impl std::fmt::Display) -> Error {
    Error::format(format!("Damaged cpio archive: {what}"))
}

fn parse_number(field: &[u8], radix: u32) -> Result<u64> {
    let text = std::str::from_utf8(field).map_err(|_| damaged("non-ASCII header field"))?;
    u64::from_str_radix(text.trim_end_matches(['\0', ' ']), radix)
        .map_err(|_| damaged(format!("bad header field {text:?}")))
}

/// Bytes needed to bring `n` up to a multiple of `align`.
fn pad_to(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align - n
}

/// Header fields common to every variant, as stored.
#[derive(Debug, Default)]
struct RawHeader {
    dev: u64,
    ino: u64,
    mode: u32,
    uid: u64,
    gid: u64,
    nlink: u64,
    rdev: u64,
    mtime: u64,
    namesize: u64,
    filesize: u64,
    check: u32,
}

fn read_odc(block: &[u8]) -> Result<RawHeader> {
    let field = |at: usize, len: usize| parse_number(&block[at..at + len], 8);
    Ok(RawHeader {
        dev: field(6, 6)?,
        ino: field(12, 6)?,
        mode: field(18, 6)? as u32,
        uid: field(24, 6)?,
        gid: field(30, 6)?,
        nlink: field(36, 6)?,
        rdev: field(42, 6)?,
        mtime: field(48, 11)?,
        namesize: field(59, 6)?,
        filesize: field(65, 11)?,
        check: 0,
    })
}

fn read_newc(block: &[u8]) -> Result<RawHeader> {
    let field = |n: usize| parse_number(&block[6 + 8 * n..14 + 8 * n], 16);
    Ok(RawHeader {
        ino: field(0)?,
        mode: field(1)? as u32,
        uid: field(2)?,
        gid: field(3)?,
        nlink: field(4)?,
        mtime: field(5)?,
        filesize: field(6)?,
        dev: makedev(field(7)? as u32, field(8)? as u32),
        rdev: makedev(field(9)? as u32, field(10)? as u32),
        namesize: field(11)?,
        check: field(12)? as u32,
    })
}

fn read_binary(block: &[u8], big_endian: bool) -> RawHeader {
    let word = |n: usize| -> u64 {
        let pair = [block[2 * n], block[2 * n + 1]];
        if big_endian {
            u16::from_be_bytes(pair) as u64
        } else {
            u16::from_le_bytes(pair) as u64
        }
    };
    // 32-bit values are stored as two words, most significant first.
    RawHeader {
        dev: word(1),
        ino: word(2),
        mode: word(3) as u32,
        uid: word(4),
        gid: word(5),
        nlink: word(6),
        rdev: word(7),
        mtime: (word(8) << 16) | word(9),
        namesize: word(10),
        filesize: (word(11) << 16) | word(12),
        check: 0,
    }
}

pub(crate) struct CpioReader {
    format: Format,
    remaining: u64,
    padding: u64,
    /// Expected and running byte sums for the crc variant.
    checksum: Option<(u32, u32)>,
    /// Checksum failure held back until the caller has the last bytes.
    pending: Option<Error>,
    links: HashMap<(u64, u64), String>,
    finished: bool,
}

impl CpioReader {
    pub(crate) fn new(format: Format) -> Self {
        CpioReader {
            format,
            remaining: 0,
            padding: 0,
            checksum: None,
            pending: None,
            links: HashMap::new(),
            finished: false,
        }
    }

    fn read_bytes(s: &mut DecodeStream, n: u64) -> Result<Vec<u8>> {
        if n > MAX_NAME {
            return Err(damaged(format!("{n} byte name")));
        }
        let mut data = vec![0u8; n as usize];
        if s.read_full(&mut data).map_err(Error::Io)? < data.len() {
            return Err(Error::format("Truncated cpio archive"));
        }
        Ok(data)
    }
}

impl FormatReader for CpioReader {
    fn format(&self) -> Format {
        self.format
    }

    fn next_header(&mut self, s: &mut DecodeStream) -> Result<Option<Header>> {
        if self.finished {
            return Ok(None);
        }
        s.skip_exact(self.remaining + self.padding)
            .map_err(|e| Error::body(e, "cpio"))?;
        self.remaining = 0;
        self.padding = 0;
        self.checksum = None;
        self.pending = None;

        let position = s.position();
        let head = s.peek(NEWC_HEADER).map_err(Error::Io)?;
        if head.is_empty() {
            log::warn!("cpio archive ends without a trailer");
            self.finished = true;
            return Ok(None);
        }
        let Some(format) = detect(head) else {
            return Err(damaged(format!("bad header magic at offset {position}")));
        };
        self.format = format;

        let (raw, header_len, align) = match format {
            Format::CpioPosix => (read_odc(&Self::read_bytes(s, ODC_HEADER as u64)?)?, ODC_HEADER, 1),
            Format::CpioBinLe | Format::CpioBinBe => {
                let block = Self::read_bytes(s, BINARY_HEADER as u64)?;
                (read_binary(&block, format == Format::CpioBinBe), BINARY_HEADER, 2)
            }
            _ => (read_newc(&Self::read_bytes(s, NEWC_HEADER as u64)?)?, NEWC_HEADER, 4),
        };
        if raw.namesize == 0 {
            return Err(damaged("empty pathname"));
        }
        let name_bytes = Self::read_bytes(s, raw.namesize)?;
        s.skip_exact(pad_to(header_len as u64 + raw.namesize, align))
            .map_err(|e| Error::body(e, "cpio"))?;
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();

        if name == TRAILER {
            self.finished = true;
            return Ok(None);
        }

        let mut entry = Entry::new();
        entry.set_pathname(name.clone());
        entry.set_mode(raw.mode);
        entry.set_uid(raw.uid as i64);
        entry.set_gid(raw.gid as i64);
        entry.set_nlink(raw.nlink as u32);
        entry.set_mtime(raw.mtime as i64, 0);
        entry.set_dev(raw.dev);
        entry.set_ino(raw.ino);
        if entry.is_char_device() || entry.is_block_device() {
            entry.set_rdev(raw.rdev);
        }
        entry.set_size(raw.filesize);
        self.remaining = raw.filesize;
        self.padding = pad_to(raw.filesize, align);
        if format == Format::CpioSvr4Crc {
            self.checksum = Some((raw.check, 0));
        }

        if entry.is_symlink() {
            let target = Self::read_bytes(s, raw.filesize)?;
            entry.set_symlink(String::from_utf8_lossy(&target).into_owned());
            entry.set_size(0);
            self.remaining = 0;
            self.checksum = None;
        } else if !entry.is_directory() && raw.ino != 0 {
            match self.links.get(&(raw.dev, raw.ino)) {
                Some(first) => entry.set_hardlink(first.clone()),
                None => {
                    self.links.insert((raw.dev, raw.ino), name);
                }
            }
        }

        log::trace!(
            "cpio header for {:?} at offset {position}",
            entry.pathname().unwrap_or("")
        );
        Ok(Some(Header { entry, position }))
    }

    fn read_data(&mut self, s: &mut DecodeStream, buf: &mut [u8]) -> Result<usize> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = s.read(&mut buf[..want]).map_err(|e| Error::body(e, "cpio"))?;
        if n == 0 {
            return Err(Error::format("Truncated cpio archive"));
        }
        self.remaining -= n as u64;
        if let Some((expected, sum)) = self.checksum.as_mut() {
            *sum = byte_sum(*sum, &buf[..n]);
            if self.remaining == 0 && *sum != *expected {
                self.pending = Some(Error::format("cpio checksum error"));
            }
        }
        Ok(n)
    }

    fn skip_data(&mut self, s: &mut DecodeStream) -> Result<()> {
        s.skip_exact(self.remaining)
            .map_err(|e| Error::body(e, "cpio"))?;
        self.remaining = 0;
        self.checksum = None;
        self.pending = None;
        Ok(())
    }
}

/// Header values for one written entry.
#[derive(Debug, Default)]
struct Fields {
    name: Vec<u8>,
    dev: u64,
    ino: u64,
    mode: u32,
    uid: u64,
    gid: u64,
    nlink: u64,
    rdev: u64,
    mtime: u64,
    size: u64,
}

/// The crc variant needs the data sum in the header, so entry data is
/// spooled to an anonymous temp file until the entry is complete.
struct Staged {
    fields: Fields,
    spool: File,
    sum: u32,
}

fn byte_sum(sum: u32, data: &[u8]) -> u32 {
    data.iter().fold(sum, |acc, &b| acc.wrapping_add(b as u32))
}

pub(crate) struct CpioWriter {
    format: Format,
    budget: DataBudget,
    padding: u64,
    next_ino: u64,
    inodes: HashMap<String, u64>,
    staged: Option<Staged>,
}

impl CpioWriter {
    pub(crate) fn new(format: Format) -> Result<Self> {
        if !matches!(
            format,
            Format::CpioPosix | Format::CpioSvr4Nocrc | Format::CpioSvr4Crc
        ) {
            return Err(Error::open(format!(
                "Writing {} is not supported on this build",
                format.description()
            )));
        }
        Ok(CpioWriter {
            format,
            budget: DataBudget::default(),
            padding: 0,
            next_ino: 1,
            inodes: HashMap::new(),
            staged: None,
        })
    }

    fn align(&self) -> u64 {
        if self.format == Format::CpioPosix { 1 } else { 4 }
    }

    fn encode(&self, f: &Fields, check: u32) -> Result<Vec<u8>> {
        let display = String::from_utf8_lossy(&f.name).into_owned();
        let mut out = Vec::with_capacity(NEWC_HEADER + f.name.len() + 4);
        let namesize = f.name.len() as u64 + 1;

        if self.format == Format::CpioPosix {
            let octal = |value: u64, width: usize, what: &str| -> Result<String> {
                if value >= 1u64 << (3 * width) {
                    return Err(Error::format(format!("{display}: {what} too large for odc cpio")));
                }
                Ok(format!("{value:0width$o}"))
            };
            out.extend_from_slice(ODC_MAGIC);
            for (value, width, what) in [
                (f.dev, 6, "device"),
                (f.ino, 6, "inode"),
                (f.mode as u64, 6, "mode"),
                (f.uid, 6, "uid"),
                (f.gid, 6, "gid"),
                (f.nlink, 6, "link count"),
                (f.rdev, 6, "device number"),
                (f.mtime, 11, "mtime"),
                (namesize, 6, "pathname"),
                (f.size, 11, "size"),
            ] {
                out.extend_from_slice(octal(value, width, what)?.as_bytes());
            }
            out.extend_from_slice(&f.name);
            out.push(0);
            return Ok(out);
        }

        let hex = |value: u64, what: &str| -> Result<String> {
            if value > u32::MAX as u64 {
                return Err(Error::format(format!("{display}: {what} too large for newc cpio")));
            }
            Ok(format!("{value:08x}"))
        };
        out.extend_from_slice(if self.format == Format::CpioSvr4Crc { CRC_MAGIC } else { NEWC_MAGIC });
        for (value, what) in [
            (f.ino, "inode"),
            (f.mode as u64, "mode"),
            (f.uid, "uid"),
            (f.gid, "gid"),
            (f.nlink, "link count"),
            (f.mtime, "mtime"),
            (f.size, "size"),
            (major(f.dev) as u64, "device"),
            (minor(f.dev) as u64, "device"),
            (major(f.rdev) as u64, "device number"),
            (minor(f.rdev) as u64, "device number"),
            (namesize, "pathname"),
            (check as u64, "checksum"),
        ] {
            out.extend_from_slice(hex(value, what)?.as_bytes());
        }
        out.extend_from_slice(&f.name);
        out.push(0);
        let pad = pad_to(out.len() as u64, 4) as usize;
        out.resize(out.len() + pad, 0);
        Ok(out)
    }

    fn end_entry(&mut self, out: &mut dyn Write) -> Result<()> {
        if let Some(mut staged) = self.staged.take() {
            // Zero fill leaves the sum alone.
            self.budget.fill(&mut staged.spool)?;
            out.write_all(&self.encode(&staged.fields, staged.sum)?)?;
            staged.spool.seek(SeekFrom::Start(0))?;
            io::copy(&mut staged.spool, &mut *out)?;
        } else {
            self.budget.fill(out)?;
        }
        write_zeros(out, self.padding)?;
        self.padding = 0;
        Ok(())
    }

    fn emit(&mut self, out: &mut dyn Write, fields: Fields, data: &[u8]) -> Result<()> {
        self.padding = pad_to(fields.size, self.align());
        if self.format == Format::CpioSvr4Crc && fields.size > 0 {
            let mut spool = tempfile::tempfile()?;
            spool.write_all(data)?;
            self.staged = Some(Staged {
                fields,
                spool,
                sum: byte_sum(0, data),
            });
            return Ok(());
        }
        out.write_all(&self.encode(&fields, 0)?)?;
        out.write_all(data)?;
        Ok(())
    }
}

impl FormatWriter for CpioWriter {
    fn write_header(&mut self, out: &mut dyn Write, entry: &Entry) -> Result<()> {
        self.end_entry(out)?;
        let path = require_basics(entry)?.to_string();

        let mut mode = entry.mode();
        let ino = match entry.hardlink().and_then(|target| self.inodes.get(target)) {
            Some(&ino) => {
                mode = S_IFREG | entry.perm();
                ino
            }
            None => {
                let ino = self.next_ino;
                self.next_ino += 1;
                ino
            }
        };
        self.inodes.insert(path.clone(), ino);

        let kind = entry.filetype();
        let symlink = match kind {
            Some(FileType::Symlink) => Some(entry.symlink().unwrap_or("").as_bytes().to_vec()),
            _ => None,
        };
        let size = match (&symlink, kind) {
            (Some(target), _) => target.len() as u64,
            (None, Some(FileType::Regular)) => entry.size(),
            _ => 0,
        };
        let rdev = if matches!(kind, Some(FileType::CharDevice | FileType::BlockDevice)) {
            entry.rdev()
        } else {
            0
        };

        let fields = Fields {
            name: path.as_bytes().to_vec(),
            dev: if self.format == Format::CpioPosix { 0 } else { entry.dev() },
            ino,
            mode,
            uid: entry.uid().max(0) as u64,
            gid: entry.gid().max(0) as u64,
            nlink: entry.nlink().max(1) as u64,
            rdev,
            mtime: entry.mtime().map(|t| t.secs.max(0) as u64).unwrap_or(0),
            size,
        };
        self.emit(out, fields, symlink.as_deref().unwrap_or(&[]))?;
        if symlink.is_none() {
            self.budget.start(&path, size);
        }
        Ok(())
    }

    fn write_data(&mut self, out: &mut dyn Write, data: &[u8]) -> Result<usize> {
        let n = self.budget.accept(data.len());
        match self.staged.as_mut() {
            Some(staged) => {
                staged.spool.write_all(&data[..n])?;
                staged.sum = byte_sum(staged.sum, &data[..n]);
            }
            None => out.write_all(&data[..n])?,
        }
        Ok(n)
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        self.end_entry(out)?;
        let trailer = Fields {
            name: TRAILER.as_bytes().to_vec(),
            nlink: 1,
            ..Fields::default()
        };
        self.emit(out, trailer, &[])?;
        self.end_entry(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Timestamp;
    use crate::error::ErrorKind;
    use crate::io::source::{Source, SourceReader};
    use bytes::Bytes;

    fn file(path: &str, data: &[u8]) -> Entry {
        let mut e = Entry::new();
        e.set_pathname(path);
        e.set_filetype(FileType::Regular);
        e.set_perm(0o644);
        e.set_size(data.len() as u64);
        e.set_uid(1000);
        e.set_gid(100);
        e.set_mtime(1_600_000_000, 0);
        e
    }

    fn write_archive(format: Format, entries: &[(Entry, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = CpioWriter::new(format).unwrap();
        for (entry, data) in entries {
            writer.write_header(&mut out, entry).unwrap();
            writer.write_data(&mut out, data).unwrap();
        }
        writer.finish(&mut out).unwrap();
        out
    }

    fn read_archive(data: Vec<u8>) -> Result<(Format, Vec<(Entry, Vec<u8>)>)> {
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let format = detect(s.peek(NEWC_HEADER).unwrap()).unwrap();
        let mut reader = CpioReader::new(format);
        let mut out = Vec::new();
        while let Some(header) = reader.next_header(&mut s)? {
            let mut data = Vec::new();
            let mut buf = [0u8; 5];
            loop {
                let n = reader.read_data(&mut s, &mut buf)?;
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            out.push((header.entry, data));
        }
        Ok((reader.format(), out))
    }

    fn sample() -> Vec<(Entry, &'static [u8])> {
        let mut dir = Entry::new();
        dir.set_pathname("d");
        dir.set_filetype(FileType::Directory);
        dir.set_perm(0o755);
        let mut link = Entry::new();
        link.set_pathname("d/link");
        link.set_filetype(FileType::Symlink);
        link.set_perm(0o777);
        link.set_symlink("a.txt");
        let mut hard = file("d/hard", b"");
        hard.set_hardlink("d/a.txt");
        hard.set_size(0);
        vec![
            (dir, b"" as &[u8]),
            (file("d/a.txt", b"hello, cpio"), b"hello, cpio"),
            (link, b""),
            (hard, b""),
        ]
    }

    fn check(entries: &[(Entry, Vec<u8>)]) {
        assert_eq!(entries.len(), 4);
        assert!(entries[0].0.is_directory());
        assert_eq!(entries[0].0.perm(), 0o755);
        assert_eq!(entries[1].0.pathname(), Some("d/a.txt"));
        assert_eq!(entries[1].1, b"hello, cpio");
        assert_eq!(entries[1].0.uid(), 1000);
        assert_eq!(entries[1].0.mtime(), Some(Timestamp::new(1_600_000_000, 0)));
        assert_eq!(entries[2].0.symlink(), Some("a.txt"));
        assert_eq!(entries[2].0.size(), 0);
        assert_eq!(entries[3].0.hardlink(), Some("d/a.txt"));
    }

    #[test]
    fn test_detect_variants() {
        assert_eq!(detect(b"070707"), Some(Format::CpioPosix));
        assert_eq!(detect(b"070701"), Some(Format::CpioSvr4Nocrc));
        assert_eq!(detect(b"070702"), Some(Format::CpioSvr4Crc));
        let mut le = [0u8; BINARY_HEADER];
        le[..2].copy_from_slice(&BINARY_MAGIC.to_le_bytes());
        assert_eq!(detect(&le), Some(Format::CpioBinLe));
        assert_eq!(detect(b"07070"), None);
    }

    #[test]
    fn test_odc_round_trip() {
        let data = write_archive(Format::CpioPosix, &sample());
        let (format, entries) = read_archive(data).unwrap();
        assert_eq!(format, Format::CpioPosix);
        check(&entries);
    }

    #[test]
    fn test_newc_round_trip_is_aligned() {
        let data = write_archive(Format::CpioSvr4Nocrc, &sample());
        assert_eq!(data.len() % 4, 0);
        let (format, entries) = read_archive(data).unwrap();
        assert_eq!(format, Format::CpioSvr4Nocrc);
        check(&entries);
    }

    #[test]
    fn test_crc_round_trip_and_corruption() {
        let mut data = write_archive(Format::CpioSvr4Crc, &sample());
        let (_, entries) = read_archive(data.clone()).unwrap();
        check(&entries);

        let at = data.windows(11).position(|w| w == b"hello, cpio").unwrap();
        data[at] = b'j';
        let err = read_archive(data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_binary_le_is_read() {
        let mut data = Vec::new();
        let name = b"bin.txt\0";
        let words: [u16; 13] = [
            BINARY_MAGIC,
            0,
            7,
            (S_IFREG | 0o600) as u16,
            0,
            0,
            1,
            0,
            0,
            1000,
            name.len() as u16,
            0,
            3,
        ];
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.extend_from_slice(name);
        data.extend_from_slice(b"abc\0");
        let trailer_name = b"TRAILER!!!\0";
        let words: [u16; 13] = [BINARY_MAGIC, 0, 0, 0, 0, 0, 1, 0, 0, 0, trailer_name.len() as u16, 0, 0];
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.extend_from_slice(trailer_name);
        data.push(0);

        let (format, entries) = read_archive(data).unwrap();
        assert_eq!(format, Format::CpioBinLe);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.pathname(), Some("bin.txt"));
        assert_eq!(entries[0].0.perm(), 0o600);
        assert_eq!(entries[0].0.mtime(), Some(Timestamp::new(1000, 0)));
        assert_eq!(entries[0].1, b"abc");
    }

    #[test]
    fn test_binary_formats_are_read_only() {
        let err = CpioWriter::new(Format::CpioBinLe).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Open);
    }

    #[test]
    fn test_odc_overflow_is_format_error() {
        let mut e = file("big", b"");
        e.set_uid(1 << 20);
        let mut writer = CpioWriter::new(Format::CpioPosix).unwrap();
        let err = writer.write_header(&mut Vec::new(), &e).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.to_string().contains("uid too large"));
    }

    #[test]
    fn test_short_data_is_zero_filled() {
        let mut out = Vec::new();
        let mut writer = CpioWriter::new(Format::CpioSvr4Crc).unwrap();
        writer.write_header(&mut out, &file("z", b"12345")).unwrap();
        writer.write_data(&mut out, b"12").unwrap();
        writer.finish(&mut out).unwrap();
        let (_, entries) = read_archive(out).unwrap();
        assert_eq!(entries[0].1, b"12\0\0\0");
    }

    #[test]
    fn test_crc_entries_stream_through_a_spool() {
        let chunk: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        let mut out = Vec::new();
        let mut writer = CpioWriter::new(Format::CpioSvr4Crc).unwrap();
        writer.write_header(&mut out, &file("big", &vec![0; 16 * chunk.len()])).unwrap();
        for _ in 0..16 {
            writer.write_data(&mut out, &chunk).unwrap();
        }
        assert!(out.is_empty());
        writer.finish(&mut out).unwrap();

        let (_, entries) = read_archive(out).unwrap();
        assert_eq!(entries[0].1.len(), 16 * chunk.len());
        assert!(entries[0].1.chunks(chunk.len()).all(|c| c == chunk));
    }

    #[test]
    fn test_crc_failure_is_reported_after_the_last_bytes() {
        let mut data = write_archive(Format::CpioSvr4Crc, &sample());
        let at = data.windows(11).position(|w| w == b"hello, cpio").unwrap();
        data[at] = b'j';
        let src = SourceReader::open(Source::Memory(Bytes::from(data))).unwrap();
        let mut s = DecodeStream::new(Box::new(src), 512);
        let mut reader = CpioReader::new(Format::CpioSvr4Crc);
        while let Some(header) = reader.next_header(&mut s).unwrap() {
            if header.entry.pathname() == Some("d/a.txt") {
                break;
            }
        }
        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        let err = loop {
            match reader.read_data(&mut s, &mut buf) {
                Ok(0) => panic!("entry ended without a checksum error"),
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(err) => break err,
            }
        };
        assert_eq!(got, b"jello, cpio");
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_truncated_archive() {
        let mut data = write_archive(Format::CpioPosix, &sample());
        data.truncate(ODC_HEADER + 10);
        assert_eq!(read_archive(data).unwrap_err().kind(), ErrorKind::Format);
    }
}
