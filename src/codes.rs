//! Filter and format identifiers.
//!
//! Both families can be named by their numeric code or by a symbolic name.
//! A name that matches nothing is a [`Error::Naming`]; a code that matches
//! nothing, or an identifier this build cannot handle, is an [`Error::Open`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Compression/transform layers applied to the raw byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    None,
    Gzip,
    Bzip2,
    Compress,
    Program,
    Lzma,
    Xz,
    Uu,
    Rpm,
    Lzip,
    Lrzip,
    Lzop,
    Grzip,
    Lz4,
    Zstd,
}

const FILTERS: [(Filter, i32, &str); 15] = [
    (Filter::None, 0, "none"),
    (Filter::Gzip, 1, "gzip"),
    (Filter::Bzip2, 2, "bzip2"),
    (Filter::Compress, 3, "compress"),
    (Filter::Program, 4, "program"),
    (Filter::Lzma, 5, "lzma"),
    (Filter::Xz, 6, "xz"),
    (Filter::Uu, 7, "uu"),
    (Filter::Rpm, 8, "rpm"),
    (Filter::Lzip, 9, "lzip"),
    (Filter::Lrzip, 10, "lrzip"),
    (Filter::Lzop, 11, "lzop"),
    (Filter::Grzip, 12, "grzip"),
    (Filter::Lz4, 13, "lz4"),
    (Filter::Zstd, 14, "zstd"),
];

const FILTER_ALIASES: [(&str, Filter); 5] = [
    ("gz", Filter::Gzip),
    ("bz2", Filter::Bzip2),
    ("zst", Filter::Zstd),
    ("uuencode", Filter::Uu),
    ("z", Filter::Compress),
];

impl Filter {
    pub fn code(self) -> i32 {
        FILTERS.iter().find(|(f, _, _)| *f == self).map(|e| e.1).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        FILTERS.iter().find(|(f, _, _)| *f == self).map(|e| e.2).unwrap_or("none")
    }

    pub fn from_code(code: i32) -> Result<Self> {
        FILTERS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|e| e.0)
            .ok_or_else(|| Error::open(format!("Unknown filter code {code}")))
    }

    pub fn all() -> impl Iterator<Item = Filter> {
        FILTERS.iter().map(|e| e.0)
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        FILTERS
            .iter()
            .find(|(_, _, n)| *n == name)
            .map(|e| e.0)
            .or_else(|| FILTER_ALIASES.iter().find(|(a, _)| *a == name).map(|e| e.1))
            .ok_or(Error::Naming {
                kind: "filter",
                name: s.to_string(),
            })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Container layouts. Codes share a family in the high bits
/// ([`Format::BASE_MASK`]) and select a variant in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Cpio,
    CpioPosix,
    CpioBinLe,
    CpioBinBe,
    CpioSvr4Nocrc,
    CpioSvr4Crc,
    CpioAfioLarge,
    Shar,
    SharBase,
    SharDump,
    Tar,
    TarUstar,
    TarPaxInterchange,
    TarPaxRestricted,
    TarGnutar,
    Iso9660,
    Iso9660Rockridge,
    Zip,
    Empty,
    Ar,
    ArGnu,
    ArBsd,
    Mtree,
    Raw,
    Xar,
    Lha,
    Cab,
    Rar,
    SevenZip,
    Warc,
    RarV5,
}

const FORMATS: [(Format, u32, &str); 31] = [
    (Format::Cpio, 0x10000, "cpio"),
    (Format::CpioPosix, 0x10001, "cpio_posix"),
    (Format::CpioBinLe, 0x10002, "cpio_bin_le"),
    (Format::CpioBinBe, 0x10003, "cpio_bin_be"),
    (Format::CpioSvr4Nocrc, 0x10004, "cpio_svr4_nocrc"),
    (Format::CpioSvr4Crc, 0x10005, "cpio_svr4_crc"),
    (Format::CpioAfioLarge, 0x10006, "cpio_afio_large"),
    (Format::Shar, 0x20000, "shar"),
    (Format::SharBase, 0x20001, "shar_base"),
    (Format::SharDump, 0x20002, "shar_dump"),
    (Format::Tar, 0x30000, "tar"),
    (Format::TarUstar, 0x30001, "tar_ustar"),
    (Format::TarPaxInterchange, 0x30002, "tar_pax_interchange"),
    (Format::TarPaxRestricted, 0x30003, "tar_pax_restricted"),
    (Format::TarGnutar, 0x30004, "tar_gnutar"),
    (Format::Iso9660, 0x40000, "iso9660"),
    (Format::Iso9660Rockridge, 0x40001, "iso9660_rockridge"),
    (Format::Zip, 0x50000, "zip"),
    (Format::Empty, 0x60000, "empty"),
    (Format::Ar, 0x70000, "ar"),
    (Format::ArGnu, 0x70001, "ar_gnu"),
    (Format::ArBsd, 0x70002, "ar_bsd"),
    (Format::Mtree, 0x80000, "mtree"),
    (Format::Raw, 0x90000, "raw"),
    (Format::Xar, 0xA0000, "xar"),
    (Format::Lha, 0xB0000, "lha"),
    (Format::Cab, 0xC0000, "cab"),
    (Format::Rar, 0xD0000, "rar"),
    (Format::SevenZip, 0xE0000, "7zip"),
    (Format::Warc, 0xF0000, "warc"),
    (Format::RarV5, 0x100000, "rar_v5"),
];

const FORMAT_ALIASES: [(&str, Format); 12] = [
    ("ustar", Format::TarUstar),
    ("pax", Format::TarPaxInterchange),
    ("paxr", Format::TarPaxRestricted),
    ("pax_restricted", Format::TarPaxRestricted),
    ("gnutar", Format::TarGnutar),
    ("gnu", Format::TarGnutar),
    ("odc", Format::CpioPosix),
    ("newc", Format::CpioSvr4Nocrc),
    ("crc", Format::CpioSvr4Crc),
    ("7z", Format::SevenZip),
    ("rar5", Format::RarV5),
    ("iso", Format::Iso9660),
];

impl Format {
    pub const BASE_MASK: u32 = 0xff0000;

    pub fn code(self) -> u32 {
        FORMATS.iter().find(|(f, _, _)| *f == self).map(|e| e.1).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        FORMATS.iter().find(|(f, _, _)| *f == self).map(|e| e.2).unwrap_or("unknown")
    }

    pub fn from_code(code: u32) -> Result<Self> {
        FORMATS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|e| e.0)
            .ok_or_else(|| Error::open(format!("Unknown format code {code:#x}")))
    }

    /// The generic identifier of this format's family (e.g. `Tar` for
    /// `TarGnutar`).
    pub fn family(self) -> Format {
        let base = self.code() & Self::BASE_MASK;
        Format::from_code(base).unwrap_or(self)
    }

    pub fn is_tar(self) -> bool {
        self.family() == Format::Tar
    }

    pub fn is_cpio(self) -> bool {
        self.family() == Format::Cpio
    }

    /// Human-readable description, as reported after detection.
    pub fn description(self) -> &'static str {
        match self {
            Format::TarUstar => "POSIX ustar format",
            Format::TarPaxInterchange => "POSIX pax interchange format",
            Format::TarPaxRestricted => "POSIX pax restricted format",
            Format::TarGnutar => "GNU tar format",
            Format::Tar => "tar format",
            Format::Zip => "ZIP 2.0 (deflation)",
            Format::CpioPosix => "POSIX octet-oriented cpio",
            Format::CpioSvr4Nocrc => "SVR4 cpio nocrc",
            Format::CpioSvr4Crc => "SVR4 cpio crc",
            Format::CpioBinLe => "cpio (little-endian binary)",
            Format::CpioBinBe => "cpio (big-endian binary)",
            Format::Raw => "raw",
            Format::Empty => "Empty file",
            other => other.name(),
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        FORMATS
            .iter()
            .find(|(_, _, n)| *n == name)
            .map(|e| e.0)
            .or_else(|| FORMAT_ALIASES.iter().find(|(a, _)| *a == name).map(|e| e.1))
            .ok_or(Error::Naming {
                kind: "format",
                name: s.to_string(),
            })
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A filter choice for a session: a built-in codec or an external
/// command line used verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    Builtin(Filter),
    Program(String),
}

impl FilterSpec {
    pub fn program(command: impl Into<String>) -> Self {
        FilterSpec::Program(command.into())
    }

    pub fn filter(&self) -> Filter {
        match self {
            FilterSpec::Builtin(f) => *f,
            FilterSpec::Program(_) => Filter::Program,
        }
    }
}

impl From<Filter> for FilterSpec {
    fn from(f: Filter) -> Self {
        FilterSpec::Builtin(f)
    }
}

/// Anything a writer accepts as its filter: an identifier, a numeric code,
/// a symbolic name, or a ready [`FilterSpec`].
pub trait IntoFilter {
    fn into_filter(self) -> Result<FilterSpec>;
}

impl IntoFilter for FilterSpec {
    fn into_filter(self) -> Result<FilterSpec> {
        Ok(self)
    }
}

impl IntoFilter for Filter {
    fn into_filter(self) -> Result<FilterSpec> {
        Ok(FilterSpec::Builtin(self))
    }
}

impl IntoFilter for i32 {
    fn into_filter(self) -> Result<FilterSpec> {
        Filter::from_code(self).map(FilterSpec::Builtin)
    }
}

impl IntoFilter for &str {
    fn into_filter(self) -> Result<FilterSpec> {
        self.parse::<Filter>().map(FilterSpec::Builtin)
    }
}

impl IntoFilter for String {
    fn into_filter(self) -> Result<FilterSpec> {
        self.as_str().into_filter()
    }
}

/// Anything a writer accepts as its format.
pub trait IntoFormat {
    fn into_format(self) -> Result<Format>;
}

impl IntoFormat for Format {
    fn into_format(self) -> Result<Format> {
        Ok(self)
    }
}

impl IntoFormat for u32 {
    fn into_format(self) -> Result<Format> {
        Format::from_code(self)
    }
}

impl IntoFormat for i32 {
    fn into_format(self) -> Result<Format> {
        u32::try_from(self)
            .map_err(|_| Error::open(format!("Unknown format code {self}")))
            .and_then(Format::from_code)
    }
}

impl IntoFormat for &str {
    fn into_format(self) -> Result<Format> {
        self.parse()
    }
}

impl IntoFormat for String {
    fn into_format(self) -> Result<Format> {
        self.parse()
    }
}

/// What this build can do, probed once per process.
#[derive(Debug, Clone)]
pub struct Features {
    pub read_filters: Vec<Filter>,
    pub write_filters: Vec<Filter>,
    pub read_formats: Vec<Format>,
    pub write_formats: Vec<Format>,
    pub program_filters: bool,
}

impl Features {
    fn probe() -> Self {
        let mut codecs = vec![Filter::None, Filter::Gzip];
        if cfg!(feature = "bzip2") {
            codecs.push(Filter::Bzip2);
        }
        if cfg!(feature = "xz") {
            codecs.push(Filter::Xz);
            codecs.push(Filter::Lzma);
        }
        if cfg!(feature = "zstd") {
            codecs.push(Filter::Zstd);
        }
        let program_filters = cfg!(unix);
        if program_filters {
            codecs.push(Filter::Program);
        }

        Features {
            read_filters: codecs.clone(),
            write_filters: codecs,
            read_formats: vec![
                Format::Tar,
                Format::TarUstar,
                Format::TarPaxInterchange,
                Format::TarPaxRestricted,
                Format::TarGnutar,
                Format::Zip,
                Format::Cpio,
                Format::CpioPosix,
                Format::CpioSvr4Nocrc,
                Format::CpioSvr4Crc,
                Format::CpioBinLe,
                Format::CpioBinBe,
                Format::Raw,
                Format::Empty,
            ],
            write_formats: vec![
                Format::Tar,
                Format::TarUstar,
                Format::TarPaxInterchange,
                Format::TarPaxRestricted,
                Format::TarGnutar,
                Format::Zip,
                Format::Cpio,
                Format::CpioPosix,
                Format::CpioSvr4Nocrc,
                Format::CpioSvr4Crc,
                Format::Raw,
            ],
            program_filters,
        }
    }

    pub fn can_read_filter(&self, filter: Filter) -> bool {
        self.read_filters.contains(&filter)
    }

    pub fn can_write_filter(&self, filter: Filter) -> bool {
        self.write_filters.contains(&filter)
    }

    pub fn can_read_format(&self, format: Format) -> bool {
        self.read_formats.contains(&format)
    }

    pub fn can_write_format(&self, format: Format) -> bool {
        self.write_formats.contains(&format)
    }

    pub(crate) fn require_write_filter(&self, filter: Filter) -> Result<()> {
        if self.can_write_filter(filter) {
            Ok(())
        } else {
            Err(Error::open(format!(
                "{filter} compression not supported on this build"
            )))
        }
    }

    pub(crate) fn require_write_format(&self, format: Format) -> Result<()> {
        if self.can_write_format(format) {
            Ok(())
        } else {
            Err(Error::open(format!(
                "Writing {} is not supported on this build",
                format.description()
            )))
        }
    }
}

/// The capability set of this build.
pub fn features() -> &'static Features {
    static FEATURES: OnceLock<Features> = OnceLock::new();
    FEATURES.get_or_init(Features::probe)
}
