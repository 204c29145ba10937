//! Text form of file-attribute flags (`lsattr`/`chflags` style).
//!
//! Values use the Linux inode flag bits, which is what extraction applies.

const FLAGS: [(&str, u64); 14] = [
    ("sappnd", 0x0000_0020),
    ("schg", 0x0000_0010),
    ("nodump", 0x0000_0040),
    ("noatime", 0x0000_0080),
    ("compress", 0x0000_0004),
    ("secdel", 0x0000_0001),
    ("undel", 0x0000_0002),
    ("sync", 0x0000_0008),
    ("dirsync", 0x0001_0000),
    ("journal-data", 0x0000_4000),
    ("notail", 0x0000_8000),
    ("topdir", 0x0002_0000),
    ("nocow", 0x0080_0000),
    ("projinherit", 0x2000_0000),
];

const ALIASES: [(&str, &str); 4] = [
    ("sappend", "sappnd"),
    ("schange", "schg"),
    ("simmutable", "schg"),
    ("nouunlink", "undel"),
];

/// Immutable and append-only bits; these block writes to a file.
pub const NOCHANGE_FLAGS: u64 = 0x0000_0010 | 0x0000_0020;

fn lookup(token: &str) -> Option<u64> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == token)
        .map(|(_, name)| *name)
        .unwrap_or(token);
    FLAGS.iter().find(|(name, _)| *name == canonical).map(|(_, bit)| *bit)
}

/// Parses comma/space separated flag names into `(set, clear)`.
/// A `no` prefix clears a flag instead of setting it. Returns the first
/// token that is not a known flag as the error.
pub fn parse(text: &str) -> Result<(u64, u64), String> {
    let mut set = 0;
    let mut clear = 0;
    let mut invalid = None;

    for token in text.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        if let Some(bit) = lookup(token) {
            set |= bit;
            clear &= !bit;
        } else if let Some(bit) = token.strip_prefix("no").and_then(lookup) {
            clear |= bit;
            set &= !bit;
        } else if let Some(bit) = lookup(&format!("no{token}")) {
            // "dump" undoes "nodump".
            clear |= bit;
            set &= !bit;
        } else if invalid.is_none() {
            invalid = Some(token.to_string());
        }
    }

    match invalid {
        Some(token) => Err(token),
        None => Ok((set, clear)),
    }
}

pub fn render(set: u64, clear: u64) -> Option<String> {
    let mut names = Vec::new();
    for (name, bit) in FLAGS {
        if set & bit != 0 {
            names.push(name.to_string());
        }
    }
    for (name, bit) in FLAGS {
        if clear & bit != 0 {
            match name.strip_prefix("no") {
                Some(rest) => names.push(rest.to_string()),
                None => names.push(format!("no{name}")),
            }
        }
    }
    if names.is_empty() { None } else { Some(names.join(",")) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_and_clear() {
        let (set, clear) = parse("schg,nosappnd nodump").unwrap();
        assert_eq!(set, 0x10 | 0x40);
        assert_eq!(clear, 0x20);
    }

    #[test]
    fn test_parse_reports_first_invalid_token() {
        assert_eq!(parse("schg,bogus,alsobad").unwrap_err(), "bogus");
    }

    #[test]
    fn test_dump_clears_nodump() {
        assert_eq!(parse("dump").unwrap(), (0, 0x40));
    }

    #[test]
    fn test_render_round_trip() {
        let text = render(0x10 | 0x80, 0x40).unwrap();
        assert_eq!(text, "schg,noatime,dump");
        assert_eq!(parse(&text).unwrap(), (0x10 | 0x80, 0x40));
        assert_eq!(render(0, 0), None);
    }
}
