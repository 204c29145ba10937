//! Write archives with one filter/format pair, read them back with
//! auto-detection.

use arcstream::{Entry, FileType, Filter, Format, MemoryBuffer, Reader, Writer};
use rand::RngCore;
use tempfile::TempDir;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn regular(path: &str, perm: u32, data: &[u8]) -> Entry {
    let mut e = Entry::new();
    e.set_pathname(path);
    e.set_filetype(FileType::Regular);
    e.set_perm(perm);
    e.set_size(data.len() as u64);
    e.set_mtime(1_600_000_000, 0);
    e
}

#[test]
fn test_gzip_tar_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chubby.tar.gz");
    let payload = random_bytes(300_000);

    let mut writer = Writer::open_filename(&path, "gzip", "pax_restricted").unwrap();
    writer.write_header(&regular("chubby.dat", 0o666, &payload)).unwrap();
    assert_eq!(writer.write_data(&payload).unwrap(), payload.len());
    writer.close().unwrap();

    let mut reader = Reader::open_filename(&path, None).unwrap();
    let entry = reader.next_header().unwrap().unwrap();
    assert_eq!(entry.pathname(), Some("chubby.dat"));
    assert_eq!(entry.perm(), 0o666);
    assert!(entry.is_regular_file());
    assert_eq!(entry.size(), payload.len() as u64);
    assert_eq!(reader.read_data(4096).unwrap(), payload);
    assert!(reader.next_header().unwrap().is_none());
    assert_eq!(reader.filters(), [Filter::Gzip]);
    assert!(reader.format().unwrap().is_tar());
    reader.close().unwrap();
}

fn tree(filter: &str, format: &str) -> Vec<u8> {
    let buffer = MemoryBuffer::new();
    let mut writer = Writer::open_memory(&buffer, filter, format).unwrap();

    let mut dir = Entry::new();
    dir.set_pathname("d");
    dir.set_filetype(FileType::Directory);
    dir.set_perm(0o755);
    writer.write_header(&dir).unwrap();

    writer.write_header(&regular("d/a.txt", 0o600, b"alpha\n")).unwrap();
    writer.write_data(b"alpha\n").unwrap();

    let mut link = Entry::new();
    link.set_pathname("d/link");
    link.set_filetype(FileType::Symlink);
    link.set_symlink("a.txt");
    link.set_perm(0o777);
    writer.write_header(&link).unwrap();

    writer.close().unwrap();
    buffer.to_vec()
}

fn check_tree(data: Vec<u8>, expect_filter: Filter, expect_family: Format) {
    let mut reader = Reader::open_memory(data, None).unwrap();

    let dir = reader.next_header().unwrap().unwrap();
    assert_eq!(dir.pathname().map(|p| p.trim_end_matches('/')), Some("d"));
    assert!(dir.is_directory());

    let file = reader.next_header().unwrap().unwrap();
    assert_eq!(file.pathname(), Some("d/a.txt"));
    assert_eq!(file.perm(), 0o600);
    assert_eq!(reader.read_data(3).unwrap(), b"alpha\n");

    let link = reader.next_header().unwrap().unwrap();
    assert_eq!(link.pathname(), Some("d/link"));
    assert!(link.is_symlink());
    assert_eq!(link.symlink(), Some("a.txt"));

    assert!(reader.next_header().unwrap().is_none());
    let filters: &[Filter] = if expect_filter == Filter::None { &[] } else { &[expect_filter] };
    assert_eq!(reader.filters(), filters);
    assert_eq!(reader.format().unwrap().family(), expect_family);
}

#[test]
fn test_tar_variants_round_trip() {
    check_tree(tree("none", "ustar"), Filter::None, Format::Tar);
    check_tree(tree("gzip", "pax"), Filter::Gzip, Format::Tar);
    check_tree(tree("none", "gnutar"), Filter::None, Format::Tar);
}

#[test]
fn test_cpio_variants_round_trip() {
    check_tree(tree("none", "odc"), Filter::None, Format::Cpio);
    check_tree(tree("gzip", "newc"), Filter::Gzip, Format::Cpio);
    check_tree(tree("none", "crc"), Filter::None, Format::Cpio);
}

#[test]
fn test_zip_round_trip() {
    check_tree(tree("none", "zip"), Filter::None, Format::Zip);
}

#[cfg(feature = "bzip2")]
#[test]
fn test_bzip2_round_trip() {
    check_tree(tree("bzip2", "ustar"), Filter::Bzip2, Format::Tar);
}

#[cfg(feature = "xz")]
#[test]
fn test_xz_round_trip() {
    check_tree(tree("xz", "newc"), Filter::Xz, Format::Cpio);
}

#[cfg(feature = "zstd")]
#[test]
fn test_zstd_round_trip() {
    check_tree(tree("zstd", "pax_restricted"), Filter::Zstd, Format::Tar);
}

#[test]
fn test_unset_timestamps_stay_unset() {
    let buffer = MemoryBuffer::new();
    Writer::with_memory(&buffer, "none", "pax_restricted", |w| {
        let mut e = regular("t", 0o644, b"");
        e.set_mtime(1_234_567_890, 500_000_000);
        w.write_header(&e)
    })
    .unwrap();

    Reader::with_memory(buffer.to_vec(), None, |r| {
        let e = r.next_header()?.unwrap();
        let mtime = e.mtime().unwrap();
        assert_eq!((mtime.secs, mtime.nsec), (1_234_567_890, 500_000_000));
        assert!(!e.atime_is_set());
        assert!(!e.ctime_is_set());
        assert!(!e.birthtime_is_set());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_extended_times_survive_pax() {
    let buffer = MemoryBuffer::new();
    Writer::with_memory(&buffer, "none", "pax", |w| {
        let mut e = regular("t", 0o644, b"");
        e.set_atime(1_000, 1);
        e.set_birthtime(900, 0);
        w.write_header(&e)
    })
    .unwrap();

    let mut reader = Reader::open_memory(buffer.to_vec(), None).unwrap();
    let e = reader.next_header().unwrap().unwrap();
    let atime = e.atime().unwrap();
    assert_eq!((atime.secs, atime.nsec), (1_000, 1));
    assert_eq!(e.birthtime().unwrap().secs, 900);
    assert!(!e.ctime_is_set());
}

#[test]
fn test_xattrs_round_trip() {
    let buffer = MemoryBuffer::new();
    let mut writer = Writer::open_memory(&buffer, "gzip", "pax_restricted").unwrap();
    let mut e = regular("x", 0o644, b"");
    e.xattr_add_entry("user.comment", "hello");
    e.xattr_add_entry("user.binary", [0u8, 1, 2, 255]);
    writer.write_header(&e).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open_memory(buffer.to_vec(), None).unwrap();
    let mut e = reader.next_header().unwrap().unwrap();
    assert_eq!(e.xattr_count(), 2);
    let mut found = Vec::new();
    e.xattr_reset();
    while let Some(x) = e.xattr_next() {
        found.push((x.name.clone(), x.value.clone()));
    }
    found.sort();
    assert_eq!(
        found,
        [
            ("user.binary".to_string(), vec![0u8, 1, 2, 255]),
            ("user.comment".to_string(), b"hello".to_vec()),
        ]
    );
}

#[test]
fn test_short_data_is_zero_filled() {
    let buffer = MemoryBuffer::new();
    let mut writer = Writer::open_memory(&buffer, "none", "ustar").unwrap();
    writer.write_header(&regular("short", 0o644, &[0; 10])).unwrap();
    writer.write_data(b"abc").unwrap();
    writer.write_header(&regular("next", 0o644, b"n")).unwrap();
    writer.write_data(b"n").unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open_memory(buffer.to_vec(), None).unwrap();
    reader.next_header().unwrap();
    assert_eq!(reader.read_data(64).unwrap(), b"abc\0\0\0\0\0\0\0");
    assert_eq!(reader.next_header().unwrap().unwrap().pathname(), Some("next"));
}

#[test]
fn test_raw_format_writes_bare_data() {
    let buffer = MemoryBuffer::new();
    let mut writer = Writer::open_memory(&buffer, "gzip", "raw").unwrap();
    writer.write_header(&regular("whatever", 0o644, b"plain payload")).unwrap();
    writer.write_data(b"plain payload").unwrap();
    assert!(writer.write_header(&regular("second", 0o644, b"")).is_err());
    writer.close().unwrap();

    let options = arcstream::ReadOptions::default().format(Format::Raw);
    let mut reader = Reader::open(arcstream::Source::Memory(buffer.to_bytes()), options).unwrap();
    reader.next_header().unwrap().unwrap();
    assert_eq!(reader.read_data(5).unwrap(), b"plain payload");
    assert_eq!(reader.filters(), [Filter::Gzip]);
}
