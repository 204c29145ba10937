//! Cross-checks the zip codec against the `zip` crate.

use std::io::{Cursor, Read, Write};

use arcstream::{FileType, MemoryBuffer, Reader, StreamReader, Writer};
use rand::RngCore;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data[..len / 2]);
    data
}

#[test]
fn test_our_zip_reads_with_zip_crate() {
    let big = payload(100_000);
    let buffer = MemoryBuffer::new();
    Writer::with_memory(&buffer, "none", "zip", |w| {
        w.add_entry(|e| {
            e.set_pathname("docs");
            e.set_filetype(FileType::Directory);
            e.set_perm(0o755);
            None
        })?;
        w.add_entry(|e| {
            e.set_pathname("docs/big.bin");
            e.set_filetype(FileType::Regular);
            e.set_perm(0o640);
            Some(big.clone())
        })?;
        w.add_entry(|e| {
            e.set_pathname("empty");
            e.set_filetype(FileType::Regular);
            e.set_perm(0o644);
            Some(Vec::new())
        })
    })
    .unwrap();

    let mut archive = ZipArchive::new(Cursor::new(buffer.to_vec())).unwrap();
    assert_eq!(archive.len(), 3);
    assert!(archive.by_name("docs/").unwrap().is_dir());

    let mut file = archive.by_name("docs/big.bin").unwrap();
    assert_eq!(file.unix_mode().map(|m| m & 0o777), Some(0o640));
    let mut got = Vec::new();
    file.read_to_end(&mut got).unwrap();
    assert_eq!(got, big);
    drop(file);

    assert_eq!(archive.by_name("empty").unwrap().size(), 0);
}

fn crate_zip(big: &[u8]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let deflated = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o600);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    writer.add_directory("dir/", SimpleFileOptions::default()).unwrap();
    writer.start_file("dir/deflated.bin", deflated).unwrap();
    writer.write_all(big).unwrap();
    writer.start_file("stored.txt", stored).unwrap();
    writer.write_all(b"stored text").unwrap();
    writer.finish().unwrap().into_inner()
}

#[test]
fn test_zip_crate_archive_reads_in_both_modes() {
    let big = payload(80_000);
    let data = crate_zip(&big);

    let check = |mut reader: Reader, seeking: bool| {
        let dir = reader.next_header().unwrap().unwrap();
        assert_eq!(dir.pathname(), Some("dir/"));
        assert!(dir.is_directory());

        let file = reader.next_header().unwrap().unwrap();
        assert_eq!(file.pathname(), Some("dir/deflated.bin"));
        if seeking {
            assert_eq!(file.perm(), 0o600);
            assert_eq!(file.size(), big.len() as u64);
        }
        assert_eq!(reader.read_data(1000).unwrap(), big);

        let stored = reader.next_header().unwrap().unwrap();
        assert_eq!(stored.pathname(), Some("stored.txt"));
        assert_eq!(reader.read_data(4).unwrap(), b"stored text");
        assert!(reader.next_header().unwrap().is_none());
    };

    check(Reader::open_memory(data.clone(), None).unwrap(), true);
    check(
        Reader::open_stream(StreamReader::new(Cursor::new(data)), None).unwrap(),
        false,
    );
}
