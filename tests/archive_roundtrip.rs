//! End-to-end write/read tests over in-memory archives.

use std::io::{Cursor, Read};

use zipforge::{ArchiveWriter, EntryRecord, Method, TimePolicy, ZipError, ZipReader};

fn crc_of(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[test]
fn test_mixed_method_archive() {
    let text = b"the same text compressed three different ways ".repeat(30);

    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .add_entry_bytes(
            EntryRecord::new("stored.txt")
                .with_method(Method::Stored)
                .with_crc(crc_of(&text))
                .with_uncompressed_size(text.len() as u64),
            &text,
        )
        .unwrap();
    writer
        .add_entry_bytes(
            EntryRecord::new("deflated.txt").with_method(Method::Deflated),
            &text,
        )
        .unwrap();
    writer
        .add_entry_bytes(
            EntryRecord::new("bzipped.txt").with_method(Method::Bzip2),
            &text,
        )
        .unwrap();
    writer.add_directory("docs").unwrap();
    writer.finish().unwrap();

    let bytes = writer.into_inner().unwrap();
    let mut reader = ZipReader::new(Cursor::new(bytes)).unwrap();

    let names: Vec<_> = reader.entries().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["stored.txt", "deflated.txt", "bzipped.txt", "docs/"]);

    for name in ["stored.txt", "deflated.txt", "bzipped.txt"] {
        assert_eq!(reader.extract(name).unwrap(), text, "entry {name}");
    }
    assert!(reader.entry("docs/").unwrap().is_dir());
    reader.verify().unwrap();
}

#[test]
fn test_empty_payload_entries() {
    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .add_entry_bytes(EntryRecord::new("empty.bin"), b"")
        .unwrap();
    writer.finish().unwrap();

    let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    assert_eq!(reader.extract("empty.bin").unwrap(), Vec::<u8>::new());
    let rec = reader.entry("empty.bin").unwrap();
    assert_eq!(rec.uncompressed_size, Some(0));
}

#[test]
fn test_streamed_entry_in_chunks() {
    let chunk = vec![0x5Au8; 8192];
    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .begin_entry(EntryRecord::new("chunked.bin").with_method(Method::Deflated))
        .unwrap();
    for _ in 0..64 {
        writer.write_data(&chunk).unwrap();
    }
    writer.end_entry().unwrap();
    writer.finish().unwrap();

    let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    let rec = reader.entry("chunked.bin").unwrap();
    assert_eq!(rec.uncompressed_size, Some(64 * 8192));

    let mut stream = reader.entry_reader("chunked.bin").unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    stream.close().unwrap();
    assert_eq!(out.len(), 64 * 8192);
    assert!(out.iter().all(|&b| b == 0x5A));
}

#[test]
fn test_unicode_names() {
    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .add_entry_bytes(EntryRecord::new("резюме/日記.txt"), b"multilingual")
        .unwrap();
    writer.finish().unwrap();

    let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    assert_eq!(
        reader.extract("резюме/日記.txt").unwrap(),
        b"multilingual".to_vec()
    );
}

#[test]
fn test_jar_time_policy_truncates() {
    use std::time::{Duration, UNIX_EPOCH};

    // 2024-06-15 12:34:57 UTC: an odd second.
    let odd = UNIX_EPOCH + Duration::from_secs(1_718_454_897);

    let mut writer = ArchiveWriter::new(Vec::new());
    writer.set_time_policy(TimePolicy::Jar);
    writer
        .add_entry_bytes(EntryRecord::new("a").with_modified(odd), b"x")
        .unwrap();
    writer.finish().unwrap();

    let reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    let stored = reader.entry("a").unwrap().modified;
    let secs = stored.duration_since(UNIX_EPOCH).unwrap().as_secs();
    assert_eq!(secs, 1_718_454_896);
}

#[test]
fn test_unsafe_paths_flagged() {
    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .add_entry_bytes(EntryRecord::new("../../etc/shadow"), b"gotcha")
        .unwrap();
    writer.finish().unwrap();

    let reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    let rec = reader.entry("../../etc/shadow").unwrap();
    assert!(rec.validate_path().is_err());
    assert!(matches!(
        rec.validate_path().unwrap_err(),
        ZipError::InvalidHeader { .. }
    ));
}

#[test]
fn test_append_then_overwrite_by_name() {
    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
    writer
        .add_entry_bytes(EntryRecord::new("config.toml"), b"version = 1")
        .unwrap();
    writer
        .add_entry_bytes(EntryRecord::new("data.bin"), b"payload")
        .unwrap();
    writer.finish().unwrap();
    let cursor = writer.into_inner().unwrap();

    // Reopen and shadow config.toml; the old payload becomes dead bytes
    // but the directory points at the new one.
    let mut writer = ArchiveWriter::append(cursor).unwrap();
    writer
        .add_entry_bytes(EntryRecord::new("config.toml"), b"version = 2")
        .unwrap();
    writer.finish().unwrap();

    let bytes = writer.into_inner().unwrap().into_inner();
    let mut reader = ZipReader::new(Cursor::new(bytes)).unwrap();
    assert_eq!(reader.entries().count(), 2);
    assert_eq!(reader.extract("config.toml").unwrap(), b"version = 2".to_vec());
    assert_eq!(reader.extract("data.bin").unwrap(), b"payload".to_vec());
}

#[test]
fn test_append_leaves_existing_bytes_untouched() {
    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
    writer
        .add_entry_bytes(EntryRecord::new("a.txt").with_method(Method::Deflated), b"alpha")
        .unwrap();
    writer
        .add_entry_bytes(EntryRecord::new("b.txt").with_method(Method::Bzip2), b"bravo")
        .unwrap();
    writer.finish().unwrap();
    let old_bytes = writer.into_inner().unwrap().into_inner();

    let old_reader = ZipReader::new(Cursor::new(old_bytes.clone())).unwrap();
    assert_eq!(old_reader.entries().count(), 2);
    let old_cd_offset = old_reader.central_directory_offset() as usize;

    let mut writer = ArchiveWriter::append(Cursor::new(old_bytes.clone())).unwrap();
    writer
        .add_entry_bytes(EntryRecord::new("c.txt"), b"charlie")
        .unwrap();
    writer.finish().unwrap();
    let new_bytes = writer.into_inner().unwrap().into_inner();

    // Every byte up to the old central directory is untouched; only the
    // directory region was rewritten, after the appended payload.
    assert_eq!(&new_bytes[..old_cd_offset], &old_bytes[..old_cd_offset]);
    assert!(new_bytes.len() > old_bytes.len());

    // And the directory grew by exactly one.
    let mut reader = ZipReader::new(Cursor::new(new_bytes)).unwrap();
    assert_eq!(reader.entries().count(), 3);
    assert_eq!(reader.extract("a.txt").unwrap(), b"alpha".to_vec());
    assert_eq!(reader.extract("b.txt").unwrap(), b"bravo".to_vec());
    assert_eq!(reader.extract("c.txt").unwrap(), b"charlie".to_vec());
}

#[test]
fn test_many_entries_promote_to_zip64() {
    let mut writer = ArchiveWriter::new(Vec::new());
    for i in 0..0x10000 {
        writer
            .add_entry_bytes(
                EntryRecord::new(format!("e{i:05}"))
                    .with_method(Method::Stored)
                    .with_crc(0)
                    .with_uncompressed_size(0),
                b"",
            )
            .unwrap();
    }
    writer.finish().unwrap();
    let bytes = writer.into_inner().unwrap();

    // The 16-bit count saturated, so the ZIP64 trailer pair must exist.
    let sig = 0x06064B50u32.to_le_bytes();
    assert!(bytes.windows(4).any(|w| w == sig));

    let reader = ZipReader::new(Cursor::new(bytes)).unwrap();
    assert_eq!(reader.entries().count(), 0x10000);
}
