//! WinZip-AES behavior across the full write/read path.

use std::collections::HashMap;
use std::io::Cursor;

use zipforge::{
    AesExtraField, AesStrength, AesVendor, ArchiveWriter, CryptoParams, CryptoProvider,
    EntryRecord, Method, PasswordProvider, Result, ZipError, ZipReader,
};

/// Provider with a different password per entry, and nothing for the rest.
struct KeyringProvider {
    passwords: HashMap<String, Vec<u8>>,
}

impl CryptoProvider for KeyringProvider {
    fn parameters(&self, entry_name: &str) -> Result<CryptoParams> {
        let password = self
            .passwords
            .get(entry_name)
            .cloned()
            .ok_or_else(|| ZipError::crypto_parameters(format!("no key for {entry_name:?}")))?;
        Ok(CryptoParams {
            strength: AesStrength::Aes256,
            password,
        })
    }
}

#[test]
fn test_per_entry_passwords() {
    let passwords: HashMap<String, Vec<u8>> = [
        ("a.txt".to_string(), b"alpha".to_vec()),
        ("b.txt".to_string(), b"bravo".to_vec()),
    ]
    .into();

    let mut writer = ArchiveWriter::new(Vec::new());
    writer.set_crypto_provider(Box::new(KeyringProvider {
        passwords: passwords.clone(),
    }));
    writer
        .add_entry_bytes(EntryRecord::new("a.txt").with_encryption(), b"first secret")
        .unwrap();
    writer
        .add_entry_bytes(EntryRecord::new("b.txt").with_encryption(), b"second secret")
        .unwrap();
    // An entry the provider has no key for is refused before any bytes land.
    let err = writer
        .begin_entry(EntryRecord::new("c.txt").with_encryption())
        .unwrap_err();
    assert!(matches!(err, ZipError::CryptoParameters { .. }));
    writer.finish().unwrap();

    let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    reader.set_crypto_provider(Box::new(KeyringProvider { passwords }));
    assert_eq!(reader.extract("a.txt").unwrap(), b"first secret".to_vec());
    assert_eq!(reader.extract("b.txt").unwrap(), b"second secret".to_vec());
    assert_eq!(reader.entries().count(), 2);
}

#[test]
fn test_all_strengths_roundtrip() {
    for strength in [
        AesStrength::Aes128,
        AesStrength::Aes192,
        AesStrength::Aes256,
    ] {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.set_crypto_provider(Box::new(PasswordProvider::with_strength("pw", strength)));
        writer
            .add_entry_bytes(
                EntryRecord::new("s.bin").with_encryption(),
                b"strength-independent plaintext",
            )
            .unwrap();
        writer.finish().unwrap();

        let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
        let aes = AesExtraField::from_extra(&reader.entry("s.bin").unwrap().extra).unwrap();
        assert_eq!(aes.strength, strength as u8);

        reader.set_crypto_provider(Box::new(PasswordProvider::with_strength("pw", strength)));
        assert_eq!(
            reader.extract("s.bin").unwrap(),
            b"strength-independent plaintext".to_vec()
        );
    }
}

#[test]
fn test_plaintext_never_on_the_wire() {
    let secret = b"THE-CANARY-STRING-THAT-MUST-NOT-LEAK".repeat(4);
    let mut writer = ArchiveWriter::new(Vec::new());
    writer.set_crypto_provider(Box::new(PasswordProvider::new("pw")));
    writer
        .add_entry_bytes(
            EntryRecord::new("canary.bin")
                .with_method(Method::Stored)
                .with_encryption()
                .with_crc({
                    let mut h = crc32fast::Hasher::new();
                    h.update(&secret);
                    h.finalize()
                })
                .with_uncompressed_size(secret.len() as u64),
            &secret,
        )
        .unwrap();
    writer.finish().unwrap();
    let bytes = writer.into_inner().unwrap();

    let needle = b"THE-CANARY-STRING";
    assert!(!bytes
        .windows(needle.len())
        .any(|w| w == needle.as_slice()));
}

#[test]
fn test_ae1_keeps_crc_ae2_zeroes_it() {
    let small = b"tiny"; // below the AE-1 threshold
    let large = b"large enough to qualify for AE-1 treatment";

    let mut writer = ArchiveWriter::new(Vec::new());
    writer.set_crypto_provider(Box::new(PasswordProvider::new("pw")));
    writer
        .add_entry_bytes(
            EntryRecord::new("small.bin")
                .with_encryption()
                .with_uncompressed_size(small.len() as u64),
            small,
        )
        .unwrap();
    writer
        .add_entry_bytes(
            EntryRecord::new("large.bin")
                .with_encryption()
                .with_uncompressed_size(large.len() as u64),
            large,
        )
        .unwrap();
    writer.finish().unwrap();

    let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    let small_rec = reader.entry("small.bin").unwrap();
    let large_rec = reader.entry("large.bin").unwrap();
    assert_eq!(
        AesExtraField::from_extra(&small_rec.extra).unwrap().vendor,
        AesVendor::Ae2
    );
    assert_eq!(small_rec.crc, Some(0));
    assert_eq!(
        AesExtraField::from_extra(&large_rec.extra).unwrap().vendor,
        AesVendor::Ae1
    );
    assert_ne!(large_rec.crc, Some(0));

    reader.set_crypto_provider(Box::new(PasswordProvider::new("pw")));
    assert_eq!(reader.extract("small.bin").unwrap(), small.to_vec());
    assert_eq!(reader.extract("large.bin").unwrap(), large.to_vec());
    reader.verify().unwrap();
}

#[test]
fn test_encrypted_and_plain_entries_coexist() {
    let mut writer = ArchiveWriter::new(Vec::new());
    writer.set_crypto_provider(Box::new(PasswordProvider::new("pw")));
    writer
        .add_entry_bytes(EntryRecord::new("open.txt"), b"public")
        .unwrap();
    writer
        .add_entry_bytes(EntryRecord::new("shut.txt").with_encryption(), b"private")
        .unwrap();
    writer.finish().unwrap();

    let mut reader = ZipReader::new(Cursor::new(writer.into_inner().unwrap())).unwrap();
    // The plain entry needs no provider.
    assert_eq!(reader.extract("open.txt").unwrap(), b"public".to_vec());
    assert!(!reader.entry("open.txt").unwrap().is_encrypted());
    assert!(reader.entry("shut.txt").unwrap().is_encrypted());
}
