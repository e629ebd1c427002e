//! Raw container framing.
//!
//! Byte-exact, little-endian encoding of the ZIP container records as
//! specified in the PKWARE APPNOTE: local file header, data descriptor,
//! central directory header, end-of-central-directory record, and the
//! ZIP64 record/locator pair. 16/32-bit fields that would overflow are
//! written as the all-ones sentinel with the true value relocated to a
//! ZIP64 field.

use std::io::Write;

use crate::entry::{dos_datetime, EntryRecord, Method, TimePolicy};
use crate::error::{Result, ZipError};
use crate::extra::{zip64_central_payload, ZIP64_EXTRA_ID};

/// Local file header signature.
pub(crate) const LOCAL_FILE_HEADER_SIG: u32 = 0x04034B50;

/// Central directory header signature.
pub(crate) const CENTRAL_DIR_HEADER_SIG: u32 = 0x02014B50;

/// End of central directory signature.
pub(crate) const END_OF_CENTRAL_DIR_SIG: u32 = 0x06054B50;

/// ZIP64 end of central directory signature.
pub(crate) const ZIP64_END_OF_CENTRAL_DIR_SIG: u32 = 0x06064B50;

/// ZIP64 end of central directory locator signature.
pub(crate) const ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG: u32 = 0x07064B50;

/// Data descriptor signature.
pub(crate) const DATA_DESCRIPTOR_SIG: u32 = 0x08074B50;

/// Sentinel for overflowed 32-bit fields.
pub(crate) const ZIP64_MARKER_32: u32 = 0xFFFF_FFFF;

/// Sentinel for overflowed 16-bit fields.
pub(crate) const ZIP64_MARKER_16: u16 = 0xFFFF;

/// General-purpose flag: payload is encrypted.
pub(crate) const FLAG_ENCRYPTED: u16 = 0x0001;

/// General-purpose flag: a data descriptor follows the payload.
pub(crate) const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// General-purpose flag: name and comment are UTF-8.
pub(crate) const FLAG_UTF8: u16 = 0x0800;

/// Version needed to extract a stored entry.
pub(crate) const VERSION_STORED: u16 = 10;
/// Version needed to extract a deflated entry.
pub(crate) const VERSION_DEFLATED: u16 = 20;
/// Version needed to extract a ZIP64 entry.
pub(crate) const VERSION_ZIP64: u16 = 45;
/// Version needed to extract a bzip2 entry.
pub(crate) const VERSION_BZIP2: u16 = 46;
/// Version needed to extract a WinZip-AES entry.
pub(crate) const VERSION_AES: u16 = 51;

/// Compute the version-needed field from the entry's shape.
pub(crate) fn version_needed(method: Method, encrypted: bool, zip64: bool) -> u16 {
    let mut version = match method {
        Method::Stored => VERSION_STORED,
        Method::Bzip2 => VERSION_BZIP2,
        Method::AesWrapped => VERSION_AES,
        _ => VERSION_DEFLATED,
    };
    if encrypted {
        version = version.max(VERSION_AES);
    }
    if zip64 {
        version = version.max(VERSION_ZIP64);
    }
    version
}

/// Check a variable-length field fits its 16-bit length slot.
pub(crate) fn check_u16_len(field: &'static str, len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| ZipError::FieldOverflow { field, len })
}

/// Write a local file header. `crc` and the 32-bit sizes must already be
/// resolved to their on-wire values (zero placeholders when a data
/// descriptor follows, sentinels when a ZIP64 field carries the truth).
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_local_header<W: Write>(
    w: &mut W,
    name: &[u8],
    extra: &[u8],
    version: u16,
    flags: u16,
    method_id: u16,
    dos: (u16, u16),
    crc: u32,
    compressed_size: u32,
    uncompressed_size: u32,
) -> Result<()> {
    let name_len = check_u16_len("name", name.len())?;
    let extra_len = check_u16_len("extra field", extra.len())?;

    w.write_all(&LOCAL_FILE_HEADER_SIG.to_le_bytes())?;
    w.write_all(&version.to_le_bytes())?;
    w.write_all(&flags.to_le_bytes())?;
    w.write_all(&method_id.to_le_bytes())?;
    w.write_all(&dos.0.to_le_bytes())?;
    w.write_all(&dos.1.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&compressed_size.to_le_bytes())?;
    w.write_all(&uncompressed_size.to_le_bytes())?;
    w.write_all(&name_len.to_le_bytes())?;
    w.write_all(&extra_len.to_le_bytes())?;
    w.write_all(name)?;
    w.write_all(extra)?;
    Ok(())
}

/// Write a data descriptor, with 32- or 64-bit sizes.
pub(crate) fn write_data_descriptor<W: Write>(
    w: &mut W,
    crc: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    zip64: bool,
) -> Result<()> {
    w.write_all(&DATA_DESCRIPTOR_SIG.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    if zip64 {
        w.write_all(&compressed_size.to_le_bytes())?;
        w.write_all(&uncompressed_size.to_le_bytes())?;
    } else {
        w.write_all(&(compressed_size as u32).to_le_bytes())?;
        w.write_all(&(uncompressed_size as u32).to_le_bytes())?;
    }
    Ok(())
}

fn sentinel_32(value: u64) -> u32 {
    if value >= ZIP64_MARKER_32 as u64 {
        ZIP64_MARKER_32
    } else {
        value as u32
    }
}

/// Write one central directory header for a resolved entry record.
pub(crate) fn write_central_header<W: Write>(
    w: &mut W,
    rec: &EntryRecord,
    policy: TimePolicy,
) -> Result<()> {
    let compressed = rec.compressed_size.unwrap_or(0);
    let uncompressed = rec.uncompressed_size.unwrap_or(0);
    let zip64_payload = zip64_central_payload(rec);
    let zip64 = zip64_payload.is_some();

    let mut extra = Vec::new();
    if let Some(payload) = &zip64_payload {
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        extra.extend_from_slice(payload);
    }
    extra.extend_from_slice(&rec.extra.to_bytes());

    let name = rec.name.as_bytes();
    let comment = rec.comment.as_deref().unwrap_or("").as_bytes();
    let name_len = check_u16_len("name", name.len())?;
    let extra_len = check_u16_len("extra field", extra.len())?;
    let comment_len = check_u16_len("comment", comment.len())?;

    let version_made_by = u16::from(rec.platform) << 8 | VERSION_ZIP64;
    let version = version_needed(rec.method, rec.encrypted, zip64);
    let dos = dos_datetime(policy, rec.modified);

    w.write_all(&CENTRAL_DIR_HEADER_SIG.to_le_bytes())?;
    w.write_all(&version_made_by.to_le_bytes())?;
    w.write_all(&version.to_le_bytes())?;
    w.write_all(&rec.general_flags().to_le_bytes())?;
    w.write_all(&rec.method.id().to_le_bytes())?;
    w.write_all(&dos.0.to_le_bytes())?;
    w.write_all(&dos.1.to_le_bytes())?;
    w.write_all(&rec.crc.unwrap_or(0).to_le_bytes())?;
    w.write_all(&sentinel_32(compressed).to_le_bytes())?;
    w.write_all(&sentinel_32(uncompressed).to_le_bytes())?;
    w.write_all(&name_len.to_le_bytes())?;
    w.write_all(&extra_len.to_le_bytes())?;
    w.write_all(&comment_len.to_le_bytes())?;
    w.write_all(&0u16.to_le_bytes())?; // disk number start
    w.write_all(&0u16.to_le_bytes())?; // internal attributes
    w.write_all(&rec.external_attributes().to_le_bytes())?;
    w.write_all(&sentinel_32(rec.header_offset).to_le_bytes())?;
    w.write_all(name)?;
    w.write_all(&extra)?;
    w.write_all(comment)?;
    Ok(())
}

/// Write the ZIP64 end-of-central-directory record and its locator.
pub(crate) fn write_zip64_eocd<W: Write>(
    w: &mut W,
    entries: u64,
    cd_size: u64,
    cd_offset: u64,
    zip64_eocd_offset: u64,
) -> Result<()> {
    w.write_all(&ZIP64_END_OF_CENTRAL_DIR_SIG.to_le_bytes())?;
    w.write_all(&44u64.to_le_bytes())?; // record size following this field
    w.write_all(&(3u16 << 8 | VERSION_ZIP64).to_le_bytes())?;
    w.write_all(&VERSION_ZIP64.to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?; // this disk
    w.write_all(&0u32.to_le_bytes())?; // central directory disk
    w.write_all(&entries.to_le_bytes())?;
    w.write_all(&entries.to_le_bytes())?;
    w.write_all(&cd_size.to_le_bytes())?;
    w.write_all(&cd_offset.to_le_bytes())?;

    w.write_all(&ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG.to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?; // disk with the ZIP64 EOCD
    w.write_all(&zip64_eocd_offset.to_le_bytes())?;
    w.write_all(&1u32.to_le_bytes())?; // total disks
    Ok(())
}

/// Write the standard end-of-central-directory record.
pub(crate) fn write_eocd<W: Write>(
    w: &mut W,
    entries: u64,
    cd_size: u64,
    cd_offset: u64,
    comment: &[u8],
) -> Result<()> {
    let comment_len = check_u16_len("comment", comment.len())?;
    let entries_16 = if entries > ZIP64_MARKER_16 as u64 {
        ZIP64_MARKER_16
    } else {
        entries as u16
    };

    w.write_all(&END_OF_CENTRAL_DIR_SIG.to_le_bytes())?;
    w.write_all(&0u16.to_le_bytes())?; // this disk
    w.write_all(&0u16.to_le_bytes())?; // central directory disk
    w.write_all(&entries_16.to_le_bytes())?;
    w.write_all(&entries_16.to_le_bytes())?;
    w.write_all(&sentinel_32(cd_size).to_le_bytes())?;
    w.write_all(&sentinel_32(cd_offset).to_le_bytes())?;
    w.write_all(&comment_len.to_le_bytes())?;
    w.write_all(comment)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn test_version_needed() {
        assert_eq!(version_needed(Method::Stored, false, false), 10);
        assert_eq!(version_needed(Method::Deflated, false, false), 20);
        assert_eq!(version_needed(Method::Bzip2, false, false), 46);
        assert_eq!(version_needed(Method::Deflated, false, true), 45);
        assert_eq!(version_needed(Method::AesWrapped, true, false), 51);
        assert_eq!(version_needed(Method::AesWrapped, true, true), 51);
    }

    #[test]
    fn test_local_header_layout() {
        let mut buf = Vec::new();
        write_local_header(
            &mut buf,
            b"a.txt",
            &[],
            20,
            FLAG_DATA_DESCRIPTOR,
            8,
            (0x6083, 0x58CF),
            0,
            0,
            0,
        )
        .unwrap();
        assert_eq!(buf.len(), 30 + 5);
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), LOCAL_FILE_HEADER_SIG);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), FLAG_DATA_DESCRIPTOR);
        assert_eq!(u16::from_le_bytes(buf[8..10].try_into().unwrap()), 8);
        assert_eq!(&buf[30..], b"a.txt");
    }

    #[test]
    fn test_name_overflow_rejected() {
        let name = vec![b'x'; 70_000];
        let mut buf = Vec::new();
        let err = write_local_header(&mut buf, &name, &[], 20, 0, 8, (0, 0), 0, 0, 0).unwrap_err();
        assert!(matches!(err, ZipError::FieldOverflow { field: "name", .. }));
    }

    #[test]
    fn test_data_descriptor_sizes() {
        let mut narrow = Vec::new();
        write_data_descriptor(&mut narrow, 1, 2, 3, false).unwrap();
        assert_eq!(narrow.len(), 16);

        let mut wide = Vec::new();
        write_data_descriptor(&mut wide, 1, 2, 3, true).unwrap();
        assert_eq!(wide.len(), 24);
        assert_eq!(u32::from_le_bytes(wide[..4].try_into().unwrap()), DATA_DESCRIPTOR_SIG);
    }

    #[test]
    fn test_central_header_sentinels() {
        let mut rec = EntryRecord::new("big.bin").with_method(Method::Stored);
        rec.crc = Some(0xAABBCCDD);
        rec.compressed_size = Some(0x1_0000_0000);
        rec.uncompressed_size = Some(0x1_0000_0000);
        rec.modified = SystemTime::UNIX_EPOCH;
        rec.header_offset = 7;

        let mut buf = Vec::new();
        write_central_header(&mut buf, &rec, TimePolicy::Zip).unwrap();

        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), CENTRAL_DIR_HEADER_SIG);
        // Both size fields hold the sentinel; the offset does not.
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), ZIP64_MARKER_32);
        assert_eq!(u32::from_le_bytes(buf[24..28].try_into().unwrap()), ZIP64_MARKER_32);
        assert_eq!(u32::from_le_bytes(buf[42..46].try_into().unwrap()), 7);
        // Version needed promoted to ZIP64.
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), VERSION_ZIP64);
        // ZIP64 extra with both sizes.
        let extra_len = u16::from_le_bytes(buf[30..32].try_into().unwrap());
        assert_eq!(extra_len, 4 + 16);
    }

    #[test]
    fn test_eocd_sentinels() {
        let mut buf = Vec::new();
        write_eocd(&mut buf, 70_000, 0x1_0000_0000, 10, b"hi").unwrap();
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), END_OF_CENTRAL_DIR_SIG);
        assert_eq!(u16::from_le_bytes(buf[8..10].try_into().unwrap()), ZIP64_MARKER_16);
        assert_eq!(u16::from_le_bytes(buf[10..12].try_into().unwrap()), ZIP64_MARKER_16);
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), ZIP64_MARKER_32);
        assert_eq!(u32::from_le_bytes(buf[16..20].try_into().unwrap()), 10);
        assert_eq!(&buf[22..], b"hi");
    }

    #[test]
    fn test_zip64_eocd_layout() {
        let mut buf = Vec::new();
        write_zip64_eocd(&mut buf, 70_000, 123, 456, 789).unwrap();
        assert_eq!(buf.len(), 56 + 20);
        assert_eq!(
            u32::from_le_bytes(buf[..4].try_into().unwrap()),
            ZIP64_END_OF_CENTRAL_DIR_SIG
        );
        assert_eq!(u64::from_le_bytes(buf[24..32].try_into().unwrap()), 70_000);
        assert_eq!(u64::from_le_bytes(buf[48..56].try_into().unwrap()), 456);
        assert_eq!(
            u32::from_le_bytes(buf[56..60].try_into().unwrap()),
            ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG
        );
        assert_eq!(u64::from_le_bytes(buf[64..72].try_into().unwrap()), 789);
    }
}
