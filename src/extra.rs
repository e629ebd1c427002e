//! Extra-field handling.
//!
//! ZIP extra fields are a sequence of (16-bit id, 16-bit length, payload)
//! records. [`ExtraFields`] keeps them ordered and keyed by id; the two
//! fields this crate produces itself are the ZIP64 extended-information
//! field (0x0001) and the WinZip-AES field (0x9901).

use crate::entry::EntryRecord;
use crate::framing::ZIP64_MARKER_32;

/// ZIP64 extended information extra field id.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// WinZip AES extra field id.
pub const WINZIP_AES_ID: u16 = 0x9901;

/// Ordered list of extra fields, keyed by a 16-bit header id.
#[derive(Debug, Clone, Default)]
pub struct ExtraFields {
    fields: Vec<(u16, Vec<u8>)>,
}

impl ExtraFields {
    /// Parse a raw extra-field block. Truncated trailing garbage is
    /// ignored, matching how most ZIP tools behave.
    pub fn parse(data: &[u8]) -> Self {
        let mut fields = Vec::new();
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let id = u16::from_le_bytes([data[offset], data[offset + 1]]);
            let len = u16::from_le_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if offset + len > data.len() {
                break;
            }
            fields.push((id, data[offset..offset + len].to_vec()));
            offset += len;
        }
        Self { fields }
    }

    /// Install or replace the field with the given id, keeping its position
    /// if it already exists.
    pub fn set(&mut self, id: u16, payload: Vec<u8>) {
        if let Some(slot) = self.fields.iter_mut().find(|(fid, _)| *fid == id) {
            slot.1 = payload;
        } else {
            self.fields.push((id, payload));
        }
    }

    /// Get the payload of the field with the given id.
    pub fn get(&self, id: u16) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(fid, _)| *fid == id)
            .map(|(_, payload)| payload.as_slice())
    }

    /// Remove the field with the given id.
    pub fn remove(&mut self, id: u16) {
        self.fields.retain(|(fid, _)| *fid != id);
    }

    /// True if no fields are present.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialized byte length of all fields.
    pub fn byte_len(&self) -> usize {
        self.fields.iter().map(|(_, p)| 4 + p.len()).sum()
    }

    /// Serialize all fields.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for (id, payload) in &self.fields {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }
}

/// WinZip AES vendor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AesVendor {
    /// AE-1: the standard CRC-32 is retained alongside the auth code.
    Ae1 = 1,
    /// AE-2: the CRC-32 field is suppressed (written as zero).
    Ae2 = 2,
}

impl AesVendor {
    /// Convert from the raw vendor version value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Ae1),
            2 => Some(Self::Ae2),
            _ => None,
        }
    }
}

/// WinZip AES extra field: vendor version, vendor id, key strength, and
/// the true inner compression method. Fixed 7-byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesExtraField {
    /// Vendor version (AE-1 or AE-2).
    pub vendor: AesVendor,
    /// Key-strength code (1 = AES-128, 2 = AES-192, 3 = AES-256).
    pub strength: u8,
    /// The real compression method applied before encryption.
    pub inner_method: u16,
}

impl AesExtraField {
    /// Serialize the 7-byte payload (without the id/length framing).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(7);
        payload.extend_from_slice(&(self.vendor as u16).to_le_bytes());
        payload.push(b'A');
        payload.push(b'E');
        payload.push(self.strength);
        payload.extend_from_slice(&self.inner_method.to_le_bytes());
        payload
    }

    /// Parse the 7-byte payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < 7 || payload[2] != b'A' || payload[3] != b'E' {
            return None;
        }
        let vendor = AesVendor::from_u16(u16::from_le_bytes([payload[0], payload[1]]))?;
        Some(Self {
            vendor,
            strength: payload[4],
            inner_method: u16::from_le_bytes([payload[5], payload[6]]),
        })
    }

    /// Look up and parse the AES field from an extra-field list.
    pub fn from_extra(extra: &ExtraFields) -> Option<Self> {
        extra.get(WINZIP_AES_ID).and_then(Self::from_payload)
    }
}

/// Build the ZIP64 extended-information payload for a central directory
/// record, containing only the fields that overflow their 32-bit slots,
/// in the mandated order: uncompressed size, compressed size, offset.
pub(crate) fn zip64_central_payload(rec: &EntryRecord) -> Option<Vec<u8>> {
    let uncompressed = rec.uncompressed_size.unwrap_or(0);
    let compressed = rec.compressed_size.unwrap_or(0);
    let mut payload = Vec::new();
    if uncompressed >= ZIP64_MARKER_32 as u64 {
        payload.extend_from_slice(&uncompressed.to_le_bytes());
    }
    if compressed >= ZIP64_MARKER_32 as u64 {
        payload.extend_from_slice(&compressed.to_le_bytes());
    }
    if rec.header_offset >= ZIP64_MARKER_32 as u64 {
        payload.extend_from_slice(&rec.header_offset.to_le_bytes());
    }
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Build the ZIP64 payload for a local file header: both sizes, always
/// 16 bytes. The caller decides whether the header carries it.
pub(crate) fn zip64_local_payload(uncompressed: u64, compressed: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&uncompressed.to_le_bytes());
    payload.extend_from_slice(&compressed.to_le_bytes());
    payload
}

/// Read ZIP64 overrides for sizes and header offset from a parsed extra
/// field, honoring which 32-bit header fields held the sentinel.
pub(crate) fn zip64_overrides(
    extra: &ExtraFields,
    uncompressed_is_marker: bool,
    compressed_is_marker: bool,
    offset_is_marker: bool,
) -> (Option<u64>, Option<u64>, Option<u64>) {
    let Some(payload) = extra.get(ZIP64_EXTRA_ID) else {
        return (None, None, None);
    };
    let mut pos = 0;
    let mut read = |want: bool| -> Option<u64> {
        if !want || pos + 8 > payload.len() {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[pos..pos + 8]);
        pos += 8;
        Some(u64::from_le_bytes(bytes))
    };
    let uncompressed = read(uncompressed_is_marker);
    let compressed = read(compressed_is_marker);
    let offset = read(offset_is_marker);
    (uncompressed, compressed, offset)
}
