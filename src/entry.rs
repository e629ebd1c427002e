//! Archive entry metadata.
//!
//! [`EntryRecord`] is the mutable metadata unit threaded through the write
//! pipeline: every stage may complete or rewrite parts of it before the
//! record is frozen into the central directory. `None` in the CRC or size
//! fields is the UNKNOWN sentinel; a record still carrying `None` when the
//! central directory is written is dropped from the directory.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, ZipError};
use crate::extra::ExtraFields;
use crate::framing::{FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED, FLAG_UTF8};

/// Compression method of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// No compression.
    #[default]
    Stored,
    /// DEFLATE compression.
    Deflated,
    /// Bzip2 compression.
    Bzip2,
    /// WinZip-AES wrapper; the true inner method lives in the extra field.
    AesWrapped,
    /// Unknown/unsupported method.
    Unknown(u16),
}

impl Method {
    /// Get the raw ZIP method identifier.
    pub fn id(&self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
            Self::Bzip2 => 12,
            Self::AesWrapped => 99,
            Self::Unknown(id) => *id,
        }
    }

    /// Create from a raw ZIP method identifier.
    pub fn from_id(id: u16) -> Self {
        match id {
            0 => Self::Stored,
            8 => Self::Deflated,
            12 => Self::Bzip2,
            99 => Self::AesWrapped,
            other => Self::Unknown(other),
        }
    }

    /// Get the method name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stored => "Stored",
            Self::Deflated => "Deflated",
            Self::Bzip2 => "Bzip2",
            Self::AesWrapped => "AES",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "Unknown({})", id),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Date-time encoding policy, selected at writer construction time.
///
/// Plain ZIP rounds modification times *up* to the next even second so an
/// archived file never appears older than its source; the JAR variant
/// truncates instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimePolicy {
    /// Plain ZIP: round up to the DOS 2-second granularity.
    #[default]
    Zip,
    /// JAR: truncate to the DOS 2-second granularity.
    Jar,
}

/// An entry in an archive.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    /// The name/path of the entry within the archive.
    pub name: String,
    /// Compression method.
    pub method: Method,
    /// Declared CRC-32 of the uncompressed data; `None` = unknown.
    pub crc: Option<u32>,
    /// Compressed size in bytes; `None` = unknown.
    pub compressed_size: Option<u64>,
    /// Uncompressed size in bytes; `None` = unknown.
    pub uncompressed_size: Option<u64>,
    /// Last modification time.
    pub modified: SystemTime,
    /// Platform byte for version-made-by (3 = Unix).
    pub platform: u8,
    /// Unix mode bits, mapped into the external attributes.
    pub unix_mode: Option<u32>,
    /// Per-entry comment, written to the central directory.
    pub comment: Option<String>,
    /// Request authenticated encryption for this entry.
    pub encrypt: bool,
    /// Ordered extra-field list keyed by 16-bit header id.
    pub extra: ExtraFields,
    /// Offset of the local file header within the archive.
    pub(crate) header_offset: u64,
    /// A data descriptor follows this entry's payload.
    pub(crate) descriptor: bool,
    /// The payload is encrypted (derived flag, set by the pipeline).
    pub(crate) encrypted: bool,
}

impl EntryRecord {
    /// Create a new entry with unknown CRC and sizes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: Method::Deflated,
            crc: None,
            compressed_size: None,
            uncompressed_size: None,
            modified: SystemTime::now(),
            platform: 3,
            unix_mode: None,
            comment: None,
            encrypt: false,
            extra: ExtraFields::default(),
            header_offset: 0,
            descriptor: false,
            encrypted: false,
        }
    }

    /// Create a directory entry (name gets a trailing `/`).
    pub fn directory(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.ends_with('/') {
            name
        } else {
            format!("{}/", name)
        };
        let mut entry = Self::new(name);
        entry.method = Method::Stored;
        entry.crc = Some(0);
        entry.compressed_size = Some(0);
        entry.uncompressed_size = Some(0);
        entry
    }

    /// Builder method to set the compression method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Builder method to set the declared CRC-32.
    pub fn with_crc(mut self, crc: u32) -> Self {
        self.crc = Some(crc);
        self
    }

    /// Builder method to set the uncompressed size.
    pub fn with_uncompressed_size(mut self, size: u64) -> Self {
        self.uncompressed_size = Some(size);
        self
    }

    /// Builder method to set the compressed size.
    pub fn with_compressed_size(mut self, size: u64) -> Self {
        self.compressed_size = Some(size);
        self
    }

    /// Builder method to set the modification time.
    pub fn with_modified(mut self, time: SystemTime) -> Self {
        self.modified = time;
        self
    }

    /// Builder method to set the Unix mode bits.
    pub fn with_unix_mode(mut self, mode: u32) -> Self {
        self.unix_mode = Some(mode);
        self
    }

    /// Builder method to set the per-entry comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Builder method to request authenticated encryption.
    pub fn with_encryption(mut self) -> Self {
        self.encrypt = true;
        self
    }

    /// Check if this is a directory entry.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Check if the entry payload is (or will be) encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// CRC and both sizes are known.
    pub(crate) fn is_resolved(&self) -> bool {
        self.crc.is_some() && self.compressed_size.is_some() && self.uncompressed_size.is_some()
    }

    /// Derived general-purpose bit flags; never independently settable.
    pub(crate) fn general_flags(&self) -> u16 {
        let mut flags = 0;
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.descriptor {
            flags |= FLAG_DATA_DESCRIPTOR;
        }
        if !self.name.is_ascii() {
            flags |= FLAG_UTF8;
        }
        flags
    }

    /// External file attributes for the central directory.
    pub(crate) fn external_attributes(&self) -> u32 {
        let mode = self.unix_mode.unwrap_or(if self.is_dir() {
            0o40755
        } else {
            0o100644
        });
        mode << 16
    }

    /// Validate the entry path for extraction safety.
    ///
    /// Rejects absolute paths, parent-directory components, and embedded
    /// NUL bytes.
    pub fn validate_path(&self) -> Result<()> {
        let path = std::path::Path::new(&self.name);
        if path.is_absolute() {
            return Err(ZipError::invalid_header(format!(
                "unsafe entry path: {}",
                self.name
            )));
        }
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    return Err(ZipError::invalid_header(format!(
                        "unsafe entry path: {}",
                        self.name
                    )));
                }
                std::path::Component::Normal(s) => {
                    if s.to_string_lossy().contains('\0') {
                        return Err(ZipError::invalid_header(format!(
                            "unsafe entry path: {}",
                            self.name
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for EntryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:>10} {:>10} {}",
            self.method,
            self.uncompressed_size.unwrap_or(0),
            self.compressed_size.unwrap_or(0),
            self.name
        )
    }
}

// Civil-calendar conversion (Howard Hinnant's algorithms), used for the
// DOS date-time fields.

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Encode a [`SystemTime`] into DOS (time, date) words.
///
/// Times before the DOS epoch clamp to 1980-01-01 00:00:00; times past
/// 2107-12-31 clamp to the maximum representable value.
pub(crate) fn dos_datetime(policy: TimePolicy, time: SystemTime) -> (u16, u16) {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let secs = match policy {
        TimePolicy::Zip => (secs + 1) & !1,
        TimePolicy::Jar => secs & !1,
    };
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    if year < 1980 {
        return (0, (1 << 5) | 1);
    }
    if year > 2107 {
        return (
            (23 << 11) | (59 << 5) | 29,
            (127 << 9) | (12 << 5) | 31,
        );
    }
    let tod = secs % 86_400;
    let mtime =
        ((tod / 3600) as u16) << 11 | (((tod % 3600) / 60) as u16) << 5 | ((tod % 60) / 2) as u16;
    let mdate = ((year - 1980) as u16) << 9 | (month as u16) << 5 | day as u16;
    (mtime, mdate)
}

/// Decode DOS (time, date) words into a [`SystemTime`].
pub(crate) fn systemtime_from_dos(mtime: u16, mdate: u16) -> SystemTime {
    let year = ((mdate >> 9) & 0x7F) as i64 + 1980;
    let month = ((mdate >> 5) & 0x0F).clamp(1, 12) as u32;
    let day = (mdate & 0x1F).max(1) as u32;
    let hours = ((mtime >> 11) & 0x1F) as u64;
    let minutes = ((mtime >> 5) & 0x3F) as u64;
    let seconds = (mtime & 0x1F) as u64 * 2;
    let days = days_from_civil(year, month, day);
    let total = days as u64 * 86_400 + hours * 3600 + minutes * 60 + seconds;
    UNIX_EPOCH + Duration::from_secs(total)
}
