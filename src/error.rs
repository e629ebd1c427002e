//! Error types for zipforge operations.
//!
//! One error enum covers the whole crate: I/O failures from the underlying
//! stream, format violations detected while framing or parsing container
//! bytes, integrity failures (CRC, authentication), and crypto-parameter
//! lookup failures, which are deliberately distinct from I/O errors.

use std::io;
use thiserror::Error;

/// The main error type for zipforge operations.
#[derive(Debug, Error)]
pub enum ZipError {
    /// I/O error from the underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid signature in a container record.
    #[error("Invalid signature: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic {
        /// Expected signature value.
        expected: u32,
        /// Actual signature value found.
        found: u32,
    },

    /// Malformed header or record.
    #[error("Invalid header: {message}")]
    InvalidHeader {
        /// Description of the header error.
        message: String,
    },

    /// Compression method this build cannot encode or decode.
    #[error("Unsupported compression method: {method}")]
    UnsupportedMethod {
        /// The raw compression method identifier.
        method: u16,
    },

    /// A name, extra-field, or comment does not fit its 16-bit length field.
    #[error("{field} length {len} exceeds the 16-bit field limit")]
    FieldOverflow {
        /// Which variable-length field overflowed.
        field: &'static str,
        /// The offending byte length.
        len: usize,
    },

    /// Bytes written for an entry diverge from its declared compressed size.
    #[error("Entry {entry:?}: wrote {actual} compressed bytes, declared {declared}")]
    SizeMismatch {
        /// Name of the entry.
        entry: String,
        /// Compressed size declared up front.
        declared: u64,
        /// Compressed bytes actually written.
        actual: u64,
    },

    /// CRC-32 checksum mismatch, surfaced when the entry stream is closed.
    #[error("Entry {entry:?}: CRC mismatch, expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// Name of the entry.
        entry: String,
        /// Expected CRC value from the archive metadata.
        expected: u32,
        /// Computed CRC value over the consumed data.
        computed: u32,
    },

    /// A second entry was opened while one is still being written.
    #[error("Writer is busy: an entry is already open")]
    WriterBusy,

    /// An entry needs CRC/size metadata that is not available.
    #[error("Entry {entry:?}: CRC and sizes must be known before writing")]
    UnresolvedMetadata {
        /// Name of the entry.
        entry: String,
    },

    /// A value overflows its 32-bit/16-bit field and ZIP64 was not enabled.
    #[error("Entry {entry:?}: value exceeds 32-bit limits, ZIP64 required")]
    Zip64Required {
        /// Name of the entry.
        entry: String,
    },

    /// No crypto-parameter provider matched, or a provider declined.
    #[error("Crypto parameters unavailable: {message}")]
    CryptoParameters {
        /// Description of the failure.
        message: String,
    },

    /// Password verification value did not match the derived key material.
    #[error("Entry {entry:?}: password verification failed")]
    BadPassword {
        /// Name of the entry.
        entry: String,
    },

    /// Authentication code over the ciphertext did not verify.
    #[error("Entry {entry:?}: authentication code mismatch, data is tampered or corrupt")]
    AuthenticationFailed {
        /// Name of the entry.
        entry: String,
    },

    /// Entry not found in the archive directory.
    #[error("Entry not found: {name}")]
    EntryNotFound {
        /// Name of the missing entry.
        name: String,
    },
}

/// Result type alias for zipforge operations.
pub type Result<T> = std::result::Result<T, ZipError>;

impl ZipError {
    /// Create an invalid signature error.
    pub fn invalid_magic(expected: u32, found: u32) -> Self {
        Self::InvalidMagic { expected, found }
    }

    /// Create an invalid header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Create an unsupported method error.
    pub fn unsupported_method(method: u16) -> Self {
        Self::UnsupportedMethod { method }
    }

    /// Create a CRC mismatch error.
    pub fn crc_mismatch(entry: impl Into<String>, expected: u32, computed: u32) -> Self {
        Self::CrcMismatch {
            entry: entry.into(),
            expected,
            computed,
        }
    }

    /// Create a crypto parameters error.
    pub fn crypto_parameters(message: impl Into<String>) -> Self {
        Self::CryptoParameters {
            message: message.into(),
        }
    }

    /// Create an entry not found error.
    pub fn entry_not_found(name: impl Into<String>) -> Self {
        Self::EntryNotFound { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ZipError::invalid_magic(0x04034B50, 0x1F8B0808);
        assert!(err.to_string().contains("Invalid signature"));

        let err = ZipError::crc_mismatch("a.txt", 0x12345678, 0xDEADBEEF);
        assert!(err.to_string().contains("CRC mismatch"));
        assert!(err.to_string().contains("a.txt"));

        let err = ZipError::unsupported_method(97);
        assert!(err.to_string().contains("97"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ZipError = io_err.into();
        assert!(matches!(err, ZipError::Io(_)));
    }
}
