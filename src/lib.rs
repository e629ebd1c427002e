//! # zipforge
//!
//! A ZIP-compatible archive library with pluggable per-entry
//! compression, WinZip-AES authenticated encryption, and transparent
//! ZIP64 promotion.
//!
//! The crate is organized around the write pipeline:
//!
//! - [`entry`]: per-entry metadata records and DOS date-time encoding
//! - [`extra`]: extra-field handling (ZIP64, WinZip-AES)
//! - [`crypto`]: WinZip-AES key derivation, ciphering, authentication
//! - [`writer`]: the single-entry archive writer state machine
//! - [`spool`]: entry multiplexing via temp-file spooling
//! - [`reader`]: directory-driven reading and integrity checking
//! - [`error`]: error types
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ MultiplexedWriter                                    │
//! │     out-of-order entry submission, spool + replay    │
//! ├──────────────────────────────────────────────────────┤
//! │ ArchiveWriter / ZipReader                            │
//! │     entry lifecycle, central directory, trailers     │
//! ├──────────────────────────────────────────────────────┤
//! │ Pipeline                                             │
//! │     compress (deflate/bzip2) → encrypt → count       │
//! ├──────────────────────────────────────────────────────┤
//! │ Framing                                              │
//! │     headers, descriptors, EOCD, ZIP64 records        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::io::Cursor;
//! use zipforge::{ArchiveWriter, EntryRecord, Method, ZipReader};
//!
//! let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()));
//! writer
//!     .add_entry_bytes(
//!         EntryRecord::new("hello.txt").with_method(Method::Deflated),
//!         b"Hello, World!",
//!     )
//!     .unwrap();
//! writer.finish().unwrap();
//!
//! let mut reader = ZipReader::new(writer.into_inner().unwrap()).unwrap();
//! assert_eq!(reader.extract("hello.txt").unwrap(), b"Hello, World!");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod entry;
pub mod error;
pub mod extra;
pub mod reader;
pub mod spool;
pub mod writer;

mod framing;
mod pipeline;

// Re-exports for convenience
pub use crypto::{AesStrength, CryptoParams, CryptoProvider, PasswordProvider};
pub use entry::{EntryRecord, Method, TimePolicy};
pub use error::{Result, ZipError};
pub use extra::{AesExtraField, AesVendor, ExtraFields};
pub use reader::{EntryStream, ZipReader};
pub use spool::{EntryHandle, MultiplexedWriter, SpoolPool, TempFilePool};
pub use writer::ArchiveWriter;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::crypto::{AesStrength, CryptoProvider, PasswordProvider};
    pub use crate::entry::{EntryRecord, Method, TimePolicy};
    pub use crate::error::{Result, ZipError};
    pub use crate::reader::ZipReader;
    pub use crate::spool::{EntryHandle, MultiplexedWriter};
    pub use crate::writer::ArchiveWriter;
}
