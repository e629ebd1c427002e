//! Archive writing.
//!
//! [`ArchiveWriter`] drives the per-entry transform pipeline over any
//! `Write` sink and accumulates the central directory in memory. Exactly
//! one entry may be open at a time; opening a second returns
//! [`ZipError::WriterBusy`] without disturbing the open entry (the
//! multiplexer in [`crate::spool`] builds concurrent submission on top
//! of this single-writer discipline).
//!
//! Entries are either *processed* (payload is compressed, optionally
//! encrypted, and CRC-checksummed on the way through) or *raw* (bytes
//! are copied verbatim for an already-encoded payload whose CRC and
//! sizes are declared up front).

use std::io::{Read, Seek, SeekFrom, Write};

use indexmap::IndexMap;
use tracing::debug;

use crate::crypto::{CryptoProvider, EntryEncryptor};
use crate::entry::{dos_datetime, EntryRecord, Method, TimePolicy};
use crate::error::{Result, ZipError};
use crate::extra::{zip64_local_payload, AesExtraField, AesVendor, WINZIP_AES_ID, ZIP64_EXTRA_ID};
use crate::framing::{
    version_needed, write_central_header, write_data_descriptor, write_eocd, write_local_header,
    write_zip64_eocd, ZIP64_MARKER_16, ZIP64_MARKER_32,
};
use crate::pipeline::Pipeline;
use crate::reader::read_directory;

/// AE-1 retains the real CRC-32; payloads shorter than this leak too
/// much of themselves through it, so they get AE-2 instead.
const AE1_MIN_SIZE: u64 = 20;

struct OpenEntry {
    record: EntryRecord,
    hasher: Option<crc32fast::Hasher>,
    uncompressed: u64,
    data_start: u64,
    zip64_local: bool,
    process: bool,
    ae2: bool,
}

/// Streaming archive writer.
pub struct ArchiveWriter<W: Write> {
    pipeline: Pipeline<W>,
    directory: IndexMap<String, EntryRecord>,
    open: Option<OpenEntry>,
    comment: String,
    level: u32,
    force_zip64: bool,
    time_policy: TimePolicy,
    provider: Option<Box<dyn CryptoProvider>>,
    finished: bool,
}

impl<W: Write> ArchiveWriter<W> {
    /// Create a writer over a fresh sink.
    pub fn new(inner: W) -> Self {
        Self::with_pipeline(Pipeline::new(inner))
    }

    fn with_pipeline(pipeline: Pipeline<W>) -> Self {
        Self {
            pipeline,
            directory: IndexMap::new(),
            open: None,
            comment: String::new(),
            level: 6,
            force_zip64: false,
            time_policy: TimePolicy::default(),
            provider: None,
            finished: false,
        }
    }

    /// Set the archive comment written to the end-of-central-directory
    /// record.
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    /// Set the compression level (0-9) for subsequent entries.
    pub fn set_compression_level(&mut self, level: u32) {
        self.level = level;
    }

    /// Set the date-time encoding policy for subsequent entries.
    pub fn set_time_policy(&mut self, policy: TimePolicy) {
        self.time_policy = policy;
    }

    /// Install the crypto-parameters provider consulted for entries that
    /// request encryption.
    pub fn set_crypto_provider(&mut self, provider: Box<dyn CryptoProvider>) {
        self.provider = Some(provider);
    }

    /// Force ZIP64 framing for every entry and for the archive trailer.
    ///
    /// Required when streaming an entry whose sizes are unknown up front
    /// but may exceed 4 GiB, since the local header must commit to its
    /// field widths before the payload is seen.
    pub fn set_force_zip64(&mut self, force: bool) {
        self.force_zip64 = force;
    }

    /// True while an entry is open for writing.
    pub fn is_busy(&self) -> bool {
        self.open.is_some()
    }

    /// Records in the directory so far, including the entry currently
    /// being written (its CRC and sizes resolve when it closes).
    pub fn entries(&self) -> impl Iterator<Item = &EntryRecord> {
        self.directory.values()
    }

    /// Open an entry whose payload will be compressed (and encrypted if
    /// requested) as it is written.
    ///
    /// STORED entries must declare their CRC and uncompressed size up
    /// front; the other methods may stream with unknown metadata, which
    /// is then carried by a trailing data descriptor.
    pub fn begin_entry(&mut self, record: EntryRecord) -> Result<()> {
        self.begin(record, true)
    }

    /// Open an entry whose payload bytes are copied verbatim, for
    /// transplanting an already-encoded entry from another archive.
    /// CRC and both sizes must be declared; the payload is never
    /// re-compressed or re-encrypted.
    pub fn begin_raw_entry(&mut self, record: EntryRecord) -> Result<()> {
        if !record.is_resolved() {
            return Err(ZipError::UnresolvedMetadata { entry: record.name });
        }
        self.begin(record, false)
    }

    fn begin(&mut self, mut rec: EntryRecord, process: bool) -> Result<()> {
        if self.finished {
            return Err(ZipError::invalid_header("archive is already finalized"));
        }
        if self.open.is_some() {
            return Err(ZipError::WriterBusy);
        }

        let encrypt = process && !rec.is_dir() && (rec.encrypt || rec.method == Method::AesWrapped);
        let inner_method = if rec.is_dir() {
            Method::Stored
        } else if rec.method == Method::AesWrapped {
            Method::Deflated
        } else {
            rec.method
        };
        if process && matches!(inner_method, Method::Unknown(_)) {
            return Err(ZipError::unsupported_method(inner_method.id()));
        }
        if process
            && inner_method == Method::Stored
            && (rec.crc.is_none() || rec.uncompressed_size.is_none())
        {
            return Err(ZipError::UnresolvedMetadata { entry: rec.name });
        }

        // Resolve crypto parameters and the AE vendor version before any
        // bytes are framed.
        let mut encryptor = None;
        let mut salt_and_verifier = Vec::new();
        let mut ae2 = false;
        let mut overhead = 0u64;
        if encrypt {
            let provider = self.provider.as_ref().ok_or_else(|| {
                ZipError::crypto_parameters(format!(
                    "entry {:?} requests encryption but no provider is installed",
                    rec.name
                ))
            })?;
            let params = provider.parameters(&rec.name)?;
            let vendor = match rec.uncompressed_size {
                Some(size) if size >= AE1_MIN_SIZE && inner_method != Method::Bzip2 => {
                    AesVendor::Ae1
                }
                _ => AesVendor::Ae2,
            };
            ae2 = vendor == AesVendor::Ae2;
            overhead = params.strength.overhead();

            let salt = crate::crypto::random_salt(params.strength.salt_len());
            let (enc, verifier) =
                EntryEncryptor::new(&params.password, &salt, params.strength)?;
            encryptor = Some(enc);
            salt_and_verifier.extend_from_slice(&salt);
            salt_and_verifier.extend_from_slice(&verifier);

            let aes_field = AesExtraField {
                vendor,
                strength: params.strength as u8,
                inner_method: inner_method.id(),
            };
            rec.extra.set(WINZIP_AES_ID, aes_field.to_payload());
            rec.method = Method::AesWrapped;
        } else if process {
            rec.method = inner_method;
            rec.extra.remove(WINZIP_AES_ID);
        }
        rec.encrypted = encrypt || (!process && rec.method == Method::AesWrapped);

        // What the local header can commit to. The compressed size is
        // predictable only for STORED payloads.
        let header_crc = if ae2 { Some(0) } else { rec.crc };
        let predicted_compressed = if process {
            match inner_method {
                Method::Stored => rec.uncompressed_size.map(|u| u + overhead),
                _ => None,
            }
        } else {
            rec.compressed_size
        };
        rec.descriptor = process
            && (header_crc.is_none()
                || predicted_compressed.is_none()
                || rec.uncompressed_size.is_none());

        let size_hint = rec
            .uncompressed_size
            .unwrap_or(0)
            .max(predicted_compressed.unwrap_or(0));
        let zip64_local = self.force_zip64 || size_hint >= ZIP64_MARKER_32 as u64;

        // Local extra block: the ZIP64 field first, then the rest
        // (including the AES field installed above).
        let mut local_extra = Vec::new();
        if zip64_local {
            let payload = zip64_local_payload(
                rec.uncompressed_size.unwrap_or(0),
                predicted_compressed.unwrap_or(0),
            );
            local_extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
            local_extra.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            local_extra.extend_from_slice(&payload);
        }
        local_extra.extend_from_slice(&rec.extra.to_bytes());

        let (header_csize, header_usize) = if zip64_local {
            (ZIP64_MARKER_32, ZIP64_MARKER_32)
        } else if rec.descriptor {
            (0, 0)
        } else {
            (
                predicted_compressed.unwrap_or(0) as u32,
                rec.uncompressed_size.unwrap_or(0) as u32,
            )
        };

        rec.header_offset = self.pipeline.position();
        let version = version_needed(rec.method, rec.encrypted, zip64_local);
        let dos = dos_datetime(self.time_policy, rec.modified);
        let flags = rec.general_flags();
        let sink = self.pipeline.sink_mut()?;
        write_local_header(
            sink,
            rec.name.as_bytes(),
            &local_extra,
            version,
            flags,
            rec.method.id(),
            dos,
            if rec.descriptor {
                0
            } else {
                header_crc.unwrap_or(0)
            },
            header_csize,
            header_usize,
        )?;

        let data_start = self.pipeline.position();
        if !salt_and_verifier.is_empty() {
            // Salt and verifier precede the ciphertext, unencrypted and
            // outside the MAC, but inside the compressed size.
            self.pipeline.sink_mut()?.write_all(&salt_and_verifier)?;
        }
        if process {
            // Bzip2 block size: the smallest 100 kB multiple covering a
            // declared size, falling back to the configured level.
            let level = match (inner_method, rec.uncompressed_size) {
                (Method::Bzip2, Some(size)) => (size.div_ceil(100_000).max(1) as u32).min(9),
                _ => self.level,
            };
            self.pipeline.open(inner_method, encryptor, level)?;
        } else {
            self.pipeline.open(Method::Stored, None, self.level)?;
        }

        debug!(
            entry = %rec.name,
            method = %rec.method,
            encrypted = rec.encrypted,
            raw = !process,
            offset = rec.header_offset,
            "entry opened"
        );
        // The record is visible in the directory from the moment writing
        // begins; resolved values replace it at end_entry.
        self.directory.insert(rec.name.clone(), rec.clone());

        // Raw STORED copies carry the payload in the clear, so the
        // declared CRC is verifiable on the way through.
        let hash = process || rec.method == Method::Stored;
        self.open = Some(OpenEntry {
            record: rec,
            hasher: hash.then(crc32fast::Hasher::new),
            uncompressed: 0,
            data_start,
            zip64_local,
            process,
            ae2,
        });
        Ok(())
    }

    /// Write payload bytes to the open entry.
    pub fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        let open = self.open.as_mut().ok_or(ZipError::WriterBusy)?;
        if let Some(hasher) = &mut open.hasher {
            hasher.update(buf);
        }
        open.uncompressed += buf.len() as u64;
        self.pipeline.write_data(buf)
    }

    /// Close the open entry, settling its metadata and committing it to
    /// the in-memory central directory. A no-op when no entry is open.
    pub fn end_entry(&mut self) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        let end = self.pipeline.close()?;
        let compressed = end - open.data_start;
        let rec = &mut open.record;

        if open.process {
            let computed = open.hasher.take().map_or(0, |h| h.finalize());
            if let Some(declared) = rec.uncompressed_size {
                if declared != open.uncompressed {
                    return Err(ZipError::SizeMismatch {
                        entry: rec.name.clone(),
                        declared,
                        actual: open.uncompressed,
                    });
                }
            }
            if let Some(declared) = rec.crc {
                if declared != computed {
                    return Err(ZipError::crc_mismatch(&rec.name, declared, computed));
                }
            }
            rec.uncompressed_size = Some(open.uncompressed);
            rec.compressed_size = Some(compressed);
            rec.crc = Some(if open.ae2 { 0 } else { computed });
        } else {
            let declared = rec.compressed_size.unwrap_or(0);
            if declared != compressed {
                return Err(ZipError::SizeMismatch {
                    entry: rec.name.clone(),
                    declared,
                    actual: compressed,
                });
            }
            if let (Some(hasher), Some(declared)) = (open.hasher.take(), rec.crc) {
                let computed = hasher.finalize();
                if declared != computed {
                    return Err(ZipError::crc_mismatch(&rec.name, declared, computed));
                }
            }
        }

        let uncompressed = rec.uncompressed_size.unwrap_or(0);
        if !open.zip64_local
            && (compressed >= ZIP64_MARKER_32 as u64 || uncompressed >= ZIP64_MARKER_32 as u64)
        {
            // The local header already committed to 32-bit fields.
            return Err(ZipError::Zip64Required {
                entry: rec.name.clone(),
            });
        }

        if rec.descriptor {
            let crc = rec.crc.unwrap_or(0);
            let sink = self.pipeline.sink_mut()?;
            write_data_descriptor(sink, crc, compressed, uncompressed, open.zip64_local)?;
        }

        debug!(
            entry = %rec.name,
            compressed,
            uncompressed,
            "entry closed"
        );
        self.directory.insert(rec.name.clone(), open.record);
        Ok(())
    }

    /// Convenience: add a whole entry from a byte slice.
    pub fn add_entry_bytes(&mut self, record: EntryRecord, data: &[u8]) -> Result<()> {
        self.begin_entry(record)?;
        self.write_data(data)?;
        self.end_entry()
    }

    /// Convenience: add a directory entry.
    pub fn add_directory(&mut self, name: impl Into<String>) -> Result<()> {
        self.begin_entry(EntryRecord::directory(name))?;
        self.end_entry()
    }

    /// Write the central directory and trailer records, closing any
    /// still-open entry first. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.end_entry()?;

        // A record still missing CRC or sizes is untrackable: its bytes
        // stay in the file but the directory never points at them.
        self.directory.retain(|_, rec| rec.is_resolved());

        let cd_offset = self.pipeline.position();
        let policy = self.time_policy;
        {
            let sink = self.pipeline.sink_mut()?;
            for rec in self.directory.values() {
                write_central_header(sink, rec, policy)?;
            }
        }
        let cd_end = self.pipeline.position();
        let cd_size = cd_end - cd_offset;
        let entries = self.directory.len() as u64;

        let zip64 = self.force_zip64
            || entries >= ZIP64_MARKER_16 as u64
            || cd_size >= ZIP64_MARKER_32 as u64
            || cd_offset >= ZIP64_MARKER_32 as u64;
        let sink = self.pipeline.sink_mut()?;
        if zip64 {
            write_zip64_eocd(sink, entries, cd_size, cd_offset, cd_end)?;
        }
        write_eocd(sink, entries, cd_size, cd_offset, self.comment.as_bytes())?;
        sink.flush()?;

        debug!(entries, cd_size, zip64, "archive finalized");
        self.finished = true;
        Ok(())
    }

    /// Unwrap the underlying writer. Fails if an entry is still open.
    pub fn into_inner(self) -> Result<W> {
        if self.open.is_some() {
            return Err(ZipError::WriterBusy);
        }
        self.pipeline.into_inner()
    }
}

impl<W: Read + Write + Seek> ArchiveWriter<W> {
    /// Open an existing archive for appending.
    ///
    /// The existing central directory is loaded and will be rewritten
    /// after the new entries; existing payloads are left in place.
    pub fn append(mut inner: W) -> Result<Self> {
        let (directory, cd_offset, comment) = read_directory(&mut inner)?;
        inner.seek(SeekFrom::Start(cd_offset))?;
        let mut writer = Self::with_pipeline(Pipeline::with_offset(inner, cd_offset));
        writer.directory = directory;
        writer.comment = comment;
        Ok(writer)
    }
}
