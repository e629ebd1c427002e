//! Archive reading and integrity checking.
//!
//! The reader is directory-driven: it locates the end-of-central-directory
//! record by scanning backward from the end of the stream, follows the
//! ZIP64 locator when present, and materializes every central header into
//! an [`EntryRecord`]. Local headers are only consulted to find payload
//! bytes; the central directory is authoritative for metadata.
//!
//! CRC verification is deferred to [`EntryStream::close`]: partial reads
//! succeed, and the mismatch surfaces when the consumer declares it has
//! read everything it wants.

use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use indexmap::IndexMap;
use tracing::debug;

use crate::crypto::{AesStrength, CryptoProvider, EntryDecryptor, AUTH_CODE_LEN, VERIFIER_LEN};
use crate::entry::{systemtime_from_dos, EntryRecord, Method};
use crate::error::{Result, ZipError};
use crate::extra::{zip64_overrides, AesExtraField, AesVendor, ExtraFields, ZIP64_EXTRA_ID};
use crate::framing::{
    CENTRAL_DIR_HEADER_SIG, END_OF_CENTRAL_DIR_SIG, FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED,
    LOCAL_FILE_HEADER_SIG, ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG, ZIP64_END_OF_CENTRAL_DIR_SIG,
    ZIP64_MARKER_16, ZIP64_MARKER_32,
};

const EOCD_MIN_LEN: u64 = 22;
const EOCD_MAX_LEN: u64 = EOCD_MIN_LEN + u16::MAX as u64;
const ZIP64_LOCATOR_LEN: u64 = 20;
const ZIP64_EOCD_LEN: usize = 56;
const CENTRAL_HEADER_LEN: usize = 46;
const LOCAL_HEADER_LEN: usize = 30;

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap_or([0; 4]))
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap_or([0; 8]))
}

/// Parse the central directory of an existing archive.
///
/// Returns the entry records in directory order, the offset where the
/// central directory begins, and the archive comment.
pub(crate) fn read_directory<R: Read + Seek>(
    r: &mut R,
) -> Result<(IndexMap<String, EntryRecord>, u64, String)> {
    let stream_len = r.seek(SeekFrom::End(0))?;
    if stream_len < EOCD_MIN_LEN {
        return Err(ZipError::invalid_header(
            "stream is too short to hold an end-of-central-directory record",
        ));
    }

    // Backward scan for the EOCD signature; the record may be followed
    // by a comment of up to 65535 bytes.
    let tail_len = stream_len.min(EOCD_MAX_LEN);
    let tail_start = stream_len - tail_len;
    r.seek(SeekFrom::Start(tail_start))?;
    let mut tail = vec![0u8; tail_len as usize];
    r.read_exact(&mut tail)?;

    let sig = END_OF_CENTRAL_DIR_SIG.to_le_bytes();
    let eocd_in_tail = (0..=tail.len() - EOCD_MIN_LEN as usize)
        .rev()
        .find(|&i| tail[i..i + 4] == sig)
        .ok_or_else(|| {
            ZipError::invalid_header("end-of-central-directory record not found")
        })?;
    let eocd = &tail[eocd_in_tail..];
    let eocd_offset = tail_start + eocd_in_tail as u64;

    let mut entries = le_u16(eocd, 10) as u64;
    let mut cd_size = le_u32(eocd, 12) as u64;
    let mut cd_offset = le_u32(eocd, 16) as u64;
    let comment_len = le_u16(eocd, 20) as usize;
    let comment = eocd
        .get(EOCD_MIN_LEN as usize..EOCD_MIN_LEN as usize + comment_len)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();

    // Follow the ZIP64 locator when the record leaves room for one or
    // any field holds a sentinel.
    let sentinel = entries == ZIP64_MARKER_16 as u64
        || cd_size == ZIP64_MARKER_32 as u64
        || cd_offset == ZIP64_MARKER_32 as u64;
    if eocd_offset >= ZIP64_LOCATOR_LEN {
        r.seek(SeekFrom::Start(eocd_offset - ZIP64_LOCATOR_LEN))?;
        let mut locator = [0u8; ZIP64_LOCATOR_LEN as usize];
        r.read_exact(&mut locator)?;
        if le_u32(&locator, 0) == ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIG {
            let zip64_eocd_offset = le_u64(&locator, 8);
            r.seek(SeekFrom::Start(zip64_eocd_offset))?;
            let mut record = [0u8; ZIP64_EOCD_LEN];
            r.read_exact(&mut record)?;
            let found = le_u32(&record, 0);
            if found != ZIP64_END_OF_CENTRAL_DIR_SIG {
                return Err(ZipError::invalid_magic(ZIP64_END_OF_CENTRAL_DIR_SIG, found));
            }
            entries = le_u64(&record, 32);
            cd_size = le_u64(&record, 40);
            cd_offset = le_u64(&record, 48);
        } else if sentinel {
            return Err(ZipError::invalid_header(
                "end-of-central-directory holds ZIP64 sentinels but no locator was found",
            ));
        }
    } else if sentinel {
        return Err(ZipError::invalid_header(
            "end-of-central-directory holds ZIP64 sentinels but no locator was found",
        ));
    }

    // Header-declared sizes are untrusted; bound them by what the
    // stream can actually hold before allocating.
    if cd_size > stream_len.saturating_sub(cd_offset) {
        return Err(ZipError::invalid_header(
            "central directory extends past the end of the stream",
        ));
    }
    r.seek(SeekFrom::Start(cd_offset))?;
    let mut cd = vec![0u8; cd_size as usize];
    r.read_exact(&mut cd)?;

    let mut directory = IndexMap::new();
    let mut pos = 0usize;
    for _ in 0..entries {
        if pos + CENTRAL_HEADER_LEN > cd.len() {
            return Err(ZipError::invalid_header("central directory truncated"));
        }
        let header = &cd[pos..];
        let found = le_u32(header, 0);
        if found != CENTRAL_DIR_HEADER_SIG {
            return Err(ZipError::invalid_magic(CENTRAL_DIR_HEADER_SIG, found));
        }
        let flags = le_u16(header, 8);
        let method = Method::from_id(le_u16(header, 10));
        let mtime = le_u16(header, 12);
        let mdate = le_u16(header, 14);
        let crc = le_u32(header, 16);
        let mut compressed = le_u32(header, 20) as u64;
        let mut uncompressed = le_u32(header, 24) as u64;
        let name_len = le_u16(header, 28) as usize;
        let extra_len = le_u16(header, 30) as usize;
        let comment_len = le_u16(header, 32) as usize;
        let external = le_u32(header, 38);
        let mut header_offset = le_u32(header, 42) as u64;

        let var_end = CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
        if pos + var_end > cd.len() {
            return Err(ZipError::invalid_header("central directory truncated"));
        }
        let name =
            String::from_utf8_lossy(&header[CENTRAL_HEADER_LEN..CENTRAL_HEADER_LEN + name_len])
                .into_owned();
        let mut extra = ExtraFields::parse(
            &header[CENTRAL_HEADER_LEN + name_len..CENTRAL_HEADER_LEN + name_len + extra_len],
        );
        let entry_comment = &header[CENTRAL_HEADER_LEN + name_len + extra_len..var_end];

        let (u64_override, c64_override, o64_override) = zip64_overrides(
            &extra,
            uncompressed == ZIP64_MARKER_32 as u64,
            compressed == ZIP64_MARKER_32 as u64,
            header_offset == ZIP64_MARKER_32 as u64,
        );
        if let Some(v) = u64_override {
            uncompressed = v;
        }
        if let Some(v) = c64_override {
            compressed = v;
        }
        if let Some(v) = o64_override {
            header_offset = v;
        }
        // The field is regenerated on rewrite; keeping it would duplicate.
        extra.remove(ZIP64_EXTRA_ID);

        let mut rec = EntryRecord::new(name);
        rec.method = method;
        rec.crc = Some(crc);
        rec.compressed_size = Some(compressed);
        rec.uncompressed_size = Some(uncompressed);
        rec.modified = systemtime_from_dos(mtime, mdate);
        rec.unix_mode = match external >> 16 {
            0 => None,
            mode => Some(mode),
        };
        rec.comment = if entry_comment.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(entry_comment).into_owned())
        };
        rec.extra = extra;
        rec.header_offset = header_offset;
        rec.descriptor = flags & FLAG_DATA_DESCRIPTOR != 0;
        rec.encrypted = flags & FLAG_ENCRYPTED != 0;

        pos += var_end;
        directory.insert(rec.name.clone(), rec);
    }

    debug!(entries = directory.len(), cd_offset, "central directory loaded");
    Ok((directory, cd_offset, comment))
}

/// Directory-driven archive reader.
pub struct ZipReader<R: Read + Seek> {
    inner: R,
    directory: IndexMap<String, EntryRecord>,
    comment: String,
    cd_offset: u64,
    stream_len: u64,
    provider: Option<Box<dyn CryptoProvider>>,
}

impl<R: Read + Seek> fmt::Debug for ZipReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipReader")
            .field("directory", &self.directory)
            .field("comment", &self.comment)
            .field("cd_offset", &self.cd_offset)
            .field("stream_len", &self.stream_len)
            .field("provider", &self.provider.as_ref().map(|_| ".."))
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> ZipReader<R> {
    /// Open an archive and load its central directory.
    pub fn new(mut inner: R) -> Result<Self> {
        let (directory, cd_offset, comment) = read_directory(&mut inner)?;
        let stream_len = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            directory,
            comment,
            cd_offset,
            stream_len,
            provider: None,
        })
    }

    /// Install the crypto-parameters provider consulted for encrypted
    /// entries.
    pub fn set_crypto_provider(&mut self, provider: Box<dyn CryptoProvider>) {
        self.provider = Some(provider);
    }

    /// The archive comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Offset where the central directory begins.
    pub fn central_directory_offset(&self) -> u64 {
        self.cd_offset
    }

    /// Entries in central directory order.
    pub fn entries(&self) -> impl Iterator<Item = &EntryRecord> {
        self.directory.values()
    }

    /// Look up one entry's metadata.
    pub fn entry(&self, name: &str) -> Option<&EntryRecord> {
        self.directory.get(name)
    }

    /// Decode one entry's payload, without the CRC check. Returns the
    /// bytes and the CRC the directory expects (`None` for AE-2, which
    /// suppresses it in favor of the authentication code).
    fn read_payload(&mut self, name: &str) -> Result<(Vec<u8>, Option<u32>)> {
        let rec = self
            .directory
            .get(name)
            .ok_or_else(|| ZipError::entry_not_found(name))?
            .clone();

        // The local header only tells us where the payload starts.
        self.inner.seek(SeekFrom::Start(rec.header_offset))?;
        let mut local = [0u8; LOCAL_HEADER_LEN];
        self.inner.read_exact(&mut local)?;
        let found = le_u32(&local, 0);
        if found != LOCAL_FILE_HEADER_SIG {
            return Err(ZipError::invalid_magic(LOCAL_FILE_HEADER_SIG, found));
        }
        let skip = le_u16(&local, 26) as i64 + le_u16(&local, 28) as i64;
        let data_offset = self.inner.seek(SeekFrom::Current(skip))?;

        let compressed_size = rec.compressed_size.unwrap_or(0);
        if compressed_size > self.stream_len.saturating_sub(data_offset) {
            return Err(ZipError::invalid_header(format!(
                "entry {:?} claims more payload bytes than the stream holds",
                rec.name
            )));
        }
        let mut payload = vec![0u8; compressed_size as usize];
        self.inner.read_exact(&mut payload)?;

        let mut inner_method = rec.method;
        let mut expected_crc = Some(rec.crc.unwrap_or(0));
        if rec.method == Method::AesWrapped {
            let aes = AesExtraField::from_extra(&rec.extra).ok_or_else(|| {
                ZipError::invalid_header(format!(
                    "entry {:?} is AES-wrapped but carries no AES extra field",
                    rec.name
                ))
            })?;
            let strength = AesStrength::from_code(aes.strength).ok_or_else(|| {
                ZipError::invalid_header(format!(
                    "entry {:?} declares unknown AES strength {}",
                    rec.name, aes.strength
                ))
            })?;
            inner_method = Method::from_id(aes.inner_method);
            if aes.vendor == AesVendor::Ae2 {
                expected_crc = None;
            }

            let provider = self.provider.as_ref().ok_or_else(|| {
                ZipError::crypto_parameters(format!(
                    "entry {:?} is encrypted but no provider is installed",
                    rec.name
                ))
            })?;
            let params = provider.parameters(&rec.name)?;

            let salt_len = strength.salt_len();
            if payload.len() < salt_len + VERIFIER_LEN + AUTH_CODE_LEN {
                return Err(ZipError::invalid_header(format!(
                    "entry {:?} is shorter than the AES framing",
                    rec.name
                )));
            }
            let (salt, rest) = payload.split_at(salt_len);
            let (verifier, rest) = rest.split_at(VERIFIER_LEN);
            let (ciphertext, auth_code) = rest.split_at(rest.len() - AUTH_CODE_LEN);

            let mut decryptor = EntryDecryptor::new(&params.password, salt, strength)?;
            if !decryptor.verify_password(verifier) {
                return Err(ZipError::BadPassword {
                    entry: rec.name.clone(),
                });
            }
            decryptor.update_mac(ciphertext);
            if !decryptor.verify_auth_code(auth_code) {
                return Err(ZipError::AuthenticationFailed {
                    entry: rec.name.clone(),
                });
            }
            let mut plaintext = ciphertext.to_vec();
            decryptor.decrypt(&mut plaintext);
            payload = plaintext;
        }

        let data = match inner_method {
            Method::Stored => payload,
            Method::Deflated => {
                let mut out = Vec::new();
                flate2::read::DeflateDecoder::new(&payload[..]).read_to_end(&mut out)?;
                out
            }
            Method::Bzip2 => {
                let mut out = Vec::new();
                bzip2::read::BzDecoder::new(&payload[..]).read_to_end(&mut out)?;
                out
            }
            other => return Err(ZipError::unsupported_method(other.id())),
        };

        let declared = rec.uncompressed_size.unwrap_or(0);
        if data.len() as u64 != declared {
            return Err(ZipError::SizeMismatch {
                entry: rec.name.clone(),
                declared,
                actual: data.len() as u64,
            });
        }
        Ok((data, expected_crc))
    }

    /// Extract one entry, fully verified.
    pub fn extract(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.entry_reader(name)?;
        let mut out = Vec::new();
        stream.read_to_end(&mut out)?;
        stream.close()?;
        Ok(out)
    }

    /// Open a checked stream over one entry's decoded payload.
    pub fn entry_reader(&mut self, name: &str) -> Result<EntryStream> {
        let (data, expected) = self.read_payload(name)?;
        Ok(EntryStream {
            cursor: Cursor::new(data),
            hasher: crc32fast::Hasher::new(),
            expected,
            name: name.to_string(),
        })
    }

    /// Decode and verify every entry in the archive.
    ///
    /// Encrypted entries require a provider; any CRC, size, password, or
    /// authentication failure aborts with the entry that caused it.
    pub fn verify(&mut self) -> Result<()> {
        let names: Vec<String> = self.directory.keys().cloned().collect();
        for name in names {
            let mut stream = self.entry_reader(&name)?;
            io::copy(&mut stream, &mut io::sink())?;
            stream.close()?;
        }
        Ok(())
    }

    /// Extract one entry to a writer, fully verified.
    pub fn extract_to<W: Write>(&mut self, name: &str, out: &mut W) -> Result<u64> {
        let mut stream = self.entry_reader(name)?;
        let copied = io::copy(&mut stream, out)?;
        stream.close()?;
        Ok(copied)
    }

    /// Unwrap the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// A readable stream over one entry's decoded payload.
///
/// Reading never fails on corrupt data; the CRC verdict is delivered by
/// [`EntryStream::close`], which consumes any unread remainder first.
pub struct EntryStream {
    cursor: Cursor<Vec<u8>>,
    hasher: crc32fast::Hasher,
    expected: Option<u32>,
    name: String,
}

impl EntryStream {
    /// Bytes remaining in the stream.
    pub fn remaining(&self) -> u64 {
        self.cursor.get_ref().len() as u64 - self.cursor.position()
    }

    /// Finish the stream: consume whatever was not read and check the
    /// CRC over the whole payload.
    pub fn close(mut self) -> Result<()> {
        let pos = self.cursor.position() as usize;
        let rest = &self.cursor.get_ref()[pos..];
        self.hasher.update(rest);
        let computed = self.hasher.finalize();
        match self.expected {
            Some(expected) if expected != computed => {
                Err(ZipError::crc_mismatch(self.name, expected, computed))
            }
            _ => Ok(()),
        }
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.cursor.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
