//! The per-entry transform pipeline.
//!
//! Entry payload bytes flow through up to three stages before reaching
//! the archive stream: a compressor ([`flate2`] or [`bzip2`]), an
//! optional AES-CTR cipher stage that also accumulates the HMAC, and a
//! byte counter over the underlying writer. The pipeline owns the
//! underlying writer for its whole life and moves between states with
//! [`std::mem::replace`]; the `Poisoned` state is only observable if a
//! state transition returned an error.

use std::io::{self, Write};
use std::mem;

use bzip2::write::BzEncoder;
use flate2::write::DeflateEncoder;

use crate::crypto::EntryEncryptor;
use crate::entry::Method;
use crate::error::{Result, ZipError};

/// A writer wrapper that counts every byte passing through it.
///
/// The count doubles as the absolute archive offset, so appending to an
/// existing archive seeds it with a nonzero start.
pub(crate) struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self::with_offset(inner, 0)
    }

    pub(crate) fn with_offset(inner: W, offset: u64) -> Self {
        Self {
            inner,
            count: offset,
        }
    }

    /// Absolute offset in the archive stream.
    pub(crate) fn position(&self) -> u64 {
        self.count
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The cipher stage: encrypts compressed bytes in flight and folds the
/// ciphertext into the entry MAC. Without an encryptor it is a plain
/// passthrough.
pub(crate) struct CipherSink<W: Write> {
    inner: CountingWriter<W>,
    encryptor: Option<EntryEncryptor>,
    scratch: Vec<u8>,
}

impl<W: Write> CipherSink<W> {
    pub(crate) fn new(inner: CountingWriter<W>, encryptor: Option<EntryEncryptor>) -> Self {
        Self {
            inner,
            encryptor,
            scratch: Vec::new(),
        }
    }

    /// Finalize the stage: emit the authentication code if encrypting,
    /// and hand the counting writer back.
    pub(crate) fn finish(mut self) -> Result<CountingWriter<W>> {
        if let Some(encryptor) = self.encryptor.take() {
            let code = encryptor.finish();
            self.inner.write_all(&code)?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for CipherSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.encryptor {
            Some(encryptor) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(buf);
                encryptor.encrypt(&mut self.scratch);
                self.inner.write_all(&self.scratch)?;
                Ok(buf.len())
            }
            None => self.inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// State machine over the underlying writer: idle between entries, or
/// feeding one of the compressor stages while an entry is open.
pub(crate) enum Pipeline<W: Write> {
    Idle(CountingWriter<W>),
    Stored(CipherSink<W>),
    Deflated(DeflateEncoder<CipherSink<W>>),
    Bzip2(BzEncoder<CipherSink<W>>),
    Poisoned,
}

impl<W: Write> Pipeline<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self::Idle(CountingWriter::new(inner))
    }

    pub(crate) fn with_offset(inner: W, offset: u64) -> Self {
        Self::Idle(CountingWriter::with_offset(inner, offset))
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Self::Idle(_))
    }

    /// Direct access to the counting writer between entries, for header
    /// and trailer framing.
    pub(crate) fn sink_mut(&mut self) -> Result<&mut CountingWriter<W>> {
        match self {
            Self::Idle(w) => Ok(w),
            _ => Err(ZipError::WriterBusy),
        }
    }

    /// Current absolute offset. Between entries this is exact; while a
    /// compressor holds buffered bytes it lags the logical position, so
    /// offsets are only sampled in the idle state.
    pub(crate) fn position(&self) -> u64 {
        match self {
            Self::Idle(w) => w.position(),
            Self::Stored(s) => s.inner.position(),
            Self::Deflated(e) => e.get_ref().inner.position(),
            Self::Bzip2(e) => e.get_ref().inner.position(),
            Self::Poisoned => 0,
        }
    }

    /// Open the transform chain for one entry. `method` is the inner
    /// compression method, after any encryption wrapping is peeled off.
    pub(crate) fn open(
        &mut self,
        method: Method,
        encryptor: Option<EntryEncryptor>,
        level: u32,
    ) -> Result<()> {
        let writer = match mem::replace(self, Self::Poisoned) {
            Self::Idle(w) => w,
            other => {
                *self = other;
                return Err(ZipError::WriterBusy);
            }
        };
        let sink = CipherSink::new(writer, encryptor);
        *self = match method {
            Method::Stored => Self::Stored(sink),
            Method::Deflated => Self::Deflated(DeflateEncoder::new(
                sink,
                flate2::Compression::new(level.min(9)),
            )),
            Method::Bzip2 => Self::Bzip2(BzEncoder::new(
                sink,
                bzip2::Compression::new(level.clamp(1, 9)),
            )),
            other => {
                // Put the writer back before reporting; the pipeline
                // stays usable.
                *self = Self::Idle(sink.finish()?);
                return Err(ZipError::unsupported_method(other.id()));
            }
        };
        Ok(())
    }

    /// Feed payload bytes to the open transform chain.
    pub(crate) fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Self::Stored(s) => s.write_all(buf)?,
            Self::Deflated(e) => e.write_all(buf)?,
            Self::Bzip2(e) => e.write_all(buf)?,
            _ => return Err(ZipError::WriterBusy),
        }
        Ok(())
    }

    /// Drain the transform chain, emit the trailer bytes of the cipher
    /// stage, and return to idle. Returns the offset after the payload.
    pub(crate) fn close(&mut self) -> Result<u64> {
        let sink = match mem::replace(self, Self::Poisoned) {
            Self::Stored(s) => s,
            Self::Deflated(e) => e.finish()?,
            Self::Bzip2(e) => e.finish()?,
            Self::Idle(w) => {
                let position = w.position();
                *self = Self::Idle(w);
                return Ok(position);
            }
            Self::Poisoned => return Err(ZipError::WriterBusy),
        };
        let writer = sink.finish()?;
        let position = writer.position();
        *self = Self::Idle(writer);
        Ok(position)
    }

    /// Unwrap the underlying writer. Only valid between entries.
    pub(crate) fn into_inner(self) -> Result<W> {
        match self {
            Self::Idle(w) => Ok(w.into_inner()),
            _ => Err(ZipError::WriterBusy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_counting_writer_tracks_offset() {
        let mut w = CountingWriter::with_offset(Vec::new(), 100);
        w.write_all(b"hello").unwrap();
        assert_eq!(w.position(), 105);
        assert_eq!(w.into_inner(), b"hello");
    }

    #[test]
    fn test_stored_passthrough() {
        let mut p = Pipeline::new(Vec::new());
        p.open(Method::Stored, None, 6).unwrap();
        p.write_data(b"abc").unwrap();
        p.write_data(b"def").unwrap();
        assert_eq!(p.close().unwrap(), 6);
        assert_eq!(p.into_inner().unwrap(), b"abcdef");
    }

    #[test]
    fn test_deflate_roundtrip() {
        let payload = b"the quick brown fox jumps over the lazy dog ".repeat(50);
        let mut p = Pipeline::new(Vec::new());
        p.open(Method::Deflated, None, 6).unwrap();
        p.write_data(&payload).unwrap();
        let end = p.close().unwrap();
        let bytes = p.into_inner().unwrap();
        assert_eq!(bytes.len() as u64, end);
        assert!(bytes.len() < payload.len());

        let mut inflated = Vec::new();
        flate2::read::DeflateDecoder::new(&bytes[..])
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, payload);
    }

    #[test]
    fn test_bzip2_roundtrip() {
        let payload = b"bzip2 block sorting compression ".repeat(80);
        let mut p = Pipeline::new(Vec::new());
        p.open(Method::Bzip2, None, 9).unwrap();
        p.write_data(&payload).unwrap();
        p.close().unwrap();
        let bytes = p.into_inner().unwrap();

        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(&bytes[..])
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_open_twice_is_busy() {
        let mut p = Pipeline::new(Vec::new());
        p.open(Method::Stored, None, 6).unwrap();
        let err = p.open(Method::Stored, None, 6).unwrap_err();
        assert!(matches!(err, ZipError::WriterBusy));
        // The original entry is still writable.
        p.write_data(b"x").unwrap();
        p.close().unwrap();
    }

    #[test]
    fn test_unsupported_method_keeps_pipeline_usable() {
        let mut p = Pipeline::new(Vec::new());
        let err = p.open(Method::Unknown(97), None, 6).unwrap_err();
        assert!(matches!(err, ZipError::UnsupportedMethod { method: 97 }));
        assert!(p.is_idle());
    }

    #[test]
    fn test_cipher_stage_appends_auth_code() {
        use crate::crypto::{AesStrength, EntryEncryptor};

        let salt = [7u8; 16];
        let (enc, _) = EntryEncryptor::new(b"pw", &salt, AesStrength::Aes256).unwrap();
        let mut p = Pipeline::new(Vec::new());
        p.open(Method::Stored, Some(enc), 6).unwrap();
        p.write_data(b"secret").unwrap();
        let end = p.close().unwrap();
        // 6 ciphertext bytes plus the 10-byte authentication code.
        assert_eq!(end, 16);
        let bytes = p.into_inner().unwrap();
        assert_ne!(&bytes[..6], b"secret");
    }
}
