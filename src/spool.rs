//! Entry multiplexing over the single-writer archive.
//!
//! [`ArchiveWriter`] admits one open entry at a time. The
//! [`MultiplexedWriter`] relaxes that for callers producing entries out
//! of order: when the direct slot is taken, the next entry's payload is
//! spooled to a temporary file and replayed into the archive once the
//! direct slot frees up.
//!
//! Spooling also settles metadata: a STORED entry with unknown CRC and
//! size cannot be framed directly (its local header needs both), so it
//! is always spooled, measured, and replayed with resolved metadata.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::entry::{EntryRecord, Method};
use crate::error::{Result, ZipError};
use crate::writer::ArchiveWriter;

const REPLAY_BUF_SIZE: usize = 64 * 1024;

/// A scratch file handed out by a [`SpoolPool`].
pub struct SpoolFile {
    file: File,
    path: PathBuf,
}

impl Write for SpoolFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Read for SpoolFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Provider of scratch storage for spooled entries.
pub trait SpoolPool {
    /// Hand out a fresh scratch file.
    fn allocate(&mut self) -> Result<SpoolFile>;

    /// Return a scratch file once its contents have been replayed.
    fn release(&mut self, file: SpoolFile);
}

/// The default pool: named temporary files in a configurable directory.
///
/// Files that cannot be deleted on release (the handle may still be
/// mapped on some platforms) are retried when the pool is dropped.
pub struct TempFilePool {
    dir: Option<PathBuf>,
    pending_delete: Vec<PathBuf>,
}

impl TempFilePool {
    /// Pool over the system temporary directory.
    pub fn new() -> Self {
        Self {
            dir: None,
            pending_delete: Vec::new(),
        }
    }

    /// Pool over a specific directory, typically on the same filesystem
    /// as the archive.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            pending_delete: Vec::new(),
        }
    }
}

impl Default for TempFilePool {
    fn default() -> Self {
        Self::new()
    }
}

impl SpoolPool for TempFilePool {
    fn allocate(&mut self) -> Result<SpoolFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("zipforge-spool-");
        let named = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = named.keep().map_err(|e| ZipError::Io(e.error))?;
        debug!(path = %path.display(), "spool file allocated");
        Ok(SpoolFile { file, path })
    }

    fn release(&mut self, file: SpoolFile) {
        let SpoolFile { file, path } = file;
        drop(file);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "spool file deletion deferred");
            self.pending_delete.push(path);
        }
    }
}

impl Drop for TempFilePool {
    fn drop(&mut self) {
        for path in self.pending_delete.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "spool file left behind");
            }
        }
    }
}

/// Token identifying which slot an opened entry landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryHandle {
    /// The entry streams straight through the archive writer.
    Direct,
    /// The entry's payload is buffered in scratch storage.
    Spooled,
}

struct SpooledEntry {
    record: EntryRecord,
    file: SpoolFile,
    hasher: crc32fast::Hasher,
    size: u64,
    complete: bool,
}

/// Archive writer accepting a second in-flight entry via spooling.
pub struct MultiplexedWriter<W: Write> {
    inner: ArchiveWriter<W>,
    pool: Box<dyn SpoolPool>,
    spooled: Option<SpooledEntry>,
}

impl<W: Write> MultiplexedWriter<W> {
    /// Wrap an archive writer, spooling through [`TempFilePool`].
    pub fn new(inner: ArchiveWriter<W>) -> Self {
        Self::with_pool(inner, Box::new(TempFilePool::new()))
    }

    /// Wrap an archive writer with a custom scratch-storage pool.
    pub fn with_pool(inner: ArchiveWriter<W>, pool: Box<dyn SpoolPool>) -> Self {
        Self {
            inner,
            pool,
            spooled: None,
        }
    }

    /// Access the wrapped writer for configuration.
    pub fn writer_mut(&mut self) -> &mut ArchiveWriter<W> {
        &mut self.inner
    }

    fn needs_spool(&self, record: &EntryRecord) -> bool {
        if self.inner.is_busy() {
            return true;
        }
        // STORED local headers need CRC and size before the payload.
        record.method == Method::Stored
            && !record.is_dir()
            && (record.crc.is_none() || record.uncompressed_size.is_none())
    }

    /// Open an entry, routing it to the direct slot when available and
    /// to scratch storage otherwise. At most one spooled entry may be
    /// in flight.
    pub fn begin_entry(&mut self, record: EntryRecord) -> Result<EntryHandle> {
        if !self.needs_spool(&record) {
            self.inner.begin_entry(record)?;
            return Ok(EntryHandle::Direct);
        }
        if self.spooled.is_some() {
            return Err(ZipError::WriterBusy);
        }
        let file = self.pool.allocate()?;
        debug!(entry = %record.name, "entry spooled");
        self.spooled = Some(SpooledEntry {
            record,
            file,
            hasher: crc32fast::Hasher::new(),
            size: 0,
            complete: false,
        });
        Ok(EntryHandle::Spooled)
    }

    /// Write payload bytes to the slot named by the handle.
    pub fn write_data(&mut self, handle: EntryHandle, buf: &[u8]) -> Result<()> {
        match handle {
            EntryHandle::Direct => self.inner.write_data(buf),
            EntryHandle::Spooled => {
                let spooled = self
                    .spooled
                    .as_mut()
                    .filter(|s| !s.complete)
                    .ok_or(ZipError::WriterBusy)?;
                spooled.file.write_all(buf)?;
                spooled.hasher.update(buf);
                spooled.size += buf.len() as u64;
                Ok(())
            }
        }
    }

    /// Close the slot named by the handle. A completed spooled entry is
    /// replayed into the archive as soon as the direct slot is free.
    pub fn end_entry(&mut self, handle: EntryHandle) -> Result<()> {
        match handle {
            EntryHandle::Direct => self.inner.end_entry()?,
            EntryHandle::Spooled => {
                if let Some(spooled) = self.spooled.as_mut() {
                    spooled.complete = true;
                }
            }
        }
        self.drain()
    }

    /// Replay the pending spooled entry if the direct slot is free.
    fn drain(&mut self) -> Result<()> {
        if self.inner.is_busy() || !self.spooled.as_ref().is_some_and(|s| s.complete) {
            return Ok(());
        }
        let mut spooled = self.spooled.take().unwrap();
        let mut rec = spooled.record;
        let computed = spooled.hasher.finalize();
        if rec.crc.is_none() {
            rec.crc = Some(computed);
        }
        if rec.uncompressed_size.is_none() {
            rec.uncompressed_size = Some(spooled.size);
        }
        debug!(entry = %rec.name, size = spooled.size, "replaying spooled entry");

        let result = (|| -> Result<()> {
            self.inner.begin_entry(rec)?;
            spooled.file.file.seek(SeekFrom::Start(0))?;
            let mut buf = vec![0u8; REPLAY_BUF_SIZE];
            loop {
                let n = spooled.file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.inner.write_data(&buf[..n])?;
            }
            self.inner.end_entry()
        })();
        self.pool.release(spooled.file);
        result
    }

    /// Finalize the archive: replay any pending spooled entry, then
    /// write the central directory and trailer.
    pub fn finish(&mut self) -> Result<()> {
        self.drain()?;
        if self.spooled.is_some() {
            return Err(ZipError::WriterBusy);
        }
        self.inner.finish()
    }

    /// Unwrap the underlying archive writer.
    pub fn into_inner(self) -> ArchiveWriter<W> {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ZipReader;
    use std::io::Cursor;

    #[test]
    fn test_direct_when_idle() {
        let mut m = MultiplexedWriter::new(ArchiveWriter::new(Vec::new()));
        let h = m.begin_entry(EntryRecord::new("a.txt")).unwrap();
        assert_eq!(h, EntryHandle::Direct);
        m.write_data(h, b"direct").unwrap();
        m.end_entry(h).unwrap();
        m.finish().unwrap();
    }

    #[test]
    fn test_stored_unknown_metadata_spools() {
        let mut m = MultiplexedWriter::new(ArchiveWriter::new(Vec::new()));
        let h = m
            .begin_entry(EntryRecord::new("s.bin").with_method(Method::Stored))
            .unwrap();
        assert_eq!(h, EntryHandle::Spooled);
        m.write_data(h, b"stored without declared metadata").unwrap();
        m.end_entry(h).unwrap();
        m.finish().unwrap();

        let w = m.into_inner();
        let bytes = w.into_inner().unwrap();
        let mut reader = ZipReader::new(Cursor::new(bytes)).unwrap();
        let rec = reader.entries().next().unwrap();
        assert_eq!(rec.method, Method::Stored);
        assert_eq!(rec.uncompressed_size, Some(32));
        assert_eq!(
            reader.extract("s.bin").unwrap(),
            b"stored without declared metadata".to_vec()
        );
    }

    #[test]
    fn test_interleaved_entries_replay_in_slot_order() {
        let mut m = MultiplexedWriter::new(ArchiveWriter::new(Cursor::new(Vec::new())));
        let a = m.begin_entry(EntryRecord::new("a.txt")).unwrap();
        let b = m.begin_entry(EntryRecord::new("b.txt")).unwrap();
        assert_eq!(a, EntryHandle::Direct);
        assert_eq!(b, EntryHandle::Spooled);

        // Interleaved writes: the spooled entry buffers off to the side.
        m.write_data(b, b"second ").unwrap();
        m.write_data(a, b"first ").unwrap();
        m.write_data(b, b"entry").unwrap();
        m.write_data(a, b"entry").unwrap();

        // Closing the spooled one first leaves it pending.
        m.end_entry(b).unwrap();
        m.end_entry(a).unwrap();
        m.finish().unwrap();

        let bytes = m.into_inner().into_inner().unwrap().into_inner();
        let mut reader = ZipReader::new(Cursor::new(bytes)).unwrap();
        let names: Vec<_> = reader.entries().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(reader.extract("a.txt").unwrap(), b"first entry".to_vec());
        assert_eq!(reader.extract("b.txt").unwrap(), b"second entry".to_vec());
    }

    #[test]
    fn test_third_concurrent_entry_rejected() {
        let mut m = MultiplexedWriter::new(ArchiveWriter::new(Vec::new()));
        let _a = m.begin_entry(EntryRecord::new("a")).unwrap();
        let _b = m.begin_entry(EntryRecord::new("b")).unwrap();
        let err = m.begin_entry(EntryRecord::new("c")).unwrap_err();
        assert!(matches!(err, ZipError::WriterBusy));
    }

    #[test]
    fn test_finish_with_open_spooled_entry_fails() {
        let mut m = MultiplexedWriter::new(ArchiveWriter::new(Vec::new()));
        let a = m.begin_entry(EntryRecord::new("a")).unwrap();
        let b = m.begin_entry(EntryRecord::new("b")).unwrap();
        m.end_entry(a).unwrap();
        // b is still open: its spool cannot be replayed yet.
        let err = m.finish().unwrap_err();
        assert!(matches!(err, ZipError::WriterBusy));
        m.end_entry(b).unwrap();
        m.finish().unwrap();
    }

    #[test]
    fn test_pool_releases_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TempFilePool::in_dir(dir.path());
        let mut m = MultiplexedWriter::with_pool(ArchiveWriter::new(Vec::new()), Box::new(pool));
        let a = m.begin_entry(EntryRecord::new("a")).unwrap();
        let b = m.begin_entry(EntryRecord::new("b")).unwrap();
        m.write_data(b, b"spooled payload").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        m.end_entry(b).unwrap();
        m.end_entry(a).unwrap();
        m.finish().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
