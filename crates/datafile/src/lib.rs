//! # DataFile: the append-only log segment
//!
//! One `NNNNNNNN.data` file on disk. The segment with the highest id is the
//! **active** file: opened read-write, it takes appends at its tracked end
//! offset. Every other segment is **sealed**: opened read-only with an
//! mmap-backed read path, and any append is rejected.
//!
//! Reads come in two shapes:
//!
//! - [`DataFile::read_entire_record_at`], the hot path. The caller already
//!   knows `(offset, size)` from the index, so the whole record is fetched
//!   in a single read and decoded.
//! - [`DataFile::read_record_at`], the scan path used by recovery and
//!   index rebuild. It parses the header at `offset` to discover the
//!   record's size, returning `Ok(None)` exactly at end-of-file.
//!
//! [`DataFile::recover`] walks the scan path from offset zero and truncates
//! the file at the first corrupt or torn record. Because the file is
//! append-only, only a trailing suffix can ever be damaged; everything
//! before the truncation point is intact.

use memmap2::Mmap;
use record::{Record, CHECKSUM_BYTES, HEADER_BYTES};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Extension of segment files.
pub const DATA_FILE_EXTENSION: &str = "data";

/// Errors from segment file operations.
#[derive(Debug, Error)]
pub enum DataFileError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An append was attempted on a sealed (read-only) segment.
    #[error("data file is read only")]
    ReadOnly,

    /// A record frame at `offset` extends past the end of the file or
    /// fails to parse. During recovery this marks the truncation point.
    #[error("truncated record at offset {0}")]
    Truncated(u64),
}

pub type Result<T> = std::result::Result<T, DataFileError>;

/// File name of the segment with the given id, e.g. `00000042.data`.
#[must_use]
pub fn file_name(id: u64) -> String {
    format!("{:08}.{}", id, DATA_FILE_EXTENSION)
}

/// Full path of the segment with the given id inside `dir`.
#[must_use]
pub fn file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(file_name(id))
}

/// How random reads are served.
enum ReadAt {
    /// Positional reads through the file descriptor (active segments, and
    /// sealed segments that are empty, since a zero-length mapping is
    /// invalid).
    Plain,
    /// Reads copied out of a shared mapping (sealed segments).
    Mmap(Mmap),
}

/// An append-only segment file.
pub struct DataFile {
    id: u64,
    path: PathBuf,
    file: File,
    read_at: ReadAt,
    read_only: bool,
    end: u64,
}

impl DataFile {
    /// Opens (or, when `read_only` is false, creates) segment `id` in `dir`.
    ///
    /// Read-only segments are additionally mapped for copy-free reads and
    /// reject [`append`](DataFile::append).
    pub fn open(dir: &Path, id: u64, read_only: bool) -> Result<Self> {
        let path = file_path(dir, id);
        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?
        };
        let end = file.metadata()?.len();
        let read_at = if read_only && end > 0 {
            // Sealed segments are immutable, so the mapping never observes
            // a write.
            ReadAt::Mmap(unsafe { Mmap::map(&file)? })
        } else {
            ReadAt::Plain
        };
        Ok(Self {
            id,
            path,
            file,
            read_at,
            read_only,
            end,
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size in bytes; also the offset the next append lands at.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Appends `data` at the end of the file.
    ///
    /// Returns `(offset, written)` where `offset` is the position the data
    /// was written at.
    pub fn append(&mut self, data: &[u8]) -> Result<(u64, u64)> {
        if self.read_only {
            return Err(DataFileError::ReadOnly);
        }
        let offset = self.end;
        self.file.write_all_at(data, offset)?;
        self.end += data.len() as u64;
        Ok((offset, data.len() as u64))
    }

    /// Encodes and appends a record. Returns `(offset, size)` suitable for
    /// an index entry.
    pub fn append_record(&mut self, record: &Record) -> Result<(u64, u64)> {
        self.append(&record.encode())
    }

    /// Reads a whole record whose frame is known to span `size` bytes at
    /// `offset`. Single read, no checksum verification; the caller decides.
    pub fn read_entire_record_at(&self, offset: u64, size: u64) -> Result<Record> {
        if offset.checked_add(size).map_or(true, |end| end > self.end) {
            return Err(DataFileError::Truncated(offset));
        }
        let mut buf = vec![0u8; size as usize];
        self.read_exact_at(&mut buf, offset)?;
        Record::decode(&buf).map_err(|_| DataFileError::Truncated(offset))
    }

    /// Reads the record starting at `offset`, discovering its size from the
    /// header.
    ///
    /// Returns `Ok(None)` when `offset` is exactly the end of the file. A
    /// frame that extends past the end yields [`DataFileError::Truncated`].
    pub fn read_record_at(&self, offset: u64) -> Result<Option<Record>> {
        if offset == self.end {
            return Ok(None);
        }
        if offset + HEADER_BYTES as u64 > self.end {
            return Err(DataFileError::Truncated(offset));
        }
        let mut header = [0u8; HEADER_BYTES];
        self.read_exact_at(&mut header, offset)?;
        let ksize = u16::from_be_bytes([header[1], header[2]]) as u64;
        let vsize = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as u64;
        let total = HEADER_BYTES as u64 + ksize + vsize + CHECKSUM_BYTES as u64;
        if offset.checked_add(total).map_or(true, |end| end > self.end) {
            return Err(DataFileError::Truncated(offset));
        }
        let mut buf = vec![0u8; total as usize];
        self.read_exact_at(&mut buf, offset)?;
        match Record::decode(&buf) {
            Ok(record) => Ok(Some(record)),
            Err(_) => Err(DataFileError::Truncated(offset)),
        }
    }

    /// Durably flushes appended data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Renames the segment to a new id within `dir`. The open descriptor
    /// stays valid across the rename.
    pub fn rename(&mut self, dir: &Path, new_id: u64) -> Result<()> {
        let new_path = file_path(dir, new_id);
        fs::rename(&self.path, &new_path)?;
        self.id = new_id;
        self.path = new_path;
        Ok(())
    }

    /// Truncates a corrupt tail, if any.
    ///
    /// Scans records from offset zero, verifying each checksum. At the
    /// first corrupt or torn record the file is rewritten with exactly the
    /// preceding good prefix (temp file, fsync, atomic rename) and the
    /// handle is reopened. Returns whether a truncation happened.
    pub fn recover(&mut self) -> Result<bool> {
        if self.read_only {
            return Err(DataFileError::ReadOnly);
        }
        let mut offset = 0u64;
        loop {
            match self.read_record_at(offset) {
                Ok(Some(record)) => {
                    if record.is_corrupted() {
                        break;
                    }
                    offset += record.encoded_len();
                }
                Ok(None) => break,
                Err(DataFileError::Truncated(_)) => break,
                Err(e) => return Err(e),
            }
        }
        if offset == self.end {
            return Ok(false);
        }

        let mut good = vec![0u8; offset as usize];
        self.read_exact_at(&mut good, 0)?;

        let tmp_path = self.path.with_extension("data.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&good)?;
            tmp.flush()?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // the old descriptor still points at the replaced inode
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.end = offset;
        Ok(true)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        match &self.read_at {
            ReadAt::Plain => self.file.read_exact_at(buf, offset)?,
            ReadAt::Mmap(map) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > map.len() {
                    return Err(DataFileError::Truncated(offset));
                }
                buf.copy_from_slice(&map[start..end]);
            }
        }
        Ok(())
    }
}
