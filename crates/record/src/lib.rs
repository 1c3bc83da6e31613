//! # Record: on-disk codecs for the UndertowKV log
//!
//! Defines the two binary formats everything else is built on: the log
//! **record** appended to data files, and the index **entry** stored in
//! hint files and the index snapshot.
//!
//! ## Record Format
//!
//! ```text
//! [flag: u8][ksize: u16 BE][vsize: u32 BE][key ...][value ...][crc32: u32 BE]
//! ```
//!
//! The CRC-32/IEEE checksum covers every byte before it (flag through
//! value). Bit 0 of `flag` marks a tombstone; a tombstone carries the key
//! and an empty value. Total on-disk size is `7 + ksize + vsize + 4` bytes.
//!
//! ## Entry Format
//!
//! ```text
//! [file_id: u64 BE][offset: u64 BE][size: u64 BE]
//! ```
//!
//! Fixed 24 bytes. Hint files and the index snapshot store repeated
//! `[ksize: u16 BE][key ...][entry]` frames until end-of-file; see
//! [`write_frame`] and [`read_frame`].
//!
//! ## Example
//!
//! ```rust
//! use record::Record;
//!
//! let rec = Record::put(b"hello".to_vec(), b"world".to_vec());
//! let bytes = rec.encode();
//! let back = Record::decode(&bytes).unwrap();
//! assert_eq!(back, rec);
//! assert!(!back.is_corrupted());
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{self, Read, Write};

use thiserror::Error;

/// Bytes before the key: flag (1) + ksize (2) + vsize (4).
pub const HEADER_BYTES: usize = 7;
/// Trailing CRC-32 bytes.
pub const CHECKSUM_BYTES: usize = 4;
/// Encoded size of an [`Entry`].
pub const ENTRY_BYTES: usize = 24;

/// Bit 0 of the flag byte marks a tombstone.
const TOMBSTONE_BIT: u8 = 1 << 0;

/// Errors that can occur while decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ends before the frame it claims to contain.
    #[error("record frame truncated")]
    Truncated,
}

/// A single log record: the unit of append in a data file.
///
/// Constructed via [`Record::put`] or [`Record::tombstone`], both of which
/// compute the checksum eagerly, or via [`Record::decode`], which preserves
/// the stored checksum so [`Record::is_corrupted`] can compare it against a
/// fresh computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    flag: u8,
    key: Vec<u8>,
    value: Vec<u8>,
    checksum: u32,
}

impl Record {
    /// A live record carrying `key` and `value`.
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        let checksum = checksum_of(0, &key, &value);
        Self {
            flag: 0,
            key,
            value,
            checksum,
        }
    }

    /// A tombstone for `key`: deleted bit set, empty value.
    pub fn tombstone(key: Vec<u8>) -> Self {
        let checksum = checksum_of(TOMBSTONE_BIT, &key, &[]);
        Self {
            flag: TOMBSTONE_BIT,
            key,
            value: Vec::new(),
            checksum,
        }
    }

    /// Returns `true` if the deleted bit is set.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flag & TOMBSTONE_BIT != 0
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Consumes the record, returning the value without copying it.
    #[must_use]
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// The exact number of bytes [`encode`](Record::encode) produces.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        (HEADER_BYTES + self.key.len() + self.value.len() + CHECKSUM_BYTES) as u64
    }

    /// Serializes the record into its on-disk layout.
    ///
    /// The caller is responsible for keeping `key` within `u16::MAX` and
    /// `value` within `u32::MAX` bytes; the engine validates both before a
    /// record is ever built.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.push(self.flag);
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Deserializes a record from `buf`, which must contain the full frame.
    ///
    /// The stored checksum is preserved as-is; call
    /// [`is_corrupted`](Record::is_corrupted) to verify it. Trailing bytes
    /// beyond the frame are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_BYTES + CHECKSUM_BYTES {
            return Err(CodecError::Truncated);
        }
        let flag = buf[0];
        let ksize = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let vsize = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        let total = HEADER_BYTES + ksize + vsize + CHECKSUM_BYTES;
        if buf.len() < total {
            return Err(CodecError::Truncated);
        }
        let key = buf[HEADER_BYTES..HEADER_BYTES + ksize].to_vec();
        let value = buf[HEADER_BYTES + ksize..HEADER_BYTES + ksize + vsize].to_vec();
        let checksum = u32::from_be_bytes([
            buf[total - 4],
            buf[total - 3],
            buf[total - 2],
            buf[total - 1],
        ]);
        Ok(Self {
            flag,
            key,
            value,
            checksum,
        })
    }

    /// Recomputes the checksum over the record's contents and compares it
    /// against the stored one.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.checksum != checksum_of(self.flag, &self.key, &self.value)
    }
}

/// CRC-32/IEEE over the encoded prefix (flag through value) without
/// materializing it.
fn checksum_of(flag: u8, key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(&[flag]);
    hasher.update(&(key.len() as u16).to_be_bytes());
    hasher.update(&(value.len() as u32).to_be_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Location of a key's latest record: which data file, where in it, and how
/// many bytes the whole record occupies. `size` covers the full frame so a
/// get is a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub file_id: u64,
    pub offset: u64,
    pub size: u64,
}

impl Entry {
    /// Serializes into the fixed 24-byte layout.
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_BYTES] {
        let mut buf = [0u8; ENTRY_BYTES];
        buf[0..8].copy_from_slice(&self.file_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Deserializes from exactly [`ENTRY_BYTES`] bytes.
    #[must_use]
    pub fn from_bytes(buf: &[u8; ENTRY_BYTES]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[0..8]);
        let file_id = u64::from_be_bytes(word);
        word.copy_from_slice(&buf[8..16]);
        let offset = u64::from_be_bytes(word);
        word.copy_from_slice(&buf[16..24]);
        let size = u64::from_be_bytes(word);
        Self {
            file_id,
            offset,
            size,
        }
    }

    /// Deserializes from a slice that must hold at least [`ENTRY_BYTES`].
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < ENTRY_BYTES {
            return Err(CodecError::Truncated);
        }
        let mut fixed = [0u8; ENTRY_BYTES];
        fixed.copy_from_slice(&buf[..ENTRY_BYTES]);
        Ok(Self::from_bytes(&fixed))
    }
}

/// Writes one `[ksize][key][entry]` frame, the repeated unit of hint files
/// and the index snapshot.
pub fn write_frame<W: Write>(w: &mut W, key: &[u8], entry: &Entry) -> io::Result<()> {
    w.write_u16::<BigEndian>(key.len() as u16)?;
    w.write_all(key)?;
    w.write_all(&entry.encode())?;
    Ok(())
}

/// Reads the next frame.
///
/// A clean end-of-file before the first byte of a frame yields `Ok(None)`.
/// End-of-file in the middle of a frame surfaces as the underlying
/// `UnexpectedEof` error: hint files and index snapshots are written whole
/// and fsynced, so a partial frame means the file is damaged.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<(Vec<u8>, Entry)>> {
    let ksize = match r.read_u16::<BigEndian>() {
        Ok(v) => v as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut key = vec![0u8; ksize];
    r.read_exact(&mut key)?;
    let mut buf = [0u8; ENTRY_BYTES];
    r.read_exact(&mut buf)?;
    Ok(Some((key, Entry::from_bytes(&buf))))
}
