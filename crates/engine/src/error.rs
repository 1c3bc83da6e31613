//! The unified error type for engine operations.
//!
//! [`Error::KeyNotFound`] and [`Error::DirLocked`] are sentinels callers
//! are expected to match on; everything else is an operational failure.
//! Tail corruption is never surfaced; it is consumed by recovery at open
//! time.

use datafile::DataFileError;
use std::io;

use thiserror::Error;

/// Result type alias using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The key is absent or deleted. The normal miss signal from get.
    #[error("key not found")]
    KeyNotFound,

    /// Another process (or another handle in this one) holds the
    /// directory lock.
    #[error("directory is locked by another process")]
    DirLocked,

    /// An append reached a sealed segment. Surfacing this means an
    /// internal invariant broke.
    #[error("data file is read only")]
    ReadOnly,

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,

    /// The key does not fit the wire format's u16 length field.
    #[error("key too large: {0} bytes (max 65535)")]
    KeyTooLarge(usize),

    /// The value does not fit the wire format's u32 length field.
    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// Malformed configuration or metadata JSON.
    #[error("bad config: {0}")]
    Config(String),

    /// An underlying I/O failure, surfaced verbatim.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<DataFileError> for Error {
    fn from(e: DataFileError) -> Self {
        match e {
            DataFileError::Io(e) => Error::Io(e),
            DataFileError::ReadOnly => Error::ReadOnly,
            DataFileError::Truncated(offset) => Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("truncated record at offset {offset}"),
            )),
        }
    }
}
