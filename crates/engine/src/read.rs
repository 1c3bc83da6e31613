//! Read path: `get()` and `walk()`.
//!
//! Both run under the shared lock. A get is one index lookup plus one
//! positional read of exactly `entry.size` bytes; sealed segments serve it
//! from their mmap region. The hot path does not re-verify the checksum
//! (tail recovery at open time guards against torn writes), but debug
//! builds assert it.

use record::Entry;

use crate::error::{Error, Result};
use crate::{Core, Engine};

impl Engine {
    /// Returns the value stored for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] for a missing or deleted key.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.core.get(key)
    }

    /// Visits every live `(key, entry)` pair under the shared lock.
    ///
    /// Iteration order is arbitrary. The first error returned by the
    /// visitor aborts the walk and is surfaced as-is. Writes block for the
    /// duration, so visitors should stay cheap.
    pub fn walk<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &Entry) -> Result<()>,
    {
        self.core.walk(visit)
    }
}

impl Core {
    pub(crate) fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let st = self.state.read();
        let files = st.files()?;
        let entry = st.index.get(key).ok_or(Error::KeyNotFound)?;

        let file = if entry.file_id == files.active.id() {
            &files.active
        } else {
            files.sealed.get(&entry.file_id).ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("index points at missing segment {:08}", entry.file_id),
                ))
            })?
        };

        let record = file.read_entire_record_at(entry.offset, entry.size)?;
        debug_assert_eq!(record.key(), key);
        debug_assert!(!record.is_corrupted());
        Ok(record.into_value())
    }

    pub(crate) fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &Entry) -> Result<()>,
    {
        let st = self.state.read();
        st.files()?;
        for (key, entry) in &st.index {
            visit(key, entry)?;
        }
        Ok(())
    }
}
