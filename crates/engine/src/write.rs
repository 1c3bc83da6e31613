//! Write path: `put()`, `delete()`, and segment rollover.
//!
//! Every mutation appends a record to the active file under the exclusive
//! lock, then updates the index and the reusable-space counter. The index
//! is only touched after the append succeeds, so a failed write never
//! leaves the index pointing at bytes that were not written.

use datafile::DataFile;
use record::{Entry, Record};

use crate::error::{Error, Result};
use crate::index;
use crate::{Core, Engine, State, MAX_KEY_SIZE, MAX_VALUE_SIZE};

impl Engine {
    /// Inserts or overwrites a key.
    ///
    /// Last-writer-wins under concurrency: appends are serialized by the
    /// exclusive lock, and the index always reflects the latest append.
    ///
    /// # Errors
    ///
    /// [`Error::KeyTooLarge`] / [`Error::ValueTooLarge`] when an argument
    /// does not fit the wire format; otherwise I/O errors from the append
    /// or the fsync (`sync_write`).
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(value.len()));
        }
        self.core.put(key, value)
    }

    /// Deletes a key by appending a tombstone and dropping the key from
    /// the index.
    ///
    /// Deleting an absent key still appends the tombstone; harmless, and
    /// rebuild ignores it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        self.core.delete(key)
    }
}

impl Core {
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut st = self.state.write();
        self.roll_active_if_full(&mut st)?;

        let record = Record::put(key.to_vec(), value.to_vec());
        let entry = {
            let files = st.files_mut()?;
            let (offset, size) = files.active.append_record(&record)?;
            if self.config.sync_write {
                files.active.sync()?;
            }
            Entry {
                file_id: files.active.id(),
                offset,
                size,
            }
        };

        let old_size = st.index.get(key).map(|old| old.size);
        if let Some(size) = old_size {
            st.meta.reusable_space += size as i64;
        }
        st.index.insert(key.to_vec(), entry);
        Ok(())
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        let mut st = self.state.write();
        self.roll_active_if_full(&mut st)?;

        let record = Record::tombstone(key.to_vec());
        {
            let files = st.files_mut()?;
            files.active.append_record(&record)?;
            if self.config.sync_write {
                files.active.sync()?;
            }
        }

        if let Some(old) = st.index.remove(key) {
            st.meta.reusable_space += old.size as i64;
        }
        Ok(())
    }

    fn roll_active_if_full(&self, st: &mut State) -> Result<()> {
        if st.files()?.active.size() < self.config.data_file_max_size {
            return Ok(());
        }
        self.rotate_active(st, true)
    }

    /// Seals the active file and opens a fresh one at `id + 1`.
    ///
    /// The sealed segment is reopened read-only with an mmap reader and
    /// moved into the sealed map. With `write_hint`, its hint sidecar is
    /// synthesized from the index; a hint failure only slows the next
    /// rebuild, so it is logged and swallowed.
    pub(crate) fn rotate_active(&self, st: &mut State, write_hint: bool) -> Result<()> {
        let root = &self.config.root_directory;
        let sealed_id = {
            let files = st.files_mut()?;
            let sealed_id = files.active.id();
            let new_active = DataFile::open(root, sealed_id + 1, false)?;
            let old_active = std::mem::replace(&mut files.active, new_active);
            // the read-write descriptor goes away before the read-only reopen
            drop(old_active);
            files
                .sealed
                .insert(sealed_id, DataFile::open(root, sealed_id, true)?);
            sealed_id
        };

        if write_hint {
            if let Err(e) = index::save_hint(&st.index, root, sealed_id) {
                tracing::warn!(id = sealed_id, error = %e, "failed to write hint file");
            }
        }
        Ok(())
    }
}
