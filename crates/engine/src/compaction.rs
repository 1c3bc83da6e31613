//! Merge: compaction of sealed segments into a compact rewrite.
//!
//! A merge replays every live key whose record sits in a sealed segment
//! into a scratch engine under `merge.tmp/`, then swaps the scratch
//! output in: the compacted segments are deleted and the rewritten ones
//! (plus their hints and index snapshot) move into the root directory.
//!
//! Locking: the single-flight check, the rotation that frees the active
//! file from the merge set, and the key snapshot happen under one
//! exclusive hold. The replay, the expensive part, runs without the
//! lock, so concurrent puts and gets proceed; writes that land during the
//! replay go to the new active file, which is re-scanned during
//! finalization. Finalization retakes the exclusive hold.
//!
//! A merge failure before finalization leaves the pre-merge state intact;
//! the scratch directory is removed either way.

use datafile::DataFile;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::{index, meta, recovery, Config, Core, Engine, LOCK_FILE_NAME, MERGE_TMP_DIR};

impl Engine {
    /// Runs a compaction now.
    ///
    /// Returns `Ok(())` without doing work if a merge is already in
    /// flight.
    pub fn merge(&self) -> Result<()> {
        self.core.merge()
    }
}

impl Core {
    pub(crate) fn merge(&self) -> Result<()> {
        // Single-flight guard, rotation, and key snapshot in one
        // exclusive hold.
        let (max_merge_id, keys) = {
            let mut st = self.state.write();
            st.files()?;
            if st.merging {
                return Ok(());
            }
            st.merging = true;

            if let Err(e) = self.rotate_active(&mut st, false) {
                st.merging = false;
                return Err(e);
            }

            // everything strictly older than the fresh active file
            let max_merge_id = st.files()?.active.id() - 1;
            let keys: Vec<Vec<u8>> = st
                .index
                .iter()
                .filter(|(_, entry)| entry.file_id <= max_merge_id)
                .map(|(key, _)| key.clone())
                .collect();
            (max_merge_id, keys)
        };

        let result = self.merge_without_lock(max_merge_id, keys);
        self.state.write().merging = false;
        result
    }

    /// The replay and finalization, run after the rotation hold was
    /// dropped.
    fn merge_without_lock(&self, max_merge_id: u64, keys: Vec<Vec<u8>>) -> Result<()> {
        let root = &self.config.root_directory;
        let scratch_dir = root.join(MERGE_TMP_DIR);
        if scratch_dir.exists() {
            fs::remove_dir_all(&scratch_dir)?;
        }

        tracing::info!(
            up_to_segment = max_merge_id,
            live_keys = keys.len(),
            "merge started"
        );

        // The scratch engine keeps the parent's segment size so it can
        // never emit more segments than it replaces.
        let scratch_config = Config {
            root_directory: scratch_dir.clone(),
            auto_merging: false,
            sync_write: false,
            ..self.config.clone()
        };
        let scratch = Engine::open(scratch_config)?;

        let replayed = self.replay_live_keys(&scratch, keys);
        let closed = match replayed {
            Ok(()) => scratch.close(),
            Err(e) => {
                drop(scratch);
                let _ = fs::remove_dir_all(&scratch_dir);
                return Err(e);
            }
        };
        if let Err(e) = closed {
            let _ = fs::remove_dir_all(&scratch_dir);
            return Err(e);
        }

        let finalized = self.finalize_merge(max_merge_id, &scratch_dir);
        let _ = fs::remove_dir_all(&scratch_dir);
        if finalized.is_ok() {
            tracing::info!("merge finished");
        }
        finalized
    }

    fn replay_live_keys(&self, scratch: &Engine, keys: Vec<Vec<u8>>) -> Result<()> {
        for key in keys {
            match self.get(&key) {
                Ok(value) => scratch.put(&key, &value)?,
                // deleted while the merge was running
                Err(Error::KeyNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Swaps the scratch output in under the exclusive lock.
    ///
    /// Segments that survived the merge, meaning anything sealed after
    /// the rotation (concurrent writers can roll the active file during
    /// the replay) plus the active file itself, are re-scanned into the
    /// index, so every write accepted while the replay ran is reflected.
    fn finalize_merge(&self, max_merge_id: u64, scratch_dir: &Path) -> Result<()> {
        let root = &self.config.root_directory;
        let mut st = self.state.write();

        // 1. Retire the compacted segments and their hint sidecars.
        // TODO: a crash between here and step 4 drops the rewrite (open
        // discards the scratch directory); needs a two-phase commit marker.
        {
            let files = st.files_mut()?;
            let retired: Vec<u64> = files
                .sealed
                .keys()
                .filter(|&&id| id <= max_merge_id)
                .copied()
                .collect();
            for id in retired {
                if let Some(file) = files.sealed.remove(&id) {
                    let path = file.path().to_path_buf();
                    // release the descriptor and mmap before unlinking
                    drop(file);
                    fs::remove_file(&path)?;
                    let hint = index::hint_path(root, id);
                    if hint.exists() {
                        let _ = fs::remove_file(&hint);
                    }
                }
            }
        }

        // 2. List the scratch output; the scratch lock and meta stay
        //    behind.
        let mut to_move: Vec<(PathBuf, OsString)> = Vec::new();
        let mut rewritten: Vec<u64> = Vec::new();
        for dirent in fs::read_dir(scratch_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            if name.to_str() == Some(LOCK_FILE_NAME) || name.to_str() == Some(meta::META_FILE_NAME)
            {
                continue;
            }
            if let Some(id) = recovery::parse_segment_id(&dirent.path()) {
                rewritten.push(id);
            }
            to_move.push((dirent.path(), name));
        }

        // 3. If a rewritten id reaches a surviving segment, renumber the
        //    survivors above the rewritten range first (ids may be
        //    renamed freely as long as the highest stays active). Their
        //    hints carry the old id and are dropped; the scan below
        //    re-indexes them.
        if let Some(&max_rewritten) = rewritten.iter().max() {
            let files = st.files_mut()?;
            let mut kept: Vec<u64> = files.sealed.keys().copied().collect();
            kept.sort_unstable();
            let lowest_surviving = kept.first().copied().unwrap_or_else(|| files.active.id());
            if max_rewritten >= lowest_surviving {
                let mut next = max_rewritten.max(files.active.id()) + 1;
                for id in kept {
                    if let Some(mut file) = files.sealed.remove(&id) {
                        file.rename(root, next)?;
                        let hint = index::hint_path(root, id);
                        if hint.exists() {
                            let _ = fs::remove_file(&hint);
                        }
                        files.sealed.insert(next, file);
                        next += 1;
                    }
                }
                files.active.rename(root, next)?;
            }
        }

        // 4. Adopt the rewritten files.
        for (path, name) in to_move {
            fs::rename(&path, root.join(&name))?;
        }

        // 5. Rebuild the index: the scratch snapshot, then every
        //    surviving segment in id order, then the active file.
        let mut new_index = index::load_index(root)?;
        let _ = fs::remove_file(index::index_path(root));
        {
            let files = st.files()?;
            let mut kept: Vec<u64> = files.sealed.keys().copied().collect();
            kept.sort_unstable();
            for id in kept {
                recovery::apply_segment(&mut new_index, &files.sealed[&id])?;
            }
            recovery::apply_segment(&mut new_index, &files.active)?;
        }

        // 6. Open the rewritten segments read-only.
        {
            let files = st.files_mut()?;
            for id in rewritten {
                files.sealed.insert(id, DataFile::open(root, id, true)?);
            }
        }

        st.index = new_index;
        st.meta.reusable_space = 0;
        st.meta.index_up_to_date = false;
        st.meta.save(root)?;
        Ok(())
    }

    /// The ticker's entry point: merge when enough dead bytes piled up.
    ///
    /// Thresholds: `reusable_space >= merge_space_threshold` and
    /// `reusable_space / total_bytes >= merge_ratio_threshold`, with no
    /// merge already in flight.
    pub(crate) fn maybe_merge(&self) {
        let should = {
            let st = self.state.read();
            match st.files() {
                Err(_) => false,
                Ok(files) => {
                    let total = files.active.size()
                        + files.sealed.values().map(DataFile::size).sum::<u64>();
                    let reusable = st.meta.reusable_space;
                    !st.merging
                        && total > 0
                        && reusable >= self.config.merge_space_threshold
                        && reusable as f64 / total as f64 >= self.config.merge_ratio_threshold
                }
            }
        };
        if should {
            if let Err(e) = self.merge() {
                tracing::warn!(error = %e, "background merge failed");
            }
        }
    }
}
