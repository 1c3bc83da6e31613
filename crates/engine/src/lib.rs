//! # Engine: the UndertowKV storage engine
//!
//! An embedded, persistent key-value store on the Bitcask design: an
//! append-only log of records split across numbered segment files, with an
//! in-memory hash index mapping each key to its latest record's location.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!   |
//!   v
//! ┌───────────────────────────────────────────────┐
//! │                   ENGINE                      │
//! │                                               │
//! │ write.rs → append record to the active file   │
//! │              → update index + reusable bytes  │
//! │              (rollover when the file is full) │
//! │                                               │
//! │ read.rs  → index lookup → one read at         │
//! │              (file_id, offset, size)          │
//! │                                               │
//! │ compaction.rs → replay live keys into a temp  │
//! │              engine, swap its output in       │
//! │                                               │
//! │ recovery.rs → tail-truncate the active file,  │
//! │              rebuild the index on open        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                            |
//! |-----------------|----------------------------------------------------|
//! | `lib.rs`        | `Engine` handle, open/close, accessors, `Debug`, `Drop` |
//! | [`config`]      | options, defaults, JSON loading                    |
//! | [`meta`]        | `meta.json` (`index_up_to_date`, `reusable_space`) |
//! | [`index`]       | in-memory index, `index` snapshot, hint sidecars   |
//! | [`recovery`]    | segment discovery, index rebuild                   |
//! | `write.rs`      | `put()`, `delete()`, rollover                      |
//! | `read.rs`       | `get()`, `walk()`                                  |
//! | `compaction.rs` | `merge()` and the merge trigger                    |
//! | `ticker.rs`     | background auto-merge thread                       |
//!
//! ## Concurrency
//!
//! The engine is thread-safe for concurrent callers: one reader/writer
//! lock guards the mutable state (active file, sealed segment map, index,
//! meta counters, merge flag). Gets and walks take shared holds; puts,
//! deletes, rollover, close, and merge finalization take exclusive holds.
//! The merge replay phase deliberately runs without the lock so readers
//! and writers are not stalled for the duration of a compaction.
//!
//! ## Crash Safety
//!
//! Every record carries a CRC-32. On open, the active segment is scanned
//! and truncated at the first corrupt record; the log is append-only, so
//! only a trailing suffix can be damaged. The `index` snapshot is trusted
//! only when `meta.json` says it is current, which is persisted `false`
//! the moment an engine opens for writing and `true` only by a clean
//! close.

mod compaction;
mod config;
mod error;
mod index;
mod meta;
mod read;
mod recovery;
mod ticker;
mod write;

pub use config::Config;
pub use error::{Error, Result};
pub use index::Index;
pub use record::Entry;

use datafile::DataFile;
use fs2::FileExt;
use meta::Meta;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::sync::Arc;
use ticker::MergeTicker;

/// Advisory lock sentinel inside the root directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Scratch subdirectory a merge rewrites live records into. A leftover one
/// (crashed merge) is deleted on open.
pub const MERGE_TMP_DIR: &str = "merge.tmp";

/// Maximum key size in bytes; the wire format stores key lengths as u16.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Maximum value size in bytes; the wire format stores value lengths as u32.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// The storage engine handle.
///
/// Cheap to share by reference across threads; all operations take
/// `&self`. [`Engine::close`] flushes the index snapshot and releases the
/// directory; dropping an unclosed engine closes it best-effort.
pub struct Engine {
    core: Arc<Core>,
    ticker: Mutex<Option<MergeTicker>>,
}

/// Everything behind the engine handle. The background ticker holds a
/// `Weak` reference to this, so it never keeps a dropped engine alive.
pub(crate) struct Core {
    pub(crate) config: Config,
    pub(crate) state: RwLock<State>,
}

/// The lock-guarded mutable state.
pub(crate) struct State {
    pub(crate) meta: Meta,
    pub(crate) index: Index,
    pub(crate) merging: bool,
    /// `None` once the engine is closed; taking it drops every file
    /// handle and mmap region.
    pub(crate) files: Option<Files>,
    pub(crate) lock_file: File,
}

pub(crate) struct Files {
    pub(crate) active: DataFile,
    pub(crate) sealed: HashMap<u64, DataFile>,
}

impl State {
    pub(crate) fn files(&self) -> Result<&Files> {
        self.files.as_ref().ok_or(Error::Closed)
    }

    pub(crate) fn files_mut(&mut self) -> Result<&mut Files> {
        self.files.as_mut().ok_or(Error::Closed)
    }
}

impl Engine {
    /// Opens (creating if necessary) the engine over
    /// `config.root_directory`.
    ///
    /// # Steps
    ///
    /// 1. Create the directory and take the advisory lock
    ///    ([`Error::DirLocked`] if another holder exists).
    /// 2. Load `meta.json` (defaults if absent) and delete a leftover
    ///    merge scratch directory.
    /// 3. Discover segments; the highest id opens read-write as the
    ///    active file, the rest read-only with mmap readers. A fresh
    ///    directory gets an active file with id 0.
    /// 4. Tail-recover the active file; if anything was truncated, the
    ///    `index` snapshot is stale and is deleted.
    /// 5. Load the snapshot if meta vouches for it, otherwise rebuild the
    ///    index by scanning segments in id order.
    /// 6. Persist `meta.index_up_to_date = false`: from here on the
    ///    snapshot no longer reflects the log.
    /// 7. Start the merge ticker when `auto_merging` is set.
    pub fn open(config: Config) -> Result<Engine> {
        let root = config.root_directory.clone();
        fs::create_dir_all(&root)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE_NAME))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::DirLocked)?;

        let mut meta = Meta::load(&root)?;

        let merge_tmp = root.join(MERGE_TMP_DIR);
        if merge_tmp.exists() {
            tracing::warn!(dir = %merge_tmp.display(), "removing leftover merge scratch directory");
            fs::remove_dir_all(&merge_tmp)?;
        }

        let ids = recovery::segment_ids(&root)?;
        let (active, sealed, index) = match ids.split_last() {
            None => (
                DataFile::open(&root, 0, false)?,
                HashMap::new(),
                Index::new(),
            ),
            Some((&last, rest)) => {
                let mut sealed = HashMap::with_capacity(rest.len());
                for &id in rest {
                    sealed.insert(id, DataFile::open(&root, id, true)?);
                }
                let mut active = DataFile::open(&root, last, false)?;

                let truncated = active.recover()?;
                if truncated {
                    tracing::warn!(
                        file = %active.path().display(),
                        size = active.size(),
                        "discarded corrupt tail of the active file"
                    );
                    let snapshot = index::index_path(&root);
                    if snapshot.exists() {
                        fs::remove_file(&snapshot)?;
                    }
                }

                let index = if meta.index_up_to_date && index::index_path(&root).exists() {
                    index::load_index(&root)?
                } else {
                    recovery::rebuild_index(&sealed, &active)?
                };
                (active, sealed, index)
            }
        };

        meta.index_up_to_date = false;
        meta.save(&root)?;

        let core = Arc::new(Core {
            config,
            state: RwLock::new(State {
                meta,
                index,
                merging: false,
                files: Some(Files { active, sealed }),
                lock_file,
            }),
        });

        let ticker = if core.config.auto_merging {
            Some(MergeTicker::start(
                Arc::downgrade(&core),
                core.config.merge_interval,
            ))
        } else {
            None
        };

        Ok(Engine {
            core,
            ticker: Mutex::new(ticker),
        })
    }

    /// Closes the engine: stops the ticker, writes the index snapshot,
    /// marks it trusted in meta, drops every file handle, and releases the
    /// directory lock.
    ///
    /// Sub-step failures do not abort the remaining steps; the first error
    /// is surfaced. Operations after close return [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        self.core.close()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.state.read().index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segment files, the active one included.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        match &self.core.state.read().files {
            Some(files) => files.sealed.len() + 1,
            None => 0,
        }
    }

    /// Current size of the active segment in bytes.
    #[must_use]
    pub fn active_file_size(&self) -> u64 {
        match &self.core.state.read().files {
            Some(files) => files.active.size(),
            None => 0,
        }
    }

    /// Bytes occupied by superseded or tombstoned records since the last
    /// merge.
    #[must_use]
    pub fn reusable_space(&self) -> i64 {
        self.core.state.read().meta.reusable_space
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.core.config
    }
}

impl Core {
    fn close(&self) -> Result<()> {
        let root = &self.config.root_directory;
        let mut st = self.state.write();
        let files = match st.files.take() {
            Some(files) => files,
            None => return Err(Error::Closed),
        };

        let mut first_err: Option<Error> = None;
        let mut note = |result: Result<()>, slot: &mut Option<Error>| {
            if let Err(e) = result {
                slot.get_or_insert(e);
            }
        };

        note(index::save_index(&st.index, root), &mut first_err);
        st.meta.index_up_to_date = true;
        note(st.meta.save(root), &mut first_err);

        // closes every descriptor and unmaps the sealed segments
        drop(files);

        note(
            st.lock_file.unlock().map_err(Error::from),
            &mut first_err,
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.core.state.read();
        let mut d = f.debug_struct("Engine");
        d.field("root_directory", &self.core.config.root_directory)
            .field("keys", &st.index.len())
            .field("reusable_space", &st.meta.reusable_space)
            .field("merging", &st.merging);
        match &st.files {
            Some(files) => {
                d.field("active_file_id", &files.active.id())
                    .field("active_file_size", &files.active.size())
                    .field("sealed_segments", &files.sealed.len());
            }
            None => {
                d.field("closed", &true);
            }
        }
        d.finish()
    }
}

/// Best-effort close on drop.
///
/// Drop cannot propagate errors; an engine that was already closed is left
/// alone, anything else gets the full close sequence so the index snapshot
/// and directory lock are not leaked on the happy path.
impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        if self.core.state.read().files.is_some() {
            let _ = self.core.close();
        }
    }
}

#[cfg(test)]
mod tests;
