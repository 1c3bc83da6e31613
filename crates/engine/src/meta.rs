//! The `meta.json` record: a small JSON object tracking whether the on-disk
//! index snapshot can be trusted and how many dead bytes the segments carry.
//!
//! Saved atomically (temp file, fsync, rename). An absent file means
//! defaults, so a fresh directory needs no bootstrap step.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

/// Name of the meta file inside the root directory.
pub const META_FILE_NAME: &str = "meta.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    /// True only when the `index` snapshot on disk matches the data files
    /// exactly; set by a clean close, cleared the moment writes can
    /// resume.
    pub index_up_to_date: bool,

    /// Total bytes occupied by superseded or tombstoned records. Grows on
    /// every overwrite and delete; a merge resets it to zero.
    pub reusable_space: i64,
}

impl Meta {
    /// Loads the meta file from `dir`, or defaults if it does not exist.
    pub fn load(dir: &Path) -> Result<Meta> {
        let path = dir.join(META_FILE_NAME);
        if !path.exists() {
            return Ok(Meta::default());
        }
        let data = fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| Error::Config(format!("{META_FILE_NAME}: {e}")))
    }

    /// Persists the meta file into `dir` atomically.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(META_FILE_NAME);
        let tmp_path = dir.join(format!("{META_FILE_NAME}.tmp"));
        let data = serde_json::to_vec(self).map_err(|e| Error::Config(e.to_string()))?;
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&data)?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
