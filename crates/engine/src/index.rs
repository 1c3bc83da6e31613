//! The in-memory index and its two on-disk snapshots.
//!
//! - `index`: the full index, written by a clean close and trusted on the
//!   next open only while `meta.index_up_to_date` holds.
//! - `NNNNNNNN.hint`: a per-segment sidecar written when a segment is
//!   sealed, listing the keys whose latest record lives in that segment.
//!
//! Both use the same `[ksize][key][entry]` framing from the record crate
//! and are written atomically (temp file, fsync, rename).

use record::{read_frame, write_frame, Entry};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Mapping from key bytes to the location of that key's latest record.
pub type Index = HashMap<Vec<u8>, Entry>;

/// Name of the full-index snapshot inside the root directory.
pub const INDEX_FILE_NAME: &str = "index";

/// Extension of per-segment hint sidecars.
pub const HINT_FILE_EXTENSION: &str = "hint";

#[must_use]
pub fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE_NAME)
}

#[must_use]
pub fn hint_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:08}.{}", id, HINT_FILE_EXTENSION))
}

/// Writes the full index snapshot into `dir`.
pub fn save_index(index: &Index, dir: &Path) -> Result<()> {
    write_frames(&index_path(dir), index.iter().map(|(k, e)| (k.as_slice(), e)))
}

/// Loads the full index snapshot from `dir`.
pub fn load_index(dir: &Path) -> Result<Index> {
    let file = File::open(index_path(dir))?;
    let mut reader = BufReader::new(file);
    let mut index = Index::new();
    while let Some((key, entry)) = read_frame(&mut reader)? {
        index.insert(key, entry);
    }
    Ok(index)
}

/// Writes the hint sidecar for segment `id`: every index entry whose record
/// lives in that segment.
pub fn save_hint(index: &Index, dir: &Path, id: u64) -> Result<()> {
    write_frames(
        &hint_path(dir, id),
        index
            .iter()
            .filter(|(_, e)| e.file_id == id)
            .map(|(k, e)| (k.as_slice(), e)),
    )
}

/// Merges a hint sidecar into `index`.
pub fn load_hint(path: &Path, index: &mut Index) -> Result<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    while let Some((key, entry)) = read_frame(&mut reader)? {
        index.insert(key, entry);
    }
    Ok(())
}

fn write_frames<'a, I>(path: &Path, frames: I) -> Result<()>
where
    I: Iterator<Item = (&'a [u8], &'a Entry)>,
{
    let tmp_path = path.with_extension("tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        for (key, entry) in frames {
            write_frame(&mut w, key, entry)?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
