use crate::{Config, Engine};
use fs2::FileExt;
use std::fs;
use std::path::Path;

/// A config rooted at `root` with the library defaults otherwise.
pub fn test_config(root: &Path) -> Config {
    Config {
        root_directory: root.to_path_buf(),
        ..Config::default()
    }
}

/// A config with a tiny segment size so tests roll over quickly.
pub fn small_segment_config(root: &Path, max_size: u64) -> Config {
    Config {
        data_file_max_size: max_size,
        ..test_config(root)
    }
}

pub fn open_engine(root: &Path) -> Engine {
    Engine::open(test_config(root)).unwrap()
}

pub fn count_files_with_extension(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s == ext)
                .unwrap_or(false)
        })
        .count()
}

/// Simulates a crash: releases the directory lock and leaks the engine so
/// neither `close` nor `Drop` runs. The index snapshot is never written
/// and `meta.json` keeps saying the snapshot is stale, exactly like a
/// killed process.
pub fn abandon(engine: Engine) {
    {
        let st = engine.core.state.read();
        let _ = st.lock_file.unlock();
    }
    std::mem::forget(engine);
}
