//! Engine configuration.
//!
//! All options are recognized at open time. A config can be built in code
//! (struct-update over [`Config::default`]) or loaded from a JSON file via
//! [`Config::load`]; every field has a default, so a partial JSON object is
//! fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Segment size at which the active file rolls over (4 GiB).
pub const DEFAULT_DATA_FILE_MAX_SIZE: u64 = 1 << 32;
/// Minimum reusable/total ratio before an automatic merge.
pub const DEFAULT_MERGE_RATIO_THRESHOLD: f64 = 0.5;
/// Minimum reusable bytes before an automatic merge (4 GiB).
pub const DEFAULT_MERGE_SPACE_THRESHOLD: i64 = 1 << 32;
/// Tick period of the background merge ticker.
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding every engine file (segments, hints, index
    /// snapshot, meta, lock).
    pub root_directory: PathBuf,

    /// Size at which the active segment is sealed and a fresh one opened.
    pub data_file_max_size: u64,

    /// Run the background merge ticker.
    pub auto_merging: bool,

    /// fsync the active file after every append (puts and tombstones).
    pub sync_write: bool,

    /// Merge only once reusable bytes make up at least this fraction of
    /// the total segment bytes.
    pub merge_ratio_threshold: f64,

    /// Merge only once at least this many reusable bytes accumulated.
    pub merge_space_threshold: i64,

    /// Tick period when `auto_merging` is on. Serialized in seconds.
    #[serde(with = "duration_secs")]
    pub merge_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_directory: std::env::temp_dir().join("undertow"),
            data_file_max_size: DEFAULT_DATA_FILE_MAX_SIZE,
            auto_merging: false,
            sync_write: false,
            merge_ratio_threshold: DEFAULT_MERGE_RATIO_THRESHOLD,
            merge_space_threshold: DEFAULT_MERGE_SPACE_THRESHOLD,
            merge_interval: DEFAULT_MERGE_INTERVAL,
        }
    }
}

impl Config {
    /// Loads a config from a JSON file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, [`Error::Config`] if the
    /// JSON does not parse.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| Error::Config(e.to_string()))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.data_file_max_size, 1 << 32);
        assert!(!cfg.auto_merging);
        assert!(!cfg.sync_write);
        assert_eq!(cfg.merge_ratio_threshold, 0.5);
        assert_eq!(cfg.merge_space_threshold, 1 << 32);
        assert_eq!(cfg.merge_interval, Duration::from_secs(3600));
    }

    #[test]
    fn load_full_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "root_directory": "/data/undertow",
                "data_file_max_size": 1024,
                "auto_merging": true,
                "sync_write": true,
                "merge_ratio_threshold": 0.25,
                "merge_space_threshold": 2048,
                "merge_interval": 30
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.root_directory, PathBuf::from("/data/undertow"));
        assert_eq!(cfg.data_file_max_size, 1024);
        assert!(cfg.auto_merging);
        assert!(cfg.sync_write);
        assert_eq!(cfg.merge_ratio_threshold, 0.25);
        assert_eq!(cfg.merge_space_threshold, 2048);
        assert_eq!(cfg.merge_interval, Duration::from_secs(30));
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"sync_write": true}"#).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert!(cfg.sync_write);
        assert_eq!(cfg.data_file_max_size, DEFAULT_DATA_FILE_MAX_SIZE);
    }

    #[test]
    fn load_malformed_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn load_missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("absent.json")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn json_roundtrip() {
        let cfg = Config {
            merge_interval: Duration::from_secs(90),
            ..Config::default()
        };
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.merge_interval, Duration::from_secs(90));
    }
}
