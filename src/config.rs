use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read once from `SHOPSLOTS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Compact the WAL once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("SHOPSLOTS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("SHOPSLOTS_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: lookup("SHOPSLOTS_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            compact_interval: lookup("SHOPSLOTS_COMPACT_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("shopslots.wal")
    }
}
