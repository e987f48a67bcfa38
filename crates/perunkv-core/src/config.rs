//! Engine configuration.

use crate::error::{Error, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default in-flight ring capacity (entries) for the batched log writer.
pub const DEFAULT_RING_CAPACITY: usize = 1 << 15;

/// Default group-commit interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10;

/// Default period of the background snapshot, in seconds.
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;

/// Configuration for one [`Engine`](crate::Engine).
///
/// Loadable from a TOML file layered with `PERUNKV_*` environment
/// variables, or built in code from a data directory:
///
/// ```
/// use perunkv_core::EngineConfig;
///
/// let config = EngineConfig::new("/var/lib/perunkv")
///     .with_flush_interval_ms(0); // sync-always durability
/// assert!(config.aof_path.ends_with("perun.aof"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// File used for the append-only command log.
    pub aof_path: PathBuf,
    /// File used for snapshots.
    pub rdb_path: PathBuf,
    /// In-flight ring capacity; rounded up to a power of two at open.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Group-commit interval in milliseconds. Zero selects sync-always
    /// mode: every append is written and fsynced inline.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Background snapshot period in seconds. Zero disables the timer;
    /// snapshots then only happen through explicit calls.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_snapshot_interval_secs() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_SECS
}

impl EngineConfig {
    /// Default configuration with both persistence files under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            aof_path: data_dir.join("perun.aof"),
            rdb_path: data_dir.join("perun.rdb"),
            ring_capacity: DEFAULT_RING_CAPACITY,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
        }
    }

    /// Loads configuration from a TOML file, with `PERUNKV_*` environment
    /// variables taking precedence over file values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PERUNKV_"))
            .extract()
            .map_err(|err| Error::Config(Box::new(err)))
    }

    /// Sets the group-commit interval; zero means sync-always.
    #[must_use]
    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }

    /// Sets the background snapshot period; zero disables the timer.
    #[must_use]
    pub fn with_snapshot_interval_secs(mut self, interval_secs: u64) -> Self {
        self.snapshot_interval_secs = interval_secs;
        self
    }

    /// Sets the in-flight ring capacity.
    #[must_use]
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub(crate) fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub(crate) fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_interval_secs > 0).then(|| Duration::from_secs(self.snapshot_interval_secs))
    }
}
