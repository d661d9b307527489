//! Profiler configuration
//!
//! A [`Config`] is a plain declarative record: which kinds to enable, where to
//! put the artifacts, how often to snapshot and at which sampling rates. It is
//! never mutated once handed to a [`crate::ProfilerController`].
//!
//! The JSON form uses the field names below, every field optional:
//!
//! ```json
//! {
//!   "cpu": true,
//!   "memory": true,
//!   "prefix": "/tmp/myapp.",
//!   "interval": "30s",
//!   "memory_profile_rate": 524288,
//!   "cpu_profile_rate": 250
//! }
//! ```

mod interval;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::domain::{ConfigError, IntervalError, ProfileKind};

pub use interval::parse_interval;

/// Profiler settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    /// Enable CPU profiling
    pub cpu: bool,
    /// Enable heap allocation profiling
    pub memory: bool,
    /// Enable blocking-event profiling
    pub block: bool,
    /// Capture a thread dump on every snapshot
    pub goroutine: bool,
    /// Enable contended mutex profiling
    pub mutex: bool,
    /// Prefix for the names of the files storing the snapshots
    pub prefix: String,
    /// Interval between two subsequent snapshots; empty for single-shot mode
    pub interval: String,
    /// Average bytes between sampled allocations; 1 samples every block, 0 disables
    pub memory_profile_rate: i64,
    /// CPU samples per second; values <= 0 keep the backend default
    pub cpu_profile_rate: i32,
    /// Record one in N contention events; values <= 0 disable collection
    pub mutex_profile_fraction: i64,
}

impl Config {
    /// Parse a JSON document into a config
    ///
    /// # Errors
    /// Returns an error if the document is not valid JSON or a field has the
    /// wrong type
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// True when at least one kind is enabled
    #[must_use]
    pub const fn is_on(&self) -> bool {
        self.cpu || self.memory || self.goroutine || self.block || self.mutex
    }

    /// Whether `kind` is enabled
    #[must_use]
    pub const fn is_enabled(&self, kind: ProfileKind) -> bool {
        match kind {
            ProfileKind::Cpu => self.cpu,
            ProfileKind::Memory => self.memory,
            ProfileKind::Block => self.block,
            ProfileKind::Goroutine => self.goroutine,
            ProfileKind::Mutex => self.mutex,
        }
    }

    /// Enabled kinds, in snapshot order
    pub fn enabled_kinds(&self) -> impl Iterator<Item = ProfileKind> + '_ {
        ProfileKind::ALL.into_iter().filter(|kind| self.is_enabled(*kind))
    }

    /// The snapshot interval, `None` in single-shot mode
    ///
    /// # Errors
    /// Returns an error if the interval string is set but malformed
    pub fn parse_interval(&self) -> Result<Option<Duration>, IntervalError> {
        if self.interval.is_empty() {
            return Ok(None);
        }
        parse_interval(&self.interval).map(Some)
    }
}
