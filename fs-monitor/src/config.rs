//! Configuration types for directory monitoring.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Path watched when the host supplies none.
pub const DEFAULT_PATH: &str = ".";

/// Configuration for a directory monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Directories to watch, in registration order. Not recursive.
    pub paths: Vec<PathBuf>,

    /// Upper bound on a single notification wait (in milliseconds).
    pub poll_interval_ms: u64,

    /// Pause before reopening a session after invalidation (in milliseconds).
    pub rebuild_backoff_ms: u64,
}

impl MonitorConfig {
    /// Create a config watching the given paths.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Add a directory to watch.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_to_ms(interval);
        self
    }

    /// Set the session rebuild backoff.
    pub fn with_rebuild_backoff(mut self, backoff: Duration) -> Self {
        self.rebuild_backoff_ms = duration_to_ms(backoff);
        self
    }

    /// Poll interval as a duration. Never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Rebuild backoff as a duration.
    pub fn rebuild_backoff(&self) -> Duration {
        Duration::from_millis(self.rebuild_backoff_ms)
    }

    /// Check the path list is structurally usable.
    ///
    /// Existence is not checked here: a missing directory only fails its own
    /// registration once the monitor runs.
    pub fn validate(&self) -> Result<()> {
        for (index, path) in self.paths.iter().enumerate() {
            let raw = path.as_os_str();
            if raw.is_empty() {
                return Err(WatcherError::Config(format!("path #{index} is empty")));
            }
            if raw.as_encoded_bytes().contains(&0) {
                return Err(WatcherError::Config(format!(
                    "path #{index} contains a NUL byte: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from(DEFAULT_PATH)],
            poll_interval_ms: 250,
            rebuild_backoff_ms: 100,
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
