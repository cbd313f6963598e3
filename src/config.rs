//! Registry-wide tracker defaults.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, IdleResult};

/// Default inactivity timeout: five seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default per-stream buffer size.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// Defaults applied to trackers created by a registry.
///
/// # Examples
///
/// ```
/// use idlewatch::TrackerConfig;
///
/// let config = TrackerConfig::from_json(r#"{ "timeout_ms": 3000 }"#).unwrap();
/// assert_eq!(config.timeout_ms, 3000);
/// assert!(!config.sync_presentation);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Inactivity timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whether new trackers mirror their state to the presentation sink.
    pub sync_presentation: bool,
    /// Buffer size of streams created by `Tracker::subscribe`.
    pub stream_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            sync_presentation: false,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

impl TrackerConfig {
    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the document is not valid JSON or a
    /// field has the wrong type.
    pub fn from_json(json: &str) -> IdleResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ConfigError::Parse {
                message: e.to_string(),
            }
            .into()
        })
    }
}
