//! Tunables for synchronized boards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds between connectivity checks while a board is synchronized.
pub const DEFAULT_STATUS_POLL_INTERVAL_SECS: u64 = 5;

/// Maximum number of undo snapshots kept per board.
pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// How often [`crate::SyncSession::poll`] re-queries connectivity.
    pub status_poll_interval: Duration,
    /// History capacity. `None` keeps every snapshot.
    pub max_history: Option<usize>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(DEFAULT_STATUS_POLL_INTERVAL_SECS),
            max_history: Some(DEFAULT_MAX_HISTORY),
        }
    }
}

impl SyncSettings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
