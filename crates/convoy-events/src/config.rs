//! Event log settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Number of most recent events kept in the log.
    pub retention: u64,
    pub prune_interval_secs: u64,
    /// SSE keep-alive comment interval.
    pub keep_alive_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention: 10_000,
            prune_interval_secs: 60,
            keep_alive_secs: 15,
        }
    }
}

impl EventsConfig {
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }
}
