//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thermowire_core::DEFAULT_RESOLUTION;

/// Default period between probe cycles
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;

/// Shortest period the scheduler accepts
pub const MIN_POLL_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the probe + value refresh cycle in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Resolution written to every newly attached sensor, in bits
    #[serde(default = "default_resolution")]
    pub default_resolution: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            default_resolution: default_resolution(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_resolution() -> u8 {
    DEFAULT_RESOLUTION
}
