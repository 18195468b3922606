//! Looper Configuration

use obd_connector::ConnectorOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Command looper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Wait between two initialization attempts (milliseconds)
    pub adapter_try_period_ms: u64,

    /// Entries into the same phase before a full reconnect is requested
    pub max_phase_count: u32,

    /// Window without measurements before the monitor gives up (milliseconds)
    pub max_no_data_time_ms: u64,

    /// Options handed to every connector candidate
    pub connector: ConnectorOptions,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            adapter_try_period_ms: 5000,
            max_phase_count: 2,
            max_no_data_time_ms: 60_000,
            connector: ConnectorOptions::default(),
        }
    }
}

impl LooperConfig {
    pub fn adapter_try_period(&self) -> Duration {
        Duration::from_millis(self.adapter_try_period_ms)
    }

    pub fn max_no_data_time(&self) -> Duration {
        Duration::from_millis(self.max_no_data_time_ms)
    }
}
