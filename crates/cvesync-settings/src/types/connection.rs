//! Connection manager settings.

use serde::{Deserialize, Serialize};

use cvesync_core::retry::BackoffConfig;

/// Connection manager tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Reconnect delay parameters.
    pub backoff: BackoffConfig,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Upper bound on a single transport open, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Interval between latency probes while connected.
    pub latency_interval_ms: u64,
    /// A probe unanswered for this long counts as a timeout sample.
    pub ping_timeout_ms: u64,
    /// Number of latency samples kept.
    pub latency_window: usize,
    /// Quiet period after connectivity returns before reconnecting.
    pub network_restore_debounce_ms: u64,
    /// Frames buffered by `emit` while disconnected.
    pub max_offline_queue: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
            latency_interval_ms: 60_000,
            ping_timeout_ms: 5_000,
            latency_window: 10,
            network_restore_debounce_ms: 2_000,
            max_offline_queue: 100,
        }
    }
}
