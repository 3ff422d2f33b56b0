//! Subscription registry and cache bridge settings.

use serde::{Deserialize, Serialize};

use cvesync_core::retry::BackoffConfig;

/// Subscription registry tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionSettings {
    /// Requests for one resource closer together than this are coalesced.
    pub coalesce_window_ms: u64,
    /// Time to wait for `subscription_status` before retrying.
    pub request_timeout_ms: u64,
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    /// Retry delay parameters.
    pub backoff: BackoffConfig,
    /// `subscribers_updated` events remembered for de-duplication.
    pub dedup_window: usize,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 1_000,
            request_timeout_ms: 5_000,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            dedup_window: 256,
        }
    }
}

/// Cache bridge tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Invalidation debounce per (event, key), in milliseconds.
    pub debounce_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}
