//! Runtime configuration derived from [`SyncSettings`].
//!
//! Settings are serde-friendly millisecond integers. The runtime works with
//! [`Duration`]s, so each component gets a small config struct built here.

use std::time::Duration;

use cvesync_core::protocol::Subscriber;
use cvesync_core::retry::BackoffConfig;
use cvesync_settings::SyncSettings;

/// Connection manager configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Reconnect delay parameters.
    pub backoff: BackoffConfig,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Upper bound on a single transport open.
    pub connect_timeout: Duration,
    /// Interval between latency probes.
    pub latency_interval: Duration,
    /// Probe timeout.
    pub ping_timeout: Duration,
    /// Latency samples kept.
    pub latency_window: usize,
    /// Quiet period after connectivity returns.
    pub network_restore_debounce: Duration,
    /// Frames buffered by `emit` while disconnected.
    pub max_offline_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for ConnectionConfig {
    fn from(settings: &SyncSettings) -> Self {
        let c = &settings.connection;
        Self {
            backoff: c.backoff,
            max_reconnect_attempts: c.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            latency_interval: Duration::from_millis(c.latency_interval_ms),
            ping_timeout: Duration::from_millis(c.ping_timeout_ms),
            latency_window: c.latency_window.max(1),
            network_restore_debounce: Duration::from_millis(c.network_restore_debounce_ms),
            max_offline_queue: c.max_offline_queue,
        }
    }
}

/// Subscription registry configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Coalescing window per resource.
    pub coalesce_window: Duration,
    /// Time to wait for an acknowledgement.
    pub request_timeout: Duration,
    /// Total attempts per request.
    pub max_attempts: u32,
    /// Retry delay parameters.
    pub backoff: BackoffConfig,
    /// `subscribers_updated` dedup capacity.
    pub dedup_window: usize,
    /// The local user, added/removed optimistically.
    pub local_user: Option<Subscriber>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for RegistryConfig {
    fn from(settings: &SyncSettings) -> Self {
        let s = &settings.subscription;
        let local_user = settings.server.user_id.as_ref().map(|id| Subscriber {
            id: id.as_str().into(),
            display_name: settings.server.display_name.clone(),
            avatar: None,
        });
        Self {
            coalesce_window: Duration::from_millis(s.coalesce_window_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            max_attempts: s.max_attempts.max(1),
            backoff: s.backoff,
            dedup_window: s.dedup_window,
            local_user,
        }
    }
}

/// Cache bridge configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Invalidation debounce window.
    pub debounce: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for BridgeConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.cache.debounce_ms),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
