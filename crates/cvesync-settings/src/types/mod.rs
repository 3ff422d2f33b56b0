//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of fields. Each type implements [`Default`]
//! with production values.

mod connection;
mod sync;

pub use connection::*;
pub use sync::*;

pub use cvesync_core::codec::CodecConfig;
pub use cvesync_core::retry::BackoffConfig;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "url": "wss://cve.example.org/ws", "userId": "u1" },
///   "connection": { "maxReconnectAttempts": 8 },
///   "cache": { "debounceMs": 500 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Server endpoint and local identity.
    pub server: ServerSettings,
    /// Connection manager tuning.
    pub connection: ConnectionSettings,
    /// Subscription registry tuning.
    pub subscription: SubscriptionSettings,
    /// Cache bridge tuning.
    pub cache: CacheSettings,
    /// Key codec rules.
    pub codec: CodecConfig,
    /// Logging output.
    pub logging: LoggingSettings,
}

impl SyncSettings {
    /// Reject combinations the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let url = self.server.url.trim();
        if url.is_empty() {
            return Err(SettingsError::invalid("server.url", url, "must not be empty"));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SettingsError::invalid(
                "server.url",
                url,
                "must be a ws:// or wss:// URL",
            ));
        }
        for (field, backoff) in [
            ("connection.backoff.maxDelayMs", &self.connection.backoff),
            ("subscription.backoff.maxDelayMs", &self.subscription.backoff),
        ] {
            if backoff.max_delay_ms < backoff.base_delay_ms {
                return Err(SettingsError::invalid(
                    field,
                    backoff.max_delay_ms,
                    "must not be below baseDelayMs",
                ));
            }
        }
        if self.connection.latency_window == 0 {
            return Err(SettingsError::invalid(
                "connection.latencyWindow",
                0,
                "must be greater than zero",
            ));
        }
        if self.subscription.max_attempts == 0 {
            return Err(SettingsError::invalid(
                "subscription.maxAttempts",
                0,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Server endpoint and local identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Id of the local user, used for optimistic subscriber updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Display name of the local user.
    pub display_name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".to_string(),
            user_id: None,
            display_name: String::new(),
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
