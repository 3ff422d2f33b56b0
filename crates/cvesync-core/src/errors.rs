//! Error taxonomy for the sync layer.
//!
//! - [`ConnectionError`]: returned by connection manager operations
//! - [`SubscriptionError`]: outcome of a failed subscribe/unsubscribe, with
//!   retry classification
//! - [`CacheApplyError`]: raised by cache implementations, always recovered
//!   locally by the bridge

use serde_json::Value;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionError
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from connection manager operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// `connect` was called without a credential.
    #[error("no credential available")]
    MissingCredential,
    /// The operation needs an open link.
    #[error("not connected")]
    NotConnected,
    /// The manager has been shut down.
    #[error("connection manager shut down")]
    Shutdown,
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// A frame could not be serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ConnectionError {
    /// Stable error kind string for logs and metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::NotConnected => "not_connected",
            Self::Shutdown => "shutdown",
            Self::Transport(_) => "transport",
            Self::Codec(_) => "codec",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SubscriptionError
// ─────────────────────────────────────────────────────────────────────────────

/// Why a subscribe/unsubscribe did not reach the desired state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The server refused on permission grounds.
    #[error("permission denied: {0}")]
    Permission(String),
    /// No acknowledgement arrived in time.
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout {
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// Network-class failure reported by the server.
    #[error("network error: {0}")]
    Network(String),
    /// Server-side failure.
    #[error("[{code}] {message}")]
    Server {
        /// Error code from the payload.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// The server confirmed a different state than the one requested.
    #[error("server confirmed a different state")]
    Rejected,
    /// A later call for the same resource replaced this one before the
    /// server answered.
    #[error("superseded by a later request for the same resource")]
    Superseded,
    /// The registry has been shut down.
    #[error("subscription registry shut down")]
    Shutdown,
}

impl SubscriptionError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::Server { code, .. } => is_server_class(code),
            Self::Permission(_) | Self::Rejected | Self::Superseded | Self::Shutdown => false,
        }
    }

    /// Stable error kind string for logs and metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Permission(_) => "permission",
            Self::Timeout { .. } => "timeout",
            Self::Network(_) => "network",
            Self::Server { .. } => "server",
            Self::Rejected => "rejected",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }

    /// Classify the `error` field of a `subscription_status` payload.
    ///
    /// Accepts a bare string or an object with `code`/`status` and
    /// `message` fields.
    pub fn from_payload(error: Option<&Value>) -> Self {
        let (code, message) = match error {
            Some(Value::String(s)) => (s.clone(), s.clone()),
            Some(Value::Object(map)) => {
                let code = map
                    .get("code")
                    .or_else(|| map.get("status"))
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                (code, message)
            }
            Some(other) => (other.to_string(), other.to_string()),
            None => (String::new(), "subscription request failed".to_owned()),
        };

        let haystack = format!("{code} {message}").to_ascii_lowercase();
        if ["permission", "forbidden", "unauthorized", "403", "401", "not allowed"]
            .iter()
            .any(|needle| haystack.contains(needle))
        {
            return Self::Permission(message);
        }
        if haystack.contains("timeout") || haystack.contains("timed out") {
            return Self::Timeout { attempts: 1 };
        }
        if haystack.contains("network") || haystack.contains("unavailable") {
            return Self::Network(message);
        }
        let code = if code.is_empty() { "500".to_owned() } else { code };
        Self::Server { code, message }
    }
}

fn is_server_class(code: &str) -> bool {
    if let Ok(n) = code.parse::<u16>() {
        return (500..600).contains(&n);
    }
    let lower = code.to_ascii_lowercase();
    lower.contains("internal") || lower.contains("server") || lower.contains("unavailable")
}

// ─────────────────────────────────────────────────────────────────────────────
// CacheApplyError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure while applying an operation to the external cache.
#[derive(Debug, Error)]
#[error("cache {op} failed for {key}: {message}")]
pub struct CacheApplyError {
    /// Operation name (`invalidate`, `patch`, `evict`).
    pub op: &'static str,
    /// Rendered cache key.
    pub key: String,
    /// Cause.
    pub message: String,
}

impl CacheApplyError {
    /// Build a cache error.
    pub fn new(op: &'static str, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            op,
            key: key.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn permission_is_terminal() {
        let err = SubscriptionError::from_payload(Some(&json!({
            "code": "forbidden",
            "message": "you cannot watch this record"
        })));
        assert_matches!(err, SubscriptionError::Permission(_));
        assert!(!err.is_retryable());
        assert_eq!(err.error_kind(), "permission");
    }

    #[test]
    fn numeric_403_is_permission() {
        let err = SubscriptionError::from_payload(Some(&json!({"status": 403})));
        assert_matches!(err, SubscriptionError::Permission(_));
    }

    #[test]
    fn five_hundred_is_retryable() {
        let err = SubscriptionError::from_payload(Some(&json!({"code": 503, "message": "busy"})));
        assert_matches!(err, SubscriptionError::Server { ref code, .. } if code == "503");
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_string_is_retryable() {
        let err = SubscriptionError::from_payload(Some(&json!("upstream timeout")));
        assert_matches!(err, SubscriptionError::Timeout { .. });
        assert!(err.is_retryable());
    }

    #[test]
    fn network_is_retryable() {
        let err = SubscriptionError::from_payload(Some(&json!("network unreachable")));
        assert_matches!(err, SubscriptionError::Network(_));
        assert!(err.is_retryable());
    }

    #[test]
    fn client_error_code_is_terminal() {
        let err = SubscriptionError::from_payload(Some(&json!({"code": 404, "message": "no such cve"})));
        assert_matches!(err, SubscriptionError::Server { .. });
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_error_defaults_to_server() {
        let err = SubscriptionError::from_payload(None);
        assert_matches!(err, SubscriptionError::Server { ref code, .. } if code == "500");
        assert!(err.is_retryable());
    }

    #[test]
    fn rejected_and_shutdown_are_terminal() {
        assert!(!SubscriptionError::Rejected.is_retryable());
        assert!(!SubscriptionError::Shutdown.is_retryable());
        assert!(!SubscriptionError::Superseded.is_retryable());
        assert_eq!(SubscriptionError::Superseded.error_kind(), "superseded");
    }

    #[test]
    fn timeout_display() {
        let err = SubscriptionError::Timeout { attempts: 3 };
        assert_eq!(err.to_string(), "request timed out after 3 attempt(s)");
    }

    #[test]
    fn connection_error_kinds() {
        assert_eq!(ConnectionError::MissingCredential.error_kind(), "missing_credential");
        assert_eq!(ConnectionError::NotConnected.to_string(), "not connected");
        let json_err = serde_json::from_str::<Value>("nope").unwrap_err();
        assert_eq!(ConnectionError::from(json_err).error_kind(), "codec");
    }

    #[test]
    fn cache_error_display() {
        let err = CacheApplyError::new("patch", "cve:detail:CVE-1", "store closed");
        assert_eq!(
            err.to_string(),
            "cache patch failed for cve:detail:CVE-1: store closed"
        );
    }
}
