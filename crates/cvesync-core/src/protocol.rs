//! Wire protocol types.
//!
//! Every frame on the socket is a JSON text frame shaped like
//! `{ "event": "...", "data": ..., "id": "..." }`. Payloads travel in
//! `snake_case` on the wire and are decoded to camelCase by the codec before
//! anything else sees them, so the payload structs here are camelCase.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::ids::{CorrelationId, ResourceId, SubscriberId};

// ─────────────────────────────────────────────────────────────────────────────
// Event names
// ─────────────────────────────────────────────────────────────────────────────

/// Event names used on the wire.
pub mod events {
    /// Client → server: start watching a resource.
    pub const SUBSCRIBE: &str = "subscribe_cve";
    /// Client → server: stop watching a resource.
    pub const UNSUBSCRIBE: &str = "unsubscribe_cve";
    /// Client → server latency probe.
    pub const PING: &str = "ping";
    /// Server → client latency probe answer.
    pub const PONG: &str = "pong";
    /// Server acknowledgement of a subscribe/unsubscribe request.
    pub const SUBSCRIPTION_STATUS: &str = "subscription_status";
    /// Out-of-band change of a resource's watcher list.
    pub const SUBSCRIBERS_UPDATED: &str = "subscribers_updated";
    /// A resource was created.
    pub const RESOURCE_CREATED: &str = "resource_created";
    /// A resource was updated.
    pub const RESOURCE_UPDATED: &str = "resource_updated";
    /// A resource was deleted.
    pub const RESOURCE_DELETED: &str = "resource_deleted";
    /// A crawler run touched many records at once.
    pub const CRAWLER_COMPLETED: &str = "crawler_completed";
    /// Server-initiated close, carries a reason string.
    pub const DISCONNECT: &str = "disconnect";
    /// Server rejected the connection, carries a reason string.
    pub const CONNECT_ERROR: &str = "connect_error";
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A single frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Optional frame id (ping/pong correlation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl WireFrame {
    /// Build a frame without an id.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
        }
    }

    /// Attach a frame id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Kind of an outbound request awaiting an answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// `subscribe_cve`.
    Subscribe,
    /// `unsubscribe_cve`.
    Unsubscribe,
    /// `ping`.
    Ping,
}

impl RequestKind {
    /// Wire event name for this request.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Subscribe => events::SUBSCRIBE,
            Self::Unsubscribe => events::UNSUBSCRIBE,
            Self::Ping => events::PING,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription payloads
// ─────────────────────────────────────────────────────────────────────────────

/// A user watching a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    /// User id.
    pub id: SubscriberId,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Subscriber {
    /// Subscriber with only an id.
    pub fn with_id(id: impl Into<SubscriberId>) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            avatar: None,
        }
    }
}

/// Server-side state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// The client is watching the resource.
    Subscribed,
    /// The client is not watching the resource.
    Unsubscribed,
}

impl SubscriptionState {
    /// Request that moves the server toward this state.
    pub fn request_kind(self) -> RequestKind {
        match self {
            Self::Subscribed => RequestKind::Subscribe,
            Self::Unsubscribed => RequestKind::Unsubscribe,
        }
    }
}

/// `subscription_status` acknowledgement payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    /// Resource the acknowledgement refers to.
    pub resource_id: ResourceId,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Server-confirmed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionState>,
    /// Authoritative watcher list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<Vec<Subscriber>>,
    /// Error payload (string or `{ code, message }`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Echo of the request's correlation id, when the server supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// `subscribers_updated` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribersUpdated {
    /// Resource whose watcher list changed.
    pub resource_id: ResourceId,
    /// New watcher list.
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
    /// Server timestamp, used for de-duplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl SubscribersUpdated {
    /// Server time of the update.
    ///
    /// Accepts RFC 3339 strings and epoch numbers. Numbers below 10^11 are
    /// seconds, larger ones milliseconds.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        match self.timestamp.as_ref()? {
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    trace!(timestamp = %s, error = %e, "timestamp is not RFC 3339");
                    None
                }
            },
            Value::Number(n) => {
                let n = n.as_i64()?;
                if n.abs() < EPOCH_MILLIS_THRESHOLD {
                    DateTime::from_timestamp(n, 0)
                } else {
                    DateTime::from_timestamp_millis(n)
                }
            }
            _ => None,
        }
    }

    /// Dedup key for the event timestamp. Missing timestamps never collide.
    ///
    /// Timestamps that parse compare as instants, so the same moment written
    /// with different offsets is one key. Anything else compares verbatim.
    pub fn timestamp_key(&self) -> Option<String> {
        if let Some(at) = self.server_time() {
            return Some(at.timestamp_millis().to_string());
        }
        match &self.timestamp {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// First successful open.
    Connect,
    /// Link lost or closed.
    Disconnect {
        /// Raw reason string.
        reason: String,
    },
    /// Open failed.
    ConnectError {
        /// Raw reason string.
        reason: String,
    },
    /// A reconnect attempt is about to start.
    ReconnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Reconnect attempts exhausted.
    ReconnectFailed,
    /// Reconnected after `attempt` attempts.
    Reconnect {
        /// Number of attempts it took.
        attempt: u32,
    },
}

/// Classified cause of a closed or failed link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side closed the link on purpose.
    ClientDisconnect,
    /// The server or transport closed the link.
    TransportClosed,
    /// Heartbeat timed out.
    PingTimeout,
    /// Low-level transport failure.
    TransportError(String),
    /// Credential rejected.
    Unauthorized(String),
    /// Host connectivity lost.
    Offline,
    /// Anything else.
    Other(String),
}

impl DisconnectReason {
    /// Classify a raw reason string.
    ///
    /// Connectivity wins: when the host is offline every failure is a
    /// network failure regardless of what the transport reported.
    pub fn classify(raw: &str, online: bool) -> Self {
        if !online {
            return Self::Offline;
        }
        let lower = raw.to_ascii_lowercase();
        match lower.as_str() {
            "io client disconnect" => Self::ClientDisconnect,
            "io server disconnect" | "transport close" => Self::TransportClosed,
            "ping timeout" => Self::PingTimeout,
            "offline" | "network error" => Self::Offline,
            _ if lower.starts_with("transport error") => Self::TransportError(raw.to_owned()),
            _ if is_auth_failure(&lower) => Self::Unauthorized(raw.to_owned()),
            _ => Self::Other(raw.to_owned()),
        }
    }

    /// Wire-style reason string for lifecycle events.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::ClientDisconnect => "io client disconnect",
            Self::TransportClosed => "transport close",
            Self::PingTimeout => "ping timeout",
            Self::Offline => "offline",
            Self::TransportError(raw) | Self::Unauthorized(raw) | Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Auth wording, or a 401/403 status standing as its own token.
fn is_auth_failure(lower: &str) -> bool {
    ["unauthorized", "forbidden", "invalid token"]
        .iter()
        .any(|needle| lower.contains(needle))
        || lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "401" || token == "403")
}

/// Pull a reason string out of a server `disconnect`/`connect_error` payload.
pub fn reason_from_payload(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("reason")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("io server disconnect")
            .to_owned(),
        _ => "io server disconnect".to_owned(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
