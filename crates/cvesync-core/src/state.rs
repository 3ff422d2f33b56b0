//! Connection state machine vocabulary.
//!
//! The state enum is owned by the connection manager in `cvesync-client`.
//! Everything else observes it through [`StateChange`] events on the bus.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::DisconnectReason;

/// State of the shared real-time connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state and the state after an intentional disconnect.
    #[default]
    Disconnected,
    /// Transport open in progress.
    Connecting,
    /// Transport open and usable.
    Connected,
    /// Waiting for the next reconnect attempt.
    Reconnecting,
    /// Server or transport closed the link.
    TransportClosed,
    /// Heartbeat timed out.
    PingTimeout,
    /// Low-level transport failure.
    TransportError,
    /// Credential missing or rejected. Terminal until a new credential is supplied.
    AuthError,
    /// Host connectivity lost. No attempts until connectivity returns.
    NetworkError,
    /// Unclassified failure.
    GenericError,
}

impl ConnectionState {
    /// Whether this is one of the failure states.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::TransportClosed
                | Self::PingTimeout
                | Self::TransportError
                | Self::AuthError
                | Self::NetworkError
                | Self::GenericError
        )
    }

    /// Whether a reconnect attempt may be scheduled from this state without
    /// outside help (fresh credential or restored connectivity).
    pub fn is_retryable(self) -> bool {
        self.is_failure() && !matches!(self, Self::AuthError | Self::NetworkError)
    }

    /// Failure state a classified disconnect reason maps to.
    pub fn from_reason(reason: &DisconnectReason) -> Self {
        match reason {
            DisconnectReason::ClientDisconnect => Self::Disconnected,
            DisconnectReason::TransportClosed => Self::TransportClosed,
            DisconnectReason::PingTimeout => Self::PingTimeout,
            DisconnectReason::TransportError(_) => Self::TransportError,
            DisconnectReason::Unauthorized(_) => Self::AuthError,
            DisconnectReason::Offline => Self::NetworkError,
            DisconnectReason::Other(_) => Self::GenericError,
        }
    }

    /// Stable `snake_case` name, used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::TransportClosed => "transport_closed",
            Self::PingTimeout => "ping_timeout",
            Self::TransportError => "transport_error",
            Self::AuthError => "auth_error",
            Self::NetworkError => "network_error",
            Self::GenericError => "generic_error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub current: ConnectionState,
}

impl StateChange {
    /// Whether this transition entered `Connected` from another state.
    pub fn entered_connected(&self) -> bool {
        self.current == ConnectionState::Connected && self.previous != ConnectionState::Connected
    }

    /// Whether this transition left `Connected`.
    pub fn left_connected(&self) -> bool {
        self.previous == ConnectionState::Connected && self.current != ConnectionState::Connected
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
