//! Connection manager.
//!
//! [`ConnectionManager`] is a cheap handle to a driver task that owns the
//! physical link and the reconnect state machine. Commands go in over a
//! channel. State changes, latency snapshots, lifecycle notifications and
//! decoded inbound messages come out on the [`EventBus`]. Read-only views
//! ([`state`](ConnectionManager::state), [`latency`](ConnectionManager::latency),
//! [`metrics`](ConnectionManager::metrics)) are served from shared memory
//! the driver updates.

mod driver;
pub mod latency;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use cvesync_core::codec::Codec;
use cvesync_core::errors::ConnectionError;
use cvesync_core::protocol::WireFrame;
use cvesync_core::{ConnectionState, Credential};

use crate::bus::EventBus;
use crate::config::ConnectionConfig;
use crate::transport::Transport;

use self::driver::Driver;
use self::latency::LatencySnapshot;

/// Counters kept by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    /// Transport opens started.
    pub connect_attempts: u64,
    /// Reconnect attempts started.
    pub reconnect_attempts: u64,
    /// Frames received.
    pub frames_in: u64,
    /// Frames written.
    pub frames_out: u64,
    /// Frames discarded (not connected, queue overflow, malformed).
    pub dropped_frames: u64,
    /// Frames waiting in the offline emit queue.
    pub queued_frames: usize,
    /// Time of the last inbound frame.
    pub last_activity: Option<DateTime<Utc>>,
}

pub(crate) struct Shared {
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) latency: RwLock<LatencySnapshot>,
    pub(crate) metrics: Mutex<ConnectionMetrics>,
}

pub(crate) enum Command {
    Connect {
        credential: Option<Credential>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        frame: WireFrame,
    },
    Emit {
        frame: WireFrame,
    },
    SetOnline(bool),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Where the subscription registry sends its requests.
pub trait OutboundSink: Send + Sync {
    /// Whether requests can currently go out.
    fn is_connected(&self) -> bool;

    /// Send a request frame. Fails with [`ConnectionError::NotConnected`]
    /// unless the connection is up.
    fn send_request(&self, event: &str, payload: Value) -> Result<(), ConnectionError>;
}

/// Handle to the shared connection.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Start the driver task. Must be called inside a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        codec: Arc<Codec>,
        bus: EventBus,
        config: ConnectionConfig,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            latency: RwLock::new(LatencySnapshot::default()),
            metrics: Mutex::new(ConnectionMetrics::default()),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(
            transport,
            codec,
            bus,
            config,
            Arc::clone(&shared),
            command_rx,
        );
        let task = tokio::spawn(driver.run());
        (Self { commands, shared }, task)
    }

    /// Open the connection with `credential`.
    ///
    /// A no-op while `Connected` or `Connecting`. Without a credential the
    /// state becomes `AuthError` and [`ConnectionError::MissingCredential`]
    /// is returned. Otherwise the open proceeds in the background and state
    /// changes are published on the bus.
    pub async fn connect(&self, credential: Option<Credential>) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { credential, reply })
            .map_err(|_| ConnectionError::Shutdown)?;
        rx.await.map_err(|_| ConnectionError::Shutdown)?
    }

    /// Intentionally close the connection. Never triggers a reconnect.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a frame now, or queue it until the next connect.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Emit {
                frame: WireFrame::new(event, payload),
            })
            .map_err(|_| ConnectionError::Shutdown)
    }

    /// Report host connectivity.
    pub fn set_online(&self, online: bool) {
        let _ = self.commands.send(Command::SetOnline(online));
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Current latency snapshot.
    pub fn latency(&self) -> LatencySnapshot {
        self.shared.latency.read().clone()
    }

    /// Current counters.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.metrics.lock().clone()
    }

    /// Tear down the link and stop the driver.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl OutboundSink for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send_request(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.commands
            .send(Command::Send {
                frame: WireFrame::new(event, payload),
            })
            .map_err(|_| ConnectionError::Shutdown)
    }
}
