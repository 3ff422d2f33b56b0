//! In-memory transport.
//!
//! [`MemoryTransport`] hands out links whose other end is a
//! [`ServerConnection`] delivered through [`MemoryServer::accept`]. Used by
//! the integration tests and by embedders that want to drive the sync layer
//! without a network.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use cvesync_core::Credential;
use cvesync_core::protocol::WireFrame;

use super::{OpenError, Transport, TransportLink, TransportSignal};

#[derive(Default)]
struct Shared {
    failures: VecDeque<String>,
    opens: usize,
    last_bearer: Option<String>,
}

/// Client side of the in-memory transport.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
}

/// Test-side control of the in-memory transport.
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MemoryTransport {
    /// Create a connected transport/server pair.
    pub fn pair() -> (Self, MemoryServer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::clone(&shared),
                accept_tx,
            },
            MemoryServer { shared, accept_rx },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credential: &Credential) -> Result<TransportLink, OpenError> {
        {
            let mut shared = self.shared.lock();
            shared.opens += 1;
            shared.last_bearer = Some(credential.bearer_header());
            if let Some(reason) = shared.failures.pop_front() {
                return Err(OpenError::new(reason));
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let server_side = ServerConnection {
            from_client: out_rx,
            to_client: in_tx,
        };
        if self.accept_tx.send(server_side).is_err() {
            return Err(OpenError::new("transport error: server gone"));
        }
        Ok(TransportLink::new(out_tx, in_rx))
    }
}

impl MemoryServer {
    /// Wait for the next successful open.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }

    /// Take a pending open without waiting.
    pub fn try_accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.try_recv().ok()
    }

    /// Make the next open fail with `reason`.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.shared.lock().failures.push_back(reason.into());
    }

    /// Number of open attempts so far.
    pub fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    /// `Authorization` value of the last open attempt.
    pub fn last_bearer(&self) -> Option<String> {
        self.shared.lock().last_bearer.clone()
    }
}

/// Server end of one in-memory link.
pub struct ServerConnection {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportSignal>,
}

impl ServerConnection {
    /// Next frame sent by the client, or `None` once the client released the link.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(frame) = serde_json::from_str(&text) {
                return Some(frame);
            }
        }
    }

    /// Next frame with the given event name, skipping others.
    pub async fn recv_event(&mut self, event: &str) -> Option<WireFrame> {
        loop {
            let frame = self.recv().await?;
            if frame.event == event {
                return Some(frame);
            }
        }
    }

    /// Take every queued client frame without waiting.
    pub fn drain(&mut self) -> Vec<WireFrame> {
        std::iter::from_fn(|| self.from_client.try_recv().ok())
            .filter_map(|text| serde_json::from_str(&text).ok())
            .collect()
    }

    /// Send a frame to the client.
    pub fn send(&self, event: &str, data: Value) -> bool {
        self.send_frame(&WireFrame::new(event, data))
    }

    /// Send a prepared frame to the client.
    pub fn send_frame(&self, frame: &WireFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    /// Send raw text to the client.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportSignal::Frame(text.into())).is_ok()
    }

    /// Close the link with a reason.
    pub fn close(&self, reason: &str) {
        let _ = self.to_client.send(TransportSignal::Closed(reason.to_owned()));
    }

    /// Whether the client still holds the link.
    pub fn is_open(&self) -> bool {
        !self.to_client.is_closed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
