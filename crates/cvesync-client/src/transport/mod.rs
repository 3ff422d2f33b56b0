//! Socket abstraction.
//!
//! A [`Transport`] opens one physical link per call. The link is a pair of
//! channels: text frames out, [`TransportSignal`]s in. The connection
//! manager owns at most one link at a time and releases it by dropping it,
//! which also aborts any background tasks the transport spawned for it.

pub mod memory;
pub mod ws;

pub use memory::{MemoryServer, MemoryTransport, ServerConnection};
pub use ws::WsTransport;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use cvesync_core::Credential;

/// Something that happened on an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSignal {
    /// A text frame arrived.
    Frame(String),
    /// The link closed. Carries a raw reason string for classification.
    Closed(String),
}

/// The transport could not open a link.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct OpenError {
    /// Raw reason string, classified by the connection manager.
    pub reason: String,
}

impl OpenError {
    /// Build an open error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An open physical link.
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportSignal>,
    tasks: Vec<AbortHandle>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl TransportLink {
    /// Wrap a channel pair.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportSignal>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie background tasks to the link's lifetime.
    #[must_use]
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = AbortHandle>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Queue a text frame. Returns `false` once the link is gone.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    /// Wait for the next signal. A link whose sender vanished without a
    /// close signal reports `transport close`.
    pub async fn next_signal(&mut self) -> TransportSignal {
        self.inbound
            .recv()
            .await
            .unwrap_or_else(|| TransportSignal::Closed("transport close".into()))
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens physical links.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link authenticated with `credential`.
    async fn open(&self, credential: &Credential) -> Result<TransportLink, OpenError>;
}
