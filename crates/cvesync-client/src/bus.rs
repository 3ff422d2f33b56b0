//! In-process event bus.
//!
//! The connection manager publishes state changes, latency snapshots,
//! lifecycle notifications and decoded wire messages. The subscription
//! registry, the cache bridge and consumers read them. The bus exists so
//! none of those components holds a reference to another.
//!
//! Delivery is synchronous: [`EventBus::publish`] enqueues into every
//! current subscriber's unbounded channel before returning. A topic exists
//! only while it has subscribers. The only buffering is the most recent
//! value of the retaining topics ([`Topic::State`], [`Topic::Latency`]),
//! which is replayed to late subscribers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use cvesync_core::errors::SubscriptionError;
use cvesync_core::protocol::{LifecycleEvent, RequestKind};
use cvesync_core::{ResourceId, StateChange};

use crate::connection::latency::LatencySnapshot;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// What a subscriber listens to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connection state transitions. Retains the last value.
    State,
    /// Latency snapshots. Retains the last value.
    Latency,
    /// Connection lifecycle notifications.
    Lifecycle,
    /// Decoded inbound wire messages with the given event name.
    Message(String),
    /// Subscription requests that failed terminally.
    SubscriptionFailed,
}

impl Topic {
    /// Topic for an inbound event name.
    pub fn message(event: impl Into<String>) -> Self {
        Self::Message(event.into())
    }

    fn retains_last(&self) -> bool {
        matches!(self, Self::State | Self::Latency)
    }
}

/// A decoded inbound wire message.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    /// Event name.
    pub event: String,
    /// Payload with camelCase keys.
    pub data: Value,
}

/// A subscription request that reached a terminal failure.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionFailure {
    /// Resource concerned.
    pub resource_id: ResourceId,
    /// Request that failed.
    pub kind: RequestKind,
    /// Why.
    pub error: SubscriptionError,
}

/// Everything that travels on the bus.
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    /// Connection state transition.
    StateChanged(StateChange),
    /// New latency snapshot.
    Latency(LatencySnapshot),
    /// Lifecycle notification.
    Lifecycle(LifecycleEvent),
    /// Inbound wire message.
    Message(InboundMessage),
    /// Terminal subscription failure.
    SubscriptionFailed(SubscriptionFailure),
}

impl BusEvent {
    /// Topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::StateChanged(_) => Topic::State,
            Self::Latency(_) => Topic::Latency,
            Self::Lifecycle(_) => Topic::Lifecycle,
            Self::Message(m) => Topic::Message(m.event.clone()),
            Self::SubscriptionFailed(_) => Topic::SubscriptionFailed,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<Topic, Vec<Listener>>,
    retained: HashMap<Topic, BusEvent>,
    next_id: u64,
}

/// Cloneable handle to the shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topic_count())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every current subscriber of its topic.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let mut state = self.state.lock();
        if topic.retains_last() {
            let _ = state.retained.insert(topic.clone(), event.clone());
        }
        let Some(listeners) = state.topics.get_mut(&topic) else {
            return 0;
        };
        listeners.retain(|l| l.tx.send(event.clone()).is_ok());
        let delivered = listeners.len();
        if delivered == 0 {
            let _ = state.topics.remove(&topic);
        }
        delivered
    }

    /// Subscribe to one topic.
    pub fn subscribe(&self, topic: Topic) -> BusSubscription {
        self.subscribe_many([topic])
    }

    /// Subscribe to several topics through one handle.
    ///
    /// Events arrive in publish order across all topics. Retained values are
    /// replayed first, in the order the topics were given.
    pub fn subscribe_many(&self, topics: impl IntoIterator<Item = Topic>) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let mut registered = Vec::new();
        for topic in topics {
            if registered.contains(&topic) {
                continue;
            }
            if let Some(last) = state.retained.get(&topic) {
                let _ = tx.send(last.clone());
            }
            state.topics.entry(topic.clone()).or_default().push(Listener {
                id,
                tx: tx.clone(),
            });
            registered.push(topic);
        }

        BusSubscription {
            id,
            topics: registered,
            rx,
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Most recent value of a retaining topic.
    pub fn last(&self, topic: &Topic) -> Option<BusEvent> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.state.lock().topics.len()
    }

    /// Number of subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state.lock().topics.get(topic).map_or(0, Vec::len)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription handle
// ─────────────────────────────────────────────────────────────────────────────

/// Receiving end of a bus subscription.
///
/// Dropping the handle (or calling [`close`](Self::close)) unregisters it.
pub struct BusSubscription {
    id: u64,
    topics: Vec<Topic>,
    rx: mpsc::UnboundedReceiver<BusEvent>,
    bus: Weak<Mutex<BusState>>,
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl BusSubscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<BusEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Topics this handle listens to.
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Unregister now.
    pub fn close(self) {
        drop(self);
    }

    fn unregister(&mut self) {
        let Some(state) = self.bus.upgrade() else {
            return;
        };
        let mut state = state.lock();
        for topic in &self.topics {
            if let Some(listeners) = state.topics.get_mut(topic) {
                listeners.retain(|l| l.id != self.id);
                if listeners.is_empty() {
                    let _ = state.topics.remove(topic);
                }
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl Stream for BusSubscription {
    type Item = BusEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
