//! Per-resource subscription record.

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use cvesync_core::errors::SubscriptionError;
use cvesync_core::protocol::{RequestKind, Subscriber, SubscriptionState};
use cvesync_core::{CorrelationId, ResourceId};

pub(super) type Waiter = oneshot::Sender<Result<(), SubscriptionError>>;

/// The request currently on the wire for a resource.
#[derive(Clone, Debug)]
pub(super) struct InFlight {
    pub(super) correlation_id: CorrelationId,
    pub(super) kind: RequestKind,
    pub(super) attempt: u32,
}

impl InFlight {
    pub(super) fn target(&self) -> SubscriptionState {
        match self.kind {
            RequestKind::Unsubscribe => SubscriptionState::Unsubscribed,
            RequestKind::Subscribe | RequestKind::Ping => SubscriptionState::Subscribed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum TimerKind {
    AckTimeout,
    Retry { attempt: u32 },
    FollowUp,
}

pub(super) struct Timer {
    pub(super) token: u64,
    pub(super) kind: TimerKind,
    pub(super) handle: AbortHandle,
}

pub(super) struct Record {
    pub(super) desired: SubscriptionState,
    pub(super) confirmed: SubscriptionState,
    pub(super) subscribers: Vec<Subscriber>,
    pub(super) confirmed_subscribers: Vec<Subscriber>,
    pub(super) pending: bool,
    pub(super) in_flight: Option<InFlight>,
    pub(super) last_request_at: Option<Instant>,
    pub(super) retry_count: u32,
    pub(super) waiters: Vec<Waiter>,
    pub(super) timer: Option<Timer>,
}

impl Record {
    pub(super) fn new() -> Self {
        Self {
            desired: SubscriptionState::Unsubscribed,
            confirmed: SubscriptionState::Unsubscribed,
            subscribers: Vec::new(),
            confirmed_subscribers: Vec::new(),
            pending: false,
            in_flight: None,
            last_request_at: None,
            retry_count: 0,
            waiters: Vec::new(),
            timer: None,
        }
    }

    /// Add or remove the local user from the visible list.
    pub(super) fn apply_optimistic(&mut self, local: Option<&Subscriber>, want: SubscriptionState) {
        let Some(local) = local else {
            return;
        };
        match want {
            SubscriptionState::Subscribed => {
                if !self.subscribers.iter().any(|s| s.id == local.id) {
                    self.subscribers.push(local.clone());
                }
            }
            SubscriptionState::Unsubscribed => {
                self.subscribers.retain(|s| s.id != local.id);
            }
        }
    }

    /// Replace both lists with the server's.
    pub(super) fn set_server_subscribers(&mut self, subscribers: Vec<Subscriber>) {
        self.confirmed_subscribers = subscribers;
        self.subscribers.clone_from(&self.confirmed_subscribers);
    }

    /// Undo optimistic changes.
    pub(super) fn roll_back(&mut self) {
        self.desired = self.confirmed;
        self.subscribers.clone_from(&self.confirmed_subscribers);
    }

    pub(super) fn resolve(&mut self, outcome: &Result<(), SubscriptionError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    pub(super) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    pub(super) fn has_follow_up(&self) -> bool {
        self.timer
            .as_ref()
            .is_some_and(|t| t.kind == TimerKind::FollowUp)
    }

    /// Nothing left to track: unsubscribed, settled and nobody waiting.
    pub(super) fn is_idle(&self) -> bool {
        self.desired == SubscriptionState::Unsubscribed
            && self.confirmed == SubscriptionState::Unsubscribed
            && !self.pending
            && self.timer.is_none()
            && self.waiters.is_empty()
    }

    pub(super) fn snapshot(&self, resource_id: &ResourceId) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            resource_id: resource_id.clone(),
            desired: self.desired,
            confirmed: self.confirmed,
            pending: self.pending,
            retry_count: self.retry_count,
            subscribers: self.subscribers.clone(),
        }
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Read-only view of one resource's subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    /// Resource id.
    pub resource_id: ResourceId,
    /// What the caller last asked for.
    pub desired: SubscriptionState,
    /// What the server last confirmed.
    pub confirmed: SubscriptionState,
    /// A request is outstanding or stalled.
    pub pending: bool,
    /// Retries made for the current request.
    pub retry_count: u32,
    /// Visible watchers, optimistic changes included.
    pub subscribers: Vec<Subscriber>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
