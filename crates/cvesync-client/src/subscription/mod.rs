//! Subscription registry.
//!
//! Tracks, per resource, what the caller wants (`desired`), what the server
//! last confirmed (`confirmed`) and who is watching. Requests go out through
//! an [`OutboundSink`]; acknowledgements, watcher updates and connection
//! state changes come back through [`handle_bus_event`], normally driven by
//! the task started with [`spawn_listener`].
//!
//! Rules worth knowing:
//!
//! - Calls for the same resource within the coalescing window collapse into
//!   one wire request. The last call wins.
//! - Acks are matched by correlation id, falling back to the resource when
//!   the server does not echo one.
//! - While disconnected, requests stall. Every entry into `Connected`
//!   re-issues one subscribe per resource the caller still wants.
//!
//! [`handle_bus_event`]: SubscriptionRegistry::handle_bus_event
//! [`spawn_listener`]: SubscriptionRegistry::spawn_listener

mod record;

pub use record::SubscriptionSnapshot;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cvesync_core::errors::{ConnectionError, SubscriptionError};
use cvesync_core::protocol::{
    RequestKind, Subscriber, SubscribersUpdated, SubscriptionState, SubscriptionStatus, events,
};
use cvesync_core::{CorrelationId, ResourceId};

use crate::bus::{BusEvent, EventBus, InboundMessage, SubscriptionFailure, Topic};
use crate::config::RegistryConfig;
use crate::connection::OutboundSink;

use self::record::{InFlight, Record, Timer, TimerKind};

type Reply = oneshot::Receiver<Result<(), SubscriptionError>>;

#[derive(Default)]
struct Table {
    records: HashMap<ResourceId, Record>,
    seen_updates: VecDeque<(ResourceId, String)>,
    closed: bool,
}

impl Table {
    fn collect(&mut self, id: &ResourceId) {
        if self.records.get(id).is_some_and(Record::is_idle) {
            let _ = self.records.remove(id);
        }
    }
}

struct Inner {
    sink: Arc<dyn OutboundSink>,
    bus: EventBus,
    config: RegistryConfig,
    table: Mutex<Table>,
    connected: AtomicBool,
    next_token: AtomicU64,
}

/// Cloneable handle to the registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("resources", &self.inner.table.lock().records.len())
            .field("connected", &self.inner.connected.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry that sends through `sink` and reports terminal
    /// failures on `bus`.
    ///
    /// The registry starts out assuming it is disconnected. It learns
    /// otherwise from the first `StateChanged` event it handles.
    pub fn new(sink: Arc<dyn OutboundSink>, bus: EventBus, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                bus,
                config,
                table: Mutex::new(Table::default()),
                connected: AtomicBool::new(false),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Start watching a resource.
    ///
    /// Resolves once the server acknowledges, immediately when nothing needs
    /// to go on the wire, or with the terminal error after retries run out.
    pub async fn subscribe(&self, resource_id: impl Into<ResourceId>) -> Result<(), SubscriptionError> {
        self.request(resource_id.into(), SubscriptionState::Subscribed)
            .await
    }

    /// Stop watching a resource. Unknown resources resolve `Ok`.
    pub async fn unsubscribe(&self, resource_id: impl Into<ResourceId>) -> Result<(), SubscriptionError> {
        self.request(resource_id.into(), SubscriptionState::Unsubscribed)
            .await
    }

    async fn request(&self, id: ResourceId, want: SubscriptionState) -> Result<(), SubscriptionError> {
        match self.inner.begin(id, want)? {
            None => Ok(()),
            Some(reply) => reply.await.unwrap_or(Err(SubscriptionError::Shutdown)),
        }
    }

    /// Visible watchers of a resource. Empty for unknown resources.
    pub fn subscribers(&self, resource_id: &ResourceId) -> Vec<Subscriber> {
        self.inner
            .table
            .lock()
            .records
            .get(resource_id)
            .map(|r| r.subscribers.clone())
            .unwrap_or_default()
    }

    /// State of one resource.
    pub fn snapshot(&self, resource_id: &ResourceId) -> Option<SubscriptionSnapshot> {
        self.inner
            .table
            .lock()
            .records
            .get(resource_id)
            .map(|r| r.snapshot(resource_id))
    }

    /// State of every tracked resource, ordered by id.
    pub fn snapshots(&self) -> Vec<SubscriptionSnapshot> {
        let table = self.inner.table.lock();
        let mut all: Vec<_> = table
            .records
            .iter()
            .map(|(id, r)| r.snapshot(id))
            .collect();
        all.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        all
    }

    /// Feed one bus event to the registry.
    pub fn handle_bus_event(&self, event: &BusEvent) {
        match event {
            BusEvent::StateChanged(change) if change.entered_connected() => {
                self.inner.on_connected();
            }
            BusEvent::StateChanged(change) if change.left_connected() => {
                self.inner.on_disconnected();
            }
            BusEvent::Message(message) => self.handle_message(message),
            _ => {}
        }
    }

    fn handle_message(&self, message: &InboundMessage) {
        match message.event.as_str() {
            events::SUBSCRIPTION_STATUS => {
                match serde_json::from_value::<SubscriptionStatus>(message.data.clone()) {
                    Ok(status) => self.inner.on_status(status),
                    Err(e) => warn!(error = %e, "malformed subscription_status payload"),
                }
            }
            events::SUBSCRIBERS_UPDATED => {
                match serde_json::from_value::<SubscribersUpdated>(message.data.clone()) {
                    Ok(update) => self.inner.on_subscribers_updated(update),
                    Err(e) => warn!(error = %e, "malformed subscribers_updated payload"),
                }
            }
            _ => {}
        }
    }

    /// Listen on `bus` for state changes and subscription messages until
    /// `cancel` fires.
    pub fn spawn_listener(&self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = bus.subscribe_many([
            Topic::State,
            Topic::message(events::SUBSCRIPTION_STATUS),
            Topic::message(events::SUBSCRIBERS_UPDATED),
        ]);
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => registry.handle_bus_event(&event),
                        None => break,
                    },
                }
            }
            debug!("subscription listener stopped");
        })
    }

    /// Cancel all timers and fail every waiting call with
    /// [`SubscriptionError::Shutdown`]. Later calls fail the same way.
    pub fn shutdown(&self) {
        let mut table = self.inner.table.lock();
        table.closed = true;
        for (_, mut record) in table.records.drain() {
            record.cancel_timer();
            record.resolve(&Err(SubscriptionError::Shutdown));
        }
        table.seen_updates.clear();
    }
}

impl Inner {
    fn local_user(&self) -> Option<&Subscriber> {
        self.config.local_user.as_ref()
    }

    fn begin(self: &Arc<Self>, id: ResourceId, want: SubscriptionState) -> Result<Option<Reply>, SubscriptionError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(SubscriptionError::Shutdown);
        }

        if want == SubscriptionState::Unsubscribed {
            let Some(record) = table.records.get_mut(&id) else {
                return Ok(None);
            };
            if !self.connected.load(Ordering::Acquire) || !self.sink.is_connected() {
                // Server-side state does not survive the disconnect.
                let outcome = match record.in_flight.as_ref().map(InFlight::target) {
                    Some(SubscriptionState::Unsubscribed) => Ok(()),
                    _ => Err(SubscriptionError::Superseded),
                };
                record.cancel_timer();
                record.desired = SubscriptionState::Unsubscribed;
                record.confirmed = SubscriptionState::Unsubscribed;
                record.pending = false;
                record.in_flight = None;
                record.apply_optimistic(self.local_user(), want);
                record.resolve(&outcome);
                let _ = table.records.remove(&id);
                debug!(resource_id = %id, "unsubscribed while disconnected");
                return Ok(None);
            }
        }

        let now = Instant::now();
        let record = table.records.entry(id.clone()).or_insert_with(Record::new);
        if record.desired == want
            && !record.pending
            && (record.confirmed == want || record.has_follow_up())
        {
            return Ok(None);
        }

        record.desired = want;
        record.apply_optimistic(self.local_user(), want);

        let window_end = record
            .last_request_at
            .map(|at| at + self.config.coalesce_window);
        let in_window = window_end.is_some_and(|end| now < end);
        if record.pending || in_window {
            counter!("cvesync_subscription_coalesced_total").increment(1);
            debug!(resource_id = %id, desired = ?want, "coalesced with recent request");
            let in_flight_target = record.in_flight.as_ref().map(InFlight::target);
            if record.has_follow_up() {
                if in_flight_target == Some(want) {
                    // Back to what is already on the wire.
                    self.arm_ack_timeout(&id, record);
                }
            } else if !record.pending {
                if let Some(end) = window_end {
                    self.arm(&id, record, TimerKind::FollowUp, end);
                }
            } else if in_flight_target.is_some_and(|target| target != want)
                && self.connected.load(Ordering::Acquire)
            {
                self.arm(&id, record, TimerKind::FollowUp, window_end.unwrap_or(now));
            }
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        record.waiters.push(tx);
        self.issue(&id, record, 1);
        table.collect(&id);
        Ok(Some(rx))
    }

    /// Put a request for the record's desired state on the wire.
    fn issue(self: &Arc<Self>, id: &ResourceId, record: &mut Record, attempt: u32) {
        record.cancel_timer();
        let kind = record.desired.request_kind();
        let correlation_id = CorrelationId::new();
        record.pending = true;
        record.in_flight = Some(InFlight {
            correlation_id: correlation_id.clone(),
            kind,
            attempt,
        });

        if !self.connected.load(Ordering::Acquire) {
            debug!(resource_id = %id, "not connected, request stalls until reconnect");
            return;
        }

        record.last_request_at = Some(Instant::now());
        let payload = json!({
            "resourceId": id,
            "correlationId": correlation_id,
        });
        match self.sink.send_request(kind.event_name(), payload) {
            Ok(()) => {
                counter!("cvesync_subscription_requests_total", "event" => kind.event_name())
                    .increment(1);
                debug!(
                    resource_id = %id,
                    event = kind.event_name(),
                    %correlation_id,
                    attempt,
                    "subscription request sent"
                );
                self.arm_ack_timeout(id, record);
            }
            Err(ConnectionError::Shutdown) => {
                self.fail(id, record, kind, SubscriptionError::Shutdown);
            }
            Err(e) => {
                debug!(resource_id = %id, error = %e, "request not sent, stalls until reconnect");
            }
        }
    }

    fn arm_ack_timeout(self: &Arc<Self>, id: &ResourceId, record: &mut Record) {
        let sent_at = record.last_request_at.unwrap_or_else(Instant::now);
        self.arm(id, record, TimerKind::AckTimeout, sent_at + self.config.request_timeout);
    }

    fn arm(self: &Arc<Self>, id: &ResourceId, record: &mut Record, kind: TimerKind, at: Instant) {
        record.cancel_timer();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let resource_id = id.clone();
        let task = tokio::spawn(async move {
            sleep_until(at).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer(&resource_id, token);
            }
        });
        record.timer = Some(Timer {
            token,
            kind,
            handle: task.abort_handle(),
        });
    }

    fn on_timer(self: &Arc<Self>, id: &ResourceId, token: u64) {
        let mut table = self.table.lock();
        let Some(record) = table.records.get_mut(id) else {
            return;
        };
        if record.timer.as_ref().is_none_or(|t| t.token != token) {
            return;
        }
        let Some(timer) = record.timer.take() else {
            return;
        };

        match timer.kind {
            TimerKind::AckTimeout => {
                if let Some(flight) = record.in_flight.take() {
                    debug!(resource_id = %id, attempt = flight.attempt, "no acknowledgement in time");
                    let error = SubscriptionError::Timeout {
                        attempts: flight.attempt,
                    };
                    self.on_request_error(id, record, &flight, error);
                }
            }
            TimerKind::Retry { attempt } => {
                if record.desired == record.confirmed {
                    settle(record);
                } else {
                    self.issue(id, record, attempt);
                }
            }
            TimerKind::FollowUp => self.follow_up(id, record),
        }
        table.collect(id);
    }

    fn on_request_error(
        self: &Arc<Self>,
        id: &ResourceId,
        record: &mut Record,
        flight: &InFlight,
        error: SubscriptionError,
    ) {
        if error.is_retryable() && flight.attempt < self.config.max_attempts {
            let delay = self.config.backoff.delay(flight.attempt - 1);
            record.retry_count = flight.attempt;
            record.pending = true;
            record.in_flight = None;
            warn!(
                resource_id = %id,
                attempt = flight.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "subscription request failed, retrying"
            );
            counter!("cvesync_subscription_retries_total").increment(1);
            self.arm(
                id,
                record,
                TimerKind::Retry {
                    attempt: flight.attempt + 1,
                },
                Instant::now() + delay,
            );
            return;
        }

        let error = match error {
            SubscriptionError::Timeout { .. } => SubscriptionError::Timeout {
                attempts: flight.attempt,
            },
            other => other,
        };
        self.fail(id, record, flight.kind, error);
    }

    /// Terminal failure: roll back and tell everyone.
    fn fail(&self, id: &ResourceId, record: &mut Record, kind: RequestKind, error: SubscriptionError) {
        record.cancel_timer();
        record.in_flight = None;
        record.pending = false;
        record.retry_count = 0;
        record.roll_back();
        warn!(resource_id = %id, kind = error.error_kind(), error = %error, "subscription request failed");
        counter!("cvesync_subscription_failures_total", "kind" => error.error_kind()).increment(1);
        record.resolve(&Err(error.clone()));
        let _ = self.bus.publish(BusEvent::SubscriptionFailed(SubscriptionFailure {
            resource_id: id.clone(),
            kind,
            error,
        }));
    }

    /// End of the coalescing window after the caller changed course.
    ///
    /// An unanswered request for the old intent is abandoned and the current
    /// intent goes out regardless of `confirmed`: the server may already
    /// have applied the abandoned request.
    fn follow_up(self: &Arc<Self>, id: &ResourceId, record: &mut Record) {
        match record.in_flight.as_ref().map(InFlight::target) {
            Some(target) if target != record.desired => {
                if let Some(flight) = record.in_flight.take() {
                    debug!(
                        resource_id = %id,
                        correlation_id = %flight.correlation_id,
                        "abandoning superseded request"
                    );
                }
                record.resolve(&Err(SubscriptionError::Superseded));
                self.issue(id, record, 1);
            }
            Some(_) => self.arm_ack_timeout(id, record),
            None => self.reconcile(id, record),
        }
    }

    /// Issue or schedule whatever closes the gap between desired and confirmed.
    fn reconcile(self: &Arc<Self>, id: &ResourceId, record: &mut Record) {
        if record.pending {
            return;
        }
        if record.desired == record.confirmed {
            record.resolve(&Ok(()));
            return;
        }
        let desired = record.desired;
        record.apply_optimistic(self.local_user(), desired);
        let due = record
            .last_request_at
            .map(|at| at + self.config.coalesce_window);
        match due {
            Some(due) if Instant::now() < due => {
                if !record.has_follow_up() {
                    self.arm(id, record, TimerKind::FollowUp, due);
                }
            }
            _ => self.issue(id, record, 1),
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    fn on_status(self: &Arc<Self>, status: SubscriptionStatus) {
        let mut table = self.table.lock();
        let id = status.resource_id.clone();
        let Some(record) = table.records.get_mut(&id) else {
            debug!(resource_id = %id, "acknowledgement for an untracked resource");
            return;
        };

        let matched = match (&record.in_flight, &status.correlation_id) {
            (Some(flight), Some(correlation_id)) => flight.correlation_id == *correlation_id,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !matched {
            apply_unsolicited(record, status, self.local_user());
        } else if let Some(flight) = record.in_flight.take() {
            record.cancel_timer();
            if status.success {
                self.on_ack(&id, record, &flight, status);
            } else {
                let error = SubscriptionError::from_payload(status.error.as_ref());
                self.on_request_error(&id, record, &flight, error);
            }
        }
        table.collect(&id);
    }

    fn on_ack(self: &Arc<Self>, id: &ResourceId, record: &mut Record, flight: &InFlight, status: SubscriptionStatus) {
        let requested = flight.target();
        let confirmed = status.status.unwrap_or(requested);
        record.pending = false;
        record.retry_count = 0;
        record.confirmed = confirmed;
        match status.subscribers {
            Some(list) => record.set_server_subscribers(list),
            None => record.confirmed_subscribers.clone_from(&record.subscribers),
        }

        let outcome = if confirmed == requested {
            debug!(resource_id = %id, state = ?confirmed, "subscription acknowledged");
            Ok(())
        } else {
            warn!(resource_id = %id, ?requested, ?confirmed, "server confirmed a different state");
            if record.desired == requested {
                record.desired = confirmed;
            }
            Err(SubscriptionError::Rejected)
        };
        record.resolve(&outcome);
        self.reconcile(id, record);
    }

    fn on_subscribers_updated(&self, update: SubscribersUpdated) {
        let mut table = self.table.lock();
        if !table.records.contains_key(&update.resource_id) {
            debug!(resource_id = %update.resource_id, "watcher update for an untracked resource");
            return;
        }
        if let Some(stamp) = update.timestamp_key() {
            let key = (update.resource_id.clone(), stamp);
            if table.seen_updates.contains(&key) {
                debug!(resource_id = %update.resource_id, "duplicate watcher update");
                return;
            }
            table.seen_updates.push_back(key);
            while table.seen_updates.len() > self.config.dedup_window.max(1) {
                let _ = table.seen_updates.pop_front();
            }
        }
        if let Some(record) = table.records.get_mut(&update.resource_id) {
            record.set_server_subscribers(update.subscribers);
        }
    }

    // ── Connection state ────────────────────────────────────────────

    fn on_connected(self: &Arc<Self>) {
        self.connected.store(true, Ordering::Release);
        let mut table = self.table.lock();
        let ids: Vec<ResourceId> = table.records.keys().cloned().collect();
        let mut reissued = 0usize;
        for id in ids {
            let Some(record) = table.records.get_mut(&id) else {
                continue;
            };
            record.cancel_timer();
            record.in_flight = None;
            record.retry_count = 0;
            record.confirmed = SubscriptionState::Unsubscribed;
            record.confirmed_subscribers.clear();
            match record.desired {
                SubscriptionState::Subscribed => {
                    self.issue(&id, record, 1);
                    reissued += 1;
                }
                SubscriptionState::Unsubscribed => settle(record),
            }
            table.collect(&id);
        }
        if reissued > 0 {
            info!(count = reissued, "re-subscribing after connect");
        }
    }

    fn on_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        let mut table = self.table.lock();
        for record in table.records.values_mut() {
            record.cancel_timer();
            if record.desired != record.confirmed {
                record.pending = true;
            }
        }
        debug!(resources = table.records.len(), "connection lost, requests stall");
    }
}

fn settle(record: &mut Record) {
    record.pending = false;
    record.in_flight = None;
    record.retry_count = 0;
    record.resolve(&Ok(()));
}

/// An ack that does not answer the in-flight request. The server's view
/// wins, the outstanding request keeps waiting.
fn apply_unsolicited(record: &mut Record, status: SubscriptionStatus, local: Option<&Subscriber>) {
    if !status.success {
        debug!(resource_id = %status.resource_id, "ignoring unmatched error acknowledgement");
        return;
    }
    if let Some(state) = status.status {
        record.confirmed = state;
        if !record.pending {
            record.desired = state;
        }
    }
    if let Some(list) = status.subscribers {
        record.set_server_subscribers(list);
        if record.pending {
            let desired = record.desired;
            record.apply_optimistic(local, desired);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
