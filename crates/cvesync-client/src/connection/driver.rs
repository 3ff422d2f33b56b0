//! Driver task: owns the link and the reconnect state machine.
//!
//! One `select!` loop multiplexes commands from handles, results of
//! transport opens, signals from the current link and four optional
//! deadlines (reconnect, connectivity restore, next latency probe, probe
//! timeout). Opens run in their own task and report back tagged with a
//! generation number; results from a superseded generation are discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use cvesync_core::codec::Codec;
use cvesync_core::errors::ConnectionError;
use cvesync_core::protocol::{
    DisconnectReason, LifecycleEvent, WireFrame, events, reason_from_payload,
};
use cvesync_core::{ConnectionState, CorrelationId, Credential, StateChange};

use crate::bus::{BusEvent, EventBus, InboundMessage};
use crate::config::ConnectionConfig;
use crate::transport::{OpenError, Transport, TransportLink, TransportSignal};

use super::latency::{LatencySample, LatencyWindow};
use super::{Command, Shared};

struct OpenOutcome {
    generation: u64,
    result: Result<TransportLink, OpenError>,
}

struct InflightPing {
    id: String,
    sent_at: Instant,
    deadline: Instant,
}

enum Wake {
    Command(Option<Command>),
    Opened(OpenOutcome),
    Signal(TransportSignal),
    ReconnectDue,
    RestoreDue,
    PingDue,
    PingExpired,
}

pub(super) struct Driver {
    transport: Arc<dyn Transport>,
    codec: Arc<Codec>,
    bus: EventBus,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    opened_tx: mpsc::UnboundedSender<OpenOutcome>,
    opened_rx: mpsc::UnboundedReceiver<OpenOutcome>,

    state: ConnectionState,
    generation: u64,
    credential: Option<Credential>,
    link: Option<TransportLink>,
    online: bool,
    user_disconnected: bool,
    attempts: u32,

    reconnect_at: Option<Instant>,
    restore_at: Option<Instant>,
    next_ping_at: Option<Instant>,
    ping: Option<InflightPing>,

    latency: LatencyWindow,
    queue: VecDeque<WireFrame>,
}

impl Driver {
    pub(super) fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<Codec>,
        bus: EventBus,
        config: ConnectionConfig,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let latency = LatencyWindow::new(config.latency_window);
        Self {
            transport,
            codec,
            bus,
            config,
            shared,
            commands,
            opened_tx,
            opened_rx,
            state: ConnectionState::Disconnected,
            generation: 0,
            credential: None,
            link: None,
            online: true,
            user_disconnected: false,
            attempts: 0,
            reconnect_at: None,
            restore_at: None,
            next_ping_at: None,
            ping: None,
            latency,
            queue: VecDeque::new(),
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some(outcome) = self.opened_rx.recv() => Wake::Opened(outcome),
                signal = next_link_signal(self.link.as_mut()) => Wake::Signal(signal),
                () = sleep_opt(self.reconnect_at) => Wake::ReconnectDue,
                () = sleep_opt(self.restore_at) => Wake::RestoreDue,
                () = sleep_opt(self.next_ping_at) => Wake::PingDue,
                () = sleep_opt(self.ping.as_ref().map(|p| p.deadline)) => Wake::PingExpired,
            };

            match wake {
                Wake::Command(None) => {
                    debug!("all connection handles dropped, stopping driver");
                    self.release_link();
                    break;
                }
                Wake::Command(Some(cmd)) => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                Wake::Opened(outcome) => self.on_opened(outcome),
                Wake::Signal(signal) => self.on_signal(signal),
                Wake::ReconnectDue => self.begin_reconnect(),
                Wake::RestoreDue => self.on_restore_due(),
                Wake::PingDue => self.on_ping_due(),
                Wake::PingExpired => self.on_ping_expired(),
            }
        }
        debug!("connection driver stopped");
    }

    // ── Commands ────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { credential, reply } => {
                let _ = reply.send(self.connect(credential));
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Send { frame } => self.send_request(&frame),
            Command::Emit { frame } => self.emit(frame),
            Command::SetOnline(online) => self.set_online(online),
            Command::Shutdown { reply } => {
                self.disconnect();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, credential: Option<Credential>) -> Result<(), ConnectionError> {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!(state = %self.state, "connect ignored, already connecting or connected");
            return Ok(());
        }

        let Some(credential) = credential.filter(|c| !c.is_empty()) else {
            warn!("connect called without a credential");
            self.credential = None;
            self.cancel_timers();
            self.transition(ConnectionState::AuthError);
            return Err(ConnectionError::MissingCredential);
        };

        self.credential = Some(credential);
        self.user_disconnected = false;
        self.attempts = 0;
        self.reconnect_at = None;
        self.restore_at = None;

        if !self.online {
            info!("offline, deferring connect until connectivity returns");
            self.transition(ConnectionState::NetworkError);
            return Ok(());
        }

        self.transition(ConnectionState::Connecting);
        self.start_open();
        Ok(())
    }

    fn disconnect(&mut self) {
        self.user_disconnected = true;
        self.generation += 1;
        self.cancel_timers();
        self.release_link();
        self.attempts = 0;
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
            self.publish_lifecycle(LifecycleEvent::Disconnect {
                reason: DisconnectReason::ClientDisconnect.as_wire().to_owned(),
            });
        }
    }

    fn send_request(&mut self, frame: &WireFrame) {
        if self.state != ConnectionState::Connected {
            debug!(event = %frame.event, "dropping request, not connected");
            self.shared.metrics.lock().dropped_frames += 1;
            return;
        }
        let _ = self.write(frame);
    }

    fn emit(&mut self, frame: WireFrame) {
        if self.state == ConnectionState::Connected && self.write(&frame) {
            return;
        }
        if self.config.max_offline_queue == 0 {
            warn!(event = %frame.event, "not connected and offline queue disabled, dropping frame");
            self.shared.metrics.lock().dropped_frames += 1;
            return;
        }
        if self.queue.len() >= self.config.max_offline_queue {
            if let Some(oldest) = self.queue.pop_front() {
                warn!(event = %oldest.event, "offline queue full, dropping oldest frame");
                self.shared.metrics.lock().dropped_frames += 1;
            }
        }
        debug!(event = %frame.event, "queued frame until connected");
        self.queue.push_back(frame);
        self.shared.metrics.lock().queued_frames = self.queue.len();
    }

    fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        self.online = online;
        gauge!("cvesync_online").set(if online { 1.0 } else { 0.0 });

        if online {
            if self.state == ConnectionState::NetworkError
                && self.credential.is_some()
                && !self.user_disconnected
            {
                info!("connectivity restored, reconnecting after debounce");
                self.restore_at = Some(Instant::now() + self.config.network_restore_debounce);
            }
            return;
        }

        self.restore_at = None;
        self.reconnect_at = None;
        let active = self.link.is_some()
            || matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
            || self.state.is_retryable();
        if active && !self.user_disconnected {
            info!("connectivity lost");
            self.generation += 1;
            if self.link.is_some() {
                self.publish_lifecycle(LifecycleEvent::Disconnect {
                    reason: DisconnectReason::Offline.as_wire().to_owned(),
                });
            }
            self.release_link();
            self.transition(ConnectionState::NetworkError);
        }
    }

    // ── Opening ─────────────────────────────────────────────────────

    fn start_open(&mut self) {
        let Some(credential) = self.credential.clone() else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        self.shared.metrics.lock().connect_attempts += 1;
        counter!("cvesync_connect_attempts_total").increment(1);

        let transport = Arc::clone(&self.transport);
        let opened = self.opened_tx.clone();
        let limit = self.config.connect_timeout;
        let _ = tokio::spawn(async move {
            let result = match timeout(limit, transport.open(&credential)).await {
                Ok(result) => result,
                Err(_) => Err(OpenError::new("transport error: connect timed out")),
            };
            let _ = opened.send(OpenOutcome { generation, result });
        });
    }

    fn on_opened(&mut self, outcome: OpenOutcome) {
        if outcome.generation != self.generation {
            debug!(
                generation = outcome.generation,
                current = self.generation,
                "discarding stale open result"
            );
            return;
        }
        match outcome.result {
            Ok(link) => self.on_link_up(link),
            Err(e) => {
                warn!(reason = %e.reason, "transport open failed");
                self.publish_lifecycle(LifecycleEvent::ConnectError {
                    reason: e.reason.clone(),
                });
                let reason = DisconnectReason::classify(&e.reason, self.online);
                self.on_link_down(&reason);
            }
        }
    }

    fn on_link_up(&mut self, link: TransportLink) {
        self.link = Some(link);
        let attempts = std::mem::take(&mut self.attempts);
        self.reconnect_at = None;
        self.restore_at = None;
        self.transition(ConnectionState::Connected);

        let event = if attempts > 0 {
            info!(attempts, "reconnected");
            LifecycleEvent::Reconnect { attempt: attempts }
        } else {
            info!("connected");
            LifecycleEvent::Connect
        };
        self.publish_lifecycle(event);

        self.flush_queue();
        self.next_ping_at = Some(Instant::now() + self.config.latency_interval);
    }

    fn on_link_down(&mut self, reason: &DisconnectReason) {
        self.release_link();
        if *reason == DisconnectReason::ClientDisconnect {
            self.transition(ConnectionState::Disconnected);
            return;
        }

        let failure = ConnectionState::from_reason(reason);
        counter!("cvesync_disconnects_total", "reason" => failure.as_str()).increment(1);
        self.transition(failure);

        match failure {
            ConnectionState::AuthError => {
                warn!(%reason, "credential rejected, not reconnecting");
            }
            ConnectionState::NetworkError if !self.online => {
                info!("offline, waiting for connectivity before reconnecting");
            }
            _ => self.schedule_reconnect(),
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.user_disconnected || self.credential.is_none() {
            return;
        }
        if self.attempts >= self.config.max_reconnect_attempts {
            warn!(attempts = self.attempts, "reconnect attempts exhausted");
            counter!("cvesync_reconnect_failed_total").increment(1);
            self.publish_lifecycle(LifecycleEvent::ReconnectFailed);
            return;
        }
        let delay = self.config.backoff.delay(self.attempts);
        self.reconnect_at = Some(Instant::now() + delay);
        debug!(
            attempt = self.attempts + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        self.transition(ConnectionState::Reconnecting);
    }

    fn begin_reconnect(&mut self) {
        self.reconnect_at = None;
        self.attempts += 1;
        self.shared.metrics.lock().reconnect_attempts += 1;
        counter!("cvesync_reconnect_attempts_total").increment(1);
        self.publish_lifecycle(LifecycleEvent::ReconnectAttempt {
            attempt: self.attempts,
        });
        self.transition(ConnectionState::Reconnecting);
        self.start_open();
    }

    fn on_restore_due(&mut self) {
        self.restore_at = None;
        if self.online
            && self.state == ConnectionState::NetworkError
            && self.credential.is_some()
            && !self.user_disconnected
        {
            self.attempts = 0;
            self.begin_reconnect();
        }
    }

    // ── Link traffic ────────────────────────────────────────────────

    fn on_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Frame(text) => self.on_frame(&text),
            TransportSignal::Closed(raw) => {
                info!(reason = %raw, "link closed");
                self.publish_lifecycle(LifecycleEvent::Disconnect {
                    reason: raw.clone(),
                });
                let reason = DisconnectReason::classify(&raw, self.online);
                self.on_link_down(&reason);
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        {
            let mut metrics = self.shared.metrics.lock();
            metrics.frames_in += 1;
            metrics.last_activity = Some(Utc::now());
        }
        counter!("cvesync_frames_in_total").increment(1);

        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed frame, skipping");
                self.shared.metrics.lock().dropped_frames += 1;
                return;
            }
        };

        match frame.event.as_str() {
            events::PONG => self.on_pong(frame.id.as_deref()),
            events::PING => {
                let mut pong = WireFrame::new(events::PONG, json!({}));
                pong.id = frame.id;
                let _ = self.write(&pong);
            }
            events::DISCONNECT => {
                let raw = reason_from_payload(&frame.data);
                info!(reason = %raw, "server closed the connection");
                self.publish_lifecycle(LifecycleEvent::Disconnect {
                    reason: raw.clone(),
                });
                let reason = DisconnectReason::classify(&raw, self.online);
                self.on_link_down(&reason);
            }
            events::CONNECT_ERROR => {
                let raw = reason_from_payload(&frame.data);
                warn!(reason = %raw, "server rejected the connection");
                self.publish_lifecycle(LifecycleEvent::ConnectError {
                    reason: raw.clone(),
                });
                let reason = DisconnectReason::classify(&raw, self.online);
                self.on_link_down(&reason);
            }
            _ => {
                let data = self.codec.decode_event(&frame.event, &frame.data);
                debug!(event = %frame.event, "inbound message");
                let _ = self.bus.publish(BusEvent::Message(InboundMessage {
                    event: frame.event,
                    data,
                }));
            }
        }
    }

    fn write(&mut self, frame: &WireFrame) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        let encoded = WireFrame {
            event: frame.event.clone(),
            data: self.codec.encode_event(&frame.event, &frame.data),
            id: frame.id.clone(),
        };
        let text = match serde_json::to_string(&encoded) {
            Ok(text) => text,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "failed to serialize frame");
                self.shared.metrics.lock().dropped_frames += 1;
                return false;
            }
        };
        if link.send(text) {
            self.shared.metrics.lock().frames_out += 1;
            counter!("cvesync_frames_out_total").increment(1);
            true
        } else {
            debug!(event = %frame.event, "link closed while writing");
            false
        }
    }

    fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            info!(frames = self.queue.len(), "flushing offline queue");
        }
        while let Some(frame) = self.queue.pop_front() {
            if !self.write(&frame) {
                self.queue.push_front(frame);
                break;
            }
        }
        self.shared.metrics.lock().queued_frames = self.queue.len();
    }

    // ── Latency ─────────────────────────────────────────────────────

    fn on_ping_due(&mut self) {
        let now = Instant::now();
        self.next_ping_at = Some(now + self.config.latency_interval);
        if self.state != ConnectionState::Connected || self.ping.is_some() {
            return;
        }
        let id = CorrelationId::new().into_inner();
        let frame = WireFrame::new(events::PING, json!({})).with_id(id.clone());
        if self.write(&frame) {
            self.ping = Some(InflightPing {
                id,
                sent_at: now,
                deadline: now + self.config.ping_timeout,
            });
        }
    }

    fn on_pong(&mut self, id: Option<&str>) {
        let Some(ping) = &self.ping else {
            debug!("pong without a probe in flight");
            return;
        };
        if id.is_some_and(|id| id != ping.id) {
            debug!(?id, "pong for an unknown probe");
            return;
        }
        let rtt = Instant::now().saturating_duration_since(ping.sent_at);
        self.ping = None;
        self.record_latency(LatencySample::RoundTrip(rtt));
    }

    fn on_ping_expired(&mut self) {
        if self.ping.take().is_some() {
            warn!(
                timeout_ms = duration_ms(self.config.ping_timeout),
                "latency probe timed out"
            );
            self.record_latency(LatencySample::Timeout);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_latency(&mut self, sample: LatencySample) {
        self.latency.push(sample);
        let snapshot = self.latency.snapshot();
        if let Some(avg) = snapshot.average_ms {
            gauge!("cvesync_latency_avg_ms").set(avg as f64);
        }
        *self.shared.latency.write() = snapshot.clone();
        let _ = self.bus.publish(BusEvent::Latency(snapshot));
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next);
        *self.shared.state.write() = next;
        info!(from = %previous, to = %next, "connection state changed");
        counter!("cvesync_state_transitions_total", "to" => next.as_str()).increment(1);
        let _ = self.bus.publish(BusEvent::StateChanged(StateChange {
            previous,
            current: next,
        }));
    }

    fn publish_lifecycle(&self, event: LifecycleEvent) {
        let _ = self.bus.publish(BusEvent::Lifecycle(event));
    }

    fn release_link(&mut self) {
        self.link = None;
        self.ping = None;
        self.next_ping_at = None;
    }

    fn cancel_timers(&mut self) {
        self.reconnect_at = None;
        self.restore_at = None;
        self.next_ping_at = None;
        self.ping = None;
    }
}

async fn next_link_signal(link: Option<&mut TransportLink>) -> TransportSignal {
    match link {
        Some(link) => link.next_signal().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
