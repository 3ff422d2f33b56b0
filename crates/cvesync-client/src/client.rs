//! The consumer-facing facade.
//!
//! [`SyncClient`] owns one of everything: bus, codec, connection manager,
//! subscription registry and (optionally) cache bridge, plus the listener
//! tasks that connect them. Every method is safe to call before a
//! connection exists.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cvesync_core::codec::Codec;
use cvesync_core::errors::{ConnectionError, SubscriptionError};
use cvesync_core::protocol::Subscriber;
use cvesync_core::{ConnectionState, Credential, ResourceId};
use cvesync_settings::{SettingsError, SyncSettings};

use crate::bus::{BusSubscription, EventBus, Topic};
use crate::cache::{CacheBridge, ResourceCache};
use crate::config::{BridgeConfig, ConnectionConfig, RegistryConfig};
use crate::connection::latency::LatencySnapshot;
use crate::connection::{ConnectionManager, ConnectionMetrics};
use crate::subscription::{SubscriptionRegistry, SubscriptionSnapshot};
use crate::transport::{Transport, WsTransport};

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a [`SyncClient`].
pub struct SyncClientBuilder {
    settings: SyncSettings,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn ResourceCache>>,
}

impl SyncClientBuilder {
    /// Use a specific transport instead of the WebSocket one.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keep `cache` in sync with domain events.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ResourceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the settings and start the client. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<SyncClient, SettingsError> {
        self.settings.validate()?;
        let settings = self.settings;

        let bus = EventBus::new();
        let codec = Arc::new(Codec::new(&settings.codec));
        let connection_config = ConnectionConfig::from(&settings);
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(WsTransport::new(
                settings.server.url.clone(),
                connection_config.connect_timeout,
            ))
        });

        let (connection, driver) =
            ConnectionManager::spawn(transport, codec, bus.clone(), connection_config);
        let registry = SubscriptionRegistry::new(
            Arc::new(connection.clone()),
            bus.clone(),
            RegistryConfig::from(&settings),
        );

        let cancel = CancellationToken::new();
        let mut tasks = vec![driver, registry.spawn_listener(&bus, cancel.clone())];
        let bridge = self.cache.map(|cache| {
            let bridge = CacheBridge::new(cache, &BridgeConfig::from(&settings));
            tasks.push(bridge.spawn_listener(&bus, cancel.clone()));
            bridge
        });

        info!(url = %settings.server.url, cache = bridge.is_some(), "sync client started");
        Ok(SyncClient {
            bus,
            connection,
            registry,
            bridge,
            cancel,
            tasks: Mutex::new(tasks),
            watchers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Shared real-time connection plus subscription and cache plumbing.
pub struct SyncClient {
    bus: EventBus,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    bridge: Option<CacheBridge>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watchers: Arc<Mutex<HashMap<ResourceId, usize>>>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("state", &self.connection.state())
            .field("registry", &self.registry)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    /// Start building a client from settings.
    pub fn builder(settings: SyncSettings) -> SyncClientBuilder {
        SyncClientBuilder {
            settings,
            transport: None,
            cache: None,
        }
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Open the shared connection.
    pub async fn connect(&self, credential: Option<Credential>) -> Result<(), ConnectionError> {
        self.connection.connect(credential).await
    }

    /// Close the shared connection without reconnecting.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Report host connectivity changes.
    pub fn set_online(&self, online: bool) {
        self.connection.set_online(online);
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// State transitions. The current state is delivered first.
    pub fn on_state_change(&self) -> BusSubscription {
        self.bus.subscribe(Topic::State)
    }

    /// Lifecycle notifications (`connect`, `reconnect_attempt`, ...).
    pub fn on_lifecycle(&self) -> BusSubscription {
        self.bus.subscribe(Topic::Lifecycle)
    }

    /// Latency snapshots. The last one is delivered first.
    pub fn on_latency(&self) -> BusSubscription {
        self.bus.subscribe(Topic::Latency)
    }

    /// Latest latency snapshot.
    pub fn latency(&self) -> LatencySnapshot {
        self.connection.latency()
    }

    /// Connection counters.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.connection.metrics()
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Decoded inbound messages named `event`.
    pub fn on(&self, event: &str) -> BusSubscription {
        self.bus.subscribe(Topic::message(event))
    }

    /// Send an event now, or once connected.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        self.connection.emit(event, payload)
    }

    /// The underlying bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Watch a resource. See [`SubscriptionRegistry::subscribe`].
    pub async fn subscribe(&self, resource_id: impl Into<ResourceId>) -> Result<(), SubscriptionError> {
        self.registry.subscribe(resource_id).await
    }

    /// Stop watching a resource. See [`SubscriptionRegistry::unsubscribe`].
    pub async fn unsubscribe(&self, resource_id: impl Into<ResourceId>) -> Result<(), SubscriptionError> {
        self.registry.unsubscribe(resource_id).await
    }

    /// Visible watchers of a resource.
    pub fn get_subscribers(&self, resource_id: impl Into<ResourceId>) -> Vec<Subscriber> {
        self.registry.subscribers(&resource_id.into())
    }

    /// Subscription state of a resource.
    pub fn subscription(&self, resource_id: impl Into<ResourceId>) -> Option<SubscriptionSnapshot> {
        self.registry.snapshot(&resource_id.into())
    }

    /// Terminal subscription failures.
    pub fn on_subscription_failed(&self) -> BusSubscription {
        self.bus.subscribe(Topic::SubscriptionFailed)
    }

    /// Reference-counted subscription.
    ///
    /// The resource is subscribed while at least one [`Watch`] for it is
    /// alive. Dropping the last one unsubscribes in the background.
    pub async fn watch(&self, resource_id: impl Into<ResourceId>) -> Result<Watch, SubscriptionError> {
        let resource_id = resource_id.into();
        *self.watchers.lock().entry(resource_id.clone()).or_insert(0) += 1;
        let watch = Watch {
            resource_id: resource_id.clone(),
            registry: self.registry.clone(),
            watchers: Arc::clone(&self.watchers),
        };
        // On failure the guard drops here and releases the count.
        self.registry.subscribe(resource_id).await?;
        Ok(watch)
    }

    /// Stop listeners, fail waiting calls, close the connection and wait
    /// for background tasks.
    pub async fn shutdown(&self) {
        info!("sync client shutting down");
        self.cancel.cancel();
        self.registry.shutdown();
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        self.connection.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        debug!("sync client stopped");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch guard
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps a resource subscribed while alive.
pub struct Watch {
    resource_id: ResourceId,
    registry: SubscriptionRegistry,
    watchers: Arc<Mutex<HashMap<ResourceId, usize>>>,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("resource_id", &self.resource_id)
            .finish_non_exhaustive()
    }
}

impl Watch {
    /// Watched resource.
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Visible watchers of the resource.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.registry.subscribers(&self.resource_id)
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        let last = {
            let mut watchers = self.watchers.lock();
            match watchers.get_mut(&self.resource_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    let _ = watchers.remove(&self.resource_id);
                    true
                }
                None => false,
            }
        };
        if !last {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(resource_id = %self.resource_id, "no runtime, skipping unsubscribe");
            return;
        };
        let registry = self.registry.clone();
        let resource_id = self.resource_id.clone();
        let _ = runtime.spawn(async move {
            if let Err(e) = registry.unsubscribe(resource_id.clone()).await {
                debug!(%resource_id, error = %e, "unsubscribe after last watch failed");
            }
        });
    }
}
