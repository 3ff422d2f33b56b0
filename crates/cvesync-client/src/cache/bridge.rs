use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus, InboundMessage, Topic};
use crate::config::BridgeConfig;

use super::debounce::Debouncer;
use super::{CacheKey, CacheOp, DomainEvent, DomainEventKind, ResourceCache, plan};

/// Applies domain events to a [`ResourceCache`].
///
/// Patches and evictions go straight through. Invalidations are debounced
/// per `(event kind, key)`. Cache errors are logged and dropped.
#[derive(Clone)]
pub struct CacheBridge {
    cache: Arc<dyn ResourceCache>,
    invalidations: Debouncer<(DomainEventKind, CacheKey)>,
}

impl std::fmt::Debug for CacheBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBridge")
            .field("open_windows", &self.invalidations.open_windows())
            .finish_non_exhaustive()
    }
}

impl CacheBridge {
    /// Bridge into `cache`.
    pub fn new(cache: Arc<dyn ResourceCache>, config: &BridgeConfig) -> Self {
        Self {
            cache,
            invalidations: Debouncer::new(config.debounce),
        }
    }

    /// Handle one inbound message. Messages the bridge does not understand
    /// are skipped.
    pub fn handle_message(&self, message: &InboundMessage) {
        match DomainEvent::parse(&message.event, &message.data) {
            Ok(event) => self.apply(&event),
            Err(e) => warn!(event = %message.event, error = %e, "skipping domain event"),
        }
    }

    /// Apply the plan for one event.
    pub fn apply(&self, event: &DomainEvent) {
        for op in plan(event) {
            match op {
                CacheOp::Invalidate(key) => {
                    let cache = Arc::clone(&self.cache);
                    let fired = self.invalidations.call((event.kind, key), move |(_, key)| {
                        apply_op(cache.as_ref(), &CacheOp::Invalidate(key.clone()));
                    });
                    if !fired {
                        debug!(kind = ?event.kind, "invalidation debounced");
                    }
                }
                op => apply_op(self.cache.as_ref(), &op),
            }
        }
    }

    /// Listen for domain events on `bus` until `cancel` fires.
    pub fn spawn_listener(&self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = bus.subscribe_many(DomainEventKind::EVENTS.map(Topic::message));
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(BusEvent::Message(message)) => bridge.handle_message(&message),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            bridge.shutdown();
            debug!("cache bridge stopped");
        })
    }

    /// Drop pending trailing invalidations.
    pub fn shutdown(&self) {
        self.invalidations.cancel_all();
    }
}

fn apply_op(cache: &dyn ResourceCache, op: &CacheOp) {
    let result = match op {
        CacheOp::Invalidate(key) => cache.invalidate(key),
        CacheOp::Patch { key, body } => cache.patch(key, body),
        CacheOp::Evict(key) => cache.evict(key),
    };
    match result {
        Ok(()) => {
            counter!("cvesync_cache_ops_total", "op" => op.name()).increment(1);
            debug!(op = op.name(), key = %op.key(), "cache updated");
        }
        Err(e) => {
            counter!("cvesync_cache_errors_total", "op" => op.name()).increment(1);
            warn!(op = op.name(), key = %op.key(), error = %e, "cache update failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, ResourceKind};
    use cvesync_core::errors::CacheApplyError;
    use cvesync_core::protocol::events;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn message(event: &str, data: Value) -> InboundMessage {
        InboundMessage {
            event: event.into(),
            data,
        }
    }

    fn bridge(cache: &Arc<MemoryCache>) -> CacheBridge {
        CacheBridge::new(
            cache.clone(),
            &BridgeConfig {
                debounce: Duration::from_millis(300),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn patch_is_immediate_list_invalidation_debounced() {
        let cache = Arc::new(MemoryCache::new());
        let bridge = bridge(&cache);
        let list = CacheKey::list(ResourceKind::Cve);

        for n in 0..5 {
            bridge.handle_message(&message(
                events::RESOURCE_UPDATED,
                json!({ "cve_id": "CVE-1", "data": { "revision": n } }),
            ));
        }
        let detail = CacheKey::detail(ResourceKind::Cve, "CVE-1");
        assert_eq!(cache.get(&detail), Some(json!({ "revision": 4 })));
        assert_eq!(cache.invalidations(&list), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.invalidations(&list), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_is_per_event_kind() {
        let cache = Arc::new(MemoryCache::new());
        let bridge = bridge(&cache);
        let list = CacheKey::list(ResourceKind::Cve);

        bridge.handle_message(&message(events::RESOURCE_CREATED, json!({ "cve_id": "CVE-1" })));
        bridge.handle_message(&message(events::RESOURCE_DELETED, json!({ "cve_id": "CVE-2" })));
        assert_eq!(cache.invalidations(&list), 2);
    }

    #[tokio::test]
    async fn malformed_event_is_skipped() {
        let cache = Arc::new(MemoryCache::new());
        let bridge = bridge(&cache);
        bridge.handle_message(&message(events::RESOURCE_UPDATED, json!({ "data": {} })));
        assert!(cache.ops().is_empty());
    }

    struct FailingCache;

    impl ResourceCache for FailingCache {
        fn invalidate(&self, key: &CacheKey) -> Result<(), CacheApplyError> {
            Err(CacheApplyError::new("invalidate", key.to_string(), "store closed"))
        }
        fn patch(&self, key: &CacheKey, _body: &Value) -> Result<(), CacheApplyError> {
            Err(CacheApplyError::new("patch", key.to_string(), "store closed"))
        }
        fn evict(&self, key: &CacheKey) -> Result<(), CacheApplyError> {
            Err(CacheApplyError::new("evict", key.to_string(), "store closed"))
        }
    }

    #[tokio::test]
    async fn cache_errors_are_swallowed() {
        let bridge = CacheBridge::new(Arc::new(FailingCache), &BridgeConfig::default());
        bridge.handle_message(&message(
            events::RESOURCE_UPDATED,
            json!({ "cve_id": "CVE-1", "data": { "x": 1 } }),
        ));
        bridge.handle_message(&message(events::RESOURCE_DELETED, json!({ "cve_id": "CVE-1" })));
    }

    #[tokio::test(start_paused = true)]
    async fn listener_applies_bus_messages() {
        let cache = Arc::new(MemoryCache::new());
        let bridge = bridge(&cache);
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let task = bridge.spawn_listener(&bus, cancel.clone());

        let _ = bus.publish(BusEvent::Message(message(
            events::RESOURCE_DELETED,
            json!({ "cve_id": "CVE-7" }),
        )));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            cache.ops(),
            vec![
                CacheOp::Evict(CacheKey::detail(ResourceKind::Cve, "CVE-7")),
                CacheOp::Invalidate(CacheKey::list(ResourceKind::Cve)),
            ]
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
