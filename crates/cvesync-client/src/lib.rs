//! # cvesync-client
//!
//! Real-time connection and synchronization layer for the CVE management app.
//!
//! One persistent connection is shared by every consumer in the process.
//! Components, leaf first:
//!
//! - [`bus`]: typed publish/subscribe register with disposer handles
//! - [`transport`]: the socket abstraction, a WebSocket implementation and an
//!   in-memory one for tests
//! - [`connection`]: the connection manager actor (reconnect state machine,
//!   latency sampling, connectivity awareness, offline emit queue)
//! - [`subscription`]: per-resource subscribe/unsubscribe protocol with
//!   coalescing, correlation, retry and reconnection re-subscribe
//! - [`cache`]: translates domain events into cache invalidate/patch/evict
//! - [`client`]: the [`SyncClient`] facade that wires everything together
//!
//! Nothing is global. A [`SyncClient`] is built explicitly and torn down with
//! [`SyncClient::shutdown`].

#![deny(unsafe_code)]

pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod subscription;
pub mod transport;

pub use bus::{BusEvent, BusSubscription, EventBus, InboundMessage, Topic};
pub use cache::{CacheBridge, CacheKey, CacheOp, MemoryCache, ResourceCache, ResourceKind};
pub use client::{SyncClient, SyncClientBuilder, Watch};
pub use connection::latency::{LatencyQuality, LatencySnapshot};
pub use connection::{ConnectionManager, ConnectionMetrics, OutboundSink};
pub use subscription::{SubscriptionRegistry, SubscriptionSnapshot};
pub use transport::{MemoryServer, MemoryTransport, ServerConnection, Transport, WsTransport};
