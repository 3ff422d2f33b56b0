//! # cvesync-core
//!
//! Foundation types for the CVE real-time sync layer.
//!
//! This crate provides the shared vocabulary that the client runtime, the
//! settings loader and the CLI depend on:
//!
//! - **Branded IDs**: `ResourceId`, `CorrelationId`, `SubscriberId` newtypes
//! - **Wire protocol**: `WireFrame` envelope, event names, subscription payloads
//! - **Connection state**: `ConnectionState` and disconnect-reason classification
//! - **Errors**: `ConnectionError`, `SubscriptionError`, `CacheApplyError`
//! - **Backoff**: exponential reconnect/retry delay with additive jitter
//! - **Codec**: camelCase ↔ `snake_case` key translation with a bounded plan cache
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod codec;
pub mod credential;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod state;

pub use credential::Credential;
pub use ids::{CorrelationId, ResourceId, SubscriberId};
pub use state::{ConnectionState, StateChange};
