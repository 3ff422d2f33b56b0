//! Cache bridge.
//!
//! Inbound domain events become operations on an external [`ResourceCache`]:
//! invalidate (refetch later), patch (merge the body the event carried) or
//! evict. [`plan`] is the pure decision table. [`CacheBridge`] applies the
//! plan, debouncing invalidations.

mod bridge;
mod debounce;
pub mod memory;

pub use bridge::CacheBridge;
pub use memory::MemoryCache;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cvesync_core::ResourceId;
use cvesync_core::errors::CacheApplyError;
use cvesync_core::protocol::events;

// ─────────────────────────────────────────────────────────────────────────────
// Keys and operations
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of cached resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A vulnerability record.
    Cve,
    /// A comment on a vulnerability.
    Comment,
}

impl ResourceKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cve => "cve",
            Self::Comment => "comment",
        }
    }

    /// Parse a wire name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cve" | "cves" | "vulnerability" => Some(Self::Cve),
            "comment" | "comments" => Some(Self::Comment),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a cached entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// A collection. Comment lists are scoped to their parent CVE.
    List {
        /// Kind of the listed resources.
        kind: ResourceKind,
        /// Parent resource, if the list is scoped.
        scope: Option<ResourceId>,
    },
    /// A single resource.
    Detail {
        /// Kind of the resource.
        kind: ResourceKind,
        /// Resource id.
        id: ResourceId,
    },
}

impl CacheKey {
    /// Unscoped list of `kind`.
    pub fn list(kind: ResourceKind) -> Self {
        Self::List { kind, scope: None }
    }

    /// Detail entry of `kind`.
    pub fn detail(kind: ResourceKind, id: impl Into<ResourceId>) -> Self {
        Self::Detail {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List { kind, scope: None } => write!(f, "{kind}:list"),
            Self::List {
                kind,
                scope: Some(scope),
            } => write!(f, "{kind}:list:{scope}"),
            Self::Detail { kind, id } => write!(f, "{kind}:detail:{id}"),
        }
    }
}

/// One mutation of the external cache.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheOp {
    /// Mark stale so the next read refetches.
    Invalidate(CacheKey),
    /// Merge `body` into the entry.
    Patch {
        /// Entry to patch.
        key: CacheKey,
        /// Fields to merge.
        body: Value,
    },
    /// Drop the entry.
    Evict(CacheKey),
}

impl CacheOp {
    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invalidate(_) => "invalidate",
            Self::Patch { .. } => "patch",
            Self::Evict(_) => "evict",
        }
    }

    /// Key the operation touches.
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Invalidate(key) | Self::Evict(key) | Self::Patch { key, .. } => key,
        }
    }
}

/// The application's reactive cache, seen from the bridge.
///
/// Implementations must not block for long: the bridge calls them from its
/// listener task.
pub trait ResourceCache: Send + Sync {
    /// Mark an entry stale.
    fn invalidate(&self, key: &CacheKey) -> Result<(), CacheApplyError>;

    /// Merge `body` into an entry.
    fn patch(&self, key: &CacheKey, body: &Value) -> Result<(), CacheApplyError>;

    /// Remove an entry.
    fn evict(&self, key: &CacheKey) -> Result<(), CacheApplyError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain events
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    /// `resource_created`
    Created,
    /// `resource_updated`
    Updated,
    /// `resource_deleted`
    Deleted,
    /// `subscribers_updated`
    SubscribersChanged,
    /// `crawler_completed`: many records changed at once.
    BulkUpdated,
}

impl DomainEventKind {
    /// Kind for a wire event name.
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            events::RESOURCE_CREATED => Some(Self::Created),
            events::RESOURCE_UPDATED => Some(Self::Updated),
            events::RESOURCE_DELETED => Some(Self::Deleted),
            events::SUBSCRIBERS_UPDATED => Some(Self::SubscribersChanged),
            events::CRAWLER_COMPLETED => Some(Self::BulkUpdated),
            _ => None,
        }
    }

    /// Wire events the bridge consumes.
    pub const EVENTS: [&'static str; 5] = [
        events::RESOURCE_CREATED,
        events::RESOURCE_UPDATED,
        events::RESOURCE_DELETED,
        events::SUBSCRIBERS_UPDATED,
        events::CRAWLER_COMPLETED,
    ];
}

/// A parsed domain event.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainEvent {
    /// What happened.
    pub kind: DomainEventKind,
    /// Resource kind, `cve` when the payload does not say.
    pub resource: ResourceKind,
    /// Resource id, absent for bulk events.
    pub id: Option<ResourceId>,
    /// Parent CVE of a comment.
    pub parent: Option<ResourceId>,
    /// Updated body, when the event carries one.
    pub body: Option<Value>,
}

/// Why a payload could not be turned into a [`DomainEvent`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DomainEventError {
    /// Not an event the bridge handles.
    #[error("unhandled event {0}")]
    Unhandled(String),
    /// Payload is not an object.
    #[error("payload is not an object")]
    NotAnObject,
    /// `resourceType` names something unknown.
    #[error("unknown resource type {0}")]
    UnknownResource(String),
    /// The event needs an id and none was found.
    #[error("missing resource id")]
    MissingId,
}

impl DomainEvent {
    /// Parse a decoded (camelCase) payload.
    pub fn parse(event: &str, data: &Value) -> Result<Self, DomainEventError> {
        let kind = DomainEventKind::from_event(event)
            .ok_or_else(|| DomainEventError::Unhandled(event.to_owned()))?;
        let empty = Map::new();
        let map = match data {
            Value::Object(map) => map,
            Value::Null if kind == DomainEventKind::BulkUpdated => &empty,
            _ => return Err(DomainEventError::NotAnObject),
        };

        let resource = match map.get("resourceType").and_then(Value::as_str) {
            None => ResourceKind::Cve,
            Some(name) => ResourceKind::parse(name)
                .ok_or_else(|| DomainEventError::UnknownResource(name.to_owned()))?,
        };

        let (id, parent) = match resource {
            ResourceKind::Cve => (first_id(map, &["cve_id", "id", "resourceId", "cveId"]), None),
            ResourceKind::Comment => (
                first_id(map, &["id", "commentId", "resourceId"]),
                first_id(map, &["cve_id", "parentId", "cveId"]),
            ),
        };

        let needs_id = matches!(
            kind,
            DomainEventKind::Updated | DomainEventKind::Deleted | DomainEventKind::SubscribersChanged
        );
        if needs_id && id.is_none() {
            return Err(DomainEventError::MissingId);
        }

        let body = map
            .get("data")
            .filter(|body| body.as_object().is_some_and(|o| !o.is_empty()))
            .cloned();

        Ok(Self {
            kind,
            resource,
            id,
            parent,
            body,
        })
    }

    fn list_key(&self) -> CacheKey {
        let scope = match self.resource {
            ResourceKind::Comment => self.parent.clone(),
            ResourceKind::Cve => None,
        };
        CacheKey::List {
            kind: self.resource,
            scope,
        }
    }

    fn detail_key(&self) -> Option<CacheKey> {
        self.id.as_ref().map(|id| CacheKey::Detail {
            kind: self.resource,
            id: id.clone(),
        })
    }
}

fn first_id(map: &Map<String, Value>, fields: &[&str]) -> Option<ResourceId> {
    fields.iter().find_map(|field| match map.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(ResourceId::from(s.as_str())),
        Value::Number(n) => Some(ResourceId::from(n.to_string())),
        _ => None,
    })
}

/// Operations for one event, in application order.
pub fn plan(event: &DomainEvent) -> Vec<CacheOp> {
    let list = event.list_key();
    let detail = event.detail_key();
    match (event.kind, detail) {
        (DomainEventKind::Created, _) => vec![CacheOp::Invalidate(list)],
        (DomainEventKind::Updated, Some(key)) => match &event.body {
            Some(body) => vec![
                CacheOp::Patch {
                    key,
                    body: body.clone(),
                },
                CacheOp::Invalidate(list),
            ],
            None => vec![CacheOp::Invalidate(key), CacheOp::Invalidate(list)],
        },
        (DomainEventKind::Deleted, Some(key)) => {
            vec![CacheOp::Evict(key), CacheOp::Invalidate(list)]
        }
        (DomainEventKind::SubscribersChanged, Some(key)) => vec![CacheOp::Invalidate(key)],
        (DomainEventKind::BulkUpdated, _) => vec![CacheOp::Invalidate(CacheKey::list(event.resource))],
        (_, None) => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
