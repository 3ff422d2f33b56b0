//! Key-naming codec for wire payloads.
//!
//! The server speaks `snake_case`, the client works in camelCase. [`Codec`]
//! renames object keys recursively in both directions with two exceptions:
//!
//! - **Exclusions**: identifier and timestamp keys pass through untouched.
//! - **Bypass events**: payloads of the listed events keep *both* spellings
//!   of every renamed key, because older consumers still read the other one.
//!
//! Renaming plans are cached per object shape. The cache key is a cheap
//! structural signature (direction, bypass flag, key count, leading keys);
//! every hit is checked against the full key list before it is used, so a
//! signature collision only costs a recompute.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Keys that are never renamed.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "id",
    "cve_id",
    "created_at",
    "updated_at",
    "published_date",
    "last_modified_date",
    "timestamp",
];

/// Events whose payloads keep both key spellings.
pub const DEFAULT_BYPASS_EVENTS: &[&str] = &[
    "subscribe_cve",
    "unsubscribe_cve",
    "subscription_status",
    "subscribers_updated",
];

/// Codec configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodecConfig {
    /// Keys passed through unchanged.
    pub exclusions: Vec<String>,
    /// Events whose payloads carry both spellings.
    pub bypass_events: Vec<String>,
    /// Maximum cached plans.
    pub cache_capacity: usize,
    /// Plan lifetime in milliseconds.
    pub cache_ttl_ms: u64,
    /// Number of leading keys folded into the signature.
    pub signature_keys: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            exclusions: DEFAULT_EXCLUSIONS.iter().map(|s| (*s).to_owned()).collect(),
            bypass_events: DEFAULT_BYPASS_EVENTS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            cache_capacity: 256,
            cache_ttl_ms: 60_000,
            signature_keys: 3,
        }
    }
}

/// Which way keys are renamed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// camelCase → `snake_case` (outbound).
    Encode,
    /// `snake_case` → camelCase (inbound).
    Decode,
}

/// Plan cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that computed a plan.
    pub misses: u64,
    /// Entries dropped for age or capacity.
    pub evictions: u64,
    /// Live entries.
    pub entries: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Key conversion
// ─────────────────────────────────────────────────────────────────────────────

/// `resourceId` → `resource_id`.
pub fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `resource_id` → `resourceId`.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, ch) in key.chars().enumerate() {
        if ch == '_' && i > 0 {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    if upper_next {
        out.push('_');
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Plan cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Signature {
    direction: Direction,
    bypass: bool,
    len: usize,
    leading: Vec<String>,
}

/// Target keys for each source key, in source iteration order.
type Plan = Arc<Vec<Vec<String>>>;

struct CachedPlan {
    keys: Vec<String>,
    plan: Plan,
    inserted: Instant,
}

struct PlanCache {
    entries: HashMap<Signature, CachedPlan>,
    stats: CacheStats,
}

impl PlanCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    fn purge_expired(&mut self, ttl: Duration, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted) < ttl);
        let expired = before - self.entries.len();
        if expired > 0 {
            trace!(expired, remaining = self.entries.len(), "expired codec plans");
        }
        self.stats.evictions += expired as u64;
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted)
            .map(|(sig, _)| sig.clone());
        if let Some(sig) = oldest {
            let _ = self.entries.remove(&sig);
            self.stats.evictions += 1;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Bidirectional key-naming transform.
pub struct Codec {
    exclusions: HashSet<String>,
    bypass_events: HashSet<String>,
    capacity: usize,
    ttl: Duration,
    signature_keys: usize,
    cache: Mutex<PlanCache>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(&CodecConfig::default())
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("exclusions", &self.exclusions.len())
            .field("bypass_events", &self.bypass_events)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Codec {
    /// Build a codec from configuration.
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            exclusions: config.exclusions.iter().cloned().collect(),
            bypass_events: config.bypass_events.iter().cloned().collect(),
            capacity: config.cache_capacity,
            ttl: Duration::from_millis(config.cache_ttl_ms),
            signature_keys: config.signature_keys.max(1),
            cache: Mutex::new(PlanCache::new()),
        }
    }

    /// Whether `event` keeps both key spellings.
    pub fn is_bypass(&self, event: &str) -> bool {
        self.bypass_events.contains(event)
    }

    /// camelCase → `snake_case`.
    pub fn encode(&self, value: &Value) -> Value {
        self.walk(value, Direction::Encode, false)
    }

    /// `snake_case` → camelCase.
    pub fn decode(&self, value: &Value) -> Value {
        self.walk(value, Direction::Decode, false)
    }

    /// Encode the payload of an outbound event, honouring the bypass list.
    pub fn encode_event(&self, event: &str, value: &Value) -> Value {
        self.walk(value, Direction::Encode, self.is_bypass(event))
    }

    /// Decode the payload of an inbound event, honouring the bypass list.
    pub fn decode_event(&self, event: &str, value: &Value) -> Value {
        self.walk(value, Direction::Decode, self.is_bypass(event))
    }

    /// Plan cache counters.
    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            entries: cache.entries.len(),
            ..cache.stats
        }
    }

    fn walk(&self, value: &Value, direction: Direction, bypass: bool) -> Value {
        match value {
            Value::Object(map) => {
                let plan = self.plan_for(map, direction, bypass);
                let mut out = Map::with_capacity(map.len());
                for (targets, (_, child)) in plan.iter().zip(map.iter()) {
                    let converted = self.walk(child, direction, bypass);
                    if let Some((last, rest)) = targets.split_last() {
                        for target in rest {
                            let _ = out.insert(target.clone(), converted.clone());
                        }
                        let _ = out.insert(last.clone(), converted);
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.walk(item, direction, bypass))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn convert_key(&self, key: &str, direction: Direction) -> String {
        if self.exclusions.contains(key) {
            return key.to_owned();
        }
        match direction {
            Direction::Encode => to_snake_case(key),
            Direction::Decode => to_camel_case(key),
        }
    }

    fn compute_plan(&self, keys: &[String], direction: Direction, bypass: bool) -> Plan {
        let plan = keys
            .iter()
            .map(|key| {
                let converted = self.convert_key(key, direction);
                if bypass && converted != *key {
                    vec![key.clone(), converted]
                } else {
                    vec![converted]
                }
            })
            .collect();
        Arc::new(plan)
    }

    fn plan_for(&self, map: &Map<String, Value>, direction: Direction, bypass: bool) -> Plan {
        let keys: Vec<String> = map.keys().cloned().collect();
        if self.capacity == 0 {
            return self.compute_plan(&keys, direction, bypass);
        }

        let signature = Signature {
            direction,
            bypass,
            len: keys.len(),
            leading: keys.iter().take(self.signature_keys).cloned().collect(),
        };
        let now = Instant::now();
        let mut cache = self.cache.lock();

        if let Some(entry) = cache.entries.get(&signature) {
            if entry.keys == keys && now.duration_since(entry.inserted) < self.ttl {
                let plan = Arc::clone(&entry.plan);
                cache.stats.hits += 1;
                return plan;
            }
        }

        cache.stats.misses += 1;
        let plan = self.compute_plan(&keys, direction, bypass);
        cache.purge_expired(self.ttl, now);
        if cache.entries.len() >= self.capacity && !cache.entries.contains_key(&signature) {
            cache.evict_oldest();
        }
        let _ = cache.entries.insert(
            signature,
            CachedPlan {
                keys,
                plan: Arc::clone(&plan),
                inserted: now,
            },
        );
        plan
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_conversion() {
        assert_eq!(to_snake_case("resourceId"), "resource_id");
        assert_eq!(to_snake_case("lastModifiedDate"), "last_modified_date");
        assert_eq!(to_snake_case("plain"), "plain");
        assert_eq!(to_camel_case("resource_id"), "resourceId");
        assert_eq!(to_camel_case("display_name"), "displayName");
        assert_eq!(to_camel_case("_private"), "_private");
        assert_eq!(to_camel_case("trailing_"), "trailing_");
    }

    #[test]
    fn encode_nested_objects_and_arrays() {
        let codec = Codec::default();
        let input = json!({
            "resourceId": "CVE-1",
            "subscribers": [{"id": "u1", "displayName": "Ada"}],
            "meta": {"cvssScore": 9.8, "createdAt": "x"}
        });
        let encoded = codec.encode(&input);
        assert_eq!(
            encoded,
            json!({
                "resource_id": "CVE-1",
                "subscribers": [{"id": "u1", "display_name": "Ada"}],
                "meta": {"cvss_score": 9.8, "created_at": "x"}
            })
        );
    }

    #[test]
    fn exclusions_pass_through() {
        let codec = Codec::default();
        let input = json!({
            "cve_id": "CVE-1",
            "created_at": "2024-01-01",
            "published_date": "2024-01-02",
            "timestamp": 1,
            "severity_level": "high"
        });
        let decoded = codec.decode(&input);
        assert_eq!(
            decoded,
            json!({
                "cve_id": "CVE-1",
                "created_at": "2024-01-01",
                "published_date": "2024-01-02",
                "timestamp": 1,
                "severityLevel": "high"
            })
        );
    }

    #[test]
    fn bypass_event_keeps_both_spellings() {
        let codec = Codec::default();
        let payload = json!({"resourceId": "CVE-1", "correlationId": "c1"});
        let encoded = codec.encode_event("subscribe_cve", &payload);
        assert_eq!(
            encoded,
            json!({
                "resourceId": "CVE-1",
                "resource_id": "CVE-1",
                "correlationId": "c1",
                "correlation_id": "c1"
            })
        );
    }

    #[test]
    fn bypass_decode_is_recursive() {
        let codec = Codec::default();
        let payload = json!({
            "resource_id": "R",
            "subscribers": [{"id": "u1", "display_name": "Ada"}]
        });
        let decoded = codec.decode_event("subscription_status", &payload);
        assert_eq!(decoded["resourceId"], "R");
        assert_eq!(decoded["resource_id"], "R");
        assert_eq!(decoded["subscribers"][0]["displayName"], "Ada");
        assert_eq!(decoded["subscribers"][0]["display_name"], "Ada");
        assert_eq!(decoded["subscribers"][0]["id"], "u1");
    }

    #[test]
    fn non_bypass_event_renames_only() {
        let codec = Codec::default();
        let decoded = codec.decode_event("resource_updated", &json!({"cvss_score": 5}));
        assert_eq!(decoded, json!({"cvssScore": 5}));
    }

    #[test]
    fn scalars_untouched() {
        let codec = Codec::default();
        assert_eq!(codec.encode(&json!("someValue")), json!("someValue"));
        assert_eq!(codec.decode(&json!([1, "a_b", null])), json!([1, "a_b", null]));
    }

    #[test]
    fn cache_hits_on_repeated_shape() {
        let codec = Codec::default();
        let _ = codec.decode(&json!({"cvss_score": 1, "severity": "low"}));
        let _ = codec.decode(&json!({"cvss_score": 2, "severity": "high"}));
        let stats = codec.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn signature_collision_is_detected() {
        let codec = Codec::new(&CodecConfig {
            signature_keys: 1,
            ..CodecConfig::default()
        });
        // Same direction, length and leading key, different tails.
        let first = codec.decode(&json!({"a_key": 1, "b_key": 2}));
        let second = codec.decode(&json!({"a_key": 1, "c_key": 3}));
        assert_eq!(first, json!({"aKey": 1, "bKey": 2}));
        assert_eq!(second, json!({"aKey": 1, "cKey": 3}));
        assert_eq!(codec.stats().hits, 0);
    }

    #[test]
    fn direction_is_part_of_signature() {
        let codec = Codec::default();
        let _ = codec.encode(&json!({"abc": 1}));
        let _ = codec.decode(&json!({"abc": 1}));
        assert_eq!(codec.stats().entries, 2);
    }

    #[test]
    fn capacity_bounds_entries() {
        let codec = Codec::new(&CodecConfig {
            cache_capacity: 2,
            ..CodecConfig::default()
        });
        let _ = codec.decode(&json!({"a": 1}));
        let _ = codec.decode(&json!({"b": 1}));
        let _ = codec.decode(&json!({"c": 1}));
        let stats = codec.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn zero_ttl_never_hits() {
        let codec = Codec::new(&CodecConfig {
            cache_ttl_ms: 0,
            ..CodecConfig::default()
        });
        let _ = codec.decode(&json!({"a_b": 1}));
        let _ = codec.decode(&json!({"a_b": 1}));
        assert_eq!(codec.stats().hits, 0);
    }

    #[test]
    fn disabled_cache() {
        let codec = Codec::new(&CodecConfig {
            cache_capacity: 0,
            ..CodecConfig::default()
        });
        assert_eq!(codec.decode(&json!({"a_b": 1})), json!({"aB": 1}));
        assert_eq!(codec.stats(), CacheStats::default());
    }

    #[test]
    fn encoded_shape_snapshot() {
        let codec = Codec::default();
        let encoded = codec.encode_event(
            "subscribe_cve",
            &json!({"resourceId": "CVE-2024-0001", "correlationId": "c-1"}),
        );
        insta::assert_json_snapshot!(encoded, @r#"
        {
          "correlationId": "c-1",
          "correlation_id": "c-1",
          "resourceId": "CVE-2024-0001",
          "resource_id": "CVE-2024-0001"
        }
        "#);
    }

    fn camel_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,5}([A-Z][a-z0-9]{0,4}){0,3}"
    }

    fn camel_payload() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-zA-Z_ ]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map(camel_key(), inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn collides_with_exclusion(value: &Value) -> bool {
        match value {
            Value::Object(map) => map.iter().any(|(k, v)| {
                let snake = to_snake_case(k);
                (snake != *k && DEFAULT_EXCLUSIONS.contains(&snake.as_str()))
                    || collides_with_exclusion(v)
            }),
            Value::Array(items) => items.iter().any(collides_with_exclusion),
            _ => false,
        }
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(payload in camel_payload()) {
            prop_assume!(!collides_with_exclusion(&payload));
            let codec = Codec::default();
            let round = codec.decode(&codec.encode(&payload));
            prop_assert_eq!(round, payload);
        }
    }
}
