//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncSettings::default()`]
//! 2. If `~/.cvesync/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CVESYNC_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::SyncSettings;

/// Resolve the path to the settings file (`~/.cvesync/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cvesync").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SyncSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CVESYNC_*` environment overrides.
pub fn apply_env_overrides(settings: &mut SyncSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within the listed range. Invalid values are
/// ignored with a warning and the file/default value is kept.
pub fn apply_overrides_from<F>(settings: &mut SyncSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("CVESYNC_URL") {
        settings.server.url = v;
    }
    if let Some(v) = env.string("CVESYNC_USER_ID") {
        settings.server.user_id = Some(v);
    }
    if let Some(v) = env.string("CVESYNC_DISPLAY_NAME") {
        settings.server.display_name = v;
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.u32("CVESYNC_MAX_RECONNECT_ATTEMPTS", 0, 1_000) {
        settings.connection.max_reconnect_attempts = v;
    }
    if let Some(v) = env.u64("CVESYNC_BASE_DELAY_MS", 10, 60_000) {
        settings.connection.backoff.base_delay_ms = v;
    }
    if let Some(v) = env.u64("CVESYNC_MAX_DELAY_MS", 100, 600_000) {
        settings.connection.backoff.max_delay_ms = v;
    }
    if let Some(v) = env.u64("CVESYNC_LATENCY_INTERVAL_MS", 1_000, 3_600_000) {
        settings.connection.latency_interval_ms = v;
    }
    if let Some(v) = env.u64("CVESYNC_PING_TIMEOUT_MS", 100, 60_000) {
        settings.connection.ping_timeout_ms = v;
    }
    if let Some(v) = env.usize("CVESYNC_MAX_OFFLINE_QUEUE", 0, 100_000) {
        settings.connection.max_offline_queue = v;
    }

    // ── Subscription ────────────────────────────────────────────────
    if let Some(v) = env.u64("CVESYNC_REQUEST_TIMEOUT_MS", 100, 120_000) {
        settings.subscription.request_timeout_ms = v;
    }
    if let Some(v) = env.u64("CVESYNC_COALESCE_WINDOW_MS", 0, 60_000) {
        settings.subscription.coalesce_window_ms = v;
    }
    if let Some(v) = env.u32("CVESYNC_MAX_ATTEMPTS", 1, 20) {
        settings.subscription.max_attempts = v;
    }

    // ── Cache ───────────────────────────────────────────────────────
    if let Some(v) = env.u64("CVESYNC_CACHE_DEBOUNCE_MS", 0, 60_000) {
        settings.cache.debounce_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CVESYNC_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("CVESYNC_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Readers ─────────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        let val = (self.lookup)(name)?;
        let result = parse_u32_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"connection": {"latencyWindow": 10, "pingTimeoutMs": 5000}});
        let source = serde_json::json!({"connection": {"latencyWindow": 3}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["connection"]["latencyWindow"], 3);
        assert_eq!(merged["connection"]["pingTimeoutMs"], 5000);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"exclusions": ["id", "cve_id"]});
        let source = serde_json::json!({"exclusions": ["id"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["exclusions"], serde_json::json!(["id"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        let defaults = SyncSettings::default();
        assert_eq!(settings.cache, defaults.cache);
        assert_eq!(settings.subscription, defaults.subscription);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"connection": {"backoff": {"baseDelayMs": 250}}, "subscription": {"maxAttempts": 2}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.connection.backoff.base_delay_ms, 250);
        assert_eq!(settings.connection.backoff.max_delay_ms, 30_000);
        assert_eq!(settings.subscription.max_attempts, 2);
        assert_eq!(settings.subscription.request_timeout_ms, 5_000);
    }

    #[test]
    fn load_codec_exclusions_replace_not_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"codec": {"exclusions": ["id"]}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.codec.exclusions, vec!["id".to_string()]);
        assert_eq!(settings.codec.bypass_events.len(), 4);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(
            result.unwrap_err(),
            SettingsError::Parse { path: p, .. } if p == path
        ));
    }

    #[test]
    fn wrong_type_is_a_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"subscription": {"maxAttempts": "three"}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Shape(_)));
    }

    #[test]
    fn load_invalid_value_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"connection": {"latencyWindow": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        let err = result.unwrap_err();
        assert_eq!(err.field(), Some("connection.latencyWindow"));
    }

    #[test]
    fn defaults_snapshot() {
        insta::assert_json_snapshot!(SyncSettings::default().subscription, @r#"
        {
          "coalesceWindowMs": 1000,
          "requestTimeoutMs": 5000,
          "maxAttempts": 3,
          "backoff": {
            "baseDelayMs": 1000,
            "maxDelayMs": 30000,
            "jitterMs": 1000,
            "exponentCap": 5
          },
          "dedupWindow": 256
        }
        "#);
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut settings = SyncSettings::default();
        apply_overrides_from(
            &mut settings,
            lookup_from(&[
                ("CVESYNC_URL", "wss://cve.example.org/ws"),
                ("CVESYNC_USER_ID", "u42"),
                ("CVESYNC_MAX_RECONNECT_ATTEMPTS", "9"),
                ("CVESYNC_CACHE_DEBOUNCE_MS", "120"),
                ("CVESYNC_MAX_ATTEMPTS", "2"),
            ]),
        );
        assert_eq!(settings.server.url, "wss://cve.example.org/ws");
        assert_eq!(settings.server.user_id.as_deref(), Some("u42"));
        assert_eq!(settings.connection.max_reconnect_attempts, 9);
        assert_eq!(settings.cache.debounce_ms, 120);
        assert_eq!(settings.subscription.max_attempts, 2);
    }

    #[test]
    fn out_of_range_override_ignored() {
        let mut settings = SyncSettings::default();
        apply_overrides_from(
            &mut settings,
            lookup_from(&[
                ("CVESYNC_PING_TIMEOUT_MS", "5"),
                ("CVESYNC_MAX_ATTEMPTS", "abc"),
            ]),
        );
        assert_eq!(settings.connection.ping_timeout_ms, 5_000);
        assert_eq!(settings.subscription.max_attempts, 3);
    }

    #[test]
    fn empty_string_override_ignored() {
        let mut settings = SyncSettings::default();
        apply_overrides_from(&mut settings, lookup_from(&[("CVESYNC_URL", "")]));
        assert_eq!(settings.server.url, SyncSettings::default().server.url);
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("300", 0, 1000), Some(300));
        assert_eq!(parse_u64_range(" 300 ", 0, 1000), Some(300));
        assert_eq!(parse_u64_range("3000", 0, 1000), None);
        assert_eq!(parse_u32_range("-1", 0, 10), None);
        assert_eq!(parse_usize_range("0", 0, 10), Some(0));
    }
}
