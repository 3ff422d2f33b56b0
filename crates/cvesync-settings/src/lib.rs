//! # cvesync-settings
//!
//! Configuration for the CVE sync client, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`SyncSettings::default()`]
//! 2. **User file**: `~/.cvesync/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CVESYNC_*` overrides (highest priority)
//!
//! Settings are plain values. The client runtime takes them by reference at
//! construction; nothing here is global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
