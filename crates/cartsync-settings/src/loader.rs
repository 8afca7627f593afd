//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CartsyncSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `CARTSYNC_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::CartsyncSettings;

/// `~/.cartsync/settings.json`
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cartsync").join("settings.json")
}

/// Load from `path`, or from [`settings_path`] when `None`.
pub fn load_settings(path: Option<&Path>) -> Result<CartsyncSettings> {
    match path {
        Some(p) => {
            if !p.exists() {
                return Err(SettingsError::InvalidValue(format!(
                    "settings file {} does not exist",
                    p.display()
                )));
            }
            load_settings_from_path(p)
        }
        None => load_settings_from_path(&settings_path()),
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CartsyncSettings> {
    let defaults = serde_json::to_value(CartsyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CartsyncSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, anything else is replaced by `source`. Nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut CartsyncSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are logged and ignored.
pub fn apply_overrides_from<F>(settings: &mut CartsyncSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── server ──
    if let Some(v) = read("CARTSYNC_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("CARTSYNC_PORT").and_then(|v| parsed("CARTSYNC_PORT", &v, 0u16, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = read("CARTSYNC_MAX_SEND_QUEUE")
        .and_then(|v| parsed("CARTSYNC_MAX_SEND_QUEUE", &v, 1usize, 65_536))
    {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = read("CARTSYNC_HEARTBEAT_SECS")
        .and_then(|v| parsed("CARTSYNC_HEARTBEAT_SECS", &v, 1u64, 3_600))
    {
        settings.server.heartbeat_interval_secs = v;
    }

    // ── sessions ──
    if let Some(v) = read("CARTSYNC_IDLE_TIMEOUT_SECS")
        .and_then(|v| parsed("CARTSYNC_IDLE_TIMEOUT_SECS", &v, 0u64, 604_800))
    {
        settings.sessions.idle_timeout_secs = v;
    }
    if let Some(v) = read("CARTSYNC_ALLOW_CLOSE").and_then(|v| {
        let b = parse_bool(&v);
        if b.is_none() {
            tracing::warn!(key = "CARTSYNC_ALLOW_CLOSE", value = %v, "invalid boolean env var, ignoring");
        }
        b
    }) {
        settings.sessions.allow_explicit_close = v;
    }

    // ── paths ──
    if let Some(v) = read("CARTSYNC_STORE_PATH") {
        settings.store.path = Some(v);
    }
    if let Some(v) = read("CARTSYNC_MENU_PATH") {
        settings.catalog.menu_path = Some(v);
    }

    // ── logging ──
    if let Some(v) = read("CARTSYNC_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("CARTSYNC_LOG_JSON").and_then(|v| parse_bool(&v)) {
        settings.logging.json = v;
    }
}

/// Reject settings the server cannot run with.
pub fn validate(settings: &CartsyncSettings) -> Result<()> {
    if settings.sessions.max_lines == 0 {
        return Err(SettingsError::InvalidValue(
            "sessions.maxLines must be at least 1".into(),
        ));
    }
    if settings.sessions.max_line_quantity == 0 {
        return Err(SettingsError::InvalidValue(
            "sessions.maxLineQuantity must be at least 1".into(),
        ));
    }
    if settings.server.max_send_queue == 0 {
        return Err(SettingsError::InvalidValue(
            "server.maxSendQueue must be at least 1".into(),
        ));
    }
    if settings.server.heartbeat_interval_secs == 0
        || settings.server.cleanup_interval_secs == 0
        || settings.sessions.eviction_interval_secs == 0
    {
        return Err(SettingsError::InvalidValue(
            "intervals must be at least 1 second".into(),
        ));
    }
    if settings.server.client_timeout_secs <= settings.server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(
            "server.clientTimeoutSecs must exceed the heartbeat interval".into(),
        ));
    }
    Ok(())
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parsed<T>(name: &str, val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let result = val.parse::<T>().ok().filter(|n| *n >= min && *n <= max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}
