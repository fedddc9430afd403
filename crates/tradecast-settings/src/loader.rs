//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `~/.tradecast/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ChannelBackend, Settings};

/// Resolve the path to the settings file (`~/.tradecast/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tradecast").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests do not
/// have to mutate the process environment.
pub fn apply_overrides_from<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TRADECAST_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("TRADECAST_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TRADECAST_TOPIC") {
        settings.server.topic = v;
    }

    // ── Channel ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TRADECAST_CHANNEL") {
        match parse_backend(&v) {
            Some(backend) => settings.channel.backend = backend,
            None => tracing::warn!(
                key = "TRADECAST_CHANNEL",
                value = %v,
                "unknown channel backend, ignoring"
            ),
        }
    }
    if let Some(v) = env.string("TRADECAST_MAILBOX_DIR") {
        settings.channel.mailbox_dir = v;
    }
    if let Some(v) = env.u64("TRADECAST_POLL_INTERVAL_MS", 10, 600_000) {
        settings.channel.poll_interval_ms = v;
    }

    // ── Worker ──────────────────────────────────────────────────────
    if let Some(v) = env
        .string("TRADECAST_WORKER_URL")
        .or_else(|| env.string("N8N_URL"))
    {
        settings.worker.base_url = v;
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TRADECAST_SSE_URL") {
        settings.client.url = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TRADECAST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("TRADECAST_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_backend(val: &str) -> Option<ChannelBackend> {
    match val.to_lowercase().as_str() {
        "memory" => Some(ChannelBackend::Memory),
        "file" | "mailbox" => Some(ChannelBackend::File),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

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

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
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
}
