//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MarqueeSettings::default()`]
//! 2. If `~/.marquee/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `MARQUEE_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use marquee_engine::ContextConfig;
use marquee_llm::{BreakerConfig, ModelConfig, RetryPolicy};
use marquee_telemetry::TelemetryConfig;

use crate::server::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Every tunable of the service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarqueeSettings {
    pub server: ServerConfig,
    pub context: ContextConfig,
    /// Retry policy for language-model calls.
    pub model_retry: RetryPolicy,
    /// Retry policy for catalog calls.
    pub catalog_retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub model: ModelConfig,
    pub telemetry: TelemetryConfig,
}

/// `~/.marquee/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".marquee").join("settings.json")
}

pub fn load_settings() -> Result<MarqueeSettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults; unreadable or invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<MarqueeSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<MarqueeSettings> {
    let defaults = serde_json::to_value(MarqueeSettings::default())?;
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

/// Objects merge per key, arrays and scalars are replaced, nulls in
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut MarqueeSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Invalid values are logged and ignored.
fn apply_overrides(settings: &mut MarqueeSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("MARQUEE_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => invalid("MARQUEE_PORT", &v),
        }
    }
    if let Some(v) = read("MARQUEE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("MARQUEE_CONTEXT_TTL_SECS") {
        match parse_u64_range(&v, 1, 86_400) {
            Some(ttl) => settings.context.ttl_secs = ttl,
            None => invalid("MARQUEE_CONTEXT_TTL_SECS", &v),
        }
    }
    if let Some(v) = read("MARQUEE_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read("MARQUEE_MODEL_URL") {
        settings.model.base_url = v;
    }
    if let Some(v) = read("MARQUEE_API_KEY") {
        settings.model.api_key = Some(v);
    }
    if let Some(v) = read("MARQUEE_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.telemetry.json = json,
            None => invalid("MARQUEE_LOG_JSON", &v),
        }
    }
}

fn invalid(key: &str, value: &str) {
    warn!(key, value, "invalid env var, ignoring");
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
