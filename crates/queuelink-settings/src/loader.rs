//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ClientSettings, UnknownMessagePolicy};

/// Resolve the path to the settings file (`~/.queuelink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".queuelink").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ClientSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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

/// Apply `QUEUELINK_*` environment overrides.
///
/// Invalid values are warned about and ignored.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    if let Some(v) = read_env_u64("QUEUELINK_REQUEST_TIMEOUT_MS", 100, 3_600_000) {
        settings.http.request_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("QUEUELINK_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.http.connect_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("QUEUELINK_UPLOAD_CHUNK_SIZE", 1, 10_000) {
        settings.upload.chunk_size = v;
    }
    if let Some(v) = read_env_string("QUEUELINK_UNKNOWN_MESSAGES") {
        match parse_unknown_policy(&v) {
            Some(policy) => settings.protocol.unknown_messages = policy,
            None => tracing::warn!(value = %v, "invalid unknown-message policy, ignoring"),
        }
    }
    if let Some(v) = read_env_string("QUEUELINK_HUB_URL") {
        settings.hub.base_url = v;
    }
    if let Some(v) = read_env_u64("QUEUELINK_STATUS_POLL_MS", 100, 600_000) {
        settings.hub.status_poll_interval_ms = v;
    }
    if let Some(v) = read_env_string("QUEUELINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("QUEUELINK_LOG_JSON") {
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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse an unknown-message policy name.
pub fn parse_unknown_policy(val: &str) -> Option<UnknownMessagePolicy> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"hub": {"baseUrl": "a", "statusPollIntervalMs": 1}});
        let source = serde_json::json!({"hub": {"baseUrl": "b"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["hub"]["baseUrl"], "b");
        assert_eq!(merged["hub"]["statusPollIntervalMs"], 1);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.upload.chunk_size, ClientSettings::default().upload.chunk_size);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"hub": {"statusPollIntervalMs": 250}, "protocol": {"unknownMessages": "ignore"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.hub.status_poll_interval_ms, 250);
        assert_eq!(settings.protocol.unknown_messages, UnknownMessagePolicy::Ignore);
        assert_eq!(settings.hub.default_sleep_timeout_secs, 300);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_usize_range("0", 1, 10), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!(parse_unknown_policy("FAIL"), Some(UnknownMessagePolicy::Fail));
        assert_eq!(parse_unknown_policy("warn"), Some(UnknownMessagePolicy::Warn));
        assert_eq!(parse_unknown_policy("shout"), None);
    }
}
