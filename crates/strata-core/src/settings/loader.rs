//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::errors::SettingsError;
use super::StrataSettings;

/// Resolve the path to the settings file (`~/.strata/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".strata").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<StrataSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<StrataSettings, SettingsError> {
    let defaults = serde_json::to_value(StrataSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: StrataSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate();
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `STRATA_*` environment overrides. Invalid values are ignored
/// with a warning.
pub fn apply_env_overrides(settings: &mut StrataSettings) {
    if let Some(v) = read_env_string("STRATA_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_env_string("STRATA_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_parsed::<u16>("STRATA_PORT") {
        settings.server.port = v;
    }
    if let Some(v) = read_env_bool("STRATA_CACHE_ENABLED") {
        settings.cache.enabled = v;
    }
    if let Some(v) = read_env_parsed::<u64>("STRATA_CACHE_TTL_SECS") {
        settings.cache.ttl_secs = v;
    }
    if let Some(v) = read_env_parsed::<usize>("STRATA_SUBSCRIBER_BUFFER") {
        settings.notify.subscriber_buffer = v;
    }
    if let Some(v) = read_env_string("STRATA_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("STRATA_LOG_JSON") {
        settings.logging.json = v;
    }
}

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

fn read_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let result = val.parse().ok();
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_nested_objects() {
        let merged = deep_merge(
            json!({"cache": {"ttlSecs": 300, "enabled": true}}),
            json!({"cache": {"ttlSecs": 60}}),
        );
        assert_eq!(merged["cache"]["ttlSecs"], 60);
        assert_eq!(merged["cache"]["enabled"], true);
    }

    #[test]
    fn deep_merge_skips_null_and_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2], "b": 1}), json!({"a": [3], "b": null}));
        assert_eq!(merged["a"], json!([3]));
        assert_eq!(merged["b"], 1);
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let s = load_settings_from_path(Path::new("/nonexistent/strata/settings.json")).unwrap();
        assert_eq!(s.cache.compression_threshold_bytes, 4096);
    }

    #[test]
    fn load_from_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"notify": {"subscriberBuffer": 8}, "cache": {"ttlSecs": 0}}"#).unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.notify.subscriber_buffer, 8);
        // clamped by validate()
        assert_eq!(s.cache.ttl_secs, 1);
        assert!(s.cache.enabled);
    }

    #[test]
    fn load_from_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }
}
