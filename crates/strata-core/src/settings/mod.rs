//! Engine configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`StrataSettings::default()`]
//! 2. **Settings file**: `~/.strata/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `STRATA_*` overrides (highest priority)
//!
//! There is no global instance: the binary loads settings once and hands them
//! to `ContextService::init`, so tests can build isolated engines.

mod errors;
mod loader;

pub use errors::SettingsError;
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, parse_bool, settings_path};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::level::Level;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrataSettings {
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub notify: NotifySettings,
    pub batch: BatchSettings,
    pub search: SearchSettings,
    pub validation: ValidationSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Default for StrataSettings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            cache: CacheSettings::default(),
            notify: NotifySettings::default(),
            batch: BatchSettings::default(),
            search: SearchSettings::default(),
            validation: ValidationSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl StrataSettings {
    /// Correct out-of-range values. Called automatically during loading;
    /// values are clamped with a warning rather than rejected.
    pub fn validate(&mut self) {
        fn at_least<T: PartialOrd + Copy + std::fmt::Display>(val: &mut T, min: T, name: &str) {
            if *val < min {
                tracing::warn!("{name} out of range ({val}), clamped to {min}");
                *val = min;
            }
        }

        at_least(&mut self.cache.ttl_secs, 1, "cache.ttl_secs");
        at_least(&mut self.cache.max_entries, 1, "cache.max_entries");
        at_least(&mut self.notify.subscriber_buffer, 1, "notify.subscriber_buffer");
        at_least(&mut self.batch.max_parallelism, 1, "batch.max_parallelism");
        at_least(&mut self.search.default_limit, 1, "search.default_limit");
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite database path. `~` expands to `$HOME`.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "~/.strata/database/strata.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Serialized values larger than this are zlib-compressed.
    pub compression_threshold_bytes: usize,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            compression_threshold_bytes: 4096,
            max_entries: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifySettings {
    /// Per-subscriber queue depth. Oldest events are dropped on overflow.
    pub subscriber_buffer: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self { subscriber_buffer: 256 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchSettings {
    pub max_parallelism: usize,
    /// Applied when a request carries no deadline of its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_deadline_ms: Option<u64>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            default_deadline_ms: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchSettings {
    pub default_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { default_limit: 50 }
    }
}

/// Payload rules checked before any write reaches the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationSettings {
    /// Top-level payload keys that must be present, by level name.
    pub required_fields: BTreeMap<String, Vec<String>>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        let mut required_fields = BTreeMap::new();
        required_fields.insert(Level::Task.as_str().to_string(), vec!["title".to_string()]);
        Self { required_fields }
    }
}

impl ValidationSettings {
    pub fn required_fields(&self, level: Level) -> &[String] {
        self.required_fields
            .get(level.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// No payload rules at all.
    pub fn permissive() -> Self {
        Self {
            required_fields: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9191,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
