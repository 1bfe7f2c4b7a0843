use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use strata_core::settings::LoggingSettings;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "strata_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of compact human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from the `logging` settings section. An unknown level falls back to INFO.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        let log_level = Level::from_str(&settings.level).unwrap_or_else(|_| {
            eprintln!("strata-telemetry: unknown log level {:?}, using info", settings.level);
            Level::INFO
        });
        Self {
            log_level,
            module_levels: Vec::new(),
            json: settings.json,
        }
    }

    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }
}

/// `EnvFilter` directive string: the default level followed by module overrides.
pub fn filter_directives(default: Level, module_levels: &[(String, Level)]) -> String {
    let mut directives = default.to_string().to_lowercase();
    for (module, level) in module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Handle to the installed subscriber; allows runtime level changes.
pub struct TelemetryGuard {
    default_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.default_level, &levels)
        };
        if let Err(e) = self.reload.reload(EnvFilter::new(&directives)) {
            tracing::warn!(error = %e, "failed to reload log filter");
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls keep
/// the first subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, reload) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let compact_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().compact().with_target(true));

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
    {
        eprintln!("strata-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        default_level: config.log_level,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        reload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let modules = vec![
            ("strata_engine".to_string(), Level::DEBUG),
            ("strata_store".to_string(), Level::WARN),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &modules),
            "info,strata_engine=debug,strata_store=warn"
        );
        assert_eq!(filter_directives(Level::TRACE, &[]), "trace");
    }

    #[test]
    fn config_from_settings() {
        let settings = LoggingSettings {
            level: "debug".into(),
            json: true,
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);

        let bad = LoggingSettings {
            level: "loud".into(),
            json: false,
        };
        assert_eq!(TelemetryConfig::from_settings(&bad).log_level, Level::INFO);
    }

    #[test]
    fn module_levels_update_in_place() {
        let guard = init_telemetry(TelemetryConfig::default().with_module_level("strata_store", Level::WARN));
        guard.set_module_level("strata_store", Level::DEBUG);
        guard.set_module_level("strata_server", Level::ERROR);
        assert_eq!(
            guard.module_levels(),
            vec![
                ("strata_store".to_string(), Level::DEBUG),
                ("strata_server".to_string(), Level::ERROR),
            ]
        );
    }
}
