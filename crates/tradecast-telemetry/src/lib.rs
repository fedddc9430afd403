use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tradecast_server::relay" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; compact human-readable output otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(String),
    #[error("failed to reload log filter: {0}")]
    Reload(String),
}

/// Keeps the reloadable filter alive and allows runtime level changes.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    handle: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let filter_str = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        self.handle
            .reload(EnvFilter::new(filter_str))
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(filter_directives(config.log_level, &config.module_levels))
    });
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard {
        base_level: config.log_level,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        handle,
    })
}

/// Build an `EnvFilter` directive string such as `info,tradecast_server=debug`.
pub fn filter_directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Parse a level name as accepted in settings files (`warn`, `INFO`, ...).
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}
