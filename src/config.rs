//! Process configuration from the environment.
//!
//! Both binaries read the same variable set; anything unset falls back
//! to a local-development default. Per-class scaling knobs live in
//! [`crate::scaler::config`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::store::{FallbackConfig, FallbackStore, RedisStore, StoreClient, StoreError};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}' (json|pretty)")),
        }
    }
}

/// Shared process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_url: String,
    pub fallback_url: Option<String>,
    pub fallback_enabled: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    pub heartbeat_interval: Duration,
    pub metrics_port: u16,
    pub worker_class: String,
    pub worker_concurrency: usize,
    pub max_tasks_per_child: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: "redis://localhost:6379/0".to_string(),
            fallback_url: None,
            fallback_enabled: true,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            heartbeat_interval: Duration::from_secs(30),
            metrics_port: 9100,
            worker_class: "browser".to_string(),
            worker_concurrency: 1,
            max_tasks_per_child: None,
        }
    }
}

impl Config {
    /// Reads the configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_url: env_or("STORE_URL", &defaults.store_url),
            fallback_url: std::env::var("STORE_FALLBACK_URL").ok().filter(|v| !v.is_empty()),
            fallback_enabled: env_or("STORE_FALLBACK_ENABLED", "true")
                .to_lowercase()
                == "true",
            log_level: env_or("LOG_LEVEL", &defaults.log_level),
            log_format: env_or("LOG_FORMAT", "pretty").parse().unwrap_or_default(),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL",
                defaults.heartbeat_interval.as_secs(),
            )),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port),
            worker_class: env_or("WORKER_CLASS", &defaults.worker_class),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", defaults.worker_concurrency)
                .max(1),
            max_tasks_per_child: std::env::var("MAX_TASKS_PER_CHILD")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Initialises tracing once per process.
///
/// Filter priority: `RUST_LOG` over the explicit level. The format
/// follows `LOG_FORMAT` so containerised deployments can emit JSON.
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }
}

/// Builds the store client: the fallback composite when a secondary
/// endpoint is configured and enabled, a plain client otherwise.
///
/// The composite's health probe is spawned here so callers get a
/// self-healing client.
pub async fn build_store(config: &Config) -> Result<Arc<dyn StoreClient>, StoreError> {
    match (&config.fallback_url, config.fallback_enabled) {
        (Some(fallback_url), true) => {
            let store = Arc::new(
                FallbackStore::connect(&config.store_url, fallback_url, FallbackConfig::default())
                    .await?,
            );
            store.spawn_health_probe();
            Ok(store)
        }
        _ => Ok(Arc::new(
            RedisStore::connect(&config.store_url, "primary").await?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store_url, "redis://localhost:6379/0");
        assert!(config.fallback_enabled);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.worker_concurrency, 1);
        assert!(config.max_tasks_per_child.is_none());
    }
}
