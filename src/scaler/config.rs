//! Worker class and autoscaler configuration.
//!
//! Each worker class carries its own scaling policy, loaded from
//! environment variables with the class name as prefix
//! (`BROWSER_MIN_REPLICAS`, `BROWSER_COOLDOWN`, ...). The set of
//! classes comes from `WORKER_CLASSES` (comma-separated).

use std::time::Duration;

use crate::job::Queue;

/// Scaling policy for one worker class.
#[derive(Debug, Clone)]
pub struct WorkerClassConfig {
    pub class: String,
    pub enabled: bool,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// True depth at or above which the class scales up.
    pub scale_up_threshold: u64,
    /// True depth at or below which the class scales down.
    pub scale_down_threshold: u64,
    /// Minimum time between scaling actions.
    pub cooldown: Duration,
    /// The queue this class consumes.
    pub queue: Queue,
}

impl WorkerClassConfig {
    pub fn new(class: impl Into<String>) -> Self {
        let class = class.into();
        Self {
            queue: Queue::for_class(&class),
            class,
            enabled: true,
            min_replicas: 0,
            max_replicas: 10,
            scale_up_threshold: 1,
            scale_down_threshold: 0,
            cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_replica_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_replicas = min;
        self.max_replicas = max;
        self
    }

    pub fn with_thresholds(mut self, up: u64, down: u64) -> Self {
        self.scale_up_threshold = up;
        self.scale_down_threshold = down;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Loads the class policy from `<CLASS>_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env(class: &str) -> Self {
        let prefix = class.to_uppercase();
        let defaults = Self::new(class);
        Self {
            enabled: env_parse(&format!("{prefix}_ENABLED"), defaults.enabled),
            min_replicas: env_parse(&format!("{prefix}_MIN_REPLICAS"), defaults.min_replicas),
            max_replicas: env_parse(&format!("{prefix}_MAX_REPLICAS"), defaults.max_replicas),
            scale_up_threshold: env_parse(
                &format!("{prefix}_SCALE_UP_THRESHOLD"),
                defaults.scale_up_threshold,
            ),
            scale_down_threshold: env_parse(
                &format!("{prefix}_SCALE_DOWN_THRESHOLD"),
                defaults.scale_down_threshold,
            ),
            cooldown: Duration::from_secs(env_parse(
                &format!("{prefix}_COOLDOWN"),
                defaults.cooldown.as_secs(),
            )),
            ..defaults
        }
    }
}

/// Autoscaler configuration: the tick interval and the classes it
/// manages.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub check_interval: Duration,
    pub classes: Vec<WorkerClassConfig>,
}

impl ScalerConfig {
    pub fn new(classes: Vec<WorkerClassConfig>) -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            classes,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Loads classes from `WORKER_CLASSES` (default: `browser`).
    pub fn from_env() -> Self {
        let class_list = std::env::var("WORKER_CLASSES")
            .unwrap_or_else(|_| "browser".to_string());
        let classes = class_list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(WorkerClassConfig::from_env)
            .collect();
        Self::new(classes)
    }

    pub fn enabled_classes(&self) -> impl Iterator<Item = &WorkerClassConfig> {
        self.classes.iter().filter(|c| c.enabled)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
