//! Deployment context threaded through the system.
//!
//! Instead of process-global variables, one [`DeploymentContext`] is
//! built at startup and handed to the components that label their
//! output with it (heartbeats, metrics, health responses).

use std::env;

use serde::{Deserialize, Serialize};

/// Where this process is running, for labels on metrics and heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentContext {
    pub hostname: String,
    /// Container id when running containerised, otherwise "none".
    pub container_id: String,
    /// Deployment environment ("production", "staging", "local", ...).
    pub deployment_env: String,
    pub region: String,
}

impl DeploymentContext {
    /// Detects the context from the environment.
    ///
    /// `DEPLOYMENT_ENV` and `REGION` come from env vars (defaulting to
    /// "local" / "unknown"); the container id is the hostname when
    /// `/.dockerenv` exists, which is how the container runtime names
    /// containers by default.
    pub fn detect() -> Self {
        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        let container_id = if std::path::Path::new("/.dockerenv").exists() {
            hostname.clone()
        } else {
            "none".to_string()
        };
        Self {
            hostname,
            container_id,
            deployment_env: env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "local".to_string()),
            region: env::var("REGION").unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    /// Fixed context for tests.
    pub fn fixed(
        hostname: impl Into<String>,
        deployment_env: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            container_id: "none".to_string(),
            deployment_env: deployment_env.into(),
            region: region.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_context() {
        let ctx = DeploymentContext::fixed("host-1", "staging", "iad");
        assert_eq!(ctx.hostname, "host-1");
        assert_eq!(ctx.deployment_env, "staging");
        assert_eq!(ctx.region, "iad");
        assert_eq!(ctx.container_id, "none");
    }

    #[test]
    fn test_detect_populates_all_fields() {
        let ctx = DeploymentContext::detect();
        assert!(!ctx.hostname.is_empty());
        assert!(!ctx.deployment_env.is_empty());
        assert!(!ctx.region.is_empty());
    }
}
