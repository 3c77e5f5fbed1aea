//! Container-daemon scaling backend using the bollard crate.
//!
//! Workers run as labelled containers on the local daemon:
//!
//! - `taskplane.managed=true` marks containers owned by this backend
//! - `taskplane.class=<class>` selects the worker class
//!
//! `list` counts running containers matching both labels; `scale`
//! starts or stops numbered containers (`<project>-<class>-<n>`) one
//! at a time until the observed count matches the target. Scale-down
//! removes the highest-numbered containers first so the fleet stays
//! densely numbered.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use tracing::{info, warn};

use super::backend::{check_target, BackendHealth, ScaleError, ScalingBackend};

const MANAGED_LABEL: &str = "taskplane.managed=true";
const CLASS_LABEL: &str = "taskplane.class";

/// Seconds a container gets to stop gracefully before the daemon kills
/// it; matches the worker's shutdown grace.
const STOP_TIMEOUT_SECS: i64 = 30;

/// Configuration for worker containers.
#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Worker image to run.
    pub image: String,
    /// Container name prefix.
    pub project: String,
    /// Network to attach workers to (daemon default when `None`).
    pub network: Option<String>,
    /// Base environment passed to every worker (store URLs etc.).
    pub env: Vec<String>,
    /// Metrics port exposed inside worker containers.
    pub metrics_port: u16,
}

impl DockerBackendConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            project: "taskplane".to_string(),
            network: None,
            env: Vec::new(),
            metrics_port: 9100,
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// Scaling backend talking to the local container daemon.
pub struct DockerBackend {
    docker: Docker,
    config: DockerBackendConfig,
}

impl DockerBackend {
    /// Connects to the daemon via its local socket.
    pub fn new(config: DockerBackendConfig) -> Result<Self, ScaleError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ScaleError::Permanent(format!("container daemon unavailable: {e}")))?;
        Ok(Self { docker, config })
    }

    fn container_name(&self, class: &str, n: u32) -> String {
        format!("{}-{class}-{n}", self.config.project)
    }

    fn class_filters(&self, class: &str) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![MANAGED_LABEL.to_string(), format!("{CLASS_LABEL}={class}")],
        );
        filters.insert("status".to_string(), vec!["running".to_string()]);
        filters
    }

    async fn running_containers(&self, class: &str) -> Result<Vec<String>, ScaleError> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: self.class_filters(class),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        let mut names: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|n| n.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_worker(&self, class: &str, n: u32) -> Result<(), ScaleError> {
        let name = self.container_name(class, n);

        // A crashed container may still hold the name; clear it first
        // so create does not 409.
        self.remove_if_exists(&name).await?;

        let mut labels = HashMap::new();
        labels.insert("taskplane.managed".to_string(), "true".to_string());
        labels.insert(CLASS_LABEL.to_string(), class.to_string());

        let mut env = self.config.env.clone();
        env.push(format!("WORKER_CLASS={class}"));
        env.push(format!("METRICS_PORT={}", self.config.metrics_port));

        let host_config = HostConfig {
            network_mode: self.config.network.clone(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(classify)?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)?;

        info!(container = %name, class = %class, "worker container started");
        Ok(())
    }

    async fn remove_if_exists(&self, name: &str) -> Result<(), ScaleError> {
        let result = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => {
                warn!(container = %name, "removed stale container before recreation");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), ScaleError> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
            .map_err(classify)?;
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)?;
        info!(container = %name, "worker container removed");
        Ok(())
    }
}

/// 4xx daemon responses will not improve with retries; everything else
/// (socket trouble, 5xx) might.
fn classify(err: bollard::errors::Error) -> ScaleError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if (400..500).contains(status_code) =>
        {
            ScaleError::Permanent(err.to_string())
        }
        _ => ScaleError::Retryable(err.to_string()),
    }
}

#[async_trait]
impl ScalingBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list(&self, class: &str) -> Result<u32, ScaleError> {
        Ok(self.running_containers(class).await?.len() as u32)
    }

    async fn scale(&self, class: &str, target: u32) -> Result<u32, ScaleError> {
        check_target(self.name(), class, target)?;

        let running = self.running_containers(class).await?;
        let current = running.len() as u32;
        if current == target {
            info!(class = %class, replicas = current, "already at target");
            return Ok(current);
        }

        if current < target {
            info!(class = %class, from = current, to = target, "scaling up");
            for n in (current + 1)..=target {
                self.create_worker(class, n).await?;
            }
        } else {
            info!(class = %class, from = current, to = target, "scaling down");
            // Highest-numbered first; container names sort by their
            // trailing index for a fixed prefix.
            let mut names = running;
            names.sort_by(|a, b| container_index(b).cmp(&container_index(a)));
            for name in names.iter().take((current - target) as usize) {
                self.stop_and_remove(name).await?;
            }
        }

        self.list(class).await
    }

    async fn health(&self) -> BackendHealth {
        match self.docker.ping().await {
            Ok(_) => BackendHealth::Ok,
            Err(e) => {
                warn!(error = %e, "container daemon health probe failed");
                BackendHealth::Degraded
            }
        }
    }
}

fn container_index(name: &str) -> u32 {
    name.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_index_parses_trailing_number() {
        assert_eq!(container_index("taskplane-browser-12"), 12);
        assert_eq!(container_index("taskplane-browser-1"), 1);
        assert_eq!(container_index("unnumbered"), 0);
    }

    #[test]
    fn test_classify_client_errors_permanent() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        assert!(!classify(err).is_retryable());

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon error".to_string(),
        };
        assert!(classify(err).is_retryable());
    }

    #[test]
    fn test_config_builder() {
        let config = DockerBackendConfig::new("taskplane-worker:latest")
            .with_project("myproj")
            .with_network("myproj_default")
            .with_env(vec!["STORE_URL=redis://store:6379/0".to_string()]);
        assert_eq!(config.project, "myproj");
        assert_eq!(config.network.as_deref(), Some("myproj_default"));
        assert_eq!(config.metrics_port, 9100);
    }
}
