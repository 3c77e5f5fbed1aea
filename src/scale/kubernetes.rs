//! Kubernetes scaling backend via kubectl.
//!
//! Each worker class maps to a deployment named
//! `<prefix>-<class>`. Scaling sets the deployment's replica count;
//! listing reads `status.readyReplicas` from the deployment JSON.

use async_trait::async_trait;
use tracing::{info, warn};

use super::backend::{check_target, run_cli, BackendHealth, ScaleError, ScalingBackend};

/// Scaling backend driving a cluster through kubectl.
pub struct KubernetesBackend {
    namespace: String,
    deployment_prefix: String,
    kubeconfig: Option<String>,
}

impl KubernetesBackend {
    pub fn new(namespace: impl Into<String>, deployment_prefix: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            deployment_prefix: deployment_prefix.into(),
            kubeconfig: std::env::var("KUBECONFIG").ok(),
        }
    }

    fn deployment_name(&self, class: &str) -> String {
        format!("{}-{class}", self.deployment_prefix)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![format!("--namespace={}", self.namespace)];
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push(format!("--kubeconfig={kubeconfig}"));
        }
        args
    }
}

#[async_trait]
impl ScalingBackend for KubernetesBackend {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn list(&self, class: &str) -> Result<u32, ScaleError> {
        let deployment = self.deployment_name(class);
        let mut args = vec![
            "get".to_string(),
            format!("deployment/{deployment}"),
            "-o".to_string(),
            "json".to_string(),
        ];
        args.extend(self.base_args());

        let stdout = run_cli("kubectl", &args).await?;
        let parsed: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| ScaleError::Permanent(format!("unparseable deployment json: {e}")))?;

        Ok(parsed["status"]["readyReplicas"].as_u64().unwrap_or(0) as u32)
    }

    async fn scale(&self, class: &str, target: u32) -> Result<u32, ScaleError> {
        check_target(self.name(), class, target)?;
        let deployment = self.deployment_name(class);

        let mut args = vec![
            "scale".to_string(),
            format!("deployment/{deployment}"),
            format!("--replicas={target}"),
        ];
        args.extend(self.base_args());

        info!(deployment = %deployment, replicas = target, "scaling deployment");
        run_cli("kubectl", &args).await?;
        Ok(target)
    }

    async fn health(&self) -> BackendHealth {
        let mut args = vec!["get".to_string(), "--raw".to_string(), "/readyz".to_string()];
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push(format!("--kubeconfig={kubeconfig}"));
        }
        match run_cli("kubectl", &args).await {
            Ok(_) => BackendHealth::Ok,
            Err(e) => {
                warn!(error = %e, "cluster health probe failed");
                BackendHealth::Degraded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_name_includes_class() {
        let backend = KubernetesBackend::new("workers", "taskplane-worker");
        assert_eq!(backend.deployment_name("browser"), "taskplane-worker-browser");
    }

    #[test]
    fn test_ready_replicas_parse() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"status": {"replicas": 4, "readyReplicas": 3}}"#,
        )
        .unwrap();
        assert_eq!(json["status"]["readyReplicas"].as_u64().unwrap_or(0), 3);

        // A deployment scaled to zero omits readyReplicas entirely.
        let json: serde_json::Value = serde_json::from_str(r#"{"status": {}}"#).unwrap();
        assert_eq!(json["status"]["readyReplicas"].as_u64().unwrap_or(0), 0);
    }
}
