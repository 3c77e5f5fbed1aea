//! Fly.io scaling backend via the fly CLI.
//!
//! Worker classes map to process groups (`worker-<class>`); scaling
//! sets the machine count for the group, listing counts machines in
//! the started/running states from `fly status --json`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::backend::{check_target, run_cli, BackendHealth, ScaleError, ScalingBackend};

/// Scaling backend driving a Fly.io app.
pub struct FlyBackend {
    app: String,
    process_prefix: String,
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlyStatus {
    #[serde(rename = "Machines", default)]
    machines: Vec<FlyMachine>,
}

#[derive(Debug, Deserialize)]
struct FlyMachine {
    #[serde(default)]
    process_group: String,
    #[serde(default)]
    state: String,
}

impl FlyBackend {
    /// Builds the backend; the app name comes from the argument or the
    /// `FLY_APP_NAME` environment variable.
    pub fn new(app: Option<String>) -> Result<Self, ScaleError> {
        let app = app
            .or_else(|| std::env::var("FLY_APP_NAME").ok())
            .ok_or_else(|| {
                ScaleError::Permanent(
                    "fly app name missing: pass it or set FLY_APP_NAME".to_string(),
                )
            })?;
        Ok(Self {
            app,
            process_prefix: "worker".to_string(),
            region: std::env::var("FLY_REGION").ok(),
        })
    }

    fn process_group(&self, class: &str) -> String {
        format!("{}-{class}", self.process_prefix)
    }
}

#[async_trait]
impl ScalingBackend for FlyBackend {
    fn name(&self) -> &str {
        "fly"
    }

    async fn list(&self, class: &str) -> Result<u32, ScaleError> {
        let args = vec![
            "status".to_string(),
            "--app".to_string(),
            self.app.clone(),
            "--json".to_string(),
        ];
        let stdout = run_cli("fly", &args).await?;
        let status: FlyStatus = serde_json::from_str(&stdout)
            .map_err(|e| ScaleError::Permanent(format!("unparseable fly status: {e}")))?;

        let group = self.process_group(class);
        Ok(count_running(&status, &group))
    }

    async fn scale(&self, class: &str, target: u32) -> Result<u32, ScaleError> {
        check_target(self.name(), class, target)?;
        let group = self.process_group(class);

        let mut args = vec![
            "scale".to_string(),
            "count".to_string(),
            format!("{group}={target}"),
            "--app".to_string(),
            self.app.clone(),
            "--yes".to_string(),
        ];
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }

        info!(app = %self.app, group = %group, machines = target, "scaling fly machines");
        run_cli("fly", &args).await?;
        Ok(target)
    }

    async fn health(&self) -> BackendHealth {
        let args = vec![
            "status".to_string(),
            "--app".to_string(),
            self.app.clone(),
            "--json".to_string(),
        ];
        match run_cli("fly", &args).await {
            Ok(_) => BackendHealth::Ok,
            Err(e) => {
                warn!(error = %e, "fly health probe failed");
                BackendHealth::Degraded
            }
        }
    }
}

fn count_running(status: &FlyStatus, group: &str) -> u32 {
    status
        .machines
        .iter()
        .filter(|m| m.process_group == group)
        .filter(|m| matches!(m.state.as_str(), "started" | "running"))
        .count() as u32
}
