//! Scaling backend contract.
//!
//! A backend can list and adjust the replica count of a worker class.
//! Implementations exist for the local container daemon (bollard), a
//! Kubernetes cluster (kubectl), and a Fly.io app (fly CLI). All of
//! them must be:
//!
//! - **idempotent**: `scale(target)` at `target` is a no-op
//! - **bounded**: targets above the backend's hard cap are refused
//! - **observable**: every change is logged with the class and counts
//!
//! Failures are classified retryable/permanent so the scaling loop
//! knows whether the next tick should try again.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Absolute replica ceiling any backend will accept, regardless of
/// per-class configuration.
pub const HARD_REPLICA_CAP: u32 = 100;

/// Backend command failures.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// Worth retrying on the next tick (daemon busy, network, ...).
    #[error("retryable backend failure: {0}")]
    Retryable(String),

    /// Retrying will not help (bad configuration, missing binary, a
    /// refused target).
    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl ScaleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScaleError::Retryable(_))
    }
}

/// Health of a scaling backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Ok,
    Degraded,
}

/// Uniform interface over orchestration backends.
#[async_trait]
pub trait ScalingBackend: Send + Sync {
    /// Short name for logs and events ("docker", "kubernetes", "fly").
    fn name(&self) -> &str;

    /// Current replica count for the class.
    async fn list(&self, class: &str) -> Result<u32, ScaleError>;

    /// Scales the class to `target` replicas and returns the new
    /// count. Re-issuing at the current count is a no-op.
    async fn scale(&self, class: &str, target: u32) -> Result<u32, ScaleError>;

    /// Backend reachability probe.
    async fn health(&self) -> BackendHealth;
}

/// Rejects targets beyond the hard cap. Called by every backend before
/// acting.
pub(crate) fn check_target(backend: &str, class: &str, target: u32) -> Result<(), ScaleError> {
    if target > HARD_REPLICA_CAP {
        return Err(ScaleError::Permanent(format!(
            "{backend}: refusing to scale {class} to {target} (hard cap {HARD_REPLICA_CAP})"
        )));
    }
    Ok(())
}

/// Runs a CLI command, returning stdout on success.
///
/// Non-zero exits are retryable (the control plane may be briefly
/// unavailable); a missing binary is permanent.
pub(crate) async fn run_cli(program: &str, args: &[String]) -> Result<String, ScaleError> {
    debug!(program = %program, args = ?args, "running backend command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ScaleError::Permanent(format!("{program} not found on PATH: {e}"))
            }
            _ => ScaleError::Retryable(format!("{program} failed to spawn: {e}")),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(program = %program, status = ?output.status.code(), stderr = %stderr,
               "backend command failed");
        return Err(ScaleError::Retryable(format!(
            "{program} exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_target_enforces_hard_cap() {
        assert!(check_target("docker", "browser", 10).is_ok());
        assert!(check_target("docker", "browser", HARD_REPLICA_CAP).is_ok());
        let err = check_target("docker", "browser", HARD_REPLICA_CAP + 1).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_run_cli_missing_binary_is_permanent() {
        let err = run_cli("definitely-not-a-real-binary-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_run_cli_nonzero_exit_is_retryable() {
        let err = run_cli("false", &[]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_run_cli_captures_stdout() {
        let out = run_cli("echo", &["hello".to_string()]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
