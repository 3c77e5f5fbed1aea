//! CLI command definitions and dispatch for the control plane.
//!
//! Exit codes: 0 on normal shutdown, 1 on configuration errors, 2 when
//! the store is unreachable after retries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{build_store, Config};
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::scale::{DockerBackend, DockerBackendConfig, FlyBackend, KubernetesBackend, ScalingBackend};
use crate::scaler::{Autoscaler, ScalerConfig, ScalingService, WorkerClassConfig};
use crate::store::{StoreClient, StoreError};

/// Attempts made to reach the store before giving up with exit code 2.
const STORE_CONNECT_ATTEMPTS: u32 = 3;

/// Distributed task-execution control plane.
#[derive(Parser)]
#[command(name = "taskplane")]
#[command(about = "Queue-driven worker fleet control plane")]
#[command(version)]
#[command(
    long_about = "taskplane watches job queues and sizes the worker fleet to match.\n\nExample usage:\n  taskplane autoscale --orchestrator container --check-interval 30\n  taskplane workers browser\n  taskplane scale browser 4 --orchestrator container"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Store URL; overrides STORE_URL.
    #[arg(long, global = true)]
    pub store_url: Option<String>,

    /// Secondary store URL; overrides STORE_FALLBACK_URL.
    #[arg(long, global = true)]
    pub fallback_store_url: Option<String>,
}

/// Available subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the autoscaler loop.
    #[command(alias = "run")]
    Autoscale(AutoscaleArgs),

    /// List live workers from their heartbeats.
    Workers(WorkersArgs),

    /// Scale a worker class to an explicit replica count.
    Scale(ScaleArgs),

    /// Ask one worker to drain and exit.
    Drain(DrainArgs),

    /// Re-enqueue a class's dead-lettered jobs with a fresh retry
    /// budget.
    ReprocessDeadletter(ReprocessArgs),
}

/// Orchestration backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OrchestratorKind {
    /// Local container daemon.
    Container,
    /// Kubernetes deployments via kubectl.
    Cluster,
    /// Cloud machine fleet via the fly CLI.
    Cloud,
}

#[derive(Parser, Debug)]
pub struct AutoscaleArgs {
    /// Seconds between scaling checks.
    #[arg(long, default_value = "30")]
    pub check_interval: u64,

    /// Orchestration backend to drive.
    #[arg(long, value_enum, default_value_t = OrchestratorKind::Container)]
    pub orchestrator: OrchestratorKind,

    /// Worker classes to manage (repeatable); defaults to
    /// WORKER_CLASSES from the environment.
    #[arg(long = "class")]
    pub classes: Vec<String>,

    /// Listen address of the control plane's own /health + /metrics.
    #[arg(long, default_value = "127.0.0.1:9150")]
    pub metrics_url: String,
}

#[derive(Parser, Debug)]
pub struct WorkersArgs {
    /// Restrict the listing to one class.
    pub class: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ScaleArgs {
    /// Worker class to scale.
    pub class: String,

    /// Target replica count.
    pub replicas: u32,

    /// Orchestration backend to drive.
    #[arg(long, value_enum, default_value_t = OrchestratorKind::Container)]
    pub orchestrator: OrchestratorKind,
}

#[derive(Parser, Debug)]
pub struct DrainArgs {
    /// Worker id to drain (see `taskplane workers`).
    pub worker_id: String,
}

#[derive(Parser, Debug)]
pub struct ReprocessArgs {
    /// Worker class whose dead-letter stream to reprocess.
    pub class: String,
}

/// CLI failures, carrying their process exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store unreachable after {STORE_CONNECT_ATTEMPTS} attempts: {0}")]
    StoreUnreachable(String),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) => 1,
            CliError::StoreUnreachable(_) => 2,
            CliError::Runtime(_) => 1,
        }
    }
}

impl From<OrchestratorError> for CliError {
    fn from(e: OrchestratorError) -> Self {
        CliError::Runtime(anyhow::Error::new(e))
    }
}

/// Parses the process arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the selected command to completion.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::from_env();
    if let Some(url) = &cli.store_url {
        config.store_url = url.clone();
    }
    if let Some(url) = &cli.fallback_store_url {
        config.fallback_url = Some(url.clone());
    }

    match cli.command {
        Commands::Autoscale(args) => autoscale(config, args).await,
        Commands::Workers(args) => {
            let store = connect_store(&config).await?;
            let backend = build_backend(OrchestratorKind::Container, &config)?;
            let orchestrator = Orchestrator::new(store, backend);
            let workers = orchestrator.list_workers(args.class.as_deref()).await?;
            if workers.is_empty() {
                println!("no live workers");
                return Ok(());
            }
            println!(
                "{:<24} {:<10} {:<10} {:>10} {:>8} {:>8}",
                "WORKER", "CLASS", "STATE", "UPTIME", "DONE", "FAILED"
            );
            for w in workers {
                println!(
                    "{:<24} {:<10} {:<10} {:>9.0}s {:>8} {:>8}",
                    w.worker_id, w.class, w.state, w.uptime_seconds, w.jobs_processed,
                    w.jobs_failed
                );
            }
            Ok(())
        }
        Commands::Scale(args) => {
            let store = connect_store(&config).await?;
            let backend = build_backend(args.orchestrator, &config)?;
            let orchestrator = Orchestrator::new(store, backend);
            let class_config = WorkerClassConfig::from_env(&args.class);
            let observed = orchestrator.scale(&class_config, args.replicas).await?;
            println!("{} scaled to {observed} replicas", args.class);
            Ok(())
        }
        Commands::Drain(args) => {
            let store = connect_store(&config).await?;
            let backend = build_backend(OrchestratorKind::Container, &config)?;
            let orchestrator = Orchestrator::new(store, backend);
            orchestrator.drain(&args.worker_id).await?;
            println!("drain requested for {}", args.worker_id);
            Ok(())
        }
        Commands::ReprocessDeadletter(args) => {
            let store = connect_store(&config).await?;
            let backend = build_backend(OrchestratorKind::Container, &config)?;
            let orchestrator = Orchestrator::new(store, backend);
            let republished = orchestrator.reprocess_deadletter(&args.class).await?;
            println!("re-enqueued {republished} dead-lettered jobs for {}", args.class);
            Ok(())
        }
    }
}

/// Runs the autoscaler loop until a shutdown signal.
async fn autoscale(config: Config, args: AutoscaleArgs) -> Result<(), CliError> {
    init_metrics().map_err(|e| CliError::Config(format!("metrics init failed: {e}")))?;

    let store = connect_store(&config).await?;
    let backend = build_backend(args.orchestrator, &config)?;

    let mut scaler_config =
        ScalerConfig::from_env().with_check_interval(Duration::from_secs(args.check_interval));
    if !args.classes.is_empty() {
        scaler_config.classes = args
            .classes
            .iter()
            .map(|c| WorkerClassConfig::from_env(c))
            .collect();
    }
    if scaler_config.classes.is_empty() {
        return Err(CliError::Config("no worker classes configured".to_string()));
    }

    let metrics_addr: SocketAddr = args
        .metrics_url
        .parse()
        .map_err(|e| CliError::Config(format!("invalid --metrics-url: {e}")))?;

    let service = ScalingService::new(Arc::clone(&store), backend);
    let autoscaler = Autoscaler::new(scaler_config, service, Arc::clone(&store));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_signal_handler(shutdown_tx.clone());
    tokio::spawn(serve_control_plane(metrics_addr, shutdown_tx.subscribe()));

    autoscaler.run(shutdown_tx.subscribe()).await;
    Ok(())
}

/// The control plane's own /health and /metrics surface.
async fn serve_control_plane(addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) {
    let router = Router::new()
        .route(
            "/health",
            get(|| async {
                axum::Json(serde_json::json!({
                    "status": "healthy",
                    "service": "autoscaler",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }))
            }),
        )
        .route("/metrics", get(|| async { export_metrics() }));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %addr, error = %e, "control plane http surface unavailable");
            return;
        }
    };
    info!(addr = %addr, "control plane http surface listening");
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "control plane http surface failed");
    }
}

/// Translates SIGINT/SIGTERM into the shutdown broadcast.
pub fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(());
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c");
        }
        let _ = shutdown_tx.send(());
    });
}

/// Connects to the store with bounded retries.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn StoreClient>, CliError> {
    let mut last_error = String::new();
    for attempt in 1..=STORE_CONNECT_ATTEMPTS {
        match build_store(config).await {
            Ok(store) => return Ok(store),
            Err(StoreError::Permanent(msg)) => {
                return Err(CliError::Config(format!("store configuration: {msg}")));
            }
            Err(e) => {
                warn!(attempt, error = %e, "store connection failed");
                last_error = e.to_string();
                tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
            }
        }
    }
    Err(CliError::StoreUnreachable(last_error))
}

/// Builds the selected scaling backend.
pub fn build_backend(
    kind: OrchestratorKind,
    config: &Config,
) -> Result<Arc<dyn ScalingBackend>, CliError> {
    match kind {
        OrchestratorKind::Container => {
            let image = std::env::var("WORKER_IMAGE")
                .unwrap_or_else(|_| "taskplane-worker:latest".to_string());
            let mut docker_config = DockerBackendConfig::new(image)
                .with_env(vec![format!("STORE_URL={}", config.store_url)]);
            if let Ok(network) = std::env::var("WORKER_NETWORK") {
                docker_config = docker_config.with_network(network);
            }
            let backend = DockerBackend::new(docker_config)
                .map_err(|e| CliError::Config(e.to_string()))?;
            Ok(Arc::new(backend))
        }
        OrchestratorKind::Cluster => {
            let namespace = std::env::var("K8S_NAMESPACE").unwrap_or_else(|_| "default".to_string());
            let prefix = std::env::var("K8S_DEPLOYMENT_PREFIX")
                .unwrap_or_else(|_| "taskplane-worker".to_string());
            Ok(Arc::new(KubernetesBackend::new(namespace, prefix)))
        }
        OrchestratorKind::Cloud => {
            let backend = FlyBackend::new(None).map_err(|e| CliError::Config(e.to_string()))?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_autoscale_args() {
        let cli = Cli::parse_from([
            "taskplane",
            "autoscale",
            "--check-interval",
            "10",
            "--orchestrator",
            "cluster",
            "--class",
            "browser",
            "--class",
            "tankpit",
        ]);
        match cli.command {
            Commands::Autoscale(args) => {
                assert_eq!(args.check_interval, 10);
                assert_eq!(args.orchestrator, OrchestratorKind::Cluster);
                assert_eq!(args.classes, vec!["browser", "tankpit"]);
            }
            _ => panic!("expected autoscale"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Config("x".into()).exit_code(), 1);
        assert_eq!(CliError::StoreUnreachable("x".into()).exit_code(), 2);
    }

    #[test]
    fn test_global_store_url_flag() {
        let cli = Cli::parse_from([
            "taskplane",
            "workers",
            "--store-url",
            "redis://elsewhere:6379/0",
        ]);
        assert_eq!(cli.store_url.as_deref(), Some("redis://elsewhere:6379/0"));
    }
}
