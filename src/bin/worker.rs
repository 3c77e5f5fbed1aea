//! taskplane worker entry point.
//!
//! Consumes jobs from the class queue and dispatches them to the
//! registered capability handlers. Concurrency within the process is
//! obtained by running `WORKER_CONCURRENCY` independent loops, each a
//! distinct consumer of the same group with its own session bag and
//! heartbeat. The HTTP surface (health + metrics) is served once per
//! process on `METRICS_PORT`.
//!
//! Capability handlers are registered here, at the binary boundary;
//! the runtime itself knows nothing about concrete job payloads. The
//! built-in `echo.` handler exists so a freshly deployed fleet can be
//! smoke-tested end to end.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use taskplane::broker::Broker;
use taskplane::config::{build_store, init_tracing, Config};
use taskplane::context::DeploymentContext;
use taskplane::metrics::init_metrics;
use taskplane::worker::{
    Handler, HandlerError, HandlerRegistry, Heartbeat, HttpState, Session, Worker, WorkerConfig,
    WorkerError,
};

/// Seconds the in-flight work gets after a shutdown signal before the
/// process exits regardless.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Stateless session for the echo handler.
struct EchoSession;

#[async_trait]
impl Session for EchoSession {
    async fn teardown(&mut self) {}
}

/// Built-in smoke-test capability: `echo.ping` and `echo.say`.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn prefix(&self) -> &str {
        "echo."
    }

    fn arg_keys(&self) -> &[&str] {
        &["message"]
    }

    async fn create_session(&self) -> Result<Box<dyn Session>, HandlerError> {
        Ok(Box::new(EchoSession))
    }

    async fn handle(
        &self,
        op: &str,
        args: Map<String, Value>,
        _session: &mut dyn Session,
    ) -> Result<Value, HandlerError> {
        match op {
            "ping" => Ok(json!("pong")),
            "say" => Ok(args.get("message").cloned().unwrap_or(Value::Null)),
            other => Err(HandlerError::permanent(format!("unknown echo op '{other}'"))),
        }
    }
}

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(EchoHandler));
    // Additional capability handlers (browser automation, protocol
    // sessions, ...) register here.
    registry
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let log_format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    init_tracing(&log_level, log_format);

    if let Err(e) = init_metrics() {
        error!(error = %e, "metrics init failed");
        return ExitCode::from(1);
    }

    let config = Config::from_env();
    let context = DeploymentContext::detect();
    info!(class = %config.worker_class, concurrency = config.worker_concurrency,
          deployment_env = %context.deployment_env, "worker process starting");

    let store = match build_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store unreachable");
            return ExitCode::from(2);
        }
    };
    let broker = Arc::new(Broker::new(Arc::clone(&store)));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    taskplane::cli::spawn_signal_handler(shutdown_tx.clone());

    let mut worker_tasks = Vec::new();
    let mut handles = Vec::new();
    for slot in 0..config.worker_concurrency {
        let mut worker_config = WorkerConfig::new(&config.worker_class);
        if let Some(max_tasks) = config.max_tasks_per_child {
            worker_config = worker_config.with_max_tasks_per_child(max_tasks);
        }

        let worker = Worker::new(
            worker_config,
            Arc::clone(&broker),
            build_registry(),
            &context,
        );
        let worker_id = worker.worker_id().to_string();
        handles.push(worker.shutdown_handle());

        let heartbeat = Heartbeat::new(
            Arc::clone(&store),
            &worker_id,
            &config.worker_class,
            config.heartbeat_interval,
            context.clone(),
            worker.state_rx(),
            worker.counters(),
        );
        tokio::spawn(heartbeat.run(worker.shutdown_rx()));

        if slot == 0 {
            let http_state = HttpState::new(
                &worker_id,
                &config.worker_class,
                context.clone(),
                worker.state_rx(),
                worker.counters(),
            );
            let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
            let http_shutdown = worker.shutdown_rx();
            tokio::spawn(async move {
                if let Err(e) = taskplane::worker::http::serve(addr, http_state, http_shutdown).await
                {
                    warn!(error = %e, "http surface failed");
                }
            });
        }

        worker_tasks.push(tokio::spawn(worker.run()));
    }

    // Fan the process-level shutdown signal out to every loop, then
    // enforce the drain grace window: a loop stuck past it is
    // abandoned and its pending entry left for a peer to reclaim.
    let mut process_shutdown = shutdown_tx.subscribe();
    let relay = tokio::spawn(async move {
        if process_shutdown.recv().await.is_ok() {
            for handle in handles {
                handle.trigger();
            }
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            warn!("drain grace window elapsed, terminating");
            std::process::exit(0);
        }
    });

    let mut exit = ExitCode::SUCCESS;
    for task in worker_tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(WorkerError::Broker(e))) if !e.is_retryable() => {
                error!(error = %e, "worker failed on store");
                exit = ExitCode::from(2);
            }
            Ok(Err(e)) => {
                error!(error = %e, "worker exited with error");
                exit = ExitCode::from(1);
            }
            Err(e) => {
                error!(error = %e, "worker task panicked");
                exit = ExitCode::from(1);
            }
        }
    }
    relay.abort();

    info!("worker process stopped");
    exit
}
