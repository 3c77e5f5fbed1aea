//! Prometheus metric registration and export.
//!
//! All metrics live in one registry initialised once at startup.
//! Worker metrics carry the full deployment label set so a fleet of
//! workers can be told apart on one dashboard; control-plane metrics
//! are labelled by worker class.

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Label names on every worker metric.
pub const WORKER_LABELS: [&str; 6] = [
    "worker_id",
    "class",
    "hostname",
    "container_id",
    "deployment_env",
    "region",
];

/// Global registry for all taskplane metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Worker state as a numeric gauge (see `WorkerState::as_gauge`).
pub static WORKER_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Seconds since the worker process started.
pub static WORKER_UPTIME_SECONDS: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs that reached a successful terminal outcome.
pub static WORKER_JOBS_PROCESSED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs that failed (transiently or permanently).
pub static WORKER_JOBS_FAILED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Resident set size of the worker process.
pub static WORKER_MEMORY_BYTES: OnceLock<GaugeVec> = OnceLock::new();

/// Process CPU usage percentage.
pub static WORKER_CPU_PERCENT: OnceLock<GaugeVec> = OnceLock::new();

/// Job processing duration, labelled by worker id and class.
pub static WORKER_JOB_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// True queue depth per worker class (pending + new estimate).
pub static QUEUE_TRUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Pending (delivered, unacked) entries per worker class.
pub static QUEUE_PENDING: OnceLock<GaugeVec> = OnceLock::new();

/// Queue health per class (0=healthy 1=degraded 2=unhealthy).
pub static QUEUE_HEALTH: OnceLock<GaugeVec> = OnceLock::new();

/// Observed replica count per worker class.
pub static CLASS_REPLICAS: OnceLock<GaugeVec> = OnceLock::new();

/// Scaling actions taken, labelled by class and direction.
pub static SCALING_ACTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialise all metrics and register them with the registry.
///
/// Call once at process startup; calling again is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction fails, which
/// only happens for invalid names or label sets.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let worker_state = GaugeVec::new(
        Opts::new(
            "worker_state",
            "Worker state (0=idle 1=waiting 2=busy 3=error 4=shutdown)",
        ),
        &WORKER_LABELS,
    )?;
    let worker_uptime = GaugeVec::new(
        Opts::new("worker_uptime_seconds", "Seconds since worker start"),
        &WORKER_LABELS,
    )?;
    let jobs_processed = CounterVec::new(
        Opts::new("worker_jobs_processed_total", "Jobs completed successfully"),
        &WORKER_LABELS,
    )?;
    let jobs_failed = CounterVec::new(
        Opts::new("worker_jobs_failed_total", "Jobs that failed"),
        &WORKER_LABELS,
    )?;
    let memory_bytes = GaugeVec::new(
        Opts::new("worker_memory_bytes", "Worker resident set size"),
        &WORKER_LABELS,
    )?;
    let cpu_percent = GaugeVec::new(
        Opts::new("worker_cpu_percent", "Worker process CPU usage"),
        &WORKER_LABELS,
    )?;
    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "worker_job_duration_seconds",
            "Job processing duration in seconds",
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["worker_id", "class"],
    )?;

    let queue_true_depth = GaugeVec::new(
        Opts::new("taskplane_queue_true_depth", "True queue depth per class"),
        &["class"],
    )?;
    let queue_pending = GaugeVec::new(
        Opts::new("taskplane_queue_pending", "Pending entries per class"),
        &["class"],
    )?;
    let queue_health = GaugeVec::new(
        Opts::new(
            "taskplane_queue_health",
            "Queue health per class (0=healthy 1=degraded 2=unhealthy)",
        ),
        &["class"],
    )?;
    let class_replicas = GaugeVec::new(
        Opts::new("taskplane_class_replicas", "Observed replicas per class"),
        &["class"],
    )?;
    let scaling_actions = CounterVec::new(
        Opts::new("taskplane_scaling_actions_total", "Scaling actions taken"),
        &["class", "direction"],
    )?;

    registry.register(Box::new(worker_state.clone()))?;
    registry.register(Box::new(worker_uptime.clone()))?;
    registry.register(Box::new(jobs_processed.clone()))?;
    registry.register(Box::new(jobs_failed.clone()))?;
    registry.register(Box::new(memory_bytes.clone()))?;
    registry.register(Box::new(cpu_percent.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_true_depth.clone()))?;
    registry.register(Box::new(queue_pending.clone()))?;
    registry.register(Box::new(queue_health.clone()))?;
    registry.register(Box::new(class_replicas.clone()))?;
    registry.register(Box::new(scaling_actions.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = WORKER_STATE.set(worker_state);
    let _ = WORKER_UPTIME_SECONDS.set(worker_uptime);
    let _ = WORKER_JOBS_PROCESSED_TOTAL.set(jobs_processed);
    let _ = WORKER_JOBS_FAILED_TOTAL.set(jobs_failed);
    let _ = WORKER_MEMORY_BYTES.set(memory_bytes);
    let _ = WORKER_CPU_PERCENT.set(cpu_percent);
    let _ = WORKER_JOB_DURATION_SECONDS.set(job_duration);
    let _ = QUEUE_TRUE_DEPTH.set(queue_true_depth);
    let _ = QUEUE_PENDING.set(queue_pending);
    let _ = QUEUE_HEALTH.set(queue_health);
    let _ = CLASS_REPLICAS.set(class_replicas);
    let _ = SCALING_ACTIONS_TOTAL.set(scaling_actions);

    tracing::info!("metrics initialised");
    Ok(())
}

/// Export all registered metrics in the Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# metrics not initialised\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# error encoding metrics: {e}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
    }

    #[test]
    fn test_export_contains_registered_metrics() {
        init_metrics().expect("init");
        WORKER_STATE
            .get()
            .expect("initialised")
            .with_label_values(&["w1", "browser", "host", "none", "test", "local"])
            .set(2.0);

        let text = export_metrics();
        assert!(text.contains("worker_state"));
        assert!(text.contains("worker_id=\"w1\""));
    }
}
