//! Worker heartbeat reporting.
//!
//! Every interval the worker writes a snapshot of its state and
//! resource usage to two places:
//!
//! - a hash at `worker:heartbeat:<class>:<worker_id>` with a TTL of
//!   3x the interval, so dead workers age out on their own
//! - the `worker:status` stream (capped), for time-series analysis
//!
//! The scaler reads the hashes to find busy workers before scaling
//! down; the orchestrator lists them for operators. A missing hash is
//! evidence of worker death.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::context::DeploymentContext;
use crate::metrics::{ResourceSampler, ResourceSnapshot, WorkerMetricsRecorder};
use crate::store::{StoreClient, StoreError};
use crate::worker::runtime::WorkerCounters;
use crate::worker::state::WorkerState;

/// Prefix of heartbeat hash keys.
pub const HEARTBEAT_KEY_PREFIX: &str = "worker:heartbeat";

/// Stream recording heartbeat history.
pub const STATUS_STREAM: &str = "worker:status";

/// Cap on the status stream length.
const STATUS_MAXLEN: u64 = 10_000;

/// Heartbeat hash key for one worker.
pub fn heartbeat_key(class: &str, worker_id: &str) -> String {
    format!("{HEARTBEAT_KEY_PREFIX}:{class}:{worker_id}")
}

/// Scan pattern for all heartbeats of a class (or all classes).
pub fn heartbeat_pattern(class: Option<&str>) -> String {
    match class {
        Some(class) => format!("{HEARTBEAT_KEY_PREFIX}:{class}:*"),
        None => format!("{HEARTBEAT_KEY_PREFIX}:*"),
    }
}

/// Parsed heartbeat of one worker.
#[derive(Debug, Clone)]
pub struct HeartbeatSnapshot {
    pub worker_id: String,
    pub class: String,
    pub state: String,
    pub uptime_seconds: f64,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub last_job_id: Option<String>,
}

impl HeartbeatSnapshot {
    pub fn is_busy(&self) -> bool {
        self.state == "busy"
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            worker_id: fields.get("worker_id")?.clone(),
            class: fields.get("class")?.clone(),
            state: fields.get("state")?.clone(),
            uptime_seconds: fields
                .get("uptime_seconds")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            jobs_processed: fields
                .get("jobs_processed")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            jobs_failed: fields
                .get("jobs_failed")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_job_id: fields.get("last_job_id").cloned().filter(|v| !v.is_empty()),
        })
    }
}

/// Fetches live heartbeats, optionally restricted to one class.
pub async fn fetch_heartbeats(
    store: &Arc<dyn StoreClient>,
    class: Option<&str>,
) -> Result<Vec<HeartbeatSnapshot>, StoreError> {
    let keys = store.scan_keys(&heartbeat_pattern(class)).await?;
    let mut snapshots = Vec::with_capacity(keys.len());
    for key in keys {
        let fields = store.hget_all(&key).await?;
        if let Some(snapshot) = HeartbeatSnapshot::from_fields(&fields) {
            snapshots.push(snapshot);
        }
    }
    Ok(snapshots)
}

/// Periodic heartbeat task for one worker.
pub struct Heartbeat {
    store: Arc<dyn StoreClient>,
    worker_id: String,
    class: String,
    interval: Duration,
    context: DeploymentContext,
    state_rx: watch::Receiver<WorkerState>,
    counters: Arc<WorkerCounters>,
    recorder: WorkerMetricsRecorder,
    sampler: ResourceSampler,
    started_at: Instant,
}

impl Heartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StoreClient>,
        worker_id: impl Into<String>,
        class: impl Into<String>,
        interval: Duration,
        context: DeploymentContext,
        state_rx: watch::Receiver<WorkerState>,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        let worker_id = worker_id.into();
        let class = class.into();
        let recorder = WorkerMetricsRecorder::new(&worker_id, &class, &context);
        Self {
            store,
            worker_id,
            class,
            interval,
            context,
            state_rx,
            counters,
            recorder,
            sampler: ResourceSampler::new(),
            started_at: Instant::now(),
        }
    }

    /// Emits one heartbeat: hash with TTL plus status stream append.
    /// Also refreshes the resource gauges so /metrics stays current.
    pub async fn beat_once(&mut self) -> Result<(), StoreError> {
        let state = *self.state_rx.borrow();
        let resources = self.sampler.sample();
        let uptime = self.started_at.elapsed().as_secs_f64();

        self.recorder.record_state(state);
        self.recorder.record_uptime(uptime);
        self.recorder.record_resources(&resources);

        let fields = self.fields(state, uptime, &resources);
        let key = heartbeat_key(&self.class, &self.worker_id);
        self.store
            .hset_all_with_ttl(&key, &fields, self.interval * 3)
            .await?;
        self.store
            .xadd_maxlen(STATUS_STREAM, Some(STATUS_MAXLEN), &fields)
            .await?;

        debug!(worker_id = %self.worker_id, state = %state, "heartbeat sent");
        Ok(())
    }

    /// Runs until the shutdown signal fires, then flushes one final
    /// heartbeat so the fleet view shows the worker as draining.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker_id = %self.worker_id, interval_secs = self.interval.as_secs(),
              "heartbeat started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat_once().await {
                        // Keep beating through store trouble; the TTL
                        // marks us dead only if this persists.
                        error!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        if let Err(e) = self.final_beat().await {
            error!(worker_id = %self.worker_id, error = %e, "final heartbeat failed");
        }
        info!(worker_id = %self.worker_id, "heartbeat stopped");
    }

    /// Final heartbeat, forced to the shutdown state.
    async fn final_beat(&mut self) -> Result<(), StoreError> {
        let resources = self.sampler.sample();
        let uptime = self.started_at.elapsed().as_secs_f64();
        let fields = self.fields(WorkerState::Shutdown, uptime, &resources);
        let key = heartbeat_key(&self.class, &self.worker_id);
        self.store
            .hset_all_with_ttl(&key, &fields, self.interval * 3)
            .await?;
        self.store
            .xadd_maxlen(STATUS_STREAM, Some(STATUS_MAXLEN), &fields)
            .await
            .map(|_| ())
    }

    fn fields(
        &self,
        state: WorkerState,
        uptime: f64,
        resources: &ResourceSnapshot,
    ) -> Vec<(String, String)> {
        vec![
            ("worker_id".to_string(), self.worker_id.clone()),
            ("class".to_string(), self.class.clone()),
            ("state".to_string(), state.to_string()),
            ("timestamp".to_string(), Utc::now().to_rfc3339()),
            ("uptime_seconds".to_string(), format!("{uptime:.1}")),
            (
                "jobs_processed".to_string(),
                self.counters.processed().to_string(),
            ),
            ("jobs_failed".to_string(), self.counters.failed().to_string()),
            (
                "last_job_id".to_string(),
                self.counters.last_job_id().unwrap_or_default(),
            ),
            (
                "resources".to_string(),
                serde_json::to_string(resources).unwrap_or_else(|_| "{}".to_string()),
            ),
            (
                "deployment".to_string(),
                serde_json::to_string(&self.context).unwrap_or_else(|_| "{}".to_string()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::worker::state::StateMachine;

    fn heartbeat(store: Arc<MemoryStore>) -> (Heartbeat, StateMachine, Arc<WorkerCounters>) {
        let machine = StateMachine::default();
        let counters = Arc::new(WorkerCounters::default());
        let hb = Heartbeat::new(
            store as Arc<dyn StoreClient>,
            "w1",
            "browser",
            Duration::from_secs(30),
            DeploymentContext::fixed("host-1", "test", "local"),
            machine.subscribe(),
            Arc::clone(&counters),
        );
        (hb, machine, counters)
    }

    #[tokio::test]
    async fn test_beat_writes_hash_and_stream() {
        let store = Arc::new(MemoryStore::new());
        let (mut hb, machine, counters) = heartbeat(Arc::clone(&store));
        machine.set(WorkerState::Busy);
        counters.record_success("job-9");

        hb.beat_once().await.unwrap();

        let fields = store
            .hget_all("worker:heartbeat:browser:w1")
            .await
            .unwrap();
        assert_eq!(fields["state"], "busy");
        assert_eq!(fields["jobs_processed"], "1");
        assert_eq!(fields["last_job_id"], "job-9");

        assert_eq!(store.xlen(STATUS_STREAM).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_heartbeats_filters_by_class() {
        let store = Arc::new(MemoryStore::new());
        let (mut hb, _, _) = heartbeat(Arc::clone(&store));
        hb.beat_once().await.unwrap();

        let dyn_store: Arc<dyn StoreClient> = store;
        let all = fetch_heartbeats(&dyn_store, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].worker_id, "w1");

        let browser = fetch_heartbeats(&dyn_store, Some("browser")).await.unwrap();
        assert_eq!(browser.len(), 1);

        let other = fetch_heartbeats(&dyn_store, Some("tankpit")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_final_beat_reports_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (mut hb, machine, _) = heartbeat(Arc::clone(&store));
        machine.set(WorkerState::Busy);

        hb.final_beat().await.unwrap();
        let fields = store
            .hget_all("worker:heartbeat:browser:w1")
            .await
            .unwrap();
        assert_eq!(fields["state"], "shutdown");
    }
}
