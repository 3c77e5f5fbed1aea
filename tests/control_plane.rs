//! End-to-end scenarios over the in-memory store and a recording
//! scaling backend: jobs published by a front-end, picked up by the
//! autoscaler, processed by real worker loops, results delivered.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use taskplane::broker::Broker;
use taskplane::context::DeploymentContext;
use taskplane::job::{Job, JobStatus, Queue};
use taskplane::scale::{MockBackend, ScalingBackend};
use taskplane::scaler::{Autoscaler, ScalerConfig, ScalingService, WorkerClassConfig};
use taskplane::store::{MemoryStore, StoreClient, StoreError};
use taskplane::worker::{
    Handler, HandlerError, HandlerRegistry, Session, Worker, WorkerConfig,
};

struct NullSession;

#[async_trait]
impl Session for NullSession {
    async fn teardown(&mut self) {}
}

/// Handler that succeeds after a configurable number of transient
/// failures per job id (counted globally for simplicity).
struct FlakyHandler {
    failures_before_success: u32,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Handler for FlakyHandler {
    fn prefix(&self) -> &str {
        "browser."
    }

    fn arg_keys(&self) -> &[&str] {
        &["url"]
    }

    async fn create_session(&self) -> Result<Box<dyn Session>, HandlerError> {
        Ok(Box::new(NullSession))
    }

    async fn handle(
        &self,
        _op: &str,
        args: Map<String, Value>,
        _session: &mut dyn Session,
    ) -> Result<Value, HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures_before_success {
            return Err(HandlerError::transient("upstream timeout"));
        }
        Ok(json!({ "navigated": args.get("url") }))
    }
}

fn harness() -> (Arc<MemoryStore>, Arc<dyn StoreClient>, Arc<Broker>) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn StoreClient> = Arc::clone(&store) as Arc<dyn StoreClient>;
    let broker = Arc::new(Broker::new(Arc::clone(&dyn_store)));
    (store, dyn_store, broker)
}

fn spawn_worker(
    broker: &Arc<Broker>,
    worker_id: &str,
    failures_before_success: u32,
) -> (
    taskplane::worker::ShutdownHandle,
    tokio::task::JoinHandle<Result<(), taskplane::worker::WorkerError>>,
    Arc<AtomicU32>,
) {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FlakyHandler {
        failures_before_success,
        attempts: Arc::clone(&attempts),
    }));

    let config = WorkerConfig::new("browser")
        .with_worker_id(worker_id)
        .with_consume_block(Duration::from_millis(10))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_reclaim(Duration::ZERO, Duration::ZERO);
    let context = DeploymentContext::fixed("test-host", "test", "local");
    let worker = Worker::new(config, Arc::clone(broker), registry, &context);
    let handle = worker.shutdown_handle();
    let task = tokio::spawn(worker.run());
    (handle, task, attempts)
}

fn browser_job() -> Job {
    let mut payload = Map::new();
    payload.insert("url".to_string(), json!("https://example.com"));
    Job::new("browser.navigate", payload).with_reply_stream("browser:results")
}

async fn ok_results(store: &Arc<MemoryStore>) -> Vec<taskplane::job::JobResult> {
    store
        .xrange_all("browser:results")
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.fields.get("json"))
        .filter_map(|raw| taskplane::job::JobResult::decode(raw).ok())
        .filter(|r| r.status == JobStatus::Ok)
        .collect()
}

/// Zero-to-one bootstrap: with no workers and `min_replicas = 0`, the
/// autoscaler scales purely from queue observation, and the worker
/// that then appears drains the queue.
#[tokio::test]
async fn test_bootstrap_scales_and_drains_queue() {
    let (store, dyn_store, broker) = harness();
    let backend = Arc::new(MockBackend::new());

    let classes = vec![WorkerClassConfig::new("browser").with_thresholds(1, 0)];
    let service = ScalingService::new(
        Arc::clone(&dyn_store),
        Arc::clone(&backend) as Arc<dyn ScalingBackend>,
    );
    let autoscaler = Autoscaler::new(
        ScalerConfig::new(classes),
        service,
        Arc::clone(&dyn_store),
    );

    // Three jobs arrive while the fleet is empty.
    let mut jobs = Vec::new();
    for _ in 0..3 {
        let job = browser_job();
        broker.publish(&job).await.unwrap();
        jobs.push(job);
    }

    // Within one tick the backend is asked for at least one replica.
    autoscaler.tick_once().await;
    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].target >= 1, "bootstrap must request replicas");

    // The orchestration backend "starts" a worker: emulate it with a
    // real worker loop.
    let (shutdown, task, _) = spawn_worker(&broker, "browser-1", 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ok_results(&store).await.len() < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let results = ok_results(&store).await;
    assert_eq!(results.len(), 3);
    let mut result_ids: Vec<&str> = results.iter().map(|r| r.job_id.as_str()).collect();
    result_ids.sort();
    let mut job_ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    job_ids.sort();
    assert_eq!(result_ids, job_ids);

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

/// Worker crash mid-job: A consumes without acking and dies; B
/// reclaims the abandoned delivery and completes it. Exactly one ok
/// result exists.
#[tokio::test]
async fn test_crashed_worker_peer_rescue() {
    let (store, _, broker) = harness();
    let job = browser_job();
    let queue = job.queue();
    broker.publish(&job).await.unwrap();

    // Worker A consumes and crashes before acknowledging.
    let abandoned = broker
        .consume(&queue, "browser-a", Duration::ZERO)
        .await
        .unwrap()
        .expect("delivery");
    drop(abandoned);

    // Worker B (reclaim threshold zero for the test) rescues it.
    let (shutdown, task, _) = spawn_worker(&broker, "browser-b", 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ok_results(&store).await.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job was not rescued in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let results = ok_results(&store).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_id, job.id);
    assert_eq!(results[0].worker_id, "browser-b");
    // Rescued delivery carries the bumped attempt number.
    assert_eq!(results[0].attempt, 2);

    // Nothing left pending and nothing dead-lettered.
    let pending = store
        .xpending_summary(&queue.stream, &queue.group)
        .await
        .unwrap();
    assert_eq!(pending.count, 0);
    assert_eq!(store.xlen(&queue.dead_stream).await.unwrap(), 0);

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

/// A handler that fails twice then succeeds produces exactly three
/// invocations and one ok result; the dead-letter stream stays empty
/// and pending drains to zero.
#[tokio::test]
async fn test_transient_failures_retry_to_success() {
    let (store, _, broker) = harness();
    let (shutdown, task, attempts) = spawn_worker(&broker, "browser-1", 2);

    let job = browser_job();
    let queue = job.queue();
    broker.publish(&job).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ok_results(&store).await.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(store.xlen(&queue.dead_stream).await.unwrap(), 0);
    let pending = store
        .xpending_summary(&queue.stream, &queue.group)
        .await
        .unwrap();
    assert_eq!(pending.count, 0);

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

/// After the fleet drains and falls idle, the autoscaler steps the
/// class back down one replica per tick towards `min_replicas`.
#[tokio::test]
async fn test_scale_down_when_idle() {
    let (_, dyn_store, _) = harness();
    let backend = Arc::new(MockBackend::new());
    backend.set_replicas("browser", 2);

    let classes = vec![WorkerClassConfig::new("browser")
        .with_thresholds(5, 0)
        .with_replica_bounds(0, 10)
        .with_cooldown(Duration::ZERO)];
    let service = ScalingService::new(
        Arc::clone(&dyn_store),
        Arc::clone(&backend) as Arc<dyn ScalingBackend>,
    );
    let autoscaler = Autoscaler::new(
        ScalerConfig::new(classes),
        service,
        Arc::clone(&dyn_store),
    );

    // Empty queue, no busy heartbeats: one step down per tick.
    autoscaler.tick_once().await;
    assert_eq!(backend.list("browser").await.unwrap(), 1);
    autoscaler.tick_once().await;
    assert_eq!(backend.list("browser").await.unwrap(), 0);
    // At min_replicas the class holds.
    autoscaler.tick_once().await;
    assert_eq!(backend.list("browser").await.unwrap(), 0);
}

/// Queue metrics invariants hold while real traffic flows through the
/// broker.
#[tokio::test]
async fn test_depth_invariants_under_traffic() {
    let (_, dyn_store, broker) = harness();
    let metrics = taskplane::metrics::QueueMetrics::new(Arc::clone(&dyn_store));
    let queue = Queue::for_class("browser");

    for _ in 0..5 {
        broker.publish(&browser_job()).await.unwrap();
    }
    for consumer in ["w1", "w2"] {
        broker
            .consume(&queue, consumer, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
    }

    let depth = metrics.depth(&queue).await.unwrap();
    assert!(depth.pending <= depth.stream_len);
    assert!(depth.true_depth >= depth.pending);
    assert_eq!(depth.pending, 2);
    assert_eq!(depth.true_depth, 5);
    assert_eq!(depth.consumers, 2);
}

/// The composite store keeps the control plane working through a
/// rate-limited primary: the autoscaler's tick succeeds against the
/// secondary within the same pass.
#[tokio::test]
async fn test_autoscaler_survives_primary_rate_limit() {
    let primary = Arc::new(MemoryStore::new());
    let secondary = Arc::new(MemoryStore::new());
    let composite = Arc::new(taskplane::store::FallbackStore::new(
        Arc::clone(&primary) as Arc<dyn StoreClient>,
        Arc::clone(&secondary) as Arc<dyn StoreClient>,
    ));
    let dyn_store: Arc<dyn StoreClient> = Arc::clone(&composite) as Arc<dyn StoreClient>;

    // The very first primary command is rate limited; the composite
    // switches mid-command and the publish lands on the secondary.
    primary.inject_failure(StoreError::RateLimited("limit exceeded".into()));
    let broker = Broker::new(Arc::clone(&dyn_store));
    broker.publish(&browser_job()).await.unwrap();

    let backend = Arc::new(MockBackend::new());
    let classes = vec![WorkerClassConfig::new("browser").with_thresholds(1, 0)];
    let service = ScalingService::new(
        Arc::clone(&dyn_store),
        Arc::clone(&backend) as Arc<dyn ScalingBackend>,
    );
    let autoscaler = Autoscaler::new(ScalerConfig::new(classes), service, dyn_store);

    autoscaler.tick_once().await;
    assert!(composite.using_secondary());
    assert_eq!(backend.calls().len(), 1);
}
