//! The worker loop.
//!
//! A worker is a single-threaded cooperative loop: block on one
//! consume, dispatch to the matching handler, drive the delivery to a
//! terminal outcome, repeat. Retry discipline:
//!
//! - handler success or permanent failure: acknowledge, then publish
//!   the result
//! - transient failure: publish a transient result and leave the entry
//!   pending; it comes back via reclaim with a bumped attempt number
//! - transient failure past the retry budget: dead-letter and publish a
//!   permanent result
//! - store trouble: acknowledge nothing, back off, retry the loop
//!
//! Three consecutive loop-level failures end the process so the
//! orchestrator can replace the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, Delivery};
use crate::context::DeploymentContext;
use crate::job::{DeliveryTag, Job, JobResult, Queue};
use crate::metrics::WorkerMetricsRecorder;
use crate::worker::handler::{extract_args, HandlerError, HandlerRegistry, SessionBag};
use crate::worker::state::{StateMachine, WorkerState};

/// Pub/sub channel carrying operator control messages for one worker.
pub fn control_channel(worker_id: &str) -> String {
    format!("worker:control:{worker_id}")
}

/// Control message that asks a worker to drain and exit.
pub const DRAIN_MESSAGE: &str = "drain";

/// Fatal worker errors; anything recoverable is handled inside the loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{0} consecutive loop failures, exiting so the orchestrator can replace this worker")]
    TooManyLoopErrors(u32),
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub class: String,
    /// Block duration of one consume call.
    pub consume_block: Duration,
    /// Transient failures tolerated before dead-lettering.
    pub max_retries: u32,
    /// Wall-clock budget for one handler invocation.
    pub job_timeout: Duration,
    /// Recycle the session bag after this many jobs.
    pub max_tasks_per_child: Option<u32>,
    /// Pending entries idle at least this long are reclaimed.
    pub reclaim_min_idle: Duration,
    /// How often to attempt a reclaim pass.
    pub reclaim_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Consecutive loop failures before process exit.
    pub max_consecutive_errors: u32,
}

impl WorkerConfig {
    /// Defaults for a worker of the given class, with a generated id.
    pub fn new(class: impl Into<String>) -> Self {
        let class = class.into();
        let short_id = Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("{class}-{}", &short_id[..8]),
            class,
            consume_block: Duration::from_secs(1),
            max_retries: 3,
            job_timeout: Duration::from_secs(300),
            max_tasks_per_child: None,
            reclaim_min_idle: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            max_consecutive_errors: 3,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_consume_block(mut self, block: Duration) -> Self {
        self.consume_block = block;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_tasks_per_child(mut self, max_tasks: u32) -> Self {
        self.max_tasks_per_child = Some(max_tasks);
        self
    }

    pub fn with_reclaim(mut self, min_idle: Duration, interval: Duration) -> Self {
        self.reclaim_min_idle = min_idle;
        self.reclaim_interval = interval;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }
}

/// Job counters shared with the heartbeat and HTTP surface.
#[derive(Default)]
pub struct WorkerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    last_job: Mutex<Option<String>>,
}

impl WorkerCounters {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_job_id(&self) -> Option<String> {
        self.last_job.lock().unwrap().clone()
    }

    pub fn record_success(&self, job_id: &str) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        *self.last_job.lock().unwrap() = Some(job_id.to_string());
    }

    pub fn record_failure(&self, job_id: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_job.lock().unwrap() = Some(job_id.to_string());
    }
}

/// Clonable handle that asks the worker to drain and exit.
#[derive(Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.0.send(());
    }
}

/// A single worker process: state machine, dispatch, sessions.
pub struct Worker {
    config: WorkerConfig,
    broker: Arc<Broker>,
    registry: HandlerRegistry,
    sessions: SessionBag,
    queue: Queue,
    state: StateMachine,
    counters: Arc<WorkerCounters>,
    recorder: WorkerMetricsRecorder,
    shutdown_tx: broadcast::Sender<()>,
    backoff: Duration,
    consecutive_errors: u32,
    jobs_since_recycle: u32,
    last_reclaim: Instant,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<Broker>,
        registry: HandlerRegistry,
        context: &DeploymentContext,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let recorder = WorkerMetricsRecorder::new(&config.worker_id, &config.class, context);
        let queue = Queue::for_class(&config.class);
        let backoff = config.backoff_min;
        Self {
            config,
            broker,
            registry,
            sessions: SessionBag::new(),
            queue,
            state: StateMachine::default(),
            counters: Arc::new(WorkerCounters::default()),
            recorder,
            shutdown_tx,
            backoff,
            consecutive_errors: 0,
            jobs_since_recycle: 0,
            last_reclaim: Instant::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn state_rx(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Subscribe to the shutdown signal (used by sibling tasks such as
    /// the heartbeat).
    pub fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Runs the worker until shutdown or a fatal error.
    ///
    /// On the way out the current job has already reached a terminal
    /// outcome (or stays pending for a peer), sessions are torn down,
    /// and the shutdown signal is re-broadcast so sibling tasks stop.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(worker_id = %self.config.worker_id, class = %self.config.class,
              "worker starting");
        self.broker.ensure_queue(&self.queue).await?;
        self.spawn_drain_listener().await;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let outcome = self.run_loop(&mut shutdown_rx).await;

        self.state.set(WorkerState::Shutdown);
        self.sessions.teardown_all().await;
        // Wake sibling tasks (heartbeat) even if we exit on error.
        let _ = self.shutdown_tx.send(());
        info!(worker_id = %self.config.worker_id, "worker stopped");
        outcome
    }

    async fn run_loop(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), WorkerError> {
        loop {
            if shutdown_requested(shutdown_rx) {
                info!(worker_id = %self.config.worker_id, "shutdown requested, draining");
                return Ok(());
            }

            if let Err(e) = self.reclaim_pass().await {
                warn!(worker_id = %self.config.worker_id, error = %e, "reclaim pass failed");
            }

            self.state.set(WorkerState::Waiting);
            match self
                .broker
                .consume(&self.queue, &self.config.worker_id, self.config.consume_block)
                .await
            {
                Ok(Some(delivery)) => {
                    self.backoff = self.config.backoff_min;
                    self.consecutive_errors = 0;
                    self.state.set(WorkerState::Busy);
                    let processed = self.process(delivery).await;
                    self.state.set(WorkerState::Idle);
                    match processed {
                        Ok(()) => self.maybe_recycle_sessions().await,
                        Err(e) => self.handle_loop_error(e).await?,
                    }
                }
                Ok(None) => {
                    // Nothing to do; ease off the store while idle.
                    self.state.set(WorkerState::Idle);
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(self.config.backoff_max);
                }
                Err(BrokerError::Decode { entry_id, reason }) => {
                    // Already dead-lettered by the broker; move on.
                    warn!(worker_id = %self.config.worker_id, entry_id = %entry_id,
                          reason = %reason, "skipped undecodable entry");
                    self.state.set(WorkerState::Idle);
                }
                Err(e) => {
                    self.state.set(WorkerState::Idle);
                    self.handle_loop_error(e).await?;
                }
            }
        }
    }

    /// Classifies a loop-level failure: permanent store errors and too
    /// many consecutive failures are fatal, everything else backs off
    /// in the error state before returning to idle.
    async fn handle_loop_error(&mut self, error: BrokerError) -> Result<(), WorkerError> {
        if !error.is_retryable() {
            error!(worker_id = %self.config.worker_id, error = %error,
                   "permanent store failure, exiting");
            return Err(error.into());
        }

        self.consecutive_errors += 1;
        error!(worker_id = %self.config.worker_id, error = %error,
               consecutive = self.consecutive_errors, "worker loop error");
        if self.consecutive_errors >= self.config.max_consecutive_errors {
            return Err(WorkerError::TooManyLoopErrors(self.consecutive_errors));
        }

        self.state.set(WorkerState::Error);
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(self.config.backoff_max);
        self.state.set(WorkerState::Idle);
        Ok(())
    }

    /// Periodically rescues pending entries abandoned by crashed peers
    /// (or by our own earlier transient failures).
    async fn reclaim_pass(&mut self) -> Result<(), BrokerError> {
        if self.last_reclaim.elapsed() < self.config.reclaim_interval {
            return Ok(());
        }
        self.last_reclaim = Instant::now();

        let reclaimed = self
            .broker
            .reclaim(&self.queue, &self.config.worker_id, self.config.reclaim_min_idle)
            .await?;
        for delivery in reclaimed {
            self.state.set(WorkerState::Busy);
            let result = self.process(delivery).await;
            self.state.set(WorkerState::Idle);
            result?;
            self.maybe_recycle_sessions().await;
        }
        Ok(())
    }

    /// Drives one delivery to a terminal outcome.
    ///
    /// Handler failures are consumed here; only store failures bubble
    /// up (in which case nothing was acknowledged).
    async fn process(&mut self, delivery: Delivery) -> Result<(), BrokerError> {
        let Delivery { job, tag, attempt } = delivery;
        let worker_id = self.config.worker_id.clone();
        info!(worker_id = %worker_id, job_id = %job.id, kind = %job.kind, attempt,
              "processing job");

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.job_timeout, self.dispatch(&job)).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::transient(format!(
                "job timed out after {:?}",
                self.config.job_timeout
            ))),
        };
        self.recorder
            .observe_job_duration(started.elapsed().as_secs_f64());
        self.jobs_since_recycle += 1;

        match outcome {
            Ok(payload) => {
                // Terminal: ack first, then publish the result.
                self.broker.ack(&self.queue.group, &tag).await?;
                let result = JobResult::ok(&job, &worker_id, attempt, payload);
                self.broker.reply(&job, &result).await?;
                self.counters.record_success(&job.id);
                self.recorder.inc_processed();
                info!(worker_id = %worker_id, job_id = %job.id, attempt,
                      duration_ms = started.elapsed().as_millis() as u64, "job completed");
                Ok(())
            }
            Err(HandlerError::Permanent { message }) => {
                warn!(worker_id = %worker_id, job_id = %job.id, attempt, error = %message,
                      "job failed permanently");
                self.broker.ack(&self.queue.group, &tag).await?;
                let result = JobResult::permanent_error(&job, &worker_id, attempt, &message);
                self.broker.reply(&job, &result).await?;
                self.counters.record_failure(&job.id);
                self.recorder.inc_failed();
                Ok(())
            }
            Err(transient) => {
                if transient.is_session_fatal() {
                    if let Some(handler) = self.registry.find(&job.kind) {
                        let prefix = handler.prefix().to_string();
                        self.sessions.teardown(&prefix).await;
                    }
                }
                let message = transient.to_string();
                self.counters.record_failure(&job.id);
                self.recorder.inc_failed();

                if attempt > self.config.max_retries {
                    self.exhaust_retries(&job, &tag, attempt, &message).await
                } else {
                    warn!(worker_id = %worker_id, job_id = %job.id, attempt,
                          max_retries = self.config.max_retries, error = %message,
                          "transient failure, leaving entry pending for redelivery");
                    let result =
                        JobResult::transient_error(&job, &worker_id, attempt, &message);
                    self.broker.reply(&job, &result).await?;
                    Ok(())
                }
            }
        }
    }

    /// Terminal path for a job that burned its whole retry budget.
    async fn exhaust_retries(
        &mut self,
        job: &Job,
        tag: &DeliveryTag,
        attempt: u32,
        message: &str,
    ) -> Result<(), BrokerError> {
        error!(worker_id = %self.config.worker_id, job_id = %job.id, attempt,
               error = %message, "retry budget exhausted, dead-lettering");

        // Record how many attempts the job actually burned.
        let mut dead_job = job.clone();
        dead_job.retry_count = attempt;
        let reason = format!("retry budget exhausted after {attempt} attempts: {message}");
        self.broker.dead_letter(&dead_job, tag, &reason).await?;

        let result =
            JobResult::permanent_error(job, &self.config.worker_id, attempt, &reason);
        self.broker.reply(job, &result).await?;
        Ok(())
    }

    /// Dispatches the job to its handler with filtered arguments.
    async fn dispatch(&mut self, job: &Job) -> Result<Value, HandlerError> {
        let Some(handler) = self.registry.find(&job.kind) else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for kind '{}'",
                job.kind
            )));
        };
        let handler = Arc::clone(handler);

        let op = job.kind.strip_prefix(handler.prefix()).unwrap_or(&job.kind);
        let args = extract_args(&job.payload, handler.arg_keys());
        debug!(job_id = %job.id, op = %op, args = args.len(), "dispatching");

        let session = self.sessions.get_or_create(&handler).await?;
        handler.handle(op, args, session.as_mut()).await
    }

    /// Recycles the session bag after `max_tasks_per_child` jobs to
    /// bound resource leaks in long-lived handler state.
    async fn maybe_recycle_sessions(&mut self) {
        let Some(max_tasks) = self.config.max_tasks_per_child else {
            return;
        };
        if self.jobs_since_recycle >= max_tasks {
            info!(worker_id = %self.config.worker_id, jobs = self.jobs_since_recycle,
                  "recycling sessions");
            self.sessions.teardown_all().await;
            self.jobs_since_recycle = 0;
        }
    }

    /// Forwards operator drain messages into the shutdown signal.
    async fn spawn_drain_listener(&self) {
        let channel = control_channel(&self.config.worker_id);
        match self.broker.store().subscribe(&channel).await {
            Ok(mut rx) => {
                let shutdown = self.shutdown_tx.clone();
                let worker_id = self.config.worker_id.clone();
                tokio::spawn(async move {
                    while let Ok(message) = rx.recv().await {
                        if message == DRAIN_MESSAGE {
                            info!(worker_id = %worker_id, "drain requested by operator");
                            let _ = shutdown.send(());
                            break;
                        }
                        warn!(worker_id = %worker_id, message = %message,
                              "unknown control message ignored");
                    }
                });
            }
            Err(e) => {
                // Not fatal: the worker still drains on signals.
                warn!(worker_id = %self.config.worker_id, error = %e,
                      "control channel unavailable");
            }
        }
    }
}

fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreClient, StoreError};
    use crate::worker::handler::{Handler, Session};
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    #[derive(Clone, Copy)]
    enum Plan {
        Succeed,
        FailTransient,
        FailTransientFatal,
        FailPermanent,
    }

    struct NullSession {
        teardowns: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Session for NullSession {
        async fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedHandler {
        plans: Mutex<VecDeque<Plan>>,
        invocations: Arc<AtomicU32>,
        teardowns: Arc<AtomicU32>,
    }

    impl ScriptedHandler {
        fn new(plans: Vec<Plan>) -> (Arc<Self>, Arc<AtomicU32>, Arc<AtomicU32>) {
            let invocations = Arc::new(AtomicU32::new(0));
            let teardowns = Arc::new(AtomicU32::new(0));
            let handler = Arc::new(Self {
                plans: Mutex::new(plans.into()),
                invocations: Arc::clone(&invocations),
                teardowns: Arc::clone(&teardowns),
            });
            (handler, invocations, teardowns)
        }
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        fn prefix(&self) -> &str {
            "browser."
        }

        fn arg_keys(&self) -> &[&str] {
            &["url"]
        }

        async fn create_session(&self) -> Result<Box<dyn Session>, HandlerError> {
            Ok(Box::new(NullSession {
                teardowns: Arc::clone(&self.teardowns),
            }))
        }

        async fn handle(
            &self,
            _op: &str,
            args: Map<String, Value>,
            _session: &mut dyn Session,
        ) -> Result<Value, HandlerError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let plan = self
                .plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Plan::Succeed);
            match plan {
                Plan::Succeed => Ok(json!({ "url": args.get("url"), "done": true })),
                Plan::FailTransient => Err(HandlerError::transient("navigation timed out")),
                Plan::FailTransientFatal => {
                    Err(HandlerError::transient_session_fatal("browser crashed"))
                }
                Plan::FailPermanent => Err(HandlerError::permanent("forbidden target")),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        broker: Arc<Broker>,
        worker: Worker,
        invocations: Arc<AtomicU32>,
        teardowns: Arc<AtomicU32>,
    }

    fn fixture(plans: Vec<Plan>) -> Fixture {
        fixture_with(plans, |c| c)
    }

    fn fixture_with(
        plans: Vec<Plan>,
        tune: impl FnOnce(WorkerConfig) -> WorkerConfig,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(Broker::new(
            Arc::clone(&store) as Arc<dyn StoreClient>
        ));
        let (handler, invocations, teardowns) = ScriptedHandler::new(plans);
        let mut registry = HandlerRegistry::new();
        registry.register(handler);

        let config = tune(
            WorkerConfig::new("browser")
                .with_worker_id("w1")
                .with_consume_block(Duration::from_millis(10))
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
                .with_reclaim(Duration::ZERO, Duration::ZERO),
        );
        let context = DeploymentContext::fixed("host-1", "test", "local");
        let worker = Worker::new(config, Arc::clone(&broker), registry, &context);
        Fixture {
            store,
            broker,
            worker,
            invocations,
            teardowns,
        }
    }

    fn browser_job() -> Job {
        let mut payload = Map::new();
        payload.insert("url".to_string(), json!("https://example.com"));
        payload.insert("ignored_extra".to_string(), json!(42));
        Job::new("browser.navigate", payload).with_reply_stream("browser:results")
    }

    async fn consume_one(fixture: &mut Fixture, job: &Job) -> Delivery {
        fixture.broker.publish(job).await.unwrap();
        fixture
            .broker
            .consume(&job.queue(), "w1", Duration::ZERO)
            .await
            .unwrap()
            .expect("delivery")
    }

    async fn results_on(store: &Arc<MemoryStore>, stream: &str) -> Vec<JobResult> {
        store
            .xrange_all(stream)
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.fields.get("json"))
            .filter_map(|raw| JobResult::decode(raw).ok())
            .collect()
    }

    #[tokio::test]
    async fn test_success_acks_and_publishes_ok_result() {
        let mut f = fixture(vec![Plan::Succeed]);
        let job = browser_job();
        let delivery = consume_one(&mut f, &job).await;

        f.worker.process(delivery).await.unwrap();

        let queue = job.queue();
        let pending = f.store.xpending_summary(&queue.stream, &queue.group).await.unwrap();
        assert_eq!(pending.count, 0);

        let results = results_on(&f.store, "browser:results").await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert_eq!(results[0].attempt, 1);
        assert_eq!(f.worker.counters().processed(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_permanent_failure() {
        let mut f = fixture(vec![]);
        let job = Job::new("tankpit.spawn", Map::new()).with_reply_stream("tankpit:results");
        // Route through the browser worker's queue to hit its registry.
        let delivery = Delivery {
            job: job.clone(),
            tag: DeliveryTag {
                stream: "browser:jobs".to_string(),
                entry_id: "1-0".to_string(),
            },
            attempt: 1,
        };

        f.worker.process(delivery).await.unwrap();

        let results = results_on(&f.store, "tankpit:results").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, crate::job::JobStatus::PermanentError);
        assert!(results[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("no handler"));
        assert_eq!(f.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_entry_pending() {
        let mut f = fixture(vec![Plan::FailTransient]);
        let job = browser_job();
        let delivery = consume_one(&mut f, &job).await;

        f.worker.process(delivery).await.unwrap();

        // Not acked: the entry awaits redelivery.
        let queue = job.queue();
        let pending = f.store.xpending_summary(&queue.stream, &queue.group).await.unwrap();
        assert_eq!(pending.count, 1);

        let results = results_on(&f.store, "browser:results").await;
        assert_eq!(results[0].status, crate::job::JobStatus::TransientError);
        assert_eq!(f.worker.counters().failed(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_dead_letters() {
        let mut f = fixture(vec![Plan::FailTransient]);
        let job = browser_job();
        let mut delivery = consume_one(&mut f, &job).await;
        delivery.attempt = 4; // past max_retries = 3

        f.worker.process(delivery).await.unwrap();

        let queue = job.queue();
        assert_eq!(f.store.xlen(&queue.dead_stream).await.unwrap(), 1);
        let pending = f.store.xpending_summary(&queue.stream, &queue.group).await.unwrap();
        assert_eq!(pending.count, 0);

        let results = results_on(&f.store, "browser:results").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, crate::job::JobStatus::PermanentError);

        // The dead-letter record keeps the burned attempt count.
        let dead = f.store.xrange_all(&queue.dead_stream).await.unwrap();
        let dead_job = Job::decode(&dead[0].fields["json"]).unwrap();
        assert_eq!(dead_job.retry_count, 4);
    }

    #[tokio::test]
    async fn test_session_fatal_error_tears_down_session() {
        let mut f = fixture(vec![Plan::Succeed, Plan::FailTransientFatal]);
        let job = browser_job();

        let delivery = consume_one(&mut f, &job).await;
        f.worker.process(delivery).await.unwrap();
        assert_eq!(f.teardowns.load(Ordering::SeqCst), 0);

        let second = browser_job();
        let delivery = consume_one(&mut f, &second).await;
        f.worker.process(delivery).await.unwrap();
        assert_eq!(f.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sessions_recycled_after_max_tasks() {
        let mut f = fixture_with(vec![], |c| c.with_max_tasks_per_child(2));
        for _ in 0..2 {
            let job = browser_job();
            let delivery = consume_one(&mut f, &job).await;
            f.worker.process(delivery).await.unwrap();
            f.worker.maybe_recycle_sessions().await;
        }
        assert_eq!(f.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        // Two transient failures then success: exactly three handler
        // invocations, a final ok result, and an empty dead-letter
        // stream.
        let f = fixture(vec![Plan::FailTransient, Plan::FailTransient, Plan::Succeed]);
        let Fixture {
            store,
            broker,
            worker,
            invocations,
            ..
        } = f;

        let shutdown = worker.shutdown_handle();
        let worker_task = tokio::spawn(worker.run());

        let job = browser_job();
        let result = broker
            .publish_and_wait(&job, Duration::from_secs(5))
            .await
            .unwrap();
        // The first result received may be transient; wait for ok.
        let result = if result.is_ok() {
            result
        } else {
            loop {
                let all = results_on(&store, "browser:results").await;
                if let Some(ok) = all.iter().find(|r| r.is_ok()) {
                    break ok.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        assert!(result.is_ok());
        assert_eq!(result.job_id, job.id);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(store.xlen("browser:dead").await.unwrap(), 0);

        shutdown.trigger();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_dead_letters_job_that_always_fails() {
        let f = fixture(vec![
            Plan::FailTransient,
            Plan::FailTransient,
            Plan::FailTransient,
            Plan::FailTransient,
            Plan::FailTransient,
        ]);
        let Fixture {
            store,
            broker,
            worker,
            invocations,
            ..
        } = f;

        let shutdown = worker.shutdown_handle();
        let worker_task = tokio::spawn(worker.run());

        let job = browser_job();
        broker.publish(&job).await.unwrap();

        // Wait for the dead-letter entry.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.xlen("browser:dead").await.unwrap() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "dead-letter timeout");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // max_retries = 3 means exactly four handler invocations.
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        assert_eq!(store.xlen("browser:dead").await.unwrap(), 1);

        // No pending entry remains, so no further deliveries occur.
        let pending = store.xpending_summary("browser:jobs", "browser").await.unwrap();
        assert_eq!(pending.count, 0);

        let results = results_on(&store, "browser:results").await;
        let finals: Vec<_> = results
            .iter()
            .filter(|r| r.status == crate::job::JobStatus::PermanentError)
            .collect();
        assert_eq!(finals.len(), 1);

        shutdown.trigger();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exits_after_consecutive_loop_errors() {
        let f = fixture_with(vec![], |c| c.with_reclaim(Duration::ZERO, Duration::from_secs(3600)));
        let Fixture { store, worker, .. } = f;

        let worker_task = tokio::spawn(worker.run());
        // Let the worker establish its queue, then script three
        // consecutive transient store failures.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..3 {
            store.inject_failure(StoreError::Transient("connection reset".into()));
        }

        let err = worker_task.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::TooManyLoopErrors(3)));
    }

    #[tokio::test]
    async fn test_drain_message_stops_worker() {
        let f = fixture(vec![]);
        let Fixture { store, worker, .. } = f;
        let worker_id = worker.worker_id().to_string();

        let worker_task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        store
            .publish(&control_channel(&worker_id), DRAIN_MESSAGE)
            .await
            .unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(2), worker_task).await;
        joined.expect("drain timeout").unwrap().unwrap();
    }
}
