//! Operator-facing fleet commands.
//!
//! Thin wrappers over the scaling backend, the broker, and the
//! heartbeat data: list workers, scale a class by hand, drain one
//! worker, re-enqueue dead-lettered jobs. Permissions and presentation
//! belong to whatever front-end calls this.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError};
use crate::job::{Job, Queue};
use crate::scale::{ScaleError, ScalingBackend};
use crate::scaler::config::WorkerClassConfig;
use crate::store::{StoreClient, StoreError};
use crate::worker::heartbeat::{fetch_heartbeats, HeartbeatSnapshot};
use crate::worker::runtime::{control_channel, DRAIN_MESSAGE};

/// Errors from operator commands.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Backend(#[from] ScaleError),

    #[error("replica count {requested} outside [{min}, {max}] for class {class}")]
    OutOfBounds {
        class: String,
        requested: u32,
        min: u32,
        max: u32,
    },
}

/// Operator command surface.
pub struct Orchestrator {
    store: Arc<dyn StoreClient>,
    broker: Broker,
    backend: Arc<dyn ScalingBackend>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn StoreClient>, backend: Arc<dyn ScalingBackend>) -> Self {
        Self {
            broker: Broker::new(Arc::clone(&store)),
            store,
            backend,
        }
    }

    /// Lists live workers (optionally one class) from their heartbeats.
    pub async fn list_workers(
        &self,
        class: Option<&str>,
    ) -> Result<Vec<HeartbeatSnapshot>, OrchestratorError> {
        Ok(fetch_heartbeats(&self.store, class).await?)
    }

    /// Scales a class to an explicit replica count, bounds-checked
    /// against the class policy.
    pub async fn scale(
        &self,
        config: &WorkerClassConfig,
        replicas: u32,
    ) -> Result<u32, OrchestratorError> {
        if replicas < config.min_replicas || replicas > config.max_replicas {
            return Err(OrchestratorError::OutOfBounds {
                class: config.class.clone(),
                requested: replicas,
                min: config.min_replicas,
                max: config.max_replicas,
            });
        }
        let from = self.backend.list(&config.class).await?;
        let observed = self.backend.scale(&config.class, replicas).await?;
        info!(class = %config.class, from, to = observed, "operator scale");
        Ok(observed)
    }

    /// Asks one worker to drain: finish its in-flight job, tear down
    /// sessions, and exit. The orchestration backend replaces it (or
    /// not, if this is a deliberate scale-down).
    pub async fn drain(&self, worker_id: &str) -> Result<(), OrchestratorError> {
        self.store
            .publish(&control_channel(worker_id), DRAIN_MESSAGE)
            .await?;
        info!(worker_id = %worker_id, "drain requested");
        Ok(())
    }

    /// Re-enqueues every decodable job from a class's dead-letter
    /// stream, with a fresh retry budget. Returns how many jobs were
    /// re-published.
    ///
    /// Entries that never were valid envelopes (parked raw by the
    /// broker) cannot be retried and are dropped with a warning.
    pub async fn reprocess_deadletter(&self, class: &str) -> Result<u32, OrchestratorError> {
        let queue = Queue::for_class(class);
        let entries = self.store.xrange_all(&queue.dead_stream).await?;

        let mut republished = 0u32;
        for entry in &entries {
            let Some(raw) = entry.fields.get("json") else {
                warn!(entry_id = %entry.id, "dead-letter entry has no envelope, dropping");
                continue;
            };
            match Job::decode(raw) {
                Ok(mut job) => {
                    // Reprocessed jobs start over with a clean budget.
                    job.retry_count = 0;
                    self.broker.publish(&job).await?;
                    republished += 1;
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e,
                          "undecodable dead-letter entry, dropping");
                }
            }
        }

        // Clear the stream only after every entry has been handled.
        self.store.xtrim(&queue.dead_stream, 0).await?;
        info!(class = %class, republished, dropped = entries.len() as u32 - republished,
              "dead-letter reprocess complete");
        Ok(republished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::payload_from_pairs;
    use crate::scale::MockBackend;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn orchestrator() -> (Arc<MemoryStore>, Arc<MockBackend>, Orchestrator) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&store) as Arc<dyn StoreClient>,
            Arc::clone(&backend) as Arc<dyn ScalingBackend>,
        );
        (store, backend, orchestrator)
    }

    #[tokio::test]
    async fn test_scale_respects_class_bounds() {
        let (_, backend, orchestrator) = orchestrator();
        let config = WorkerClassConfig::new("browser").with_replica_bounds(1, 5);

        let err = orchestrator.scale(&config, 6).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::OutOfBounds { .. }));
        assert!(backend.calls().is_empty());

        let observed = orchestrator.scale(&config, 3).await.unwrap();
        assert_eq!(observed, 3);
    }

    #[tokio::test]
    async fn test_drain_publishes_control_message() {
        let (store, _, orchestrator) = orchestrator();
        let mut rx = store.subscribe("worker:control:w1").await.unwrap();

        orchestrator.drain("w1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), DRAIN_MESSAGE);
    }

    #[tokio::test]
    async fn test_reprocess_deadletter_requeues_with_fresh_budget() {
        let (store, _, orchestrator) = orchestrator();
        let broker = Broker::new(Arc::clone(&store) as Arc<dyn StoreClient>);

        // Drive a job into the dead-letter stream.
        let job = Job::new("browser.navigate", payload_from_pairs(&[("url", "x")]));
        let queue = job.queue();
        broker.publish(&job).await.unwrap();
        let delivery = broker
            .consume(&queue, "w1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let mut burned = job.clone();
        burned.retry_count = 4;
        broker
            .dead_letter(&burned, &delivery.tag, "retry budget exhausted")
            .await
            .unwrap();
        assert_eq!(store.xlen(&queue.dead_stream).await.unwrap(), 1);

        let republished = orchestrator.reprocess_deadletter("browser").await.unwrap();
        assert_eq!(republished, 1);

        // Dead stream cleared, job back on the queue with a clean
        // retry budget.
        assert_eq!(store.xlen(&queue.dead_stream).await.unwrap(), 0);
        let delivery = broker
            .consume(&queue, "w1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.job.id, job.id);
        assert_eq!(delivery.job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_list_workers_reads_heartbeats() {
        let (store, _, orchestrator) = orchestrator();
        store
            .hset_all_with_ttl(
                "worker:heartbeat:browser:w1",
                &[
                    ("worker_id".to_string(), "w1".to_string()),
                    ("class".to_string(), "browser".to_string()),
                    ("state".to_string(), "idle".to_string()),
                ],
                Duration::from_secs(90),
            )
            .await
            .unwrap();

        let workers = orchestrator.list_workers(Some("browser")).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "w1");
    }
}
