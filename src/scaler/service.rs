//! Per-class scaling decisions and their execution.
//!
//! On every tick, for each class:
//!
//! 1. measure the queue ([`QueueMetrics`]) and the fleet (backend),
//!    publishing the depth and health gauges per class
//! 2. compute pressure: true depth, doubled when the oldest pending
//!    entry is older than 30 s (starved consumers)
//! 3. scale up by `ceil(pressure / up_threshold)` (bounded by the
//!    remaining headroom), scale down by one, or hold
//! 4. respect the cooldown, and never scale down while any heartbeat
//!    of the class reads busy
//!
//! Every action (and every failed attempt) is appended to the
//! `scaling:events` stream. A failed backend call does not update the
//! cooldown clock, so the next tick retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::metrics::prometheus::{
    CLASS_REPLICAS, QUEUE_HEALTH, QUEUE_PENDING, QUEUE_TRUE_DEPTH, SCALING_ACTIONS_TOTAL,
};
use crate::metrics::queue::DEGRADED_PENDING_AGE;
use crate::metrics::{QueueDepth, QueueMetrics};
use crate::scale::{ScaleError, ScalingBackend};
use crate::scaler::config::WorkerClassConfig;
use crate::store::{StoreClient, StoreError};
use crate::worker::heartbeat::fetch_heartbeats;

/// Stream recording every scaling action.
pub const SCALING_EVENTS_STREAM: &str = "scaling:events";

const SCALING_EVENTS_MAXLEN: u64 = 1_000;

/// Errors from a per-class scaling check.
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] ScaleError),
}

/// Outcome of one per-class check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp { from: u32, to: u32 },
    ScaleDown { from: u32, to: u32 },
    Hold,
}

impl ScalingDecision {
    fn direction(&self) -> &'static str {
        match self {
            ScalingDecision::ScaleUp { .. } => "up",
            ScalingDecision::ScaleDown { .. } => "down",
            ScalingDecision::Hold => "hold",
        }
    }
}

/// Append-only record of a scaling action (or failed attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub class: String,
    pub from_replicas: u32,
    pub to_replicas: u32,
    pub reason: String,
    pub true_depth: u64,
    pub pending: u64,
    pub oldest_pending_ms: u64,
    /// Queue health classification at decision time.
    pub queue_health: String,
}

/// Policy engine for all worker classes, sharing one backend.
pub struct ScalingService {
    store: Arc<dyn StoreClient>,
    queue_metrics: QueueMetrics,
    backend: Arc<dyn ScalingBackend>,
    last_change: Mutex<HashMap<String, Instant>>,
}

impl ScalingService {
    pub fn new(store: Arc<dyn StoreClient>, backend: Arc<dyn ScalingBackend>) -> Self {
        Self {
            queue_metrics: QueueMetrics::new(Arc::clone(&store)),
            store,
            backend,
            last_change: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ScalingBackend> {
        &self.backend
    }

    /// Runs one scaling check for a class, acting on the decision.
    pub async fn check_class(
        &self,
        config: &WorkerClassConfig,
    ) -> Result<ScalingDecision, ScalerError> {
        if !config.enabled {
            return Ok(ScalingDecision::Hold);
        }

        let depth = self.queue_metrics.depth(&config.queue).await?;
        let current = self.backend.list(&config.class).await?;
        self.record_gauges(&config.class, &depth, current);

        let in_cooldown = self
            .last_change
            .lock()
            .unwrap()
            .get(&config.class)
            .map(|at| at.elapsed() < config.cooldown)
            .unwrap_or(false);

        // The busy check costs a heartbeat scan, so only pay for it
        // when a scale-down is otherwise on the table.
        let down_candidate = pressure_of(&depth) <= config.scale_down_threshold
            && current > config.min_replicas;
        let any_busy = if down_candidate {
            fetch_heartbeats(&self.store, Some(&config.class))
                .await?
                .iter()
                .any(|hb| hb.is_busy())
        } else {
            false
        };

        let decision = decide(config, &depth, current, in_cooldown, any_busy);
        debug!(class = %config.class, decision = ?decision, true_depth = depth.true_depth,
               pending = depth.pending, current, "scaling check");

        match decision {
            ScalingDecision::Hold => Ok(ScalingDecision::Hold),
            ref action => {
                self.execute(config, action, &depth).await?;
                Ok(decision)
            }
        }
    }

    async fn execute(
        &self,
        config: &WorkerClassConfig,
        decision: &ScalingDecision,
        depth: &QueueDepth,
    ) -> Result<(), ScalerError> {
        let (from, to) = match decision {
            ScalingDecision::ScaleUp { from, to } | ScalingDecision::ScaleDown { from, to } => {
                (*from, *to)
            }
            ScalingDecision::Hold => return Ok(()),
        };

        info!(class = %config.class, from, to, direction = decision.direction(),
              true_depth = depth.true_depth, "scaling");

        match self.backend.scale(&config.class, to).await {
            Ok(observed) => {
                self.last_change
                    .lock()
                    .unwrap()
                    .insert(config.class.clone(), Instant::now());
                if let Some(counter) = SCALING_ACTIONS_TOTAL.get() {
                    counter
                        .with_label_values(&[&config.class, decision.direction()])
                        .inc();
                }
                let reason = format!("{} (true_depth={})", decision.direction(), depth.true_depth);
                self.record_event(config, from, observed, &reason, depth)
                    .await;
                Ok(())
            }
            Err(e) => {
                // Leave the cooldown clock alone so the next tick can
                // retry a retryable failure.
                error!(class = %config.class, error = %e, "backend scale failed");
                let reason = format!("error: {e}");
                self.record_event(config, from, from, &reason, depth).await;
                Err(e.into())
            }
        }
    }

    /// Appends a [`ScalingEvent`]; event-log trouble never fails the
    /// scaling action itself.
    async fn record_event(
        &self,
        config: &WorkerClassConfig,
        from: u32,
        to: u32,
        reason: &str,
        depth: &QueueDepth,
    ) {
        let event = ScalingEvent {
            timestamp: Utc::now(),
            class: config.class.clone(),
            from_replicas: from,
            to_replicas: to,
            reason: reason.to_string(),
            true_depth: depth.true_depth,
            pending: depth.pending,
            oldest_pending_ms: depth.oldest_pending_age.as_millis() as u64,
            queue_health: depth.health().to_string(),
        };
        let encoded = match serde_json::to_string(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "unencodable scaling event");
                return;
            }
        };
        if let Err(e) = self
            .store
            .xadd_maxlen(
                SCALING_EVENTS_STREAM,
                Some(SCALING_EVENTS_MAXLEN),
                &[("json".to_string(), encoded)],
            )
            .await
        {
            warn!(error = %e, "failed to record scaling event");
        }
    }

    fn record_gauges(&self, class: &str, depth: &QueueDepth, current: u32) {
        if let Some(gauge) = QUEUE_TRUE_DEPTH.get() {
            gauge.with_label_values(&[class]).set(depth.true_depth as f64);
        }
        if let Some(gauge) = QUEUE_PENDING.get() {
            gauge.with_label_values(&[class]).set(depth.pending as f64);
        }
        if let Some(gauge) = QUEUE_HEALTH.get() {
            gauge
                .with_label_values(&[class])
                .set(depth.health().as_gauge() as f64);
        }
        if let Some(gauge) = CLASS_REPLICAS.get() {
            gauge.with_label_values(&[class]).set(current as f64);
        }
    }
}

/// Demand signal: true depth, doubled when the oldest pending entry
/// has sat past the degraded threshold (stuck pending entries mean the
/// consumers we have are starved).
fn pressure_of(depth: &QueueDepth) -> u64 {
    if depth.oldest_pending_age > DEGRADED_PENDING_AGE {
        depth.true_depth.saturating_mul(2)
    } else {
        depth.true_depth
    }
}

/// Pure decision function; see the module docs for the rules.
fn decide(
    config: &WorkerClassConfig,
    depth: &QueueDepth,
    current: u32,
    in_cooldown: bool,
    any_busy: bool,
) -> ScalingDecision {
    let pressure = pressure_of(depth);

    let can_up = pressure >= config.scale_up_threshold && current < config.max_replicas;
    let can_down =
        pressure <= config.scale_down_threshold && current > config.min_replicas && !any_busy;

    // Both firing at once means the thresholds are inverted; hold
    // rather than oscillate.
    if can_up && can_down {
        warn!(class = %config.class, up = config.scale_up_threshold,
              down = config.scale_down_threshold, "contradictory thresholds, holding");
        return ScalingDecision::Hold;
    }
    if in_cooldown {
        return ScalingDecision::Hold;
    }

    if can_up {
        let headroom = config.max_replicas - current;
        let step = pressure
            .div_ceil(config.scale_up_threshold.max(1))
            .min(headroom as u64) as u32;
        ScalingDecision::ScaleUp {
            from: current,
            to: current + step.max(1),
        }
    } else if can_down {
        ScalingDecision::ScaleDown {
            from: current,
            to: (current - 1).max(config.min_replicas),
        }
    } else {
        ScalingDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::job::{payload_from_pairs, Job};
    use crate::scale::MockBackend;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn depth(true_depth: u64) -> QueueDepth {
        QueueDepth {
            stream_len: true_depth,
            pending: 0,
            new_estimate: true_depth,
            true_depth,
            oldest_pending_age: Duration::ZERO,
            consumers: 0,
        }
    }

    fn config() -> WorkerClassConfig {
        WorkerClassConfig::new("browser")
            .with_replica_bounds(0, 10)
            .with_thresholds(5, 0)
    }

    #[test]
    fn test_decide_scale_up_steps_with_pressure() {
        // pressure 12 at threshold 5 -> step ceil(12/5) = 3
        let decision = decide(&config(), &depth(12), 1, false, false);
        assert_eq!(decision, ScalingDecision::ScaleUp { from: 1, to: 4 });
    }

    #[test]
    fn test_decide_step_capped_by_headroom() {
        let decision = decide(&config(), &depth(1000), 8, false, false);
        assert_eq!(decision, ScalingDecision::ScaleUp { from: 8, to: 10 });
    }

    #[test]
    fn test_decide_holds_at_max() {
        let decision = decide(&config(), &depth(1000), 10, false, false);
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_decide_scale_down_one_step() {
        let decision = decide(&config(), &depth(0), 3, false, false);
        assert_eq!(decision, ScalingDecision::ScaleDown { from: 3, to: 2 });
    }

    #[test]
    fn test_decide_never_below_min() {
        let config = config().with_replica_bounds(2, 10);
        let decision = decide(&config, &depth(0), 2, false, false);
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_decide_busy_workers_block_scale_down() {
        let decision = decide(&config(), &depth(0), 3, false, true);
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_decide_cooldown_holds_both_directions() {
        assert_eq!(decide(&config(), &depth(100), 1, true, false), ScalingDecision::Hold);
        assert_eq!(decide(&config(), &depth(0), 3, true, false), ScalingDecision::Hold);
    }

    #[test]
    fn test_decide_stuck_pending_doubles_pressure() {
        let stuck = QueueDepth {
            stream_len: 3,
            pending: 3,
            new_estimate: 0,
            true_depth: 3,
            oldest_pending_age: Duration::from_secs(45),
            consumers: 1,
        };
        // Doubled pressure 6 crosses the threshold of 5.
        let decision = decide(&config(), &stuck, 1, false, false);
        assert_eq!(decision, ScalingDecision::ScaleUp { from: 1, to: 3 });
    }

    #[test]
    fn test_decide_contradictory_thresholds_hold() {
        let config = config().with_thresholds(1, 5);
        let decision = decide(&config, &depth(3), 5, false, false);
        assert_eq!(decision, ScalingDecision::Hold);
    }

    async fn service_fixture() -> (Arc<MemoryStore>, Arc<MockBackend>, ScalingService, Broker) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let service = ScalingService::new(
            Arc::clone(&store) as Arc<dyn StoreClient>,
            Arc::clone(&backend) as Arc<dyn ScalingBackend>,
        );
        let broker = Broker::new(Arc::clone(&store) as Arc<dyn StoreClient>);
        (store, backend, service, broker)
    }

    #[tokio::test]
    async fn test_bootstrap_from_zero_workers() {
        // No heartbeats exist; pure queue observation drives 0 -> N.
        let (store, backend, service, broker) = service_fixture().await;
        for _ in 0..3 {
            broker
                .publish(&Job::new("browser.navigate", payload_from_pairs(&[])))
                .await
                .unwrap();
        }

        let config = WorkerClassConfig::new("browser").with_thresholds(1, 0);
        let decision = service.check_class(&config).await.unwrap();

        assert_eq!(decision, ScalingDecision::ScaleUp { from: 0, to: 3 });
        assert_eq!(backend.list("browser").await.unwrap(), 3);

        // The action is recorded on the events stream.
        let events = store.xrange_all(SCALING_EVENTS_STREAM).await.unwrap();
        assert_eq!(events.len(), 1);
        let event: ScalingEvent = serde_json::from_str(&events[0].fields["json"]).unwrap();
        assert_eq!(event.from_replicas, 0);
        assert_eq!(event.to_replicas, 3);
        // Nothing pending yet, so the queue reads healthy.
        assert_eq!(event.queue_health, "healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_respected_across_ticks() {
        let (_, backend, service, broker) = service_fixture().await;
        broker
            .publish(&Job::new("browser.navigate", payload_from_pairs(&[])))
            .await
            .unwrap();

        let config = WorkerClassConfig::new("browser")
            .with_thresholds(1, 0)
            .with_cooldown(Duration::from_secs(60));

        // First tick scales.
        let first = service.check_class(&config).await.unwrap();
        assert!(matches!(first, ScalingDecision::ScaleUp { .. }));

        // Publish more pressure; the second tick holds inside cooldown.
        broker
            .publish(&Job::new("browser.navigate", payload_from_pairs(&[])))
            .await
            .unwrap();
        let second = service.check_class(&config).await.unwrap();
        assert_eq!(second, ScalingDecision::Hold);

        // A tick after the cooldown may scale again.
        tokio::time::advance(Duration::from_secs(61)).await;
        let third = service.check_class(&config).await.unwrap();
        assert!(matches!(third, ScalingDecision::ScaleUp { .. }));

        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_cooldown_clock_untouched() {
        let (store, backend, service, broker) = service_fixture().await;
        broker
            .publish(&Job::new("browser.navigate", payload_from_pairs(&[])))
            .await
            .unwrap();

        let config = WorkerClassConfig::new("browser").with_thresholds(1, 0);

        // list succeeds, scale fails.
        backend.inject_scale_failure(ScaleError::Retryable("daemon busy".into()));
        let err = service.check_class(&config).await;
        assert!(err.is_err());

        // Failure is on the events stream with an error reason.
        let events = store.xrange_all(SCALING_EVENTS_STREAM).await.unwrap();
        let event: ScalingEvent =
            serde_json::from_str(events.last().unwrap().fields.get("json").unwrap()).unwrap();
        assert!(event.reason.starts_with("error:"));

        // Next tick is free to retry immediately (no cooldown).
        let decision = service.check_class(&config).await.unwrap();
        assert!(matches!(decision, ScalingDecision::ScaleUp { .. }));
    }

    #[tokio::test]
    async fn test_busy_heartbeat_blocks_scale_down() {
        let (store, backend, service, _) = service_fixture().await;
        backend.set_replicas("browser", 2);

        store
            .hset_all_with_ttl(
                "worker:heartbeat:browser:w1",
                &[
                    ("worker_id".to_string(), "w1".to_string()),
                    ("class".to_string(), "browser".to_string()),
                    ("state".to_string(), "busy".to_string()),
                ],
                Duration::from_secs(90),
            )
            .await
            .unwrap();

        let config = WorkerClassConfig::new("browser").with_thresholds(5, 0);
        let decision = service.check_class(&config).await.unwrap();
        assert_eq!(decision, ScalingDecision::Hold);

        // With the heartbeat idle, the same tick scales down.
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
        let decision = service.check_class(&config).await.unwrap();
        assert_eq!(decision, ScalingDecision::ScaleDown { from: 2, to: 1 });
    }

    #[tokio::test]
    async fn test_disabled_class_never_scales() {
        let (_, backend, service, broker) = service_fixture().await;
        broker
            .publish(&Job::new("browser.navigate", payload_from_pairs(&[])))
            .await
            .unwrap();

        let config = WorkerClassConfig::new("browser").disabled();
        let decision = service.check_class(&config).await.unwrap();
        assert_eq!(decision, ScalingDecision::Hold);
        assert!(backend.calls().is_empty());
    }
}
