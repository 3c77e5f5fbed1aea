//! The autoscaler loop.
//!
//! A single cooperative loop that, every `check_interval`, runs the
//! scaling service for every enabled class. One class failing never
//! stops the others, and a tick is postponed entirely when the store
//! looks unhealthy (the metrics it would act on cannot be trusted) or
//! the scaling backend reports itself degraded (its replica counts
//! cannot be trusted either).
//!
//! The loop needs no existing workers: scaling from zero replicas
//! works purely from queue observation, so a cold system bootstraps
//! itself as soon as jobs arrive.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::scale::BackendHealth;
use crate::scaler::config::ScalerConfig;
use crate::scaler::service::{ScalingDecision, ScalingService};
use crate::store::StoreClient;

/// Periodic driver over [`ScalingService`].
pub struct Autoscaler {
    config: ScalerConfig,
    service: ScalingService,
    store: Arc<dyn StoreClient>,
}

impl Autoscaler {
    pub fn new(config: ScalerConfig, service: ScalingService, store: Arc<dyn StoreClient>) -> Self {
        Self {
            config,
            service,
            store,
        }
    }

    pub fn service(&self) -> &ScalingService {
        &self.service
    }

    /// Runs until the shutdown signal fires. The tick in progress is
    /// allowed to finish before the loop exits.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            classes = self.config.classes.len(),
            "autoscaler started"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_once().await,
                _ = shutdown.recv() => break,
            }
        }
        info!("autoscaler stopped");
    }

    /// One pass over every enabled class.
    pub async fn tick_once(&self) {
        if let Err(e) = self.store.ping().await {
            warn!(error = %e, "store unhealthy, postponing scaling decisions");
            return;
        }
        if self.service.backend().health().await == BackendHealth::Degraded {
            warn!(backend = %self.service.backend().name(),
                  "scaling backend degraded, postponing scaling decisions");
            return;
        }

        for class_config in self.config.enabled_classes() {
            match self.service.check_class(class_config).await {
                Ok(ScalingDecision::Hold) => {
                    debug!(class = %class_config.class, "holding");
                }
                Ok(decision) => {
                    info!(class = %class_config.class, decision = ?decision, "scaled");
                }
                Err(e) => {
                    // Per-class isolation: log and move to the next.
                    error!(class = %class_config.class, error = %e, "scaling check failed");
                }
            }
        }
    }
}
