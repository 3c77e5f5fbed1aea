//! Primary/secondary store composite with automatic failover.
//!
//! The primary endpoint is typically a hosted store with TLS and a
//! request budget; the secondary is a plain self-hosted instance. The
//! composite routes every command to the active backend and handles:
//!
//! - **Rate-limit failover**: a `RateLimited` error from the primary
//!   switches the active backend to the secondary for the duration of
//!   the cooldown (default 5 minutes), then the health probe may
//!   restore the primary.
//! - **Circuit breaker**: consecutive primary failures past a threshold
//!   (default 5) open the circuit for a cooldown (default 60 s); the
//!   breaker half-opens afterwards and re-closes on the first success.
//! - **Health probe**: [`FallbackStore::spawn_health_probe`] pings the
//!   active backend every 30 s and restores the primary once it is
//!   healthy again.
//!
//! Every transition emits a [`FailoverEvent`] on a broadcast channel so
//! operators (and tests) can observe failover behaviour.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{PendingEntry, PendingSummary, StoreClient, StoreError, StreamEntry};

/// Observable failover state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    /// Secondary activated at startup because the primary was unreachable.
    Activated,
    /// Active backend switched from primary to secondary at runtime.
    Switched { reason: String },
    /// Primary restored as the active backend.
    Restored,
    /// Primary circuit breaker opened after consecutive failures.
    CircuitOpen { failures: u32 },
    /// Primary circuit breaker closed again.
    CircuitClosed,
}

/// Tunables for failover behaviour.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// How long to stay on the secondary before re-probing the primary
    /// after a rate limit.
    pub rate_limit_cooldown: Duration,
    /// Consecutive failures that open the primary circuit.
    pub circuit_threshold: u32,
    /// How long an open circuit stays open before a half-open probe.
    pub circuit_open_for: Duration,
    /// Interval of the background health probe.
    pub probe_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(300),
            circuit_threshold: 5,
            circuit_open_for: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

struct FailoverState {
    using_secondary: bool,
    /// While on the secondary, do not attempt a restore before this.
    retry_primary_at: Instant,
}

/// Store client that fails over between two backends.
///
/// At most one backend is active at a time; the rest of the system
/// consumes this as a plain [`StoreClient`].
pub struct FallbackStore {
    primary: Arc<dyn StoreClient>,
    secondary: Arc<dyn StoreClient>,
    config: FallbackConfig,
    state: Mutex<FailoverState>,
    breaker: Mutex<Breaker>,
    events: broadcast::Sender<FailoverEvent>,
}

impl FallbackStore {
    /// Builds a composite over two already-connected backends, starting
    /// on the primary.
    pub fn new(primary: Arc<dyn StoreClient>, secondary: Arc<dyn StoreClient>) -> Self {
        Self::with_config(primary, secondary, FallbackConfig::default())
    }

    pub fn with_config(
        primary: Arc<dyn StoreClient>,
        secondary: Arc<dyn StoreClient>,
        config: FallbackConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            primary,
            secondary,
            config,
            state: Mutex::new(FailoverState {
                using_secondary: false,
                retry_primary_at: Instant::now(),
            }),
            breaker: Mutex::new(Breaker::default()),
            events,
        }
    }

    /// Connects both endpoints and returns the composite.
    ///
    /// If the primary is unreachable the composite starts on the
    /// secondary and emits [`FailoverEvent::Activated`]; a later probe
    /// can still restore the primary.
    pub async fn connect(
        primary_url: &str,
        secondary_url: &str,
        config: FallbackConfig,
    ) -> Result<Self, StoreError> {
        // The primary handle connects lazily, so an endpoint that is
        // down right now can still be restored by the health probe.
        let primary = Arc::new(super::RedisStore::open(primary_url, "primary")?);
        let secondary = Arc::new(super::RedisStore::connect(secondary_url, "secondary").await?);
        let store = Self::with_config(primary, secondary, config);

        if let Err(e) = store.primary.ping().await {
            if !e.is_retryable() {
                return Err(e);
            }
            warn!(error = %e, "primary store unreachable at startup, activating secondary");
            store.force_secondary("primary unreachable at startup");
            let _ = store.events.send(FailoverEvent::Activated);
        }
        Ok(store)
    }

    /// Subscribe to failover state transitions.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    /// Whether the secondary is currently active.
    pub fn using_secondary(&self) -> bool {
        self.state.lock().unwrap().using_secondary
    }

    /// Spawns the background probe that pings the active backend every
    /// `probe_interval` and restores the primary when possible.
    pub fn spawn_health_probe(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.probe_once().await;
            }
        })
    }

    /// One probe pass: ping the active backend, and attempt a primary
    /// restore when the cooldown has elapsed.
    pub async fn probe_once(&self) {
        if self.using_secondary() {
            self.try_restore_primary().await;
        } else if let Err(e) = self.primary.ping().await {
            warn!(error = %e, "primary health probe failed");
            self.record_primary_failure();
        }
    }

    /// Attempts to move back to the primary. No-op before the cooldown
    /// deadline or when already on the primary.
    pub async fn try_restore_primary(&self) {
        {
            let state = self.state.lock().unwrap();
            if !state.using_secondary || Instant::now() < state.retry_primary_at {
                return;
            }
        }

        match self.primary.ping().await {
            Ok(()) => {
                let circuit_was_open = {
                    let mut breaker = self.breaker.lock().unwrap();
                    let was_open = breaker.open_until.is_some();
                    *breaker = Breaker::default();
                    was_open
                };
                self.state.lock().unwrap().using_secondary = false;
                info!("primary store restored");
                if circuit_was_open {
                    let _ = self.events.send(FailoverEvent::CircuitClosed);
                }
                let _ = self.events.send(FailoverEvent::Restored);
            }
            Err(e) => {
                warn!(error = %e, "primary still unhealthy, staying on secondary");
                let mut state = self.state.lock().unwrap();
                state.retry_primary_at = Instant::now() + self.config.rate_limit_cooldown;
            }
        }
    }

    fn force_secondary_for(&self, reason: &str, cooldown: Duration) {
        let mut state = self.state.lock().unwrap();
        if !state.using_secondary {
            state.using_secondary = true;
            state.retry_primary_at = Instant::now() + cooldown;
            info!(reason = %reason, cooldown_secs = cooldown.as_secs(),
                  "switched to secondary store");
        }
    }

    fn force_secondary(&self, reason: &str) {
        self.force_secondary_for(reason, self.config.rate_limit_cooldown);
    }

    /// Records a primary failure, opening the circuit (and switching to
    /// the secondary) once the threshold is reached.
    fn record_primary_failure(&self) {
        let opened = {
            let mut breaker = self.breaker.lock().unwrap();
            breaker.consecutive_failures += 1;
            if breaker.consecutive_failures >= self.config.circuit_threshold
                && breaker.open_until.is_none()
            {
                breaker.open_until = Some(Instant::now() + self.config.circuit_open_for);
                Some(breaker.consecutive_failures)
            } else {
                None
            }
        };

        if let Some(failures) = opened {
            warn!(failures, "primary circuit breaker opened");
            let _ = self.events.send(FailoverEvent::CircuitOpen { failures });
            // The circuit cooldown, not the rate-limit one, gates the
            // half-open probe.
            self.force_secondary_for("circuit open", self.config.circuit_open_for);
            let _ = self.events.send(FailoverEvent::Switched {
                reason: "circuit_open".to_string(),
            });
        }
    }

    fn record_primary_success(&self) {
        let mut breaker = self.breaker.lock().unwrap();
        if breaker.open_until.is_some() {
            // Half-open probe succeeded.
            *breaker = Breaker::default();
            drop(breaker);
            let _ = self.events.send(FailoverEvent::CircuitClosed);
        } else {
            breaker.consecutive_failures = 0;
        }
    }

    /// Routes one command to the active backend, handling rate-limit
    /// failover inline so the caller sees at most one error.
    async fn run<'a, T, F, Fut>(&'a self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&'a dyn StoreClient) -> Fut,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'a,
    {
        if self.state.lock().unwrap().using_secondary {
            return f(self.secondary.as_ref()).await;
        }

        match f(self.primary.as_ref()).await {
            Ok(value) => {
                self.record_primary_success();
                Ok(value)
            }
            Err(StoreError::RateLimited(msg)) => {
                warn!(error = %msg, "primary rate limited, switching to secondary");
                self.force_secondary("rate limited");
                let _ = self.events.send(FailoverEvent::Switched {
                    reason: "rate_limited".to_string(),
                });
                f(self.secondary.as_ref()).await
            }
            Err(e) => {
                if e.is_retryable() {
                    self.record_primary_failure();
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StoreClient for FallbackStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|s| s.ping()).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.run(|s| s.set_with_ttl(key, value, ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run(|s| s.get(key)).await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.run(|s| s.scan_keys(pattern)).await
    }

    async fn hset_all_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.run(|s| s.hset_all_with_ttl(key, fields, ttl)).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.run(|s| s.hget_all(key)).await
    }

    async fn xadd_maxlen(
        &self,
        stream: &str,
        maxlen: Option<u64>,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        self.run(|s| s.xadd_maxlen(stream, maxlen, fields)).await
    }

    async fn xgroup_create_mkstream(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<bool, StoreError> {
        self.run(|s| s.xgroup_create_mkstream(stream, group)).await
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        self.run(|s| s.xread_group(stream, group, consumer, block))
            .await
    }

    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<u64, StoreError> {
        self.run(|s| s.xack(stream, group, entry_id)).await
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError> {
        self.run(|s| s.xlen(stream)).await
    }

    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StoreError> {
        self.run(|s| s.xpending_summary(stream, group)).await
    }

    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        self.run(|s| s.xpending_range(stream, group, count)).await
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: u64,
    ) -> Result<Vec<(StreamEntry, u64)>, StoreError> {
        self.run(|s| s.xautoclaim(stream, group, consumer, min_idle, count))
            .await
    }

    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, StoreError> {
        self.run(|s| s.xrange_all(stream)).await
    }

    async fn xtrim(&self, stream: &str, maxlen: u64) -> Result<u64, StoreError> {
        self.run(|s| s.xtrim(stream, maxlen)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.run(|s| s.publish(channel, message)).await
    }

    /// Note: a subscription stays bound to the backend that was active
    /// when it was created; control channels are re-subscribed by their
    /// consumers after a failover is observed.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<String>, StoreError> {
        self.run(|s| s.subscribe(channel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn composite() -> (Arc<MemoryStore>, Arc<MemoryStore>, FallbackStore) {
        let primary = Arc::new(MemoryStore::new());
        let secondary = Arc::new(MemoryStore::new());
        let store = FallbackStore::new(
            Arc::clone(&primary) as Arc<dyn StoreClient>,
            Arc::clone(&secondary) as Arc<dyn StoreClient>,
        );
        (primary, secondary, store)
    }

    #[tokio::test]
    async fn test_rate_limit_switches_within_one_command() {
        let (primary, secondary, store) = composite();
        let mut events = store.subscribe_events();

        primary.inject_failure(StoreError::RateLimited("limit exceeded".into()));

        // The command itself succeeds against the secondary.
        store
            .set_with_ttl("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.using_secondary());
        assert_eq!(
            events.recv().await.unwrap(),
            FailoverEvent::Switched {
                reason: "rate_limited".to_string()
            }
        );

        // Subsequent commands route to the secondary.
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(secondary.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(primary.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let (primary, _, store) = composite();
        let mut events = store.subscribe_events();

        for _ in 0..5 {
            primary.inject_failure(StoreError::Transient("connection reset".into()));
            let _ = store.ping().await;
        }

        assert!(store.using_secondary());
        assert_eq!(
            events.recv().await.unwrap(),
            FailoverEvent::CircuitOpen { failures: 5 }
        );
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (primary, _, store) = composite();

        for _ in 0..4 {
            primary.inject_failure(StoreError::Transient("reset".into()));
            let _ = store.ping().await;
        }
        // A success clears the streak; four more failures are needed.
        store.ping().await.unwrap();
        for _ in 0..4 {
            primary.inject_failure(StoreError::Transient("reset".into()));
            let _ = store.ping().await;
        }
        assert!(!store.using_secondary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_cooldown() {
        let (primary, _, store) = composite();
        let mut events = store.subscribe_events();

        primary.inject_failure(StoreError::RateLimited("limit".into()));
        store.ping().await.unwrap();
        assert!(store.using_secondary());
        let _ = events.recv().await;

        // Before the cooldown the restore attempt is a no-op.
        store.try_restore_primary().await;
        assert!(store.using_secondary());

        tokio::time::advance(Duration::from_secs(301)).await;
        store.try_restore_primary().await;
        assert!(!store.using_secondary());
        assert_eq!(events.recv().await.unwrap(), FailoverEvent::Restored);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_failover() {
        let (primary, _, store) = composite();
        primary.inject_failure(StoreError::Permanent("NOAUTH".into()));
        assert!(matches!(
            store.ping().await,
            Err(StoreError::Permanent(_))
        ));
        assert!(!store.using_secondary());
    }
}
