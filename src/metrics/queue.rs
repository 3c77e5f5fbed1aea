//! Queue depth measurement for scaling decisions.
//!
//! Raw stream length is a poor demand signal: it is monotonic until
//! trimming and dominated by history. The scaler instead uses
//! *true depth*:
//!
//! ```text
//! pending      = delivered but not yet acknowledged
//! new_estimate = max(0, stream_length - pending)
//! true_depth   = pending + new_estimate
//! ```
//!
//! The age of the oldest pending entry is tracked alongside; a large
//! age means consumers are starved or stuck, and the scaler treats the
//! pressure as doubled.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::job::Queue;
use crate::store::{StoreClient, StoreError};

/// Pending age past which a queue is considered degraded.
pub const DEGRADED_PENDING_AGE: Duration = Duration::from_secs(30);

/// Pending age past which a queue is considered unhealthy.
pub const UNHEALTHY_PENDING_AGE: Duration = Duration::from_secs(60);

/// Pending entries per consumer past which a queue is considered
/// overloaded.
const OVERLOAD_PENDING_PER_CONSUMER: u64 = 10;

/// Point-in-time depth measurement for one `(stream, group)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDepth {
    /// Total entries in the stream, including history.
    pub stream_len: u64,
    /// Entries delivered to a consumer but not yet acknowledged.
    pub pending: u64,
    /// Estimate of entries not yet delivered to anyone.
    pub new_estimate: u64,
    /// `pending + new_estimate`; the demand signal for scaling.
    pub true_depth: u64,
    /// Age of the oldest pending entry (zero when none are pending).
    pub oldest_pending_age: Duration,
    /// Consumers that currently hold pending entries.
    pub consumers: u64,
}

/// Coarse queue health, derived from pending age and per-consumer load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl QueueHealth {
    /// Numeric encoding used by the `taskplane_queue_health` gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            QueueHealth::Healthy => 0,
            QueueHealth::Degraded => 1,
            QueueHealth::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueHealth::Healthy => write!(f, "healthy"),
            QueueHealth::Degraded => write!(f, "degraded"),
            QueueHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl QueueDepth {
    /// Classifies queue health from this snapshot.
    pub fn health(&self) -> QueueHealth {
        if self.pending == 0 {
            return QueueHealth::Healthy;
        }
        if self.oldest_pending_age > UNHEALTHY_PENDING_AGE {
            return QueueHealth::Unhealthy;
        }
        if self.oldest_pending_age > DEGRADED_PENDING_AGE {
            return QueueHealth::Degraded;
        }
        if self.consumers > 0 && self.pending / self.consumers > OVERLOAD_PENDING_PER_CONSUMER {
            return QueueHealth::Degraded;
        }
        QueueHealth::Healthy
    }
}

/// Computes [`QueueDepth`] snapshots from pending-info queries.
pub struct QueueMetrics {
    store: Arc<dyn StoreClient>,
}

impl QueueMetrics {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Measures the queue. A missing stream or group reads as empty
    /// rather than an error, so the scaler can run ahead of the first
    /// publish.
    pub async fn depth(&self, queue: &Queue) -> Result<QueueDepth, StoreError> {
        let stream_len = self.store.xlen(&queue.stream).await?;

        let summary = match self.store.xpending_summary(&queue.stream, &queue.group).await {
            Ok(summary) => summary,
            Err(StoreError::Permanent(msg)) if msg.contains("NOGROUP") => Default::default(),
            Err(e) => return Err(e),
        };

        let oldest_pending_age = if summary.count > 0 {
            match self.store.xpending_range(&queue.stream, &queue.group, 1).await {
                Ok(entries) => entries.first().map(|e| e.idle).unwrap_or(Duration::ZERO),
                Err(e) => {
                    warn!(stream = %queue.stream, error = %e,
                          "failed to read oldest pending entry, assuming fresh");
                    Duration::ZERO
                }
            }
        } else {
            Duration::ZERO
        };

        let pending = summary.count;
        let new_estimate = stream_len.saturating_sub(pending);
        Ok(QueueDepth {
            stream_len,
            pending,
            new_estimate,
            true_depth: pending + new_estimate,
            oldest_pending_age,
            consumers: summary.consumers.len() as u64,
        })
    }
}
