//! Job broker over store streams and consumer groups.
//!
//! The broker owns the wire discipline of the queue system:
//!
//! - **publish**: append an envelope to the queue stream (with
//!   approximate length trimming)
//! - **consume**: blocking group read of one entry; the entry becomes
//!   pending and is acknowledged only at a terminal outcome
//! - **ack / dead_letter**: terminal outcomes
//! - **reclaim**: rescue pending entries abandoned by crashed peers
//! - **reply / publish_and_wait**: result delivery for callers that
//!   want one
//!
//! Consuming does NOT acknowledge. An unacked entry stays pending and
//! is redelivered via [`Broker::reclaim`] once its idle time passes the
//! reclaim threshold, which is what makes worker crashes survivable.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::{
    envelope_fields, envelope_from_fields, DeliveryTag, Job, JobResult, Queue,
};
use crate::store::{StoreClient, StoreError};

/// Default approximate cap on queue stream length.
const DEFAULT_PUBLISH_MAXLEN: u64 = 10_000;

/// Default cap on reply and dead-letter streams.
const REPLY_MAXLEN: u64 = 1_000;

/// Maximum entries claimed per reclaim pass.
const RECLAIM_BATCH: u64 = 16;

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The underlying store failed; retryability follows the store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An entry could not be decoded. The raw entry has already been
    /// moved to the dead-letter stream and acknowledged.
    #[error("undecodable envelope in entry {entry_id}: {reason}")]
    Decode { entry_id: String, reason: String },

    /// `publish_and_wait` hit its deadline before a result arrived.
    #[error("timed out after {0:?} waiting for result of job {1}")]
    ReplyTimeout(Duration, String),
}

impl BrokerError {
    /// Whether the caller should retry (without acknowledging anything).
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Store(e) => e.is_retryable(),
            BrokerError::Decode { .. } => false,
            BrokerError::ReplyTimeout(..) => true,
        }
    }
}

/// A consumed job plus the tag needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub tag: DeliveryTag,
    /// 1-based attempt number, taken from the store's delivery count.
    /// A fresh consume is attempt 1; each reclaim increments it.
    pub attempt: u32,
}

/// Stream broker for publishing and consuming jobs.
pub struct Broker {
    store: Arc<dyn StoreClient>,
    publish_maxlen: u64,
    /// Queues whose stream+group are known to exist already.
    ensured: Mutex<HashSet<(String, String)>>,
}

impl Broker {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            publish_maxlen: DEFAULT_PUBLISH_MAXLEN,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Overrides the approximate stream length cap used on publish.
    pub fn with_publish_maxlen(mut self, maxlen: u64) -> Self {
        self.publish_maxlen = maxlen;
        self
    }

    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    /// Creates the queue's stream and consumer group if missing.
    ///
    /// Idempotent and safe under concurrent startup: the loser of the
    /// creation race observes "group exists" and carries on.
    pub async fn ensure_queue(&self, queue: &Queue) -> Result<(), BrokerError> {
        {
            let ensured = self.ensured.lock().unwrap();
            if ensured.contains(&(queue.stream.clone(), queue.group.clone())) {
                return Ok(());
            }
        }

        let created = self
            .store
            .xgroup_create_mkstream(&queue.stream, &queue.group)
            .await?;
        if created {
            info!(stream = %queue.stream, group = %queue.group, "created consumer group");
        } else {
            debug!(stream = %queue.stream, group = %queue.group, "consumer group already exists");
        }

        self.ensured
            .lock()
            .unwrap()
            .insert((queue.stream.clone(), queue.group.clone()));
        Ok(())
    }

    /// Publishes a job to the queue derived from its kind.
    ///
    /// Returns the stream entry id once the store confirms the append.
    /// The broker does not deduplicate; idempotence on retry is the
    /// caller's concern.
    pub async fn publish(&self, job: &Job) -> Result<String, BrokerError> {
        let queue = job.queue();
        self.ensure_queue(&queue).await?;

        let encoded = job
            .encode()
            .map_err(|e| StoreError::Permanent(format!("job encode failed: {e}")))?;
        let entry_id = self
            .store
            .xadd_maxlen(&queue.stream, Some(self.publish_maxlen), &envelope_fields(encoded))
            .await?;

        debug!(job_id = %job.id, kind = %job.kind, stream = %queue.stream, entry_id = %entry_id,
               "job published");
        Ok(entry_id)
    }

    /// Publishes a job and blocks until its result arrives on the
    /// job's reply stream, or the deadline passes.
    ///
    /// The reply stream is read through a disposable consumer group so
    /// concurrent waiters never steal each other's results.
    pub async fn publish_and_wait(
        &self,
        job: &Job,
        timeout: Duration,
    ) -> Result<JobResult, BrokerError> {
        let reply_stream = job
            .reply_stream
            .clone()
            .ok_or_else(|| StoreError::Permanent("job has no reply stream".to_string()))?;

        let waiter_group = format!("reply:{}", Uuid::new_v4());
        self.store
            .xgroup_create_mkstream(&reply_stream, &waiter_group)
            .await?;

        self.publish(job).await?;

        let consumer = "waiter";
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::ReplyTimeout(timeout, job.id.clone()));
            }
            let block = remaining.min(Duration::from_secs(1));

            let Some(entry) = self
                .store
                .xread_group(&reply_stream, &waiter_group, consumer, block)
                .await?
            else {
                continue;
            };
            // Results on a shared reply stream may belong to other jobs.
            self.store
                .xack(&reply_stream, &waiter_group, &entry.id)
                .await?;

            let Some(raw) = envelope_from_fields(&entry.fields) else {
                continue;
            };
            match JobResult::decode(raw) {
                Ok(result) if result.job_id == job.id => return Ok(result),
                Ok(_) => continue,
                Err(e) => {
                    warn!(stream = %reply_stream, error = %e, "undecodable result envelope");
                    continue;
                }
            }
        }
    }

    /// Blocking read of one new job via the consumer group.
    ///
    /// Returns `Ok(None)` on timeout. The returned delivery is pending
    /// until [`Broker::ack`] or [`Broker::dead_letter`] is called; a
    /// transient failure simply leaves it pending.
    pub async fn consume(
        &self,
        queue: &Queue,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_queue(queue).await?;

        let read = self
            .store
            .xread_group(&queue.stream, &queue.group, consumer, block)
            .await;

        let entry = match read {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            // The group can vanish if the store was flushed; recreate
            // once and retry the read.
            Err(StoreError::Permanent(msg)) if msg.contains("NOGROUP") => {
                warn!(stream = %queue.stream, group = %queue.group,
                      "consumer group missing, recreating");
                self.ensured.lock().unwrap().clear();
                self.ensure_queue(queue).await?;
                match self
                    .store
                    .xread_group(&queue.stream, &queue.group, consumer, block)
                    .await?
                {
                    Some(entry) => entry,
                    None => return Ok(None),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let tag = DeliveryTag {
            stream: queue.stream.clone(),
            entry_id: entry.id.clone(),
        };

        let Some(raw) = envelope_from_fields(&entry.fields) else {
            self.dead_letter_raw(queue, &tag, "missing envelope field")
                .await?;
            return Err(BrokerError::Decode {
                entry_id: entry.id,
                reason: "missing envelope field".to_string(),
            });
        };

        match Job::decode(raw) {
            Ok(job) => Ok(Some(Delivery {
                job,
                tag,
                attempt: 1,
            })),
            Err(e) => {
                // Undecodable envelopes can never succeed; park the raw
                // entry in the dead-letter stream and ack the original.
                self.dead_letter_raw(queue, &tag, &e.to_string()).await?;
                Err(BrokerError::Decode {
                    entry_id: tag.entry_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Acknowledges a delivery after a terminal outcome.
    pub async fn ack(&self, group: &str, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let acked = self.store.xack(&tag.stream, group, &tag.entry_id).await?;
        if acked == 0 {
            debug!(stream = %tag.stream, entry_id = %tag.entry_id,
                   "ack matched no pending entry (already acked or reclaimed)");
        }
        Ok(())
    }

    /// Claims pending entries idle for at least `min_idle` over to
    /// `consumer`, decoding them for processing.
    ///
    /// Used by long-lived workers to rescue work abandoned by crashed
    /// peers. Undecodable entries are dead-lettered in place.
    pub async fn reclaim(
        &self,
        queue: &Queue,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let entries = self
            .store
            .xautoclaim(&queue.stream, &queue.group, consumer, min_idle, RECLAIM_BATCH)
            .await?;

        let mut deliveries = Vec::new();
        for (entry, delivered) in entries {
            let tag = DeliveryTag {
                stream: queue.stream.clone(),
                entry_id: entry.id.clone(),
            };
            match envelope_from_fields(&entry.fields).map(Job::decode) {
                Some(Ok(job)) => {
                    info!(job_id = %job.id, entry_id = %tag.entry_id, consumer = %consumer,
                          attempt = delivered, "reclaimed abandoned job");
                    deliveries.push(Delivery {
                        job,
                        tag,
                        attempt: delivered as u32,
                    });
                }
                Some(Err(e)) => {
                    self.dead_letter_raw(queue, &tag, &e.to_string()).await?;
                }
                None => {
                    self.dead_letter_raw(queue, &tag, "missing envelope field")
                        .await?;
                }
            }
        }
        Ok(deliveries)
    }

    /// Moves a job to the queue's dead-letter stream and acknowledges
    /// the original entry.
    pub async fn dead_letter(
        &self,
        job: &Job,
        tag: &DeliveryTag,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let queue = job.queue();
        let encoded = job
            .encode()
            .map_err(|e| StoreError::Permanent(format!("job encode failed: {e}")))?;
        let fields = vec![
            ("json".to_string(), encoded),
            ("reason".to_string(), reason.to_string()),
            ("moved_at".to_string(), Utc::now().to_rfc3339()),
        ];
        self.store
            .xadd_maxlen(&queue.dead_stream, Some(REPLY_MAXLEN), &fields)
            .await?;
        self.ack(&queue.group, tag).await?;

        warn!(job_id = %job.id, kind = %job.kind, reason = %reason, "job dead-lettered");
        Ok(())
    }

    /// Publishes a result to the job's reply stream, if it has one.
    pub async fn reply(&self, job: &Job, result: &JobResult) -> Result<(), BrokerError> {
        let Some(reply_stream) = &job.reply_stream else {
            return Ok(());
        };
        let encoded = result
            .encode()
            .map_err(|e| StoreError::Permanent(format!("result encode failed: {e}")))?;
        self.store
            .xadd_maxlen(reply_stream, Some(REPLY_MAXLEN), &envelope_fields(encoded))
            .await?;
        debug!(job_id = %result.job_id, status = %result.status, stream = %reply_stream,
               "result published");
        Ok(())
    }

    /// Parks a raw, undecodable entry in the dead-letter stream.
    async fn dead_letter_raw(
        &self,
        queue: &Queue,
        tag: &DeliveryTag,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let fields = vec![
            ("reason".to_string(), reason.to_string()),
            ("entry_id".to_string(), tag.entry_id.clone()),
            ("moved_at".to_string(), Utc::now().to_rfc3339()),
        ];
        self.store
            .xadd_maxlen(&queue.dead_stream, Some(REPLY_MAXLEN), &fields)
            .await?;
        self.ack(&queue.group, tag).await?;
        warn!(stream = %queue.stream, entry_id = %tag.entry_id, reason = %reason,
              "undecodable entry dead-lettered");
        Ok(())
    }
}
