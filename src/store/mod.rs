//! Store abstraction over a log-structured key/stream server.
//!
//! Everything taskplane persists lives in one store: job streams with
//! consumer groups, heartbeat hashes with TTLs, the scaling-event stream,
//! and the pub/sub control channels. This module defines the narrow
//! command surface the rest of the system is allowed to use:
//!
//! - **StoreClient**: the injectable client trait
//! - **RedisStore**: the production backend ([`redis`] crate)
//! - **FallbackStore**: primary/secondary composite with rate-limit
//!   failover and a circuit breaker
//! - **MemoryStore**: in-process fake for tests
//!
//! Components never talk to a concrete client type; they hold an
//! `Arc<dyn StoreClient>` so tests can swap in [`MemoryStore`] and the
//! control plane can wrap everything in [`FallbackStore`].

pub mod fallback;
pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use fallback::{FailoverEvent, FallbackConfig, FallbackStore};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errors surfaced by store commands.
///
/// The split matters for retry policy: `Transient` and `RateLimited`
/// leave stream entries unacknowledged so they are redelivered, while
/// `Permanent` is fatal to the calling loop.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Network failure, timeout, or any condition worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The primary endpoint refused the command due to rate limiting.
    #[error("store rate limited: {0}")]
    RateLimited(String),

    /// Malformed command, authentication failure, or protocol error.
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Returns whether the command may be retried (possibly on another
    /// backend).
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Permanent(_))
    }
}

/// A single stream entry: the store-assigned id plus its field map.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Summary of a consumer group's pending entries (delivered, unacked).
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    /// Total pending entries in the group.
    pub count: u64,
    /// Smallest pending entry id, if any.
    pub min_id: Option<String>,
    /// Largest pending entry id, if any.
    pub max_id: Option<String>,
    /// Pending count per consumer name.
    pub consumers: Vec<(String, u64)>,
}

/// Detail record for one pending entry.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Narrow command surface of the underlying store.
///
/// Keys, hashes, streams with consumer groups, and pub/sub. Each method
/// maps to a single atomic store command; there are no multi-command
/// transactions at this layer.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Liveness probe for the active connection.
    async fn ping(&self) -> Result<(), StoreError>;

    // Keys.

    /// Set a string value with an expiry.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// List keys matching a glob pattern (used for heartbeat discovery;
    /// patterns are always `prefix:*` shaped).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    // Hashes.

    /// Replace the named hash's fields and apply a TTL to the key.
    async fn hset_all_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    // Streams.

    /// Append an entry, optionally trimming the stream to roughly
    /// `maxlen` entries (`MAXLEN ~`). Returns the new entry id.
    async fn xadd_maxlen(
        &self,
        stream: &str,
        maxlen: Option<u64>,
        fields: &[(String, String)],
    ) -> Result<String, StoreError>;

    /// Create `group` on `stream`, creating the stream if missing.
    ///
    /// Returns `true` if the group was created, `false` if it already
    /// existed (two workers racing to create is expected and harmless).
    async fn xgroup_create_mkstream(&self, stream: &str, group: &str)
        -> Result<bool, StoreError>;

    /// Blocking read of at most one **new** entry via the consumer group.
    ///
    /// Returns `None` on timeout. The entry becomes pending for
    /// `consumer` and is NOT acknowledged by this call.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError>;

    /// Acknowledge one entry. Returns the number of entries actually
    /// acked (0 if it was not pending).
    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<u64, StoreError>;

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError>;

    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StoreError>;

    /// Up to `count` pending entries of the group, oldest first.
    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Claim pending entries idle for at least `min_idle` over to
    /// `consumer`, incrementing their delivery counters.
    ///
    /// Each claimed entry is returned with its delivery count
    /// (including this claim), which is the attempt number of the
    /// processing that follows.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: u64,
    ) -> Result<Vec<(StreamEntry, u64)>, StoreError>;

    /// All entries currently in the stream, oldest first.
    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, StoreError>;

    /// Trim the stream to at most `maxlen` entries. Returns entries removed.
    async fn xtrim(&self, stream: &str, maxlen: u64) -> Result<u64, StoreError>;

    // Pub/sub.

    /// Fire-and-forget publish to a channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribe to a channel; messages arrive on the returned receiver
    /// until it is dropped.
    async fn subscribe(&self, channel: &str)
        -> Result<broadcast::Receiver<String>, StoreError>;
}
