//! Redis-backed store client.
//!
//! Wraps [`redis::aio::ConnectionManager`] (which handles reconnection
//! automatically) and exposes the narrow [`StoreClient`] surface. Raw
//! `redis::cmd` is used where the typed helpers fall short (XAUTOCLAIM).
//!
//! Error mapping is the interesting part: the hosted primary signals
//! rate limiting through a RESP error containing "max requests limit
//! exceeded", which this backend surfaces as [`StoreError::RateLimited`]
//! so the fallback composite can switch endpoints.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamMaxlen, StreamPendingCountReply, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, ErrorKind, RedisError, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{PendingEntry, PendingSummary, StoreClient, StoreError, StreamEntry};

/// Store client backed by a single Redis endpoint.
///
/// The underlying [`ConnectionManager`] is established lazily on first
/// use, so an endpoint that is down at process start can still be held
/// and retried later (the fallback composite relies on this).
pub struct RedisStore {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
    /// Label for logs ("primary" / "secondary").
    name: String,
}

impl RedisStore {
    /// Parses the URL (`redis://` or `rediss://` for TLS) without
    /// connecting yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Permanent` if the URL is malformed.
    pub fn open(url: &str, name: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Permanent(format!("invalid store url: {e}")))?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
            name: name.into(),
        })
    }

    /// Opens and eagerly connects to the endpoint.
    pub async fn connect(url: &str, name: impl Into<String>) -> Result<Self, StoreError> {
        let store = Self::open(url, name)?;
        store.conn().await?;
        Ok(store)
    }

    /// Backend label used in logs and failover events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a handle to the shared connection, establishing it on
    /// first use. ConnectionManager handles reconnection afterwards.
    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| {
                StoreError::Transient(format!("connect to {} failed: {e}", self.name))
            })?;
        debug!(backend = %self.name, "store connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

/// Maps a redis error to the store error taxonomy.
fn classify(err: RedisError) -> StoreError {
    let msg = err.to_string();
    if msg.to_lowercase().contains("max requests limit exceeded") {
        return StoreError::RateLimited(msg);
    }
    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        return StoreError::Transient(msg);
    }
    match err.kind() {
        ErrorKind::AuthenticationFailed
        | ErrorKind::InvalidClientConfig
        | ErrorKind::TypeError
        | ErrorKind::ResponseError => StoreError::Permanent(msg),
        _ => StoreError::Transient(msg),
    }
}

fn string_fields(map: &HashMap<String, Value>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect()
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        redis::cmd("PING")
            .query_async::<_, ()>(&mut self.conn().await?)
            .await
            .map_err(classify)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.conn().await?
            .set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(classify)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn().await?.get(key).await.map_err(classify)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn hset_all_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(classify)?;
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(classify)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.conn().await?.hgetall(key).await.map_err(classify)
    }

    async fn xadd_maxlen(
        &self,
        stream: &str,
        maxlen: Option<u64>,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        let mut conn = self.conn().await?;
        match maxlen {
            Some(n) => conn
                .xadd_maxlen(stream, StreamMaxlen::Approx(n as usize), "*", fields)
                .await
                .map_err(classify),
            None => conn.xadd(stream, "*", fields).await.map_err(classify),
        }
    }

    async fn xgroup_create_mkstream(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<bool, StoreError> {
        let result: Result<(), RedisError> = self
            .conn().await?
            .xgroup_create_mkstream(stream, group, "$")
            .await;
        match result {
            Ok(()) => Ok(true),
            // A concurrent worker won the race; that is fine.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = self
            .conn().await?
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(classify)?;

        for key in reply.keys {
            if let Some(id) = key.ids.into_iter().next() {
                return Ok(Some(StreamEntry {
                    fields: string_fields(&id.map),
                    id: id.id,
                }));
            }
        }
        Ok(None)
    }

    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<u64, StoreError> {
        self.conn().await?
            .xack(stream, group, &[entry_id])
            .await
            .map_err(classify)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError> {
        self.conn().await?.xlen(stream).await.map_err(classify)
    }

    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StoreError> {
        let reply: StreamPendingReply =
            self.conn().await?.xpending(stream, group).await.map_err(classify)?;

        match reply {
            StreamPendingReply::Empty => Ok(PendingSummary::default()),
            StreamPendingReply::Data(data) => Ok(PendingSummary {
                count: data.count as u64,
                min_id: Some(data.start_id),
                max_id: Some(data.end_id),
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending as u64))
                    .collect(),
            }),
        }
    }

    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let reply: StreamPendingCountReply = self
            .conn().await?
            .xpending_count(stream, group, "-", "+", count as usize)
            .await
            .map_err(classify)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: u64,
    ) -> Result<Vec<(StreamEntry, u64)>, StoreError> {
        // XAUTOCLAIM reply: [next-cursor, [[id, [field, value, ...]], ...], [deleted...]]
        let value: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn().await?)
            .await
            .map_err(classify)?;

        let Value::Bulk(parts) = value else {
            return Err(StoreError::Permanent(
                "unexpected XAUTOCLAIM reply shape".to_string(),
            ));
        };
        let Some(Value::Bulk(raw_entries)) = parts.into_iter().nth(1) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for raw in raw_entries {
            let Value::Bulk(pair) = raw else { continue };
            let mut it = pair.into_iter();
            let (Some(id_v), Some(fields_v)) = (it.next(), it.next()) else {
                continue;
            };
            let id: String = redis::from_redis_value(&id_v)
                .map_err(|e| StoreError::Permanent(format!("bad entry id: {e}")))?;
            let flat: Vec<String> = redis::from_redis_value(&fields_v)
                .map_err(|e| StoreError::Permanent(format!("bad entry fields: {e}")))?;
            let fields = flat
                .chunks_exact(2)
                .map(|kv| (kv[0].clone(), kv[1].clone()))
                .collect();
            entries.push(StreamEntry { id, fields });
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        // XAUTOCLAIM does not report delivery counts; fetch them from
        // the pending table for the claimed window.
        let pending = self.xpending_range(stream, group, count.max(128)).await?;
        let counts: HashMap<String, u64> = pending
            .into_iter()
            .map(|p| (p.id, p.delivery_count))
            .collect();

        Ok(entries
            .into_iter()
            .map(|entry| {
                let delivered = counts.get(&entry.id).copied().unwrap_or(1);
                (entry, delivered)
            })
            .collect())
    }

    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, StoreError> {
        let reply: StreamRangeReply = self.conn().await?.xrange_all(stream).await.map_err(classify)?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| StreamEntry {
                fields: string_fields(&id.map),
                id: id.id,
            })
            .collect())
    }

    async fn xtrim(&self, stream: &str, maxlen: u64) -> Result<u64, StoreError> {
        self.conn().await?
            .xtrim(stream, StreamMaxlen::Equals(maxlen as usize))
            .await
            .map_err(classify)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.conn().await?
            .publish::<_, _, ()>(channel, message)
            .await
            .map_err(classify)
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<String>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(classify)?;
        pubsub.subscribe(channel).await.map_err(classify)?;

        let (tx, rx) = broadcast::channel(64);
        let channel = channel.to_string();
        let backend = self.name.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(backend = %backend, channel = %channel, error = %e,
                              "dropping undecodable pub/sub message");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    // All receivers dropped; stop forwarding.
                    break;
                }
            }
        });
        Ok(rx)
    }
}
