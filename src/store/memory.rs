//! In-memory store fake for tests.
//!
//! Implements the full [`StoreClient`] surface (streams with consumer
//! groups and pending-entry bookkeeping, hashes with TTLs, key scans,
//! and pub/sub) so broker, worker, and scaler tests run without a
//! server. Semantics follow the real store where tests depend on them:
//!
//! - a delivered entry stays pending until acked or reclaimed
//! - `xack` of an entry that is not pending acks nothing
//! - `xautoclaim` reassigns pending entries and bumps delivery counts
//! - hash TTLs expire keys out of `scan_keys` and `hget_all`
//!
//! [`MemoryStore::inject_failure`] scripts the next command to fail,
//! which is how failover and circuit-breaker paths are exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{PendingEntry, PendingSummary, StoreClient, StoreError, StreamEntry};

/// How often the blocking read re-checks for new entries.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone)]
struct MemEntry {
    seq: u64,
    id: String,
    fields: HashMap<String, String>,
}

struct MemPending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct MemGroup {
    /// Sequence number of the last entry delivered to this group.
    last_delivered_seq: u64,
    /// Delivered-but-unacked entries by entry id.
    pending: HashMap<String, MemPending>,
}

#[derive(Default)]
struct MemStream {
    entries: Vec<MemEntry>,
    groups: HashMap<String, MemGroup>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    keys: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, (HashMap<String, String>, Option<Instant>)>,
    streams: HashMap<String, MemStream>,
}

/// In-process [`StoreClient`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    faults: Mutex<VecDeque<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next store command to fail with `err`. Multiple
    /// injected failures are consumed in order, one per command.
    pub fn inject_failure(&self, err: StoreError) {
        self.faults.lock().unwrap().push_back(err);
    }

    fn take_fault(&self) -> Result<(), StoreError> {
        match self.faults.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn matches(pattern: &str, key: &str) -> bool {
        // Patterns used here are always literal or `prefix*`.
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }

    fn try_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let MemStream { entries, groups } = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::Permanent(format!("NOGROUP no such stream {stream}")))?;
        let mem_group = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::Permanent(format!("NOGROUP no such group {group}")))?;

        let next = entries
            .iter()
            .find(|e| e.seq > mem_group.last_delivered_seq)
            .cloned();

        if let Some(entry) = next {
            mem_group.last_delivered_seq = entry.seq;
            mem_group.pending.insert(
                entry.id.clone(),
                MemPending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            return Ok(Some(StreamEntry {
                id: entry.id,
                fields: entry.fields,
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.take_fault()
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.take_fault()?;
        self.inner
            .lock()
            .unwrap()
            .keys
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        let expired = matches!(
            inner.keys.get(key),
            Some((_, Some(expiry))) if *expiry <= Instant::now()
        );
        if expired {
            inner.keys.remove(key);
            return Ok(None);
        }
        Ok(inner.keys.get(key).map(|(value, _)| value.clone()))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.take_fault()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner
            .keys
            .retain(|_, (_, expiry)| expiry.map_or(true, |e| e > now));
        inner
            .hashes
            .retain(|_, (_, expiry)| expiry.map_or(true, |e| e > now));

        let mut keys: Vec<String> = inner
            .keys
            .keys()
            .chain(inner.hashes.keys())
            .filter(|k| Self::matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hset_all_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.take_fault()?;
        let map = fields.iter().cloned().collect();
        self.inner
            .lock()
            .unwrap()
            .hashes
            .insert(key.to_string(), (map, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        let expired = matches!(
            inner.hashes.get(key),
            Some((_, Some(expiry))) if *expiry <= Instant::now()
        );
        if expired {
            inner.hashes.remove(key);
            return Ok(HashMap::new());
        }
        Ok(inner
            .hashes
            .get(key)
            .map(|(map, _)| map.clone())
            .unwrap_or_default())
    }

    async fn xadd_maxlen(
        &self,
        stream: &str,
        maxlen: Option<u64>,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let id = format!("{seq}-0");
        let mem_stream = inner.streams.entry(stream.to_string()).or_default();
        mem_stream.entries.push(MemEntry {
            seq,
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        });
        if let Some(maxlen) = maxlen {
            let excess = mem_stream.entries.len().saturating_sub(maxlen as usize);
            mem_stream.entries.drain(..excess);
        }
        Ok(id)
    }

    async fn xgroup_create_mkstream(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<bool, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        let mem_stream = inner.streams.entry(stream.to_string()).or_default();
        if mem_stream.groups.contains_key(group) {
            return Ok(false);
        }
        // A new group only sees entries appended after its creation.
        let last_seq = mem_stream.entries.last().map(|e| e.seq).unwrap_or(0);
        mem_stream.groups.insert(
            group.to_string(),
            MemGroup {
                last_delivered_seq: last_seq,
                pending: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        self.take_fault()?;
        let deadline = Instant::now() + block;
        loop {
            if let Some(entry) = self.try_read_new(stream, group, consumer)? {
                return Ok(Some(entry));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<u64, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        let acked = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(entry_id).is_some())
            .unwrap_or(false);
        Ok(acked as u64)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError> {
        self.take_fault()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StoreError> {
        self.take_fault()?;
        let inner = self.inner.lock().unwrap();
        let Some(mem_group) = inner.streams.get(stream).and_then(|s| s.groups.get(group))
        else {
            return Ok(PendingSummary::default());
        };

        let mut consumers: HashMap<String, u64> = HashMap::new();
        for pending in mem_group.pending.values() {
            *consumers.entry(pending.consumer.clone()).or_default() += 1;
        }

        // Stream order decides min/max among pending entries.
        let ordered: Vec<&str> = inner
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| mem_group.pending.contains_key(&e.id))
                    .map(|e| e.id.as_str())
                    .collect()
            })
            .unwrap_or_default();

        Ok(PendingSummary {
            count: mem_group.pending.len() as u64,
            min_id: ordered.first().map(|s| s.to_string()),
            max_id: ordered.last().map(|s| s.to_string()),
            consumers: consumers.into_iter().collect(),
        })
    }

    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        self.take_fault()?;
        let inner = self.inner.lock().unwrap();
        let Some(mem_stream) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(mem_group) = mem_stream.groups.get(group) else {
            return Ok(Vec::new());
        };
        // XPENDING returns entries in stream (id) order.
        let pending: Vec<PendingEntry> = mem_stream
            .entries
            .iter()
            .filter_map(|e| {
                mem_group.pending.get(&e.id).map(|p| PendingEntry {
                    id: e.id.clone(),
                    consumer: p.consumer.clone(),
                    idle: p.delivered_at.elapsed(),
                    delivery_count: p.delivery_count,
                })
            })
            .take(count as usize)
            .collect();
        Ok(pending)
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: u64,
    ) -> Result<Vec<(StreamEntry, u64)>, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        let Some(mem_stream) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries_by_id: HashMap<String, HashMap<String, String>> = mem_stream
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.fields.clone()))
            .collect();
        let Some(mem_group) = mem_stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut eligible: Vec<String> = mem_group
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        eligible.sort();
        eligible.truncate(count as usize);

        let mut claimed = Vec::new();
        for id in eligible {
            match entries_by_id.get(&id) {
                Some(fields) => {
                    let Some(pending) = mem_group.pending.get_mut(&id) else {
                        continue;
                    };
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.delivery_count += 1;
                    let delivered = pending.delivery_count;
                    claimed.push((
                        StreamEntry {
                            id,
                            fields: fields.clone(),
                        },
                        delivered,
                    ));
                }
                // Entry was trimmed out from under its pending record;
                // drop the dangling record like the real store does.
                None => {
                    mem_group.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    async fn xrange_all(&self, stream: &str) -> Result<Vec<StreamEntry>, StoreError> {
        self.take_fault()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| StreamEntry {
                        id: e.id.clone(),
                        fields: e.fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn xtrim(&self, stream: &str, maxlen: u64) -> Result<u64, StoreError> {
        self.take_fault()?;
        let mut inner = self.inner.lock().unwrap();
        let Some(mem_stream) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let excess = mem_stream.entries.len().saturating_sub(maxlen as usize);
        mem_stream.entries.drain(..excess);
        Ok(excess as u64)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.take_fault()?;
        if let Some(tx) = self.channels.lock().unwrap().get(channel) {
            // No subscribers is not an error, same as the real store.
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<String>, StoreError> {
        self.take_fault()?;
        let mut channels = self.channels.lock().unwrap();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(tx.subscribe())
    }
}
