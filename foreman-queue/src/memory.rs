//! In-memory stream queue.
//!
//! Single-process implementation of `StreamQueue` used by the test suites
//! and by single-node runs that do not need durability. Semantics match the
//! Postgres implementation: per-group delivery cursors, pending lists keyed
//! by message id, claim-on-idle, ack idempotence.

use crate::stream::{GroupStart, PendingEntry, StreamMessage, StreamQueue};
use async_trait::async_trait;
use foreman_core::QueueError;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
struct StoredMessage {
    /// Absolute position in the stream, never reused
    offset: u64,
    id: String,
    payload: JsonValue,
}

#[derive(Debug, Clone)]
struct PendingMeta {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
    /// Payload retained so claims survive trimming of the backing log
    payload: JsonValue,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Absolute offset of the next undelivered message
    cursor: u64,
    /// Pending entries ordered by message id
    pending: BTreeMap<String, PendingMeta>,
}

#[derive(Debug, Default)]
struct StreamState {
    log: VecDeque<StoredMessage>,
    next_offset: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    last_millis: u64,
    seq_in_millis: u64,
}

impl Inner {
    fn next_id(&mut self) -> String {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        // Never go backwards, even under clock skew
        if now_millis > self.last_millis {
            self.last_millis = now_millis;
            self.seq_in_millis = 0;
        } else {
            self.seq_in_millis += 1;
        }
        format!("{:013}-{:06}", self.last_millis, self.seq_in_millis)
    }
}

/// Process-local `StreamQueue`. Cheap to clone; clones share the same logs.
#[derive(Clone, Default)]
pub struct InMemoryStreamQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryStreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries currently held on a stream (test observability).
    pub async fn len(&self, stream: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.streams.get(stream).map_or(0, |s| s.log.len())
    }

    pub async fn is_empty(&self, stream: &str) -> bool {
        self.len(stream).await == 0
    }

    fn take_new(
        inner: &mut Inner,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| QueueError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let StreamState { log, groups, .. } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut batch = Vec::new();
        for message in log.iter() {
            if batch.len() >= max {
                break;
            }
            if message.offset < group_state.cursor {
                continue;
            }
            group_state.cursor = message.offset + 1;
            group_state.pending.insert(
                message.id.clone(),
                PendingMeta {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                    payload: message.payload.clone(),
                },
            );
            batch.push(StreamMessage {
                id: message.id.clone(),
                payload: message.payload.clone(),
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamQueue for InMemoryStreamQueue {
    async fn publish(&self, stream: &str, payload: &JsonValue) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        let state = inner.streams.entry(stream.to_string()).or_default();
        let offset = state.next_offset;
        state.next_offset += 1;
        state.log.push_back(StoredMessage {
            offset,
            id: id.clone(),
            payload: payload.clone(),
        });
        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        let end = state.next_offset;
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: match start {
                    GroupStart::Beginning => 0,
                    GroupStart::New => end,
                },
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                let batch = Self::take_new(&mut inner, stream, group, consumer, max)?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(deadline - now) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(id).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, QueueError> {
        let inner = self.inner.lock().await;
        let entries = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, meta)| PendingEntry {
                        id: id.clone(),
                        consumer: meta.consumer.clone(),
                        idle_ms: meta.delivered_at.elapsed().as_millis() as u64,
                        delivery_count: meta.delivery_count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for id in ids {
            if let Some(meta) = group_state.pending.get_mut(id) {
                if meta.delivered_at.elapsed().as_millis() as u64 >= min_idle_ms {
                    meta.consumer = new_consumer.to_string();
                    meta.delivered_at = Instant::now();
                    meta.delivery_count += 1;
                    claimed.push(StreamMessage {
                        id: id.clone(),
                        payload: meta.payload.clone(),
                    });
                }
            }
        }
        Ok(claimed)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let mut removed = 0u64;
        while state.log.len() > max_len {
            state.log.pop_front();
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_ids_strictly_increase() {
        let queue = InMemoryStreamQueue::new();
        let mut previous = String::new();
        for i in 0..100 {
            let id = queue.publish("s", &json!({ "i": i })).await.unwrap();
            assert!(id > previous, "{} should sort after {}", id, previous);
            previous = id;
        }
    }

    #[tokio::test]
    async fn test_consume_preserves_order_and_tracks_pending() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        let a = queue.publish("s", &json!({ "n": 1 })).await.unwrap();
        let b = queue.publish("s", &json!({ "n": 2 })).await.unwrap();

        let batch = queue.consume("s", "g", "c0", 10, 0).await.unwrap();
        assert_eq!(
            batch.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            vec![a.clone(), b.clone()]
        );

        let pending = queue.pending("s", "g").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|p| p.consumer == "c0"));
        assert!(pending.iter().all(|p| p.delivery_count == 1));

        // Nothing new to deliver
        let empty = queue.consume("s", "g", "c0", 10, 0).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        let id = queue.publish("s", &json!({})).await.unwrap();
        queue.consume("s", "g", "c0", 1, 0).await.unwrap();

        assert!(queue.ack("s", "g", &id).await.unwrap());
        assert!(!queue.ack("s", "g", &id).await.unwrap());
        assert!(queue.pending("s", "g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g1", GroupStart::Beginning)
            .await
            .unwrap();
        queue
            .ensure_group("s", "g2", GroupStart::Beginning)
            .await
            .unwrap();
        queue.publish("s", &json!({ "x": 1 })).await.unwrap();

        let b1 = queue.consume("s", "g1", "c", 10, 0).await.unwrap();
        let b2 = queue.consume("s", "g2", "c", 10, 0).await.unwrap();
        assert_eq!(b1.len(), 1);
        assert_eq!(b2.len(), 1, "each group gets its own delivery");
    }

    #[tokio::test]
    async fn test_group_start_new_skips_history() {
        let queue = InMemoryStreamQueue::new();
        queue.publish("s", &json!({ "old": true })).await.unwrap();
        queue.ensure_group("s", "g", GroupStart::New).await.unwrap();
        let fresh = queue.publish("s", &json!({ "old": false })).await.unwrap();

        let batch = queue.consume("s", "g", "c", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, fresh);
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        queue.publish("s", &json!({})).await.unwrap();
        queue.consume("s", "g", "c", 10, 0).await.unwrap();
        // Re-ensuring must not reset the cursor or pending list
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        assert!(queue.consume("s", "g", "c", 10, 0).await.unwrap().is_empty());
        assert_eq!(queue.pending("s", "g").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_reassigns_only_idle_messages() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        let id = queue.publish("s", &json!({ "p": 1 })).await.unwrap();
        queue.consume("s", "g", "dead", 1, 0).await.unwrap();

        // Not idle long enough
        let none = queue
            .claim("s", "g", "fresh", 60_000, &[id.clone()])
            .await
            .unwrap();
        assert!(none.is_empty());

        // Idle threshold zero claims immediately
        let claimed = queue
            .claim("s", "g", "fresh", 0, &[id.clone()])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, json!({ "p": 1 }));

        let pending = queue.pending("s", "g").await.unwrap();
        assert_eq!(pending[0].consumer, "fresh");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_consume_unknown_group_errors() {
        let queue = InMemoryStreamQueue::new();
        queue.publish("s", &json!({})).await.unwrap();
        let err = queue.consume("s", "nope", "c", 1, 0).await.unwrap_err();
        assert!(matches!(err, QueueError::NoSuchGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocking_consume_wakes_on_publish() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();

        let consumer = queue.clone();
        let handle =
            tokio::spawn(async move { consumer.consume("s", "g", "c", 1, 2_000).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish("s", &json!({ "wake": true })).await.unwrap();

        let batch = handle.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_trim_drops_oldest_but_claims_survive() {
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        let first = queue.publish("s", &json!({ "n": 0 })).await.unwrap();
        queue.consume("s", "g", "c", 1, 0).await.unwrap();
        for n in 1..=5 {
            queue.publish("s", &json!({ "n": n })).await.unwrap();
        }

        let removed = queue.trim("s", 2).await.unwrap();
        assert_eq!(removed, 4);
        assert_eq!(queue.len("s").await, 2);

        // The pending entry for the trimmed message can still be claimed.
        let claimed = queue.claim("s", "g", "c2", 0, &[first]).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, json!({ "n": 0 }));
    }
}
