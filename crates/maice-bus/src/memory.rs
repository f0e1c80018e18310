// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! In-process implementation of the bus contract.
//!
//! Streams are kept as bounded logs with one cursor per consumer group.
//! A claim first redelivers any of the group's expired claims (id order),
//! then advances the group cursor. Claims are tracked per group, so every
//! group sees every retained message at least once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use maice_config::BusConfig;

use crate::{DeadLetter, Delivery, MessageBus, MessageId};

const TOPIC_CAPACITY: usize = 256;

pub struct MemoryBus {
    visibility_timeout: Duration,
    max_deliveries: u32,
    streams: DashMap<String, Arc<StreamHandle>>,
    topics: DashMap<String, broadcast::Sender<Value>>,
    kv: DashMap<String, KvEntry>,
}

struct StreamHandle {
    state: Mutex<StreamState>,
    notify: Notify,
}

#[derive(Default)]
struct StreamState {
    next_id: MessageId,
    entries: VecDeque<(MessageId, Value)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Next unread entry id for this group.
    cursor: MessageId,
    pending: BTreeMap<MessageId, Pending>,
}

struct Pending {
    claimed_at: Instant,
    delivery_count: u32,
    /// Set by `nack`: redeliver without waiting out the visibility window.
    nacked: bool,
}

impl Pending {
    fn is_expired(&self, now: Instant, visibility: Duration) -> bool {
        self.nacked || now.duration_since(self.claimed_at) >= visibility
    }
}

#[derive(Clone)]
struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
    owner: Option<String>,
}

impl KvEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| now < t).unwrap_or(true)
    }
}

impl MemoryBus {
    pub fn new(cfg: &BusConfig) -> Self {
        Self {
            visibility_timeout: cfg.visibility_timeout(),
            max_deliveries: cfg.max_deliveries,
            streams: DashMap::new(),
            topics: DashMap::new(),
            kv: DashMap::new(),
        }
    }

    fn stream(&self, channel: &str) -> Arc<StreamHandle> {
        self.streams
            .entry(channel.to_string())
            .or_insert_with(|| {
                Arc::new(StreamHandle {
                    state: Mutex::new(StreamState::default()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    async fn publish_dead_letter(&self, record: DeadLetter) -> anyhow::Result<()> {
        let dlq = maice_dlq(&record.channel);
        let payload = serde_json::to_value(&record)?;
        self.publish(&dlq, payload).await?;
        warn!(channel = %record.channel, id = record.message_id, cause = %record.cause,
              "message dead-lettered");
        Ok(())
    }

    /// One pass over the stream for `(group, consumer)`:
    /// expired claim first, fresh entry second.
    ///
    /// Returns either a delivery, a dead-letter record to publish (after
    /// the lock is dropped), or the instant to sleep until.
    async fn try_claim(
        &self,
        handle: &StreamHandle,
        group_name: &str,
    ) -> ClaimOutcome {
        let now = Instant::now();
        let mut st = handle.state.lock().await;
        let visibility = self.visibility_timeout;
        let max_deliveries = self.max_deliveries;

        let group = st.groups.entry(group_name.to_string()).or_default();

        // 1. Redeliver the oldest expired claim, if any.
        let expired = group
            .pending
            .iter()
            .find(|(_, p)| p.is_expired(now, visibility))
            .map(|(id, _)| *id);
        if let Some(id) = expired {
            let delivery_count = {
                let p = group.pending.get_mut(&id).expect("pending entry exists");
                p.delivery_count += 1;
                p.claimed_at = now;
                p.nacked = false;
                p.delivery_count
            };
            let payload = st.entries.iter().find(|(eid, _)| *eid == id).map(|(_, v)| v.clone());
            let group = st.groups.get_mut(group_name).expect("group exists");
            let Some(payload) = payload else {
                // Entry was trimmed away under the pending claim; drop it.
                group.pending.remove(&id);
                return ClaimOutcome::Retry;
            };
            if delivery_count > max_deliveries {
                group.pending.remove(&id);
                st.entries.retain(|(eid, _)| *eid != id);
                return ClaimOutcome::DeadLetter(DeadLetter {
                    channel: String::new(), // filled in by the caller
                    message_id: id,
                    payload,
                    cause: format!("exceeded max deliveries ({max_deliveries})"),
                    failed_at: Utc::now(),
                });
            }
            return ClaimOutcome::Claimed(Delivery {
                id,
                payload,
                delivery_count,
            });
        }

        // 2. Fresh entry at or past the group cursor.
        let cursor = group.cursor;
        if let Some((id, payload)) = st
            .entries
            .iter()
            .find(|(eid, _)| *eid >= cursor)
            .map(|(id, v)| (*id, v.clone()))
        {
            let group = st.groups.get_mut(group_name).expect("group exists");
            group.cursor = id + 1;
            group.pending.insert(
                id,
                Pending {
                    claimed_at: now,
                    delivery_count: 1,
                    nacked: false,
                },
            );
            return ClaimOutcome::Claimed(Delivery {
                id,
                payload,
                delivery_count: 1,
            });
        }

        // 3. Nothing available: sleep until the earliest pending claim of
        //    this group can expire (or the caller's deadline).
        let group = st.groups.get(group_name).expect("group exists");
        let earliest = group
            .pending
            .values()
            .map(|p| p.claimed_at + visibility)
            .min();
        ClaimOutcome::Empty { wake_at: earliest }
    }
}

enum ClaimOutcome {
    Claimed(Delivery),
    DeadLetter(DeadLetter),
    Empty { wake_at: Option<Instant> },
    Retry,
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Value) -> anyhow::Result<MessageId> {
        let handle = self.stream(channel);
        let mut st = handle.state.lock().await;
        let id = st.next_id;
        st.next_id += 1;
        st.entries.push_back((id, payload));
        drop(st);
        handle.notify.notify_waiters();
        debug!(channel, id, "published");
        Ok(id)
    }

    async fn claim(
        &self,
        channel: &str,
        group: &str,
        _consumer: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let handle = self.stream(channel);
        let deadline = Instant::now() + wait;
        loop {
            // Arm the notification before scanning so a concurrent publish
            // between scan and sleep is not missed.
            let notified = handle.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim(&handle, group).await {
                ClaimOutcome::Claimed(d) => return Ok(Some(d)),
                ClaimOutcome::DeadLetter(mut record) => {
                    record.channel = channel.to_string();
                    self.publish_dead_letter(record).await?;
                    continue;
                }
                ClaimOutcome::Retry => continue,
                ClaimOutcome::Empty { wake_at } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let sleep_until = wake_at.map(|w| w.min(deadline)).unwrap_or(deadline);
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(sleep_until) => {
                            if Instant::now() >= deadline {
                                return Ok(None);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn ack(&self, channel: &str, group: &str, id: MessageId) -> anyhow::Result<()> {
        let handle = self.stream(channel);
        let mut st = handle.state.lock().await;
        if let Some(g) = st.groups.get_mut(group) {
            g.pending.remove(&id);
        }
        Ok(())
    }

    async fn nack(&self, channel: &str, group: &str, id: MessageId) -> anyhow::Result<()> {
        let handle = self.stream(channel);
        let mut st = handle.state.lock().await;
        if let Some(p) = st.groups.get_mut(group).and_then(|g| g.pending.get_mut(&id)) {
            p.nacked = true;
        }
        drop(st);
        handle.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        channel: &str,
        group: &str,
        id: MessageId,
        cause: &str,
    ) -> anyhow::Result<()> {
        let handle = self.stream(channel);
        let payload = {
            let mut st = handle.state.lock().await;
            if let Some(g) = st.groups.get_mut(group) {
                g.pending.remove(&id);
            }
            let payload = st
                .entries
                .iter()
                .find(|(eid, _)| *eid == id)
                .map(|(_, v)| v.clone());
            st.entries.retain(|(eid, _)| *eid != id);
            payload
        };
        let Some(payload) = payload else {
            return Ok(());
        };
        self.publish_dead_letter(DeadLetter {
            channel: channel.to_string(),
            message_id: id,
            payload,
            cause: cause.to_string(),
            failed_at: Utc::now(),
        })
        .await
    }

    async fn trim(&self, channel: &str, max_entries: usize) -> anyhow::Result<()> {
        let handle = self.stream(channel);
        let mut st = handle.state.lock().await;
        while st.entries.len() > max_entries {
            st.entries.pop_front();
        }
        Ok(())
    }

    async fn read_range(
        &self,
        channel: &str,
        from: MessageId,
        limit: usize,
    ) -> anyhow::Result<Vec<(MessageId, Value)>> {
        let handle = self.stream(channel);
        let st = handle.state.lock().await;
        Ok(st
            .entries
            .iter()
            .filter(|(id, _)| *id >= from)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        // No subscribers is fine; broadcast channels are lossy.
        let _ = self.topic(topic).send(payload);
        Ok(())
    }

    fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.topic(topic).subscribe()
    }

    async fn kv_put(&self, key: &str, value: Value, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
                owner: None,
            },
        );
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let now = Instant::now();
        // Clone out of the shard guard before any removal; dashmap does
        // not tolerate a write while a read guard is held.
        let entry = self.kv.get(key).map(|e| (e.value.clone(), e.is_live(now)));
        match entry {
            Some((value, true)) => Ok(Some(value)),
            Some((_, false)) => {
                self.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn kv_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut taken = false;
        let mut entry = self.kv.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: Value::Null,
            expires_at: None,
            owner: None,
        });
        let free = !entry.is_live(now)
            || entry.owner.is_none()
            || entry.owner.as_deref() == Some(owner);
        if free {
            entry.owner = Some(owner.to_string());
            entry.expires_at = Some(now + ttl);
            entry.value = Value::String(owner.to_string());
            taken = true;
        }
        Ok(taken)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let held = match self.kv.get(key) {
            Some(e) => e.is_live(now) && e.owner.as_deref() == Some(owner),
            None => false,
        };
        if held {
            self.kv.remove(key);
        }
        Ok(held)
    }

    async fn lease_owner(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .kv
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.owner.clone()))
    }
}

fn maice_dlq(channel: &str) -> String {
    match channel.strip_prefix("maice:") {
        Some(rest) => format!("maice:dlq:{rest}"),
        None => format!("maice:dlq:{channel}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> MemoryBus {
        MemoryBus::new(&BusConfig::default())
    }

    fn short_visibility_bus() -> MemoryBus {
        let cfg = BusConfig {
            visibility_timeout_sec: 1,
            max_deliveries: 3,
            ..BusConfig::default()
        };
        MemoryBus::new(&cfg)
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn publish_then_claim_preserves_order() {
        let bus = bus();
        bus.publish("s", json!({"n": 1})).await.unwrap();
        bus.publish("s", json!({"n": 2})).await.unwrap();

        let a = bus.claim("s", "g", "c1", WAIT).await.unwrap().unwrap();
        let b = bus.claim("s", "g", "c1", WAIT).await.unwrap().unwrap();
        assert_eq!(a.payload["n"], 1);
        assert_eq!(b.payload["n"], 2);
        assert!(a.id < b.id);
    }

    #[tokio::test]
    async fn claim_with_nothing_available_returns_none() {
        let bus = bus();
        let got = bus.claim("empty", "g", "c", WAIT).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acked_messages_are_not_redelivered() {
        let bus = short_visibility_bus();
        bus.publish("s", json!("x")).await.unwrap();
        let d = bus.claim("s", "g", "c", WAIT).await.unwrap().unwrap();
        bus.ack("s", "g", d.id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(bus.claim("s", "g", "c", WAIT).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_messages_reappear_after_visibility_timeout() {
        let bus = short_visibility_bus();
        bus.publish("s", json!("x")).await.unwrap();
        let first = bus.claim("s", "g", "c", WAIT).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);

        // Not acked; the claim expires and the message comes back.
        let second = bus
            .claim("s", "g", "c", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn nack_makes_message_immediately_claimable() {
        let bus = bus(); // 30 s visibility; only a nack can bring it back fast
        bus.publish("s", json!("x")).await.unwrap();
        let d = bus.claim("s", "g", "c", WAIT).await.unwrap().unwrap();
        bus.nack("s", "g", d.id).await.unwrap();

        let again = bus.claim("s", "g", "c", WAIT).await.unwrap().unwrap();
        assert_eq!(again.id, d.id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_deliveries_route_to_dead_letter() {
        let bus = short_visibility_bus(); // max_deliveries = 3
        bus.publish("maice:requests:answerer", json!({"q": "hi"}))
            .await
            .unwrap();

        // Claim three times without acking; the fourth delivery attempt
        // must dead-letter instead.
        for _ in 0..3 {
            let d = bus
                .claim("maice:requests:answerer", "g", "c", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(d.is_some());
        }
        let gone = bus
            .claim("maice:requests:answerer", "g", "c", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(gone.is_none());

        let dlq = bus
            .claim("maice:dlq:requests:answerer", "g", "c", WAIT)
            .await
            .unwrap()
            .unwrap();
        let record: DeadLetter = serde_json::from_value(dlq.payload).unwrap();
        assert_eq!(record.channel, "maice:requests:answerer");
        assert_eq!(record.payload["q"], "hi");
        assert!(record.cause.contains("max deliveries"));
    }

    #[tokio::test]
    async fn explicit_dead_letter_carries_cause() {
        let bus = bus();
        bus.publish("maice:requests:observer", json!("p")).await.unwrap();
        let d = bus
            .claim("maice:requests:observer", "g", "c", WAIT)
            .await
            .unwrap()
            .unwrap();
        bus.dead_letter("maice:requests:observer", "g", d.id, "permanent: bad payload")
            .await
            .unwrap();

        let dlq = bus
            .claim("maice:dlq:requests:observer", "g", "c", WAIT)
            .await
            .unwrap()
            .unwrap();
        let record: DeadLetter = serde_json::from_value(dlq.payload).unwrap();
        assert_eq!(record.cause, "permanent: bad payload");

        // Original message is gone from the source stream.
        assert!(bus
            .claim("maice:requests:observer", "g2", "c", WAIT)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn each_group_sees_every_message() {
        let bus = bus();
        bus.publish("s", json!("x")).await.unwrap();

        let a = bus.claim("s", "alpha", "c", WAIT).await.unwrap().unwrap();
        let b = bus.claim("s", "beta", "c", WAIT).await.unwrap().unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn trim_bounds_the_log() {
        let bus = bus();
        for i in 0..10 {
            bus.publish("s", json!(i)).await.unwrap();
        }
        bus.trim("s", 3).await.unwrap();
        let entries = bus.read_range("s", 0, 100).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1, json!(7));
    }

    #[tokio::test]
    async fn read_range_honors_from_and_limit() {
        let bus = bus();
        for i in 0..5 {
            bus.publish("s", json!(i)).await.unwrap();
        }
        let entries = bus.read_range("s", 2, 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_current_subscribers_only() {
        let bus = bus();
        bus.broadcast("t", json!("lost")).await.unwrap();

        let mut rx = bus.subscribe_topic("t");
        bus.broadcast("t", json!("seen")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!("seen"));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let bus = bus();
        let ttl = Duration::from_secs(60);
        assert!(bus.acquire_lease("l", "a", ttl).await.unwrap());
        assert!(!bus.acquire_lease("l", "b", ttl).await.unwrap());
        // Re-entrant for the same owner.
        assert!(bus.acquire_lease("l", "a", ttl).await.unwrap());

        assert!(!bus.release_lease("l", "b").await.unwrap());
        assert!(bus.release_lease("l", "a").await.unwrap());
        assert!(bus.acquire_lease("l", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_taken_over() {
        let bus = bus();
        assert!(bus
            .acquire_lease("l", "a", Duration::from_secs(1))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bus
            .acquire_lease("l", "b", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(bus.lease_owner("l").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn kv_entries_expire() {
        let bus = bus();
        bus.kv_put("k", json!(1), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(bus.kv_get("k").await.unwrap(), Some(json!(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bus.kv_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_keys_filters_by_prefix() {
        let bus = bus();
        bus.kv_put("maice:agent_status:answerer", json!({}), None)
            .await
            .unwrap();
        bus.kv_put("maice:metrics:answerer:counter:x", json!(1), None)
            .await
            .unwrap();
        let keys = bus.kv_keys("maice:agent_status:").await.unwrap();
        assert_eq!(keys, vec!["maice:agent_status:answerer".to_string()]);
    }

    #[tokio::test]
    async fn claim_wakes_on_concurrent_publish() {
        let bus = Arc::new(bus());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.claim("s", "g", "c", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("s", json!("late")).await.unwrap();
        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.payload, json!("late"));
    }
}
