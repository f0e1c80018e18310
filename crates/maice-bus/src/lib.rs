// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable, ordered, at-least-once message transport plus lossy pub/sub
//! and a TTL'd key-value surface.
//!
//! Two channel flavors:
//!
//! * **Stream channels**: ordered and persistent, consumed by named groups.
//!   Each delivery carries a message id; the consumer acknowledges
//!   explicitly. Claimed-but-unacked messages reappear after the
//!   visibility timeout, and a message delivered more than
//!   `max_deliveries` times is routed to the channel's dead-letter stream
//!   with its original payload and the error cause.
//! * **Broadcast topics**: best-effort fan-out, no persistence, delivered
//!   to every current subscriber.
//!
//! The key-value surface carries agent heartbeats, flushed metric
//! snapshots and the per-session in-flight leases; every entry may carry
//! a TTL.
//!
//! The bus itself is externally shared infrastructure. [`MemoryBus`] is
//! the bundled in-process implementation with the full contract; a
//! networked implementation plugs in behind the same trait.

pub mod memory;

pub use memory::MemoryBus;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonically increasing per-channel message id.
pub type MessageId = u64;

/// One claimed stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: MessageId,
    pub payload: Value,
    /// 1 on first delivery; grows on every redelivery.
    pub delivery_count: u32,
}

/// Record published on a dead-letter channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub channel: String,
    pub message_id: MessageId,
    pub payload: Value,
    pub cause: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append to a stream channel. Durable; network errors fail the call.
    async fn publish(&self, channel: &str, payload: Value) -> anyhow::Result<MessageId>;

    /// Claim the next message for `(group, consumer)`, blocking up to
    /// `wait`. Returns `None` when nothing became available. Expired
    /// claims of the same group are redelivered first, in id order.
    async fn claim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>>;

    /// Acknowledge a claimed message; it will not be redelivered.
    async fn ack(&self, channel: &str, group: &str, id: MessageId) -> anyhow::Result<()>;

    /// Give a claimed message back for immediate redelivery.
    async fn nack(&self, channel: &str, group: &str, id: MessageId) -> anyhow::Result<()>;

    /// Acknowledge a message and move it to the channel's dead-letter
    /// stream with the given cause.
    async fn dead_letter(
        &self,
        channel: &str,
        group: &str,
        id: MessageId,
        cause: &str,
    ) -> anyhow::Result<()>;

    /// Bound a stream's retained log to its newest `max_entries`.
    async fn trim(&self, channel: &str, max_entries: usize) -> anyhow::Result<()>;

    /// Read retained entries with `id >= from`, oldest first, ignoring
    /// consumer groups. Monitoring/replay only.
    async fn read_range(
        &self,
        channel: &str,
        from: MessageId,
        limit: usize,
    ) -> anyhow::Result<Vec<(MessageId, Value)>>;

    /// Lossy fan-out to all current subscribers of a topic.
    async fn broadcast(&self, topic: &str, payload: Value) -> anyhow::Result<()>;

    /// Subscribe to a broadcast topic. Messages published before the call
    /// are not seen.
    fn subscribe_topic(&self, topic: &str) -> tokio::sync::broadcast::Receiver<Value>;

    // ── Key-value surface ─────────────────────────────────────────────────────

    async fn kv_put(&self, key: &str, value: Value, ttl: Option<Duration>) -> anyhow::Result<()>;

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// All live keys under a prefix.
    async fn kv_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    // ── Leases ────────────────────────────────────────────────────────────────

    /// Take the lease if it is free (or already held by `owner`).
    /// Returns `false` when another owner holds it.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Release the lease if held by `owner`. Returns whether it was held.
    async fn release_lease(&self, key: &str, owner: &str) -> anyhow::Result<bool>;

    /// Current live holder of the lease, if any.
    async fn lease_owner(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Typed publish helper: serializes `payload` and appends it.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    channel: &str,
    payload: &T,
) -> anyhow::Result<MessageId> {
    bus.publish(channel, serde_json::to_value(payload)?).await
}

/// Typed broadcast helper.
pub async fn broadcast_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    payload: &T,
) -> anyhow::Result<()> {
    bus.broadcast(topic, serde_json::to_value(payload)?).await
}
