// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use histogram::Histogram;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use maice_bus::MessageBus;
use maice_types::{channels, SessionId};

use crate::snapshot::HistogramSnapshot;

/// One entry of a session's processing log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub session_id: SessionId,
    /// Process name: one of the six agents, or `backend`.
    pub agent: String,
    pub stage: String,
    pub message: String,
    #[serde(default)]
    pub fields: Value,
    pub at: DateTime<Utc>,
}

/// Hourly success/failure/latency bucket backing the processing summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub success: u64,
    pub failure: u64,
    pub latency_ms_sum: u64,
    pub latency_count: u64,
}

#[derive(Default)]
struct Registry {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, Histogram>,
    hourly: BTreeMap<i64, HourlyBucket>,
}

/// Process-wide metrics collector embedded in each worker.
///
/// Mutation is lock-cheap and synchronous; only the flush task and the
/// log append touch the bus.
pub struct MetricsSidecar {
    agent: String,
    bus: Arc<dyn MessageBus>,
    registry: Mutex<Registry>,
    flush_interval: Duration,
    heartbeat_interval: Duration,
    heartbeat_ttl: Duration,
    log_trim_entries: usize,
}

impl MetricsSidecar {
    pub fn new(
        agent: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        metrics_cfg: &maice_config::MetricsConfig,
        runtime_cfg: &maice_config::RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent: agent.into(),
            bus,
            registry: Mutex::new(Registry::default()),
            flush_interval: metrics_cfg.flush_interval(),
            heartbeat_interval: runtime_cfg.heartbeat_interval(),
            heartbeat_ttl: runtime_cfg.heartbeat_ttl(),
            log_trim_entries: metrics_cfg.log_trim_entries,
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    // ── Local aggregation ─────────────────────────────────────────────────────

    pub fn inc(&self, name: &str, delta: u64, labels: &[(&str, &str)]) {
        let key = keyed(name, labels);
        let mut reg = self.registry.lock().expect("metrics registry poisoned");
        *reg.counters.entry(key).or_insert(0) += delta;
    }

    pub fn set(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = keyed(name, labels);
        let mut reg = self.registry.lock().expect("metrics registry poisoned");
        reg.gauges.insert(key, value);
    }

    pub fn observe(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = keyed(name, labels);
        let mut reg = self.registry.lock().expect("metrics registry poisoned");
        let h = reg.histograms.entry(key).or_insert_with(Histogram::new);
        if let Err(e) = h.increment(value) {
            debug!(name, value, error = e, "histogram increment rejected");
        }
    }

    /// Record one request outcome in the hourly summary buckets.
    pub fn record_outcome(&self, success: bool, latency_ms: u64) {
        let hour = Utc::now().timestamp() / 3600;
        let mut reg = self.registry.lock().expect("metrics registry poisoned");
        let bucket = reg.hourly.entry(hour).or_default();
        if success {
            bucket.success += 1;
        } else {
            bucket.failure += 1;
        }
        bucket.latency_ms_sum += latency_ms;
        bucket.latency_count += 1;
    }

    pub fn metrics_count(&self) -> u64 {
        let reg = self.registry.lock().expect("metrics registry poisoned");
        (reg.counters.len() + reg.gauges.len() + reg.histograms.len()) as u64
    }

    // ── Processing log ────────────────────────────────────────────────────────

    /// Append to the session's durable processing log and mirror the event
    /// on its live broadcast topic. Writes immediately, bypassing the
    /// flush cadence.
    pub async fn append_log(
        &self,
        session_id: SessionId,
        stage: &str,
        message: &str,
        fields: Value,
    ) -> anyhow::Result<()> {
        let event = LogEvent {
            session_id,
            agent: self.agent.clone(),
            stage: stage.to_string(),
            message: message.to_string(),
            fields,
            at: Utc::now(),
        };
        let payload = serde_json::to_value(&event)?;
        let log = channels::session_log(session_id);
        self.bus.publish(&log, payload.clone()).await?;
        self.bus.trim(&log, self.log_trim_entries).await?;
        self.bus
            .broadcast(&channels::log_topic(session_id), payload)
            .await?;
        Ok(())
    }

    // ── Flush and heartbeat ───────────────────────────────────────────────────

    /// Write every aggregate to the shared store.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (counters, gauges, histograms, hourly) = {
            let reg = self.registry.lock().expect("metrics registry poisoned");
            (
                reg.counters.clone(),
                reg.gauges.clone(),
                reg.histograms
                    .iter()
                    .map(|(k, h)| (k.clone(), HistogramSnapshot::of(h)))
                    .collect::<BTreeMap<_, _>>(),
                reg.hourly.clone(),
            )
        };

        for (key, v) in counters {
            self.bus
                .kv_put(
                    &channels::metrics_key(&self.agent, "counter", &key),
                    json!(v),
                    None,
                )
                .await?;
        }
        for (key, v) in gauges {
            self.bus
                .kv_put(
                    &channels::metrics_key(&self.agent, "gauge", &key),
                    json!(v),
                    None,
                )
                .await?;
        }
        for (key, snap) in histograms {
            self.bus
                .kv_put(
                    &channels::metrics_key(&self.agent, "histogram", &key),
                    serde_json::to_value(snap)?,
                    None,
                )
                .await?;
        }
        self.bus
            .kv_put(
                &channels::metrics_key(&self.agent, "summary", "hourly"),
                serde_json::to_value(&hourly)?,
                None,
            )
            .await?;
        Ok(())
    }

    /// Publish the agent's liveness hash. TTL means a stalled process
    /// disappears from the store on its own.
    pub async fn heartbeat(&self) -> anyhow::Result<()> {
        self.bus
            .kv_put(
                &channels::agent_status_key(&self.agent),
                json!({
                    "agent_name": self.agent,
                    "last_update": Utc::now().to_rfc3339(),
                    "metrics_count": self.metrics_count(),
                }),
                Some(self.heartbeat_ttl),
            )
            .await
    }

    /// Spawn the flush/heartbeat loop. One leader per agent process.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut flush = tokio::time::interval(this.flush_interval);
            let mut heartbeat = tokio::time::interval(this.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = flush.tick() => {
                        if let Err(e) = this.flush().await {
                            warn!(agent = %this.agent, "metrics flush failed: {e:#}");
                        }
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = this.heartbeat().await {
                            warn!(agent = %this.agent, "heartbeat failed: {e:#}");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            // Final flush so shutdown does not lose the tail of the window.
            let _ = this.flush().await;
        })
    }
}

/// Canonical metric key: `name{k=v,...}` with labels sorted by insertion.
fn keyed(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
