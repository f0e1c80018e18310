// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Read models over the shared store: agent liveness, metric snapshots
//! and the hourly processing summary. These back the monitoring
//! endpoints and take the bus as their only dependency.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use maice_bus::MessageBus;
use maice_types::{channels, AgentName};

use crate::sidecar::HourlyBucket;

/// One row of `GET /monitoring/agents/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEntry {
    pub agent_name: String,
    pub is_alive: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub metrics_count: u64,
}

/// Liveness of every agent in the fleet. An agent whose heartbeat hash
/// has lapsed (TTL 60 s) reports as not alive.
pub async fn agents_status(bus: &dyn MessageBus) -> anyhow::Result<Vec<AgentStatusEntry>> {
    let mut out = Vec::with_capacity(AgentName::ALL.len());
    for agent in AgentName::ALL {
        let entry = match bus.kv_get(&channels::agent_status_key(agent.as_str())).await? {
            Some(v) => AgentStatusEntry {
                agent_name: agent.as_str().to_string(),
                is_alive: true,
                last_update: v["last_update"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
                metrics_count: v["metrics_count"].as_u64().unwrap_or(0),
            },
            None => AgentStatusEntry {
                agent_name: agent.as_str().to_string(),
                is_alive: false,
                last_update: None,
                metrics_count: 0,
            },
        };
        out.push(entry);
    }
    Ok(out)
}

/// Full counter/gauge/histogram snapshot for one agent, keyed by the
/// flushed store key.
pub async fn agent_metrics(
    bus: &dyn MessageBus,
    agent: AgentName,
) -> anyhow::Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for key in bus.kv_keys(&channels::metrics_prefix(agent.as_str())).await? {
        if let Some(v) = bus.kv_get(&key).await? {
            out.insert(key, v);
        }
    }
    Ok(out)
}

/// One agent's aggregate over the requested window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_name: String,
    pub success: u64,
    pub failure: u64,
    pub avg_latency_ms: u64,
}

/// `GET /monitoring/processing-summary?hours=H` read model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub hours: u64,
    pub agents: Vec<AgentSummary>,
}

pub async fn processing_summary(
    bus: &dyn MessageBus,
    hours: u64,
) -> anyhow::Result<ProcessingSummary> {
    let cutoff_hour = Utc::now().timestamp() / 3600 - hours as i64;
    let mut agents = Vec::with_capacity(AgentName::ALL.len());
    for agent in AgentName::ALL {
        let key = channels::metrics_key(agent.as_str(), "summary", "hourly");
        let buckets: BTreeMap<i64, HourlyBucket> = match bus.kv_get(&key).await? {
            Some(v) => serde_json::from_value(v).unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let mut success = 0;
        let mut failure = 0;
        let mut latency_sum = 0;
        let mut latency_count = 0;
        for (hour, b) in buckets {
            if hour >= cutoff_hour {
                success += b.success;
                failure += b.failure;
                latency_sum += b.latency_ms_sum;
                latency_count += b.latency_count;
            }
        }
        agents.push(AgentSummary {
            agent_name: agent.as_str().to_string(),
            success,
            failure,
            avg_latency_ms: if latency_count == 0 {
                0
            } else {
                latency_sum / latency_count
            },
        });
    }
    Ok(ProcessingSummary { hours, agents })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::MetricsSidecar;
    use maice_bus::MemoryBus;
    use maice_config::{BusConfig, MetricsConfig, RuntimeConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn fixture() -> (Arc<MemoryBus>, Arc<MetricsSidecar>) {
        let bus = Arc::new(MemoryBus::new(&BusConfig::default()));
        let sidecar = MetricsSidecar::new(
            "answerer",
            bus.clone(),
            &MetricsConfig::default(),
            &RuntimeConfig::default(),
        );
        (bus, sidecar)
    }

    #[tokio::test]
    async fn missing_heartbeat_reports_not_alive() {
        let (bus, sidecar) = fixture();
        sidecar.heartbeat().await.unwrap();

        let status = agents_status(bus.as_ref()).await.unwrap();
        let answerer = status.iter().find(|s| s.agent_name == "answerer").unwrap();
        let observer = status.iter().find(|s| s.agent_name == "observer").unwrap();
        assert!(answerer.is_alive);
        assert!(!observer.is_alive);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_heartbeat_flips_to_degraded_on_next_poll() {
        let (bus, sidecar) = fixture();
        sidecar.heartbeat().await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let status = agents_status(bus.as_ref()).await.unwrap();
        let answerer = status.iter().find(|s| s.agent_name == "answerer").unwrap();
        assert!(!answerer.is_alive);
    }

    #[tokio::test]
    async fn metrics_snapshot_lists_flushed_keys() {
        let (bus, sidecar) = fixture();
        sidecar.inc("requests_total", 4, &[]);
        sidecar.flush().await.unwrap();

        let metrics = agent_metrics(bus.as_ref(), AgentName::Answerer)
            .await
            .unwrap();
        assert!(metrics.contains_key("maice:metrics:answerer:counter:requests_total"));
    }

    #[tokio::test]
    async fn summary_aggregates_recent_buckets() {
        let (bus, sidecar) = fixture();
        sidecar.record_outcome(true, 100);
        sidecar.record_outcome(true, 200);
        sidecar.record_outcome(false, 300);
        sidecar.flush().await.unwrap();

        let summary = processing_summary(bus.as_ref(), 1).await.unwrap();
        let answerer = summary
            .agents
            .iter()
            .find(|a| a.agent_name == "answerer")
            .unwrap();
        assert_eq!(answerer.success, 2);
        assert_eq!(answerer.failure, 1);
        assert_eq!(answerer.avg_latency_ms, 200);
    }
}
