// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Monitoring read models behind the `GET /monitoring/...` endpoints.
//! Everything here reads the shared store; nothing mutates fleet state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use maice_bus::MessageBus;
use maice_metrics::LogEvent;
use maice_store::{Repository, SessionStore};
use maice_types::{channels, AgentName, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn ok(detail: Option<String>) -> Self {
        Self {
            status: "ok".into(),
            detail,
        }
    }

    fn error(e: impl std::fmt::Display) -> Self {
        Self {
            status: "error".into(),
            detail: Some(e.to_string()),
        }
    }
}

/// `GET /monitoring/health/detailed` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub api: ComponentHealth,
    pub bus: ComponentHealth,
    pub repository: ComponentHealth,
    pub checked_at: DateTime<Utc>,
}

pub struct Monitoring {
    bus: Arc<dyn MessageBus>,
    store: Arc<SessionStore>,
    started_at: DateTime<Utc>,
}

impl Monitoring {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<SessionStore>) -> Self {
        Self {
            bus,
            store,
            started_at: Utc::now(),
        }
    }

    /// Liveness of the whole fleet.
    pub async fn agents_status(&self) -> anyhow::Result<Vec<maice_metrics::AgentStatusEntry>> {
        maice_metrics::agents_status(self.bus.as_ref()).await
    }

    /// Counter/gauge/histogram snapshot of one agent.
    pub async fn agent_metrics(
        &self,
        agent: AgentName,
    ) -> anyhow::Result<BTreeMap<String, Value>> {
        maice_metrics::agent_metrics(self.bus.as_ref(), agent).await
    }

    /// Ordered processing-log events for one session.
    pub async fn processing_logs(&self, session_id: SessionId) -> anyhow::Result<Vec<LogEvent>> {
        let entries = self
            .bus
            .read_range(&channels::session_log(session_id), 0, usize::MAX)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect())
    }

    /// Aggregated success/failure/latency per agent over the last `hours`.
    pub async fn processing_summary(
        &self,
        hours: u64,
    ) -> anyhow::Result<maice_metrics::ProcessingSummary> {
        maice_metrics::processing_summary(self.bus.as_ref(), hours).await
    }

    /// Component status for the detailed health endpoint.
    pub async fn health(&self) -> HealthReport {
        let bus = match self.bus.ping().await {
            Ok(()) => ComponentHealth::ok(None),
            Err(e) => ComponentHealth::error(format!("{e:#}")),
        };
        let repository = match self.store.repository().ping().await {
            Ok(()) => ComponentHealth::ok(None),
            Err(e) => ComponentHealth::error(e),
        };
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0);
        HealthReport {
            api: ComponentHealth::ok(Some(format!("uptime {uptime}s"))),
            bus,
            repository,
            checked_at: Utc::now(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use maice_bus::MemoryBus;
    use maice_config::Config;
    use maice_metrics::MetricsSidecar;
    use maice_store::MemoryRepository;

    fn fixture() -> (Monitoring, Arc<MetricsSidecar>) {
        let config = Config::default();
        let bus = Arc::new(MemoryBus::new(&config.bus));
        let store = SessionStore::new(Arc::new(MemoryRepository::new()), &config.store);
        let sidecar = MetricsSidecar::new("answerer", bus.clone(), &config.metrics, &config.runtime);
        (Monitoring::new(bus, store), sidecar)
    }

    #[tokio::test]
    async fn health_reports_all_components_ok() {
        let (m, _) = fixture();
        let report = m.health().await;
        assert_eq!(report.api.status, "ok");
        assert_eq!(report.bus.status, "ok");
        assert_eq!(report.repository.status, "ok");
    }

    #[tokio::test]
    async fn processing_logs_come_back_in_order() {
        let (m, sidecar) = fixture();
        for i in 0..3 {
            sidecar
                .append_log(9, "answering", &format!("step {i}"), serde_json::json!({}))
                .await
                .unwrap();
        }
        let logs = m.processing_logs(9).await.unwrap();
        let steps: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(steps, vec!["step 0", "step 1", "step 2"]);
    }

    #[tokio::test]
    async fn status_covers_all_six_agents() {
        let (m, _) = fixture();
        let status = m.agents_status().await.unwrap();
        assert_eq!(status.len(), 6);
    }
}
