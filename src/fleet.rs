// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Single-process fleet assembly: six agent workers plus the backend
//! service, all sharing the in-process bus. One process per agent is the
//! production layout; it needs a networked bus implementation behind the
//! same trait, which is an integration concern, not a code change here.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use maice_backend::BackendService;
use maice_bus::{MemoryBus, MessageBus};
use maice_config::Config;
use maice_llm::TextGenerator;
use maice_metrics::MetricsSidecar;
use maice_runtime::{AgentBehavior, AgentContext, AgentWorker};
use maice_store::{MemoryRepository, SessionStore};

pub struct Fleet {
    pub config: Arc<Config>,
    pub bus: Arc<MemoryBus>,
    pub store: Arc<SessionStore>,
    pub service: Arc<BackendService>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// Spawn every worker and assemble the backend service.
pub fn start(config: Arc<Config>, llm: Arc<dyn TextGenerator>) -> Fleet {
    let bus = Arc::new(MemoryBus::new(&config.bus));
    let store = SessionStore::new(Arc::new(MemoryRepository::new()), &config.store);
    let shutdown = CancellationToken::new();

    let mut workers = Vec::new();
    for behavior in maice_agents::all_behaviors() {
        let agent = behavior.name();
        let metrics = MetricsSidecar::new(
            agent.as_str(),
            bus.clone() as Arc<dyn MessageBus>,
            &config.metrics,
            &config.runtime,
        );
        let cx = Arc::new(AgentContext {
            bus: bus.clone(),
            store: store.clone(),
            metrics,
            llm: llm.clone(),
            config: config.clone(),
        });
        let worker = AgentWorker::new(behavior, cx);
        workers.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    let backend_metrics = MetricsSidecar::new(
        "backend",
        bus.clone() as Arc<dyn MessageBus>,
        &config.metrics,
        &config.runtime,
    );
    let service = Arc::new(BackendService::new(
        bus.clone(),
        store.clone(),
        backend_metrics,
        config.clone(),
    ));

    info!("fleet started: 6 agent workers + backend service");
    Fleet {
        config,
        bus,
        store,
        service,
        shutdown,
        workers,
    }
}

impl Fleet {
    /// Stop claiming, wait for in-flight work (bounded by the drain
    /// timeout inside each worker), then return.
    pub async fn shutdown(self) {
        info!("fleet shutting down");
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("fleet stopped");
    }
}
