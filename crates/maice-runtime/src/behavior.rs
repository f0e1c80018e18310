// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use maice_bus::MessageBus;
use maice_config::Config;
use maice_llm::TextGenerator;
use maice_metrics::MetricsSidecar;
use maice_store::SessionStore;
use maice_types::{channels, AgentRequest, MaiceError, ResponseEvent, SessionId};

/// What a behavior did with a claimed request.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing further to publish; the worker acks.
    Done,
    /// Terminal events the worker publishes on the session stream before
    /// acking. Streamed chunks go out earlier through
    /// [`AgentContext::emit`]; this carries the tail
    /// (e.g. `answer_complete`, `complete`).
    Produced(Vec<ResponseEvent>),
}

/// Everything a behavior may touch. No shared mutable state: the bus and
/// the session store are the only coordination surfaces.
pub struct AgentContext {
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<SessionStore>,
    pub metrics: Arc<MetricsSidecar>,
    pub llm: Arc<dyn TextGenerator>,
    pub config: Arc<Config>,
}

impl AgentContext {
    /// Publish one event on the session's response stream.
    pub async fn emit(&self, session_id: SessionId, event: &ResponseEvent) -> anyhow::Result<()> {
        maice_bus::publish_json(self.bus.as_ref(), &channels::session_stream(session_id), event)
            .await?;
        Ok(())
    }

    /// A token that fires when the session's in-flight request is
    /// cancelled (client disconnect). The watcher lives until `parent`
    /// is cancelled, which the worker does when dispatch ends.
    pub fn cancellation(&self, session_id: SessionId, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut rx = self.bus.subscribe_topic(&channels::cancel_topic(session_id));
        let watched = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.cancelled() => {}
                r = rx.recv() => {
                    if r.is_ok() {
                        watched.cancel();
                    }
                }
            }
        });
        token
    }
}

/// One agent's domain logic. Behaviors are async, must yield at I/O
/// points, and check both the cancellation token and the request deadline
/// between suspension points.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    fn name(&self) -> maice_types::AgentName;

    async fn handle(
        &self,
        req: AgentRequest,
        cx: Arc<AgentContext>,
        cancel: CancellationToken,
    ) -> Result<Outcome, MaiceError>;
}
