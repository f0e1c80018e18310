// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The six agent behaviors. All share the runtime contract; none imports
//! another — cross-agent handoffs are routing decisions made by the
//! orchestrator from verdicts and progress signals on coordination
//! topics.

pub mod answer;
pub mod classify;
pub mod clarify;
pub mod curriculum;
pub mod freetalk;
pub mod observe;
pub mod parse;
pub mod prompts;

pub use answer::AnswererBehavior;
pub use classify::ClassifierBehavior;
pub use clarify::ClarifierBehavior;
pub use curriculum::CurriculumBehavior;
pub use freetalk::FreeTalkerBehavior;
pub use observe::ObserverBehavior;

use std::sync::Arc;

use maice_runtime::AgentBehavior;

/// The full fleet, ready to hand to one worker each.
pub fn all_behaviors() -> Vec<Arc<dyn AgentBehavior>> {
    vec![
        Arc::new(ClassifierBehavior),
        Arc::new(ClarifierBehavior),
        Arc::new(AnswererBehavior),
        Arc::new(ObserverBehavior),
        Arc::new(CurriculumBehavior),
        Arc::new(FreeTalkerBehavior),
    ]
}

/// Transcript rendering shared by the answerer, observer and evaluator:
/// `user: ...` / `maice: ...` lines in log order, internal rows skipped.
pub fn render_transcript(messages: &[maice_types::SessionMessage]) -> String {
    use maice_types::MessageType;
    let mut out = String::new();
    for m in messages {
        if matches!(m.message_type, MessageType::Internal | MessageType::System) {
            continue;
        }
        let who = match m.sender {
            maice_types::Sender::User => "user",
            maice_types::Sender::Maice => "maice",
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(&m.content);
        out.push('\n');
    }
    out
}

/// Map an LLM failure: a fired cancellation token means the client went
/// away, anything else is transient and retried by the runtime.
pub(crate) fn llm_error(
    err: anyhow::Error,
    cancel: &tokio_util::sync::CancellationToken,
) -> maice_types::MaiceError {
    if cancel.is_cancelled() {
        maice_types::MaiceError::Cancelled
    } else {
        maice_types::MaiceError::Transient(err)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use maice_bus::MemoryBus;
    use maice_config::Config;
    use maice_llm::TextGenerator;
    use maice_metrics::MetricsSidecar;
    use maice_runtime::AgentContext;
    use maice_store::{MemoryRepository, SessionStore};

    pub fn context(llm: Arc<dyn TextGenerator>) -> (Arc<AgentContext>, Arc<MemoryBus>) {
        let config = Arc::new(Config::default());
        let bus = Arc::new(MemoryBus::new(&config.bus));
        let store = SessionStore::new(Arc::new(MemoryRepository::new()), &config.store);
        let metrics = MetricsSidecar::new(
            "answerer",
            bus.clone(),
            &config.metrics,
            &config.runtime,
        );
        (
            Arc::new(AgentContext {
                bus: bus.clone(),
                store,
                metrics,
                llm,
                config,
            }),
            bus,
        )
    }

    /// Drain every event currently on a session stream.
    pub async fn drain_events(
        bus: &MemoryBus,
        session_id: i64,
    ) -> Vec<maice_types::ResponseEvent> {
        use maice_bus::MessageBus;
        let channel = maice_types::channels::session_stream(session_id);
        let mut out = Vec::new();
        while let Some(d) = bus
            .claim(&channel, "test", "t", std::time::Duration::from_millis(50))
            .await
            .unwrap()
        {
            bus.ack(&channel, "test", d.id).await.unwrap();
            if let Ok(ev) = serde_json::from_value(d.payload) {
                out.push(ev);
            }
        }
        out
    }
}
