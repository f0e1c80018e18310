// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use maice_llm::{GenerationRequest, TextGenerator};
use maice_runtime::{AgentBehavior, AgentContext, Outcome};
use maice_types::{AgentName, AgentRequest, MaiceError, MessageType, NewMessage, ResponseEvent};

use crate::{llm_error, prompts, render_transcript};

/// Post-hoc session summarizer. Runs off the critical path after the
/// answer completed; its only stream output is `summary_complete`.
pub struct ObserverBehavior;

#[async_trait]
impl AgentBehavior for ObserverBehavior {
    fn name(&self) -> AgentName {
        AgentName::Observer
    }

    async fn handle(
        &self,
        req: AgentRequest,
        cx: Arc<AgentContext>,
        cancel: CancellationToken,
    ) -> Result<Outcome, MaiceError> {
        let log = cx
            .store
            .list_messages(req.session_id)
            .await
            .map_err(MaiceError::transient)?;
        if log.is_empty() {
            return Ok(Outcome::Done);
        }

        let summary = cx
            .llm
            .generate_text(
                GenerationRequest::new(prompts::summary(&render_transcript(&log))),
                cancel.clone(),
            )
            .await
            .map_err(|e| llm_error(e, &cancel))?;
        if cancel.is_cancelled() {
            return Err(MaiceError::Cancelled);
        }

        cx.store
            .append(NewMessage::maice(
                req.session_id,
                summary,
                MessageType::MaiceSummary,
            ))
            .await
            .map_err(MaiceError::transient)?;
        cx.metrics
            .append_log(
                req.session_id,
                "observing",
                "session summary persisted",
                json!({}),
            )
            .await
            .map_err(MaiceError::transient)?;
        cx.metrics.inc("summaries_total", 1, &[]);
        debug!(session_id = req.session_id, "summary persisted");

        Ok(Outcome::Produced(vec![ResponseEvent::SummaryComplete]))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::context;
    use maice_llm::ScriptedGenerator;
    use maice_types::RequestKind;

    #[tokio::test]
    async fn persists_summary_and_reports_completion() {
        let llm = Arc::new(ScriptedGenerator::always(vec![
            "Student asked about derivatives; full answer given.",
        ]));
        let (cx, _bus) = context(llm);
        let sid = cx
            .store
            .create("u1", Some("Define a derivative"))
            .await
            .unwrap()
            .session_id;
        cx.store
            .append(NewMessage::maice(sid, "the answer", MessageType::MaiceAnswer))
            .await
            .unwrap();

        let outcome = ObserverBehavior
            .handle(
                AgentRequest::new(sid, "u1", "", RequestKind::Question),
                cx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            Outcome::Produced(tail) => {
                assert_eq!(tail, vec![ResponseEvent::SummaryComplete])
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let log = cx.store.list_messages(sid).await.unwrap();
        assert!(log
            .iter()
            .any(|m| m.message_type == MessageType::MaiceSummary));
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_the_summary() {
        let llm = Arc::new(ScriptedGenerator::new(vec![
            vec!["same summary".into()],
            vec!["same summary".into()],
        ]));
        let (cx, _bus) = context(llm);
        let sid = cx.store.create("u1", Some("q")).await.unwrap().session_id;

        for _ in 0..2 {
            ObserverBehavior
                .handle(
                    AgentRequest::new(sid, "u1", "", RequestKind::Question),
                    cx.clone(),
                    CancellationToken::new(),
                )
                .await
                .unwrap();
        }

        let log = cx.store.list_messages(sid).await.unwrap();
        assert_eq!(
            log.iter()
                .filter(|m| m.message_type == MessageType::MaiceSummary)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn empty_session_is_a_no_op() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["unused"]));
        let (cx, _bus) = context(llm);
        let sid = cx.store.create("u1", None).await.unwrap().session_id;

        let outcome = ObserverBehavior
            .handle(
                AgentRequest::new(sid, "u1", "", RequestKind::Question),
                cx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Done));
    }
}
