// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use maice_llm::{GenerationRequest, TextGenerator};
use maice_runtime::{AgentBehavior, AgentContext, Outcome};
use maice_types::{
    channels, AgentName, AgentRequest, KnowledgeCode, MaiceError, Verdict, VerdictDecision,
};

use crate::{llm_error, parse, prompts};

/// Intake classifier: a short, non-streamed verdict broadcast to the
/// orchestrator. When the model reply is unusable the verdict degrades
/// to `answerable` rather than stalling the session; the orchestrator's
/// timeout fallback covers the case where we never got this far.
pub struct ClassifierBehavior;

#[async_trait]
impl AgentBehavior for ClassifierBehavior {
    fn name(&self) -> AgentName {
        AgentName::Classifier
    }

    async fn handle(
        &self,
        req: AgentRequest,
        cx: Arc<AgentContext>,
        cancel: CancellationToken,
    ) -> Result<Outcome, MaiceError> {
        cx.metrics
            .append_log(
                req.session_id,
                "classifying",
                "classifying question",
                json!({ "request_id": req.request_id }),
            )
            .await
            .map_err(MaiceError::transient)?;

        let text = cx
            .llm
            .generate_text(
                GenerationRequest::new(prompts::classifier(&req.text)),
                cancel.clone(),
            )
            .await
            .map_err(|e| llm_error(e, &cancel))?;
        if cancel.is_cancelled() {
            return Err(MaiceError::Cancelled);
        }

        let verdict = parse_verdict(&req, &text);
        debug!(session_id = req.session_id, ?verdict.decision, "classifier verdict");
        cx.metrics.inc(
            "verdicts_total",
            1,
            &[(
                "decision",
                match verdict.decision {
                    VerdictDecision::Answerable => "answerable",
                    VerdictDecision::NeedsClarify => "needs_clarify",
                },
            )],
        );

        maice_bus::broadcast_json(
            cx.bus.as_ref(),
            &channels::verdict_topic(req.request_id),
            &verdict,
        )
        .await
        .map_err(MaiceError::transient)?;
        Ok(Outcome::Done)
    }
}

fn parse_verdict(req: &AgentRequest, text: &str) -> Verdict {
    let parsed = parse::extract_json(text);
    let Some(v) = parsed else {
        warn!(session_id = req.session_id, "unparseable classifier reply, defaulting to answerable");
        return fallback(req);
    };
    let knowledge_code = match v["knowledge_code"].as_str() {
        Some("K1") => KnowledgeCode::K1,
        Some("K2") => KnowledgeCode::K2,
        Some("K3") => KnowledgeCode::K3,
        Some("K4") => KnowledgeCode::K4,
        _ => KnowledgeCode::K1,
    };
    let decision = match v["decision"].as_str() {
        Some("needs_clarify") => VerdictDecision::NeedsClarify,
        _ => VerdictDecision::Answerable,
    };
    Verdict {
        request_id: req.request_id,
        knowledge_code,
        decision,
        math_relatedness: v["math_relatedness"].as_f64().unwrap_or(1.0) as f32,
    }
}

fn fallback(req: &AgentRequest) -> Verdict {
    Verdict {
        request_id: req.request_id,
        knowledge_code: KnowledgeCode::K1,
        decision: VerdictDecision::Answerable,
        math_relatedness: 1.0,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::context;
    use maice_bus::MessageBus;
    use maice_llm::ScriptedGenerator;
    use maice_types::RequestKind;

    #[tokio::test]
    async fn verdict_is_broadcast_on_the_request_topic() {
        let llm = Arc::new(ScriptedGenerator::always(vec![
            r#"{"knowledge_code": "K4", "decision": "needs_clarify", "math_relatedness": 0.8}"#,
        ]));
        let (cx, bus) = context(llm);
        let req = AgentRequest::new(1, "u", "help", RequestKind::Question);
        let mut rx = bus.subscribe_topic(&channels::verdict_topic(req.request_id));

        let outcome = ClassifierBehavior
            .handle(req.clone(), cx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Done));

        let verdict: Verdict = serde_json::from_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(verdict.request_id, req.request_id);
        assert_eq!(verdict.decision, VerdictDecision::NeedsClarify);
        assert_eq!(verdict.knowledge_code, KnowledgeCode::K4);
    }

    #[tokio::test]
    async fn unparseable_reply_degrades_to_answerable() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["I think it's about math?"]));
        let (cx, bus) = context(llm);
        let req = AgentRequest::new(2, "u", "question", RequestKind::Question);
        let mut rx = bus.subscribe_topic(&channels::verdict_topic(req.request_id));

        ClassifierBehavior
            .handle(req, cx, CancellationToken::new())
            .await
            .unwrap();

        let verdict: Verdict = serde_json::from_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(verdict.decision, VerdictDecision::Answerable);
    }

    #[tokio::test]
    async fn partial_verdict_fills_defaults() {
        let llm = Arc::new(ScriptedGenerator::always(vec![
            r#"{"decision": "answerable"}"#,
        ]));
        let (cx, bus) = context(llm);
        let req = AgentRequest::new(3, "u", "2+2?", RequestKind::Question);
        let mut rx = bus.subscribe_topic(&channels::verdict_topic(req.request_id));

        ClassifierBehavior
            .handle(req, cx, CancellationToken::new())
            .await
            .unwrap();

        let verdict: Verdict = serde_json::from_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(verdict.knowledge_code, KnowledgeCode::K1);
        assert_eq!(verdict.math_relatedness, 1.0);
    }
}
