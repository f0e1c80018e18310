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
use maice_types::{
    channels, AgentName, AgentRequest, ClarifyProgress, MaiceError, MessageType, NewMessage,
    ResponseEvent, SessionMessage,
};

use crate::{llm_error, parse, prompts};

/// Most questions the clarifier will ever ask per request.
const MAX_QUESTIONS: usize = 3;

/// Interactive clarifier.
///
/// The planned question list is persisted as an `internal` log row on
/// first contact, and the number of `maice_clarification_question` rows
/// in the log is the asked-so-far counter, so the behavior itself holds
/// no state between turns. When the plan is exhausted the orchestrator
/// is signalled to promote the request to the answerer.
pub struct ClarifierBehavior;

#[async_trait]
impl AgentBehavior for ClarifierBehavior {
    fn name(&self) -> AgentName {
        AgentName::Clarifier
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
            .map_err(|e| MaiceError::transient(anyhow::Error::new(e)))?;

        let questions = match stored_plan(&log) {
            Some(q) => q,
            None => self.plan_questions(&req, &cx, &cancel, &log).await?,
        };
        let asked = log
            .iter()
            .filter(|m| m.message_type == MessageType::MaiceClarificationQuestion)
            .count();
        let total = questions.len();

        if asked >= total {
            // Every planned question has been asked and answered; hand the
            // request to the answerer.
            debug!(session_id = req.session_id, total, "clarification exhausted");
            maice_bus::broadcast_json(
                cx.bus.as_ref(),
                &channels::clarify_done_topic(req.request_id),
                &ClarifyProgress {
                    request_id: req.request_id,
                    asked: asked as u32,
                    total: total as u32,
                    exhausted: true,
                },
            )
            .await
            .map_err(MaiceError::transient)?;
            return Ok(Outcome::Done);
        }

        let question = &questions[asked];
        cx.emit(
            req.session_id,
            &ResponseEvent::ClarificationQuestion {
                index: asked as u32,
                total: total as u32,
                question: question.clone(),
            },
        )
        .await
        .map_err(MaiceError::transient)?;
        cx.store
            .append(NewMessage::maice(
                req.session_id,
                question.clone(),
                MessageType::MaiceClarificationQuestion,
            ))
            .await
            .map_err(|e| MaiceError::transient(anyhow::Error::new(e)))?;
        cx.metrics
            .append_log(
                req.session_id,
                "clarifying",
                "asked clarification question",
                json!({ "index": asked, "total": total }),
            )
            .await
            .map_err(MaiceError::transient)?;
        cx.metrics.inc("questions_asked_total", 1, &[]);

        maice_bus::broadcast_json(
            cx.bus.as_ref(),
            &channels::clarify_done_topic(req.request_id),
            &ClarifyProgress {
                request_id: req.request_id,
                asked: asked as u32 + 1,
                total: total as u32,
                exhausted: false,
            },
        )
        .await
        .map_err(MaiceError::transient)?;

        // Each question ends its own response stream; the answer re-enters
        // through the orchestrator.
        Ok(Outcome::Produced(vec![ResponseEvent::Complete]))
    }
}

impl ClarifierBehavior {
    /// First contact: plan the question list and persist it as an
    /// internal row (idempotent on replay).
    async fn plan_questions(
        &self,
        req: &AgentRequest,
        cx: &Arc<AgentContext>,
        cancel: &CancellationToken,
        log: &[SessionMessage],
    ) -> Result<Vec<String>, MaiceError> {
        let question = log
            .iter()
            .find(|m| m.message_type == MessageType::UserQuestion)
            .map(|m| m.content.as_str())
            .unwrap_or(&req.text);

        let reply = cx
            .llm
            .generate_text(
                GenerationRequest::new(prompts::clarify_plan(question, MAX_QUESTIONS)),
                cancel.clone(),
            )
            .await
            .map_err(|e| llm_error(e, cancel))?;

        let mut questions = parse::extract_string_list(&reply);
        questions.truncate(MAX_QUESTIONS);
        if questions.is_empty() {
            // Nothing to ask; the exhausted path promotes immediately.
            return Ok(questions);
        }

        cx.store
            .append(NewMessage::maice(
                req.session_id,
                json!({ "clarify_plan": questions }).to_string(),
                MessageType::Internal,
            ))
            .await
            .map_err(|e| MaiceError::transient(anyhow::Error::new(e)))?;
        Ok(questions)
    }
}

fn stored_plan(log: &[SessionMessage]) -> Option<Vec<String>> {
    log.iter()
        .rev()
        .filter(|m| m.message_type == MessageType::Internal)
        .find_map(|m| {
            let v: serde_json::Value = serde_json::from_str(&m.content).ok()?;
            let items = v.get("clarify_plan")?.as_array()?;
            Some(
                items
                    .iter()
                    .filter_map(|q| q.as_str().map(str::to_string))
                    .collect(),
            )
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context, drain_events};
    use maice_bus::MessageBus;
    use maice_llm::ScriptedGenerator;
    use maice_types::RequestKind;

    async fn seeded_session(cx: &Arc<AgentContext>, question: &str) -> i64 {
        let s = cx.store.create("u1", Some(question)).await.unwrap();
        s.session_id
    }

    fn request(session_id: i64, text: &str, kind: RequestKind) -> AgentRequest {
        AgentRequest::new(session_id, "u1", text, kind)
    }

    #[tokio::test]
    async fn first_turn_plans_and_asks_question_zero() {
        let llm = Arc::new(ScriptedGenerator::always(vec![
            r#"["What topic?", "What level?"]"#,
        ]));
        let (cx, bus) = context(llm);
        let sid = seeded_session(&cx, "help").await;

        let outcome = ClarifierBehavior
            .handle(
                request(sid, "help", RequestKind::Question),
                cx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            Outcome::Produced(tail) => assert_eq!(tail, vec![ResponseEvent::Complete]),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let events = drain_events(&bus, sid).await;
        assert!(events.contains(&ResponseEvent::ClarificationQuestion {
            index: 0,
            total: 2,
            question: "What topic?".into(),
        }));

        // Plan persisted, question persisted.
        let log = cx.store.list_messages(sid).await.unwrap();
        assert!(log
            .iter()
            .any(|m| m.message_type == MessageType::Internal));
        assert_eq!(
            log.iter()
                .filter(|m| m.message_type == MessageType::MaiceClarificationQuestion)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn second_turn_asks_question_one_without_replanning() {
        let llm = Arc::new(ScriptedGenerator::new(vec![vec![
            r#"["What topic?", "What level?"]"#.into(),
        ]]));
        let (cx, bus) = context(llm);
        let sid = seeded_session(&cx, "help").await;
        let cancel = CancellationToken::new();

        ClarifierBehavior
            .handle(request(sid, "help", RequestKind::Question), cx.clone(), cancel.clone())
            .await
            .unwrap();
        drain_events(&bus, sid).await;

        // User answers question 0.
        cx.store
            .append(NewMessage::user(
                sid,
                "integrals",
                MessageType::UserClarificationAnswer,
            ))
            .await
            .unwrap();

        // The scripted generator has no second script; a replan would
        // surface as the fallback marker instead of the planned question.
        ClarifierBehavior
            .handle(
                request(sid, "integrals", RequestKind::ClarificationResponse),
                cx.clone(),
                cancel,
            )
            .await
            .unwrap();

        let events = drain_events(&bus, sid).await;
        assert!(events.contains(&ResponseEvent::ClarificationQuestion {
            index: 1,
            total: 2,
            question: "What level?".into(),
        }));
    }

    #[tokio::test]
    async fn exhausted_plan_signals_promotion() {
        let llm = Arc::new(ScriptedGenerator::always(vec![r#"["Only question?"]"#]));
        let (cx, bus) = context(llm);
        let sid = seeded_session(&cx, "help").await;
        let cancel = CancellationToken::new();

        let req = request(sid, "help", RequestKind::Question);
        ClarifierBehavior
            .handle(req, cx.clone(), cancel.clone())
            .await
            .unwrap();
        drain_events(&bus, sid).await;

        cx.store
            .append(NewMessage::user(sid, "answer", MessageType::UserClarificationAnswer))
            .await
            .unwrap();

        let follow_up = request(sid, "answer", RequestKind::ClarificationResponse);
        let mut done_rx = bus.subscribe_topic(&channels::clarify_done_topic(follow_up.request_id));
        let outcome = ClarifierBehavior
            .handle(follow_up, cx, cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Done));

        let progress: ClarifyProgress =
            serde_json::from_value(done_rx.recv().await.unwrap()).unwrap();
        assert!(progress.exhausted);
        assert_eq!(progress.total, 1);
    }
}
