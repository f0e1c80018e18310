// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use maice_llm::{GenerationRequest, TextGenerator};
use maice_runtime::{AgentBehavior, AgentContext, Outcome};
use maice_types::{AgentName, AgentRequest, MaiceError, MessageType, NewMessage, ResponseEvent};

use crate::{llm_error, prompts, render_transcript};

/// Free-talk mode: user message in, streamed reply out, `complete`.
/// No classification, no clarification, no observation.
pub struct FreeTalkerBehavior;

#[async_trait]
impl AgentBehavior for FreeTalkerBehavior {
    fn name(&self) -> AgentName {
        AgentName::FreeTalker
    }

    async fn handle(
        &self,
        req: AgentRequest,
        cx: Arc<AgentContext>,
        cancel: CancellationToken,
    ) -> Result<Outcome, MaiceError> {
        cx.metrics
            .append_log(req.session_id, "freepass", "free-talk reply", json!({}))
            .await
            .map_err(MaiceError::transient)?;

        let log = cx
            .store
            .list_messages(req.session_id)
            .await
            .map_err(MaiceError::transient)?;
        let prompt = prompts::free_talk(&render_transcript(&log));

        let mut stream = cx
            .llm
            .generate_stream(GenerationRequest::new(prompt), cancel.clone())
            .await
            .map_err(|e| llm_error(e, &cancel))?;

        let mut reply = String::new();
        let mut chunk_index: u64 = 0;
        let mut held: Option<String> = None;
        loop {
            let next = tokio::select! {
                n = stream.next() => n,
                _ = cancel.cancelled() => return Err(MaiceError::Cancelled),
            };
            match next {
                Some(Ok(token)) => {
                    if let Some(prev) = held.replace(token) {
                        cx.emit(
                            req.session_id,
                            &ResponseEvent::chunk(chunk_index, prev.clone(), false),
                        )
                        .await
                        .map_err(MaiceError::transient)?;
                        reply.push_str(&prev);
                        chunk_index += 1;
                    }
                }
                Some(Err(e)) => return Err(llm_error(e, &cancel)),
                None => break,
            }
        }
        if cancel.is_cancelled() {
            return Err(MaiceError::Cancelled);
        }

        let last = held.unwrap_or_default();
        cx.emit(
            req.session_id,
            &ResponseEvent::chunk(chunk_index, last.clone(), true),
        )
        .await
        .map_err(MaiceError::transient)?;
        reply.push_str(&last);

        cx.store
            .append(NewMessage::maice(
                req.session_id,
                reply,
                MessageType::MaiceAnswer,
            ))
            .await
            .map_err(MaiceError::transient)?;
        cx.metrics.inc("free_talk_replies_total", 1, &[]);

        Ok(Outcome::Produced(vec![ResponseEvent::Complete]))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context, drain_events};
    use maice_llm::ScriptedGenerator;
    use maice_types::RequestKind;

    #[tokio::test]
    async fn streams_reply_and_completes_without_answer_complete() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["hey", " there"]));
        let (cx, bus) = context(llm);
        let sid = cx
            .store
            .create("u1", Some("hi maice"))
            .await
            .unwrap()
            .session_id;

        let outcome = FreeTalkerBehavior
            .handle(
                AgentRequest::new(sid, "u1", "hi maice", RequestKind::Question),
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
        assert!(events.contains(&ResponseEvent::chunk(0, "hey", false)));
        assert!(events.contains(&ResponseEvent::chunk(1, " there", true)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ResponseEvent::AnswerComplete)));

        let log = cx.store.list_messages(sid).await.unwrap();
        assert!(log
            .iter()
            .any(|m| m.message_type == MessageType::MaiceAnswer && m.content == "hey there"));
    }
}
