// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use maice_llm::{GenerationRequest, TextGenerator};
use maice_runtime::{AgentBehavior, AgentContext, Outcome};
use maice_types::{
    AgentName, AgentRequest, MaiceError, MessageType, NewMessage, RequestKind, ResponseEvent,
};

use crate::{llm_error, prompts, render_transcript};

/// Streams the final answer as ordered chunks.
///
/// `chunk_index` starts at 0 and is strictly monotonic; the single
/// `is_final = true` chunk is the last content-bearing event, followed
/// by `answer_complete` and `complete`. The concatenation of all chunk
/// contents reproduces the persisted answer exactly. Nothing is
/// persisted unless the final chunk went out.
pub struct AnswererBehavior;

#[async_trait]
impl AgentBehavior for AnswererBehavior {
    fn name(&self) -> AgentName {
        AgentName::Answerer
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
                "answering",
                "generating answer",
                json!({ "kind": req.kind }),
            )
            .await
            .map_err(MaiceError::transient)?;

        let prompt = match req.kind {
            RequestKind::ImageToLatex => {
                let image = req.image_ref.as_deref().ok_or_else(|| {
                    MaiceError::Validation("image_to_latex request without image".into())
                })?;
                prompts::image_to_latex(image)
            }
            _ => {
                let log = cx
                    .store
                    .list_messages(req.session_id)
                    .await
                    .map_err(MaiceError::transient)?;
                prompts::answer(&render_transcript(&log))
            }
        };

        let answer = if cx.config.pipeline.force_non_streaming
            || req.kind == RequestKind::ImageToLatex
        {
            self.answer_single_chunk(&req, &cx, &cancel, prompt).await?
        } else {
            self.answer_streamed(&req, &cx, &cancel, prompt).await?
        };

        // The final chunk went out; the assistant message may now be
        // persisted (idempotent on the exact tuple).
        cx.store
            .append(NewMessage::maice(
                req.session_id,
                answer,
                MessageType::MaiceAnswer,
            ))
            .await
            .map_err(MaiceError::transient)?;
        cx.metrics.inc("answers_total", 1, &[]);
        debug!(session_id = req.session_id, "answer complete");

        Ok(Outcome::Produced(vec![
            ResponseEvent::AnswerComplete,
            ResponseEvent::Complete,
        ]))
    }
}

impl AnswererBehavior {
    /// `force_non_streaming` (and image conversion): collect the whole
    /// completion, emit one chunk with `is_final = true`.
    async fn answer_single_chunk(
        &self,
        req: &AgentRequest,
        cx: &Arc<AgentContext>,
        cancel: &CancellationToken,
        prompt: String,
    ) -> Result<String, MaiceError> {
        let answer = cx
            .llm
            .generate_text(GenerationRequest::new(prompt), cancel.clone())
            .await
            .map_err(|e| llm_error(e, cancel))?;
        if cancel.is_cancelled() {
            return Err(MaiceError::Cancelled);
        }
        self.check_deadline(req, cx)?;
        cx.emit(req.session_id, &ResponseEvent::chunk(0, answer.clone(), true))
            .await
            .map_err(MaiceError::transient)?;
        Ok(answer)
    }

    /// Streamed path with one token of lookahead, so the last chunk can
    /// carry `is_final = true` without a trailing empty marker.
    async fn answer_streamed(
        &self,
        req: &AgentRequest,
        cx: &Arc<AgentContext>,
        cancel: &CancellationToken,
        prompt: String,
    ) -> Result<String, MaiceError> {
        let mut stream = cx
            .llm
            .generate_stream(GenerationRequest::new(prompt), cancel.clone())
            .await
            .map_err(|e| llm_error(e, cancel))?;

        let mut answer = String::new();
        let mut chunk_index: u64 = 0;
        let mut held: Option<String> = None;

        loop {
            let next = tokio::select! {
                n = stream.next() => n,
                _ = cancel.cancelled() => return Err(MaiceError::Cancelled),
            };
            self.check_deadline(req, cx)?;
            match next {
                Some(Ok(token)) => {
                    if let Some(prev) = held.replace(token) {
                        cx.emit(
                            req.session_id,
                            &ResponseEvent::chunk(chunk_index, prev.clone(), false),
                        )
                        .await
                        .map_err(MaiceError::transient)?;
                        answer.push_str(&prev);
                        chunk_index += 1;
                    }
                }
                Some(Err(e)) => return Err(llm_error(e, cancel)),
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
        answer.push_str(&last);
        Ok(answer)
    }

    fn check_deadline(&self, req: &AgentRequest, cx: &Arc<AgentContext>) -> Result<(), MaiceError> {
        if req.is_expired(cx.config.orchestrator.request_timeout()) {
            return Err(MaiceError::Timeout("answer deadline expired".into()));
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context, drain_events};
    use maice_llm::ScriptedGenerator;
    use std::time::Duration;

    async fn seeded(cx: &Arc<AgentContext>) -> i64 {
        cx.store
            .create("u1", Some("Define a derivative"))
            .await
            .unwrap()
            .session_id
    }

    #[tokio::test]
    async fn streams_ordered_chunks_with_single_final() {
        let llm = Arc::new(ScriptedGenerator::always(vec![
            "A derivative",
            " is the limit",
            "...",
        ]));
        let (cx, bus) = context(llm);
        let sid = seeded(&cx).await;

        let outcome = AnswererBehavior
            .handle(
                AgentRequest::new(sid, "u1", "Define a derivative", RequestKind::Question),
                cx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = drain_events(&bus, sid).await;
        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::StreamingChunk {
                    chunk_index,
                    content,
                    is_final,
                } => Some((*chunk_index, content.clone(), *is_final)),
                _ => None,
            })
            .collect();

        assert_eq!(
            chunks,
            vec![
                (0, "A derivative".to_string(), false),
                (1, " is the limit".to_string(), false),
                (2, "...".to_string(), true),
            ]
        );
        match outcome {
            Outcome::Produced(tail) => assert_eq!(
                tail,
                vec![ResponseEvent::AnswerComplete, ResponseEvent::Complete]
            ),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concatenated_chunks_reproduce_the_persisted_answer() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["ab", "cd", "ef"]));
        let (cx, bus) = context(llm);
        let sid = seeded(&cx).await;

        AnswererBehavior
            .handle(
                AgentRequest::new(sid, "u1", "q", RequestKind::Question),
                cx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = drain_events(&bus, sid).await;
        let concatenated: String = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::StreamingChunk { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(concatenated, "abcdef");

        let log = cx.store.list_messages(sid).await.unwrap();
        let persisted = log
            .iter()
            .find(|m| m.message_type == MessageType::MaiceAnswer)
            .unwrap();
        assert_eq!(persisted.content, "abcdef");
    }

    #[tokio::test]
    async fn force_non_streaming_emits_one_final_chunk() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["part1", "part2"]));
        let (base, bus) = context(llm);
        let mut config = (*base.config).clone();
        config.pipeline.force_non_streaming = true;
        let cx = Arc::new(maice_runtime::AgentContext {
            bus: base.bus.clone(),
            store: base.store.clone(),
            metrics: base.metrics.clone(),
            llm: base.llm.clone(),
            config: Arc::new(config),
        });
        let sid = seeded(&cx).await;

        AnswererBehavior
            .handle(
                AgentRequest::new(sid, "u1", "q", RequestKind::Question),
                cx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = drain_events(&bus, sid).await;
        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::StreamingChunk {
                    chunk_index,
                    content,
                    is_final,
                } => Some((*chunk_index, content.clone(), *is_final)),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![(0, "part1part2".to_string(), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_stream_persists_nothing() {
        let llm = Arc::new(
            ScriptedGenerator::always(vec!["a", "b", "c", "d", "e"])
                .with_delay(Duration::from_millis(100)),
        );
        let (cx, bus) = context(llm);
        let sid = seeded(&cx).await;
        let cancel = CancellationToken::new();

        let task = {
            let cx = cx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                AnswererBehavior
                    .handle(
                        AgentRequest::new(sid, "u1", "q", RequestKind::Question),
                        cx,
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(MaiceError::Cancelled)));

        // No chunk was final, so nothing was persisted.
        let log = cx.store.list_messages(sid).await.unwrap();
        assert!(!log
            .iter()
            .any(|m| m.message_type == MessageType::MaiceAnswer));

        // And no emitted chunk claims finality.
        let events = drain_events(&bus, sid).await;
        assert!(events.iter().all(|e| !matches!(
            e,
            ResponseEvent::StreamingChunk { is_final: true, .. }
        )));
    }

    #[tokio::test]
    async fn image_to_latex_is_single_chunk() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["\\frac{a}{b}"]));
        let (cx, bus) = context(llm);
        let sid = seeded(&cx).await;

        let mut req = AgentRequest::new(sid, "u1", "", RequestKind::ImageToLatex);
        req.image_ref = Some("upload-1.png".into());
        AnswererBehavior
            .handle(req, cx, CancellationToken::new())
            .await
            .unwrap();

        let events = drain_events(&bus, sid).await;
        assert!(events.contains(&ResponseEvent::chunk(0, "\\frac{a}{b}", true)));
    }

    #[tokio::test]
    async fn missing_image_ref_is_a_validation_error() {
        let llm = Arc::new(ScriptedGenerator::always(vec!["x"]));
        let (cx, _bus) = context(llm);
        let sid = seeded(&cx).await;

        let req = AgentRequest::new(sid, "u1", "", RequestKind::ImageToLatex);
        let err = AnswererBehavior
            .handle(req, cx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MaiceError::Validation(_)));
    }
}
