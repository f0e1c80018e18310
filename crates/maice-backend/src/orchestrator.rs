// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Admission and routing between the HTTP ingress and the bus.
//!
//! One request per session at a time, enforced by a bus lease with the
//! request-timeout TTL. Routing is centralized: the classifier and
//! clarifier report over coordination topics, and the orchestrator
//! publishes each next hop itself. A per-request watchdog force-releases
//! stuck requests.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use maice_bus::MessageBus;
use maice_config::{Config, OrchestratorMode};
use maice_metrics::MetricsSidecar;
use maice_store::SessionStore;
use maice_runtime::RequestEnvelope;
use maice_types::{
    channels, AgentName, AgentRequest, ClarifyProgress, ErrorCode, MessageType, NewMessage,
    RequestKind, ResponseEvent, SessionId, Stage, Verdict, VerdictDecision,
};

use crate::pipeline::StreamingPipeline;

/// Outgoing event-channel capacity per request. Chunks beyond a lagging
/// client's capacity are dropped by the pipeline.
const EVENT_CAPACITY: usize = 256;

pub struct SubmitOutcome {
    /// Absent only when validation failed before a session existed.
    pub session_id: Option<SessionId>,
    pub events: mpsc::Receiver<ResponseEvent>,
}

pub struct Orchestrator {
    bus: Arc<dyn MessageBus>,
    store: Arc<SessionStore>,
    metrics: Arc<MetricsSidecar>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<SessionStore>,
        metrics: Arc<MetricsSidecar>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        if config.orchestrator.mode == OrchestratorMode::Decentralized {
            warn!("decentralized orchestrator mode is not implemented; running centralized");
        }
        Arc::new(Self {
            bus,
            store,
            metrics,
            config,
        })
    }

    /// Admit one user input and return its response-event stream.
    ///
    /// Admission failures (validation, busy) are surfaced on the stream
    /// itself as an `error` event followed by `complete`; the call only
    /// errors on infrastructure failure.
    pub async fn submit(
        self: &Arc<Self>,
        user_id: &str,
        session_id: Option<SessionId>,
        text: &str,
        image: Option<String>,
        kind: RequestKind,
    ) -> anyhow::Result<SubmitOutcome> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        // ── Validation ────────────────────────────────────────────────────────
        if text.trim().is_empty() && image.is_none() {
            reject(&tx, ErrorCode::Validation, "empty message").await;
            return Ok(SubmitOutcome {
                session_id,
                events: rx,
            });
        }

        let user = self.store.ensure_user(user_id).await?;

        // ── Session resolution ────────────────────────────────────────────────
        let (session, created) = match session_id {
            Some(id) => match self.store.session(id).await {
                Ok(s) => (s, false),
                Err(maice_store::RepositoryError::SessionNotFound(_)) => {
                    reject(&tx, ErrorCode::Validation, &format!("unknown session {id}")).await;
                    return Ok(SubmitOutcome {
                        session_id: Some(id),
                        events: rx,
                    });
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let initial = match kind {
                    RequestKind::ImageToLatex => None,
                    _ => Some(text),
                };
                (self.store.create(user_id, initial).await?, true)
            }
        };
        let sid = session.session_id;

        let mut request = AgentRequest::new(sid, user_id, text, kind);
        request.image_ref = image;

        // ── Admission: one in-flight request per session ──────────────────────
        let lease_key = channels::session_lease(sid);
        let lease_owner = request.request_id.to_string();
        let admitted = self
            .bus
            .acquire_lease(
                &lease_key,
                &lease_owner,
                self.config.orchestrator.request_timeout(),
            )
            .await?;
        if !admitted {
            self.metrics.inc("busy_rejections_total", 1, &[]);
            debug!(session_id = sid, "rejected: request already in flight");
            reject(&tx, ErrorCode::Busy, "session already has a request in flight").await;
            return Ok(SubmitOutcome {
                session_id: Some(sid),
                events: rx,
            });
        }

        // ── Conversation log ──────────────────────────────────────────────────
        // A freshly created session already carries the question.
        if !created {
            let message_type = match kind {
                RequestKind::ClarificationResponse => MessageType::UserClarificationAnswer,
                _ => MessageType::UserQuestion,
            };
            if !text.trim().is_empty() {
                self.store
                    .append(NewMessage::user(sid, text, message_type))
                    .await?;
            }
        }

        let _ = tx.send(ResponseEvent::Connected).await;
        if created {
            let _ = tx.send(ResponseEvent::SessionCreated { session_id: sid }).await;
        }

        // Subscriptions must exist before the request is published, or a
        // fast agent's broadcast is lost.
        let verdict_rx = self.bus.subscribe_topic(&channels::verdict_topic(request.request_id));
        let clarify_rx = self
            .bus
            .subscribe_topic(&channels::clarify_done_topic(request.request_id));

        // ── Initial target ────────────────────────────────────────────────────
        let mut current_stage = session.current_stage;
        let target = if kind == RequestKind::ImageToLatex {
            AgentName::Answerer
        } else if user.free_talk {
            self.advance(sid, &mut current_stage, Stage::Freepass).await;
            AgentName::FreeTalker
        } else if current_stage == Stage::Clarifying {
            AgentName::Clarifier
        } else {
            AgentName::Classifier
        };

        // Processing markers are routing events: emitted once per hop by
        // the orchestrator, so behavior retries never duplicate them.
        if target == AgentName::Classifier {
            self.emit_processing(sid, "classifying").await;
        }
        self.publish_to(target, &request).await?;
        self.metrics
            .append_log(
                sid,
                "admission",
                "request admitted",
                json!({ "request_id": request.request_id, "target": target.as_str() }),
            )
            .await?;
        info!(session_id = sid, request_id = %request.request_id, target = %target, "request admitted");

        // ── Pipeline + router ─────────────────────────────────────────────────
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let pipeline = StreamingPipeline::new(
            self.bus.clone(),
            self.metrics.clone(),
            self.config.pipeline.clone(),
        );
        let out = tx.clone();
        tokio::spawn(async move {
            pipeline.run(sid, out, tap_tx).await;
        });

        let this = Arc::clone(self);
        tokio::spawn(this.route(
            request,
            current_stage,
            target,
            verdict_rx,
            clarify_rx,
            tap_rx,
            lease_owner,
        ));

        Ok(SubmitOutcome {
            session_id: Some(sid),
            events: rx,
        })
    }

    /// Drive one admitted request to its terminal event, then release
    /// the session lease. The watchdog bounds the whole affair.
    #[allow(clippy::too_many_arguments)]
    async fn route(
        self: Arc<Self>,
        request: AgentRequest,
        current_stage: Stage,
        target: AgentName,
        verdict_rx: broadcast::Receiver<serde_json::Value>,
        clarify_rx: broadcast::Receiver<serde_json::Value>,
        tap_rx: mpsc::UnboundedReceiver<ResponseEvent>,
        lease_owner: String,
    ) {
        let sid = request.session_id;
        let timeout = self.config.orchestrator.request_timeout();

        tokio::select! {
            _ = self.drive(&request, current_stage, target, verdict_rx, clarify_rx, tap_rx) => {}
            _ = tokio::time::sleep(timeout) => {
                warn!(session_id = sid, request_id = %request.request_id, "request watchdog fired");
                self.metrics.inc("request_timeouts_total", 1, &[]);
                let _ = self
                    .metrics
                    .append_log(sid, "watchdog", "request force-terminated", json!({}))
                    .await;
                self.emit_error_complete(sid, ErrorCode::Timeout, "request timed out").await;
            }
        }

        let _ = self
            .bus
            .release_lease(&channels::session_lease(sid), &lease_owner)
            .await;
        // Bound the session's retained response log now that nothing is
        // consuming it.
        let _ = self
            .bus
            .trim(&channels::session_stream(sid), self.config.bus.trim_max_entries)
            .await;
        debug!(session_id = sid, "lease released");
    }

    async fn drive(
        &self,
        request: &AgentRequest,
        mut current_stage: Stage,
        target: AgentName,
        verdict_rx: broadcast::Receiver<serde_json::Value>,
        clarify_rx: broadcast::Receiver<serde_json::Value>,
        mut tap_rx: mpsc::UnboundedReceiver<ResponseEvent>,
    ) {
        let sid = request.session_id;

        match target {
            AgentName::Classifier => {
                match self.await_verdict(verdict_rx, request).await {
                    Some(v) if v.decision == VerdictDecision::NeedsClarify => {
                        self.advance(sid, &mut current_stage, Stage::Clarifying).await;
                        if self.publish_to(AgentName::Clarifier, request).await.is_ok() {
                            self.await_clarifier(clarify_rx, request, &mut current_stage)
                                .await;
                        }
                    }
                    Some(_) => {
                        self.advance(sid, &mut current_stage, Stage::Answering).await;
                        self.emit_processing(sid, "answering").await;
                        let _ = self.publish_to(AgentName::Answerer, request).await;
                    }
                    None => {
                        // Classifier down or slow: default to the answerer.
                        warn!(session_id = sid, "no classifier verdict, degrading to answerer");
                        self.metrics.inc("classifier_timeouts_total", 1, &[]);
                        let _ = self
                            .metrics
                            .append_log(
                                sid,
                                "degraded",
                                "classifier verdict timeout, defaulting to answerer",
                                json!({}),
                            )
                            .await;
                        self.advance(sid, &mut current_stage, Stage::Answering).await;
                        self.emit_processing(sid, "answering").await;
                        let _ = self.publish_to(AgentName::Answerer, request).await;
                    }
                }
            }
            AgentName::Clarifier => {
                self.await_clarifier(clarify_rx, request, &mut current_stage)
                    .await;
            }
            _ => {}
        }

        // Watch the released event stream until the request terminates.
        let mut answered = false;
        while let Some(ev) = tap_rx.recv().await {
            match ev {
                ResponseEvent::AnswerComplete => answered = true,
                ResponseEvent::Complete => {
                    if answered && request.kind != RequestKind::ImageToLatex {
                        self.finish_answered(request, &mut current_stage).await;
                    }
                    break;
                }
                ResponseEvent::Error { .. } => break,
                _ => {}
            }
        }
    }

    /// Post-answer bookkeeping: advance the stage machine and fan out to
    /// the off-path agents, fire-and-forget.
    async fn finish_answered(&self, request: &AgentRequest, current_stage: &mut Stage) {
        let sid = request.session_id;
        self.advance(sid, current_stage, Stage::Observing).await;
        self.advance(sid, current_stage, Stage::Completed).await;

        for agent in [AgentName::Observer, AgentName::Curriculum] {
            let follow_up = AgentRequest::new(sid, request.user_id.clone(), "", RequestKind::Question);
            if let Err(e) = self.publish_to(agent, &follow_up).await {
                warn!(session_id = sid, %agent, "fan-out publish failed: {e:#}");
            }
        }
        debug!(session_id = sid, "post-answer fan-out dispatched");
    }

    /// Wait for this request's verdict, tolerating unrelated traffic on
    /// the topic.
    async fn await_verdict(
        &self,
        mut rx: broadcast::Receiver<serde_json::Value>,
        request: &AgentRequest,
    ) -> Option<Verdict> {
        let deadline = self.config.orchestrator.classifier_timeout();
        tokio::time::timeout(deadline, async {
            loop {
                match rx.recv().await {
                    Ok(v) => {
                        if let Ok(verdict) = serde_json::from_value::<Verdict>(v) {
                            if verdict.request_id == request.request_id {
                                return Some(verdict);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Wait for the clarifier's progress signal; promote or fail on
    /// timeout per configuration.
    async fn await_clarifier(
        &self,
        mut rx: broadcast::Receiver<serde_json::Value>,
        request: &AgentRequest,
        current_stage: &mut Stage,
    ) {
        let sid = request.session_id;
        let deadline = self.config.orchestrator.clarify_timeout();
        let progress = tokio::time::timeout(deadline, async {
            loop {
                match rx.recv().await {
                    Ok(v) => {
                        if let Ok(p) = serde_json::from_value::<ClarifyProgress>(v) {
                            if p.request_id == request.request_id {
                                return Some(p);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten();

        match progress {
            Some(p) if p.exhausted => {
                debug!(session_id = sid, "clarification exhausted, promoting to answerer");
                self.advance(sid, current_stage, Stage::Answering).await;
                self.emit_processing(sid, "answering").await;
                let _ = self.publish_to(AgentName::Answerer, request).await;
            }
            Some(_) => {
                // A question went out; this request's stream completes and
                // the answer re-enters through the ingress.
            }
            None => {
                if self.config.orchestrator.auto_promote_after_clarification {
                    warn!(session_id = sid, "clarifier timeout, auto-promoting to answerer");
                    self.metrics.inc("clarify_promotions_total", 1, &[]);
                    self.advance(sid, current_stage, Stage::Answering).await;
                    self.emit_processing(sid, "answering").await;
                    let _ = self.publish_to(AgentName::Answerer, request).await;
                } else {
                    warn!(session_id = sid, "clarifier timeout");
                    self.emit_error_complete(sid, ErrorCode::Timeout, "clarifier timed out")
                        .await;
                }
            }
        }
    }

    /// CAS the stage forward, tracking the observed value. A conflict is
    /// logged, not fatal: the lease guarantees no concurrent writer, so
    /// conflicts only arise from replays.
    async fn advance(&self, sid: SessionId, current: &mut Stage, to: Stage) {
        if *current == to {
            return;
        }
        match self.store.transition(sid, *current, to).await {
            Ok(()) => *current = to,
            Err(e) => warn!(session_id = sid, %to, "stage transition failed: {e}"),
        }
    }

    async fn publish_to(&self, agent: AgentName, request: &AgentRequest) -> anyhow::Result<()> {
        maice_bus::publish_json(
            self.bus.as_ref(),
            &channels::request_stream(agent),
            &RequestEnvelope::new(request.clone()),
        )
        .await?;
        Ok(())
    }

    async fn emit_processing(&self, sid: SessionId, phase: &str) {
        let ev = ResponseEvent::Processing {
            stage: phase.to_string(),
        };
        if let Err(e) =
            maice_bus::publish_json(self.bus.as_ref(), &channels::session_stream(sid), &ev).await
        {
            warn!(session_id = sid, "emit failed: {e:#}");
        }
    }

    /// Publish `error` + `complete` onto the session stream so the
    /// pipeline forwards them and terminates.
    async fn emit_error_complete(&self, sid: SessionId, code: ErrorCode, message: &str) {
        for ev in [ResponseEvent::error(code, message), ResponseEvent::Complete] {
            if let Err(e) =
                maice_bus::publish_json(self.bus.as_ref(), &channels::session_stream(sid), &ev)
                    .await
            {
                warn!(session_id = sid, "emit failed: {e:#}");
            }
        }
    }
}

/// Short-circuit a rejected request: the stream carries exactly
/// `error` then `complete`.
async fn reject(tx: &mpsc::Sender<ResponseEvent>, code: ErrorCode, message: &str) {
    let _ = tx.send(ResponseEvent::error(code, message)).await;
    let _ = tx.send(ResponseEvent::Complete).await;
}
