// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maice_bus::{Delivery, MessageBus};
use maice_types::{channels, AgentName, ErrorCode, MaiceError, ResponseEvent};

use crate::{AgentBehavior, AgentContext, Outcome, RequestEnvelope};

/// Bounded wait per claim; keeps the loop responsive to shutdown.
const CLAIM_WAIT: Duration = Duration::from_millis(500);

/// Consecutive behavior panics on one consumer before the cool-down.
const PANIC_COOLDOWN_THRESHOLD: u32 = 3;

/// One agent worker process: joins the consumer group named after the
/// agent on its request stream and drives claimed requests through the
/// behavior.
pub struct AgentWorker {
    agent: AgentName,
    behavior: Arc<dyn AgentBehavior>,
    cx: Arc<AgentContext>,
}

impl AgentWorker {
    pub fn new(behavior: Arc<dyn AgentBehavior>, cx: Arc<AgentContext>) -> Self {
        Self {
            agent: behavior.name(),
            behavior,
            cx,
        }
    }

    /// Serve until `shutdown` fires: stop claiming, drain in-flight work
    /// up to the drain timeout, flush metrics, exit.
    pub async fn run(self, shutdown: CancellationToken) {
        let channel = channels::request_stream(self.agent);
        let group = self.agent.as_str().to_string();
        let consumer = format!("{}-worker", self.agent);

        let metrics_task = self.cx.metrics.spawn(shutdown.child_token());
        let mut consecutive_panics: u32 = 0;
        let mut retries: JoinSet<()> = JoinSet::new();

        info!(agent = %self.agent, channel, "agent worker started");
        loop {
            // Reap finished retry republishers.
            while retries.try_join_next().is_some() {}

            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                c = self.cx.bus.claim(&channel, &group, &consumer, CLAIM_WAIT) => c,
            };
            let delivery = match claimed {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!(agent = %self.agent, "claim failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let envelope: RequestEnvelope = match serde_json::from_value(delivery.payload.clone())
            {
                Ok(env) => env,
                Err(e) => {
                    warn!(agent = %self.agent, id = delivery.id, "malformed envelope: {e}");
                    if let Err(e) = self
                        .cx
                        .bus
                        .dead_letter(&channel, &group, delivery.id, &format!("malformed envelope: {e}"))
                        .await
                    {
                        warn!("dead-letter failed: {e:#}");
                    }
                    continue;
                }
            };

            self.dispatch(
                &channel,
                &group,
                delivery,
                envelope,
                &shutdown,
                &mut consecutive_panics,
                &mut retries,
            )
            .await;

            if consecutive_panics >= PANIC_COOLDOWN_THRESHOLD {
                let cooldown = self.cx.config.runtime.panic_cooldown();
                error!(agent = %self.agent, "behavior panicked {consecutive_panics} times in a row, cooling down for {cooldown:?}");
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = shutdown.cancelled() => break,
                }
                consecutive_panics = 0;
            }
        }

        // Let scheduled retry republishes land, bounded by the drain grace.
        let drain = self.cx.config.runtime.drain_timeout();
        let _ = tokio::time::timeout(drain, async {
            while retries.join_next().await.is_some() {}
        })
        .await;
        retries.abort_all();
        let _ = metrics_task.await;
        info!(agent = %self.agent, "agent worker stopped");
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        channel: &str,
        group: &str,
        delivery: Delivery,
        envelope: RequestEnvelope,
        shutdown: &CancellationToken,
        consecutive_panics: &mut u32,
        retries: &mut JoinSet<()>,
    ) {
        let req = envelope.request.clone();
        let session_id = req.session_id;
        let request_timeout = self.cx.config.orchestrator.request_timeout();

        // Deadline gate: expired requests are answered with a timeout
        // error, never dispatched.
        if req.is_expired(request_timeout) {
            self.emit_error(session_id, ErrorCode::Timeout, "request deadline expired")
                .await;
            self.ack(channel, group, delivery.id).await;
            self.cx.metrics.record_outcome(false, 0);
            return;
        }

        // Request-scoped cancellation: fires on client disconnect, dies
        // with the dispatch.
        let dispatch_guard = CancellationToken::new();
        let cancel = self.cx.cancellation(session_id, &dispatch_guard);

        let started = std::time::Instant::now();
        let behavior = Arc::clone(&self.behavior);
        let cx = Arc::clone(&self.cx);
        let task_req = req.clone();
        let task_cancel = cancel.clone();
        let mut handle =
            tokio::spawn(async move { behavior.handle(task_req, cx, task_cancel).await });

        // Normally the behavior finishes on its own; on shutdown it gets
        // the drain grace and is then aborted.
        let drain = self.cx.config.runtime.drain_timeout();
        let joined = tokio::select! {
            r = &mut handle => Some(r),
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(drain).await;
            } => None,
        };
        dispatch_guard.cancel();
        let latency_ms = started.elapsed().as_millis() as u64;

        match joined {
            None => {
                handle.abort();
                warn!(agent = %self.agent, %session_id, "dispatch aborted by shutdown drain");
                let _ = self.cx.bus.nack(channel, group, delivery.id).await;
            }
            Some(Ok(Ok(outcome))) => {
                *consecutive_panics = 0;
                if let Outcome::Produced(events) = outcome {
                    for ev in &events {
                        if let Err(e) = self.cx.emit(session_id, ev).await {
                            warn!(agent = %self.agent, "emit failed: {e:#}");
                        }
                    }
                }
                self.ack(channel, group, delivery.id).await;
                self.cx.metrics.record_outcome(true, latency_ms);
                self.cx
                    .metrics
                    .observe("request_latency_ms", latency_ms, &[]);
                self.cx.metrics.inc("requests_total", 1, &[("result", "ok")]);
                debug!(agent = %self.agent, %session_id, latency_ms, "request handled");
            }
            Some(Ok(Err(err))) => {
                *consecutive_panics = 0;
                self.handle_failure(channel, group, delivery.id, envelope, err, latency_ms, retries)
                    .await;
            }
            Some(Err(join_err)) if join_err.is_panic() => {
                *consecutive_panics += 1;
                error!(agent = %self.agent, %session_id, "behavior panicked (consecutive: {consecutive_panics})");
                self.cx.metrics.inc("behavior_panics_total", 1, &[]);
                // Nack once; redelivery will retry the message.
                let _ = self.cx.bus.nack(channel, group, delivery.id).await;
            }
            Some(Err(_)) => {
                // Task aborted for a reason other than panic.
                let _ = self.cx.bus.nack(channel, group, delivery.id).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        channel: &str,
        group: &str,
        delivery_id: u64,
        envelope: RequestEnvelope,
        err: MaiceError,
        latency_ms: u64,
        retries: &mut JoinSet<()>,
    ) {
        let session_id = envelope.request.session_id;
        let max_attempts = self.cx.config.runtime.max_attempts;

        match &err {
            MaiceError::Cancelled => {
                // Client went away; abort silently, no error surfaced.
                self.ack(channel, group, delivery_id).await;
                self.cx.metrics.inc("requests_cancelled_total", 1, &[]);
                debug!(agent = %self.agent, %session_id, "request cancelled");
            }
            MaiceError::Transient(_) if envelope.attempt + 1 < max_attempts => {
                let delay = backoff_delay(envelope.attempt);
                warn!(agent = %self.agent, %session_id, attempt = envelope.attempt,
                      "transient failure, retrying in {delay:?}: {err}");
                self.cx.metrics.inc("requests_retried_total", 1, &[]);
                let _ = self
                    .cx
                    .metrics
                    .append_log(
                        session_id,
                        self.agent.as_str(),
                        "transient failure, scheduling retry",
                        serde_json::json!({ "attempt": envelope.attempt, "error": err.to_string() }),
                    )
                    .await;

                let bus = Arc::clone(&self.cx.bus);
                let retry_channel = channel.to_string();
                let next = envelope.next_attempt();
                retries.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) =
                        maice_bus::publish_json(bus.as_ref(), &retry_channel, &next).await
                    {
                        warn!("retry republish failed: {e:#}");
                    }
                });
                self.ack(channel, group, delivery_id).await;
            }
            _ => {
                // Permanent, or transient with the retry budget exhausted.
                let code = err.code();
                self.emit_error(session_id, code, &err.to_string()).await;
                if matches!(err, MaiceError::Permanent(_) | MaiceError::Transient(_)) {
                    let _ = self
                        .cx
                        .bus
                        .dead_letter(channel, group, delivery_id, &err.to_string())
                        .await;
                } else {
                    self.ack(channel, group, delivery_id).await;
                }
                self.cx.metrics.record_outcome(false, latency_ms);
                self.cx
                    .metrics
                    .inc("requests_total", 1, &[("result", "error")]);
                warn!(agent = %self.agent, %session_id, "request failed: {err}");
            }
        }
    }

    /// Surface an error on the response stream, always followed by
    /// `complete`.
    async fn emit_error(&self, session_id: i64, code: ErrorCode, message: &str) {
        for ev in [
            ResponseEvent::error(code, message),
            ResponseEvent::Complete,
        ] {
            if let Err(e) = self.cx.emit(session_id, &ev).await {
                warn!(agent = %self.agent, "emit failed: {e:#}");
            }
        }
    }

    async fn ack(&self, channel: &str, group: &str, id: u64) {
        if let Err(e) = self.cx.bus.ack(channel, group, id).await {
            warn!(agent = %self.agent, id, "ack failed: {e:#}");
        }
    }
}

/// Exponential backoff (1 s, 4 s, 16 s) with ±25% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 4u64.saturating_pow(attempt); // 1, 4, 16, ...
    let jitter = {
        use rand::Rng;
        rand::thread_rng().gen_range(0.75..=1.25)
    };
    Duration::from_secs_f64(base as f64 * jitter)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
