// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-request stream reassembly.
//!
//! Producers emit `streaming_chunk` events with strictly monotonic
//! indices, but the bus only guarantees per-channel order per producer;
//! the pipeline buffers out-of-order arrivals and releases contiguous
//! prefixes. Held chunks are flushed past a gap when the final chunk
//! arrives, when the gap outlives `chunk_gap_timeout`, or when the gap
//! grows wider than `max_gap` indices. Skipped indices are logged and
//! surfaced as a warning event plus a metric.
//!
//! Backpressure: a slow client costs intermediate chunks (bounded by
//! `max_buffer_bytes` and the outgoing channel), never control events.
//! A gone client triggers a cancellation broadcast so the producing
//! agent stops token emission promptly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use maice_bus::MessageBus;
use maice_config::PipelineConfig;
use maice_metrics::MetricsSidecar;
use maice_types::{channels, ResponseEvent, SessionId};

const CLAIM_WAIT: Duration = Duration::from_millis(200);
const GROUP: &str = "backend";

/// Why the pipeline stopped; the router uses this for cleanup decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// A terminal event (`complete` or `error`) was forwarded.
    Terminal,
    /// The client dropped its receiver; cancellation was broadcast.
    ClientGone,
}

pub struct StreamingPipeline {
    bus: Arc<dyn MessageBus>,
    metrics: Arc<MetricsSidecar>,
    cfg: PipelineConfig,
}

struct Reassembly {
    next_index: u64,
    pending: BTreeMap<u64, (String, bool)>,
    buffered_bytes: usize,
    /// When the current head-of-line gap was first observed.
    gap_since: Option<Instant>,
}

impl StreamingPipeline {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        metrics: Arc<MetricsSidecar>,
        cfg: PipelineConfig,
    ) -> Self {
        Self { bus, metrics, cfg }
    }

    /// Consume one request's worth of the session response stream,
    /// forwarding ordered events into `out` (client) and mirroring every
    /// forwarded event into `tap` (router).
    pub async fn run(
        &self,
        session_id: SessionId,
        out: mpsc::Sender<ResponseEvent>,
        tap: mpsc::UnboundedSender<ResponseEvent>,
    ) -> PipelineEnd {
        let channel = channels::session_stream(session_id);
        let consumer = format!("pipeline-{session_id}");
        let mut state = Reassembly {
            next_index: 0,
            pending: BTreeMap::new(),
            buffered_bytes: 0,
            gap_since: None,
        };

        loop {
            if out.is_closed() {
                return self.client_gone(session_id).await;
            }

            let wait = match state.gap_since {
                Some(t) => {
                    let gap_deadline = t + self.cfg.chunk_gap_timeout();
                    gap_deadline
                        .saturating_duration_since(Instant::now())
                        .min(CLAIM_WAIT)
                }
                None => CLAIM_WAIT,
            };

            match self.bus.claim(&channel, GROUP, &consumer, wait).await {
                Ok(Some(delivery)) => {
                    let event: Option<ResponseEvent> =
                        serde_json::from_value(delivery.payload.clone()).ok();
                    if let Err(e) = self.bus.ack(&channel, GROUP, delivery.id).await {
                        warn!(session_id, "pipeline ack failed: {e:#}");
                    }
                    let Some(event) = event else {
                        // Unknown variant: log and keep going; dropping it
                        // cannot violate chunk ordering.
                        warn!(session_id, id = delivery.id, "unknown response event skipped");
                        continue;
                    };
                    match self.handle_event(session_id, event, &mut state, &out, &tap).await {
                        Step::Continue => {}
                        Step::Stop(end) => return end,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id, "pipeline claim failed: {e:#}");
                    tokio::time::sleep(CLAIM_WAIT).await;
                }
            }

            // Gap handling: head-of-line chunk missing for too long, or
            // the buffered run has drifted too far ahead.
            if let Some(&head) = state.pending.keys().next() {
                debug_assert!(head > state.next_index);
                let now = Instant::now();
                let since = *state.gap_since.get_or_insert(now);
                let too_old = now.duration_since(since) >= self.cfg.chunk_gap_timeout();
                let too_wide = head >= state.next_index + self.cfg.max_gap;
                if too_old || too_wide {
                    if let Step::Stop(end) = self
                        .flush_past_gap(session_id, &mut state, &out, &tap)
                        .await
                    {
                        return end;
                    }
                }
            } else {
                state.gap_since = None;
            }
        }
    }

    async fn handle_event(
        &self,
        session_id: SessionId,
        event: ResponseEvent,
        state: &mut Reassembly,
        out: &mpsc::Sender<ResponseEvent>,
        tap: &mpsc::UnboundedSender<ResponseEvent>,
    ) -> Step {
        match event {
            ResponseEvent::StreamingChunk {
                chunk_index,
                content,
                is_final,
            } => {
                if chunk_index < state.next_index {
                    debug!(session_id, chunk_index, "duplicate chunk ignored");
                    return Step::Continue;
                }
                if !is_final
                    && state.buffered_bytes + content.len() > self.cfg.max_buffer_bytes
                {
                    self.metrics.inc("chunks_dropped_total", 1, &[]);
                    warn!(session_id, chunk_index, "buffer full, chunk dropped");
                    return Step::Continue;
                }
                state.buffered_bytes += content.len();
                state.pending.insert(chunk_index, (content, is_final));

                if let Step::Stop(end) =
                    self.release_contiguous(session_id, state, out, tap).await
                {
                    return Step::Stop(end);
                }
                // The final chunk flushes everything still held behind a
                // gap; nothing more is coming.
                if is_final && !state.pending.is_empty() {
                    while !state.pending.is_empty() {
                        if let Step::Stop(end) =
                            self.flush_past_gap(session_id, state, out, tap).await
                        {
                            return Step::Stop(end);
                        }
                    }
                }
                Step::Continue
            }
            other => {
                let terminal = other.is_terminal();
                if let Step::Stop(end) = self.forward(session_id, other, out, tap).await {
                    return Step::Stop(end);
                }
                if terminal {
                    Step::Stop(PipelineEnd::Terminal)
                } else {
                    Step::Continue
                }
            }
        }
    }

    /// Release the contiguous run starting at `next_index`.
    async fn release_contiguous(
        &self,
        session_id: SessionId,
        state: &mut Reassembly,
        out: &mpsc::Sender<ResponseEvent>,
        tap: &mpsc::UnboundedSender<ResponseEvent>,
    ) -> Step {
        while let Some((content, is_final)) = state.pending.remove(&state.next_index) {
            state.buffered_bytes = state.buffered_bytes.saturating_sub(content.len());
            let ev = ResponseEvent::StreamingChunk {
                chunk_index: state.next_index,
                content,
                is_final,
            };
            state.next_index += 1;
            if let Step::Stop(end) = self.forward(session_id, ev, out, tap).await {
                return Step::Stop(end);
            }
        }
        state.gap_since = if state.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Step::Continue
    }

    /// Skip the missing indices ahead of the oldest held chunk, then
    /// release the run that starts there.
    async fn flush_past_gap(
        &self,
        session_id: SessionId,
        state: &mut Reassembly,
        out: &mpsc::Sender<ResponseEvent>,
        tap: &mpsc::UnboundedSender<ResponseEvent>,
    ) -> Step {
        let Some(&head) = state.pending.keys().next() else {
            return Step::Continue;
        };
        let skipped = head - state.next_index;
        warn!(
            session_id,
            from = state.next_index,
            to = head,
            skipped,
            "chunk gap, flushing past it"
        );
        self.metrics.inc("chunk_gaps_total", skipped, &[]);
        let warning = ResponseEvent::SessionStatus {
            status: "chunk_gap".into(),
            detail: Some(format!(
                "missing chunk indices {}..{head}",
                state.next_index
            )),
        };
        if let Step::Stop(end) = self.forward(session_id, warning, out, tap).await {
            return Step::Stop(end);
        }
        state.next_index = head;
        self.release_contiguous(session_id, state, out, tap).await
    }

    /// Forward one event. Control events block until the client accepts
    /// them; chunks are droppable when the client lags.
    async fn forward(
        &self,
        session_id: SessionId,
        event: ResponseEvent,
        out: &mpsc::Sender<ResponseEvent>,
        tap: &mpsc::UnboundedSender<ResponseEvent>,
    ) -> Step {
        let _ = tap.send(event.clone());
        let droppable = matches!(&event, ResponseEvent::StreamingChunk { is_final, .. } if !is_final);
        if droppable {
            match out.try_send(event) {
                Ok(()) => Step::Continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.inc("chunks_dropped_total", 1, &[]);
                    warn!(session_id, "client lagging, chunk dropped");
                    Step::Continue
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Step::Stop(self.client_gone(session_id).await)
                }
            }
        } else {
            match out.send(event).await {
                Ok(()) => Step::Continue,
                Err(_) => Step::Stop(self.client_gone(session_id).await),
            }
        }
    }

    async fn client_gone(&self, session_id: SessionId) -> PipelineEnd {
        debug!(session_id, "client disconnected, broadcasting cancellation");
        self.metrics.inc("client_disconnects_total", 1, &[]);
        let _ = self
            .bus
            .broadcast(
                &channels::cancel_topic(session_id),
                serde_json::json!({ "reason": "client_disconnect" }),
            )
            .await;
        PipelineEnd::ClientGone
    }
}

enum Step {
    Continue,
    Stop(PipelineEnd),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
