// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire-level channel names. Every process derives names through these
//! helpers so the cluster-wide namespace stays consistent:
//!
//! ```text
//! maice:requests:<agent>                          per-agent request stream
//! maice:agent_to_backend_stream_session_<id>      per-session response stream
//! maice:logs:session_<id>                         durable processing log
//! maice:coord:<topic>                             lossy coordination topics
//! maice:metrics:<agent>:<kind>:<name>             flushed metric keys
//! maice:agent_status:<agent>                      heartbeat hash (TTL 60 s)
//! maice:lease:session_<id>                        per-session in-flight lease
//! maice:dlq:<channel>                             dead-letter channels
//! ```

use crate::{AgentName, RequestId, SessionId};

/// Per-agent durable request stream.
pub fn request_stream(agent: AgentName) -> String {
    format!("maice:requests:{agent}")
}

/// Per-session durable response stream (agent → backend).
pub fn session_stream(session_id: SessionId) -> String {
    format!("maice:agent_to_backend_stream_session_{session_id}")
}

/// Durable per-session processing log, backing the monitoring endpoint.
pub fn session_log(session_id: SessionId) -> String {
    format!("maice:logs:session_{session_id}")
}

/// Lossy coordination topic.
pub fn coord_topic(topic: &str) -> String {
    format!("maice:coord:{topic}")
}

/// Live (lossy) mirror of a session's processing log.
pub fn log_topic(session_id: SessionId) -> String {
    coord_topic(&format!("processing_log_{session_id}"))
}

/// Cancellation fan-out for one session's in-flight request.
pub fn cancel_topic(session_id: SessionId) -> String {
    coord_topic(&format!("cancel_session_{session_id}"))
}

/// Classifier verdict topic for one request.
pub fn verdict_topic(request_id: RequestId) -> String {
    coord_topic(&format!("verdict_{request_id}"))
}

/// Clarifier exhaustion/promotion topic for one request.
pub fn clarify_done_topic(request_id: RequestId) -> String {
    coord_topic(&format!("clarify_done_{request_id}"))
}

/// Flushed metric key: `maice:metrics:<agent>:<kind>:<name>{labels}`.
/// The label is a process name: one of the six agents, or `backend` for
/// the orchestrator/pipeline process.
pub fn metrics_key(agent: &str, kind: &str, name: &str) -> String {
    format!("maice:metrics:{agent}:{kind}:{name}")
}

pub fn metrics_prefix(agent: &str) -> String {
    format!("maice:metrics:{agent}:")
}

/// Heartbeat hash for an agent (TTL 60 s).
pub fn agent_status_key(agent: &str) -> String {
    format!("maice:agent_status:{agent}")
}

pub const AGENT_STATUS_PREFIX: &str = "maice:agent_status:";

/// Per-session in-flight lease key.
pub fn session_lease(session_id: SessionId) -> String {
    format!("maice:lease:session_{session_id}")
}

/// Dead-letter channel for a stream channel.
pub fn dead_letter(channel: &str) -> String {
    match channel.strip_prefix("maice:") {
        Some(rest) => format!("maice:dlq:{rest}"),
        None => format!("maice:dlq:{channel}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_stream_names_match_the_wire_contract() {
        assert_eq!(
            request_stream(AgentName::Classifier),
            "maice:requests:classifier"
        );
        assert_eq!(
            request_stream(AgentName::FreeTalker),
            "maice:requests:free_talker"
        );
    }

    #[test]
    fn session_stream_embeds_the_session_id() {
        assert_eq!(
            session_stream(42),
            "maice:agent_to_backend_stream_session_42"
        );
    }

    #[test]
    fn dead_letter_strips_the_namespace_once() {
        assert_eq!(
            dead_letter("maice:requests:answerer"),
            "maice:dlq:requests:answerer"
        );
        assert_eq!(dead_letter("other"), "maice:dlq:other");
    }

    #[test]
    fn metric_keys_follow_the_scheme() {
        assert_eq!(
            metrics_key(AgentName::Answerer.as_str(), "counter", "requests_total"),
            "maice:metrics:answerer:counter:requests_total"
        );
        assert_eq!(
            agent_status_key("backend"),
            "maice:agent_status:backend"
        );
    }
}
