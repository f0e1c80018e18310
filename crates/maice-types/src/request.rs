// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::{RequestId, SessionId, UserId};

/// What kind of work a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Question,
    ClarificationResponse,
    ImageToLatex,
}

/// A unit of work flowing on the bus.
///
/// Created at ingress, claimed by exactly one worker of the target agent's
/// consumer group, and terminated by a `complete` or `error` event on the
/// session's response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub text: String,
    /// Opaque reference to an uploaded image (image-to-LaTeX requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub kind: RequestKind,
    pub enqueued_at: DateTime<Utc>,
}

impl AgentRequest {
    pub fn new(
        session_id: SessionId,
        user_id: impl Into<UserId>,
        text: impl Into<String>,
        kind: RequestKind,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4(),
            session_id,
            user_id: user_id.into(),
            text: text.into(),
            image_ref: None,
            kind,
            enqueued_at: Utc::now(),
        }
    }

    /// Absolute deadline: `enqueued_at + request_timeout`.
    pub fn deadline(&self, request_timeout: std::time::Duration) -> DateTime<Utc> {
        self.enqueued_at
            + ChronoDuration::from_std(request_timeout).unwrap_or_else(|_| ChronoDuration::zero())
    }

    /// Agents call this between suspension points; past the deadline they
    /// emit `error{code=timeout}` + `complete` and ack the original message.
    pub fn is_expired(&self, request_timeout: std::time::Duration) -> bool {
        Utc::now() >= self.deadline(request_timeout)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_request_is_not_expired() {
        let r = AgentRequest::new(1, "u1", "what is a limit?", RequestKind::Question);
        assert!(!r.is_expired(std::time::Duration::from_secs(120)));
    }

    #[test]
    fn request_with_elapsed_deadline_is_expired() {
        let mut r = AgentRequest::new(1, "u1", "q", RequestKind::Question);
        r.enqueued_at = Utc::now() - ChronoDuration::seconds(121);
        assert!(r.is_expired(std::time::Duration::from_secs(120)));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = AgentRequest::new(1, "u", "x", RequestKind::Question);
        let b = AgentRequest::new(1, "u", "x", RequestKind::Question);
        assert_ne!(a.request_id, b.request_id);
    }
}
