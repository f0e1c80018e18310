// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::{error::ErrorCode, SessionId};

/// One event on a session's response stream.
///
/// Externally tagged as `{"type": "..."}` on the wire; the tag names match
/// what the HTTP collaborator forwards to clients verbatim.
///
/// `streaming_chunk.chunk_index` is strictly monotonic per request,
/// starting at 0; `is_final = true` appears at most once and marks
/// end-of-stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    Connected,
    SessionCreated {
        session_id: SessionId,
    },
    /// Progress marker; `stage` is the processing phase
    /// ("classifying", "answering", ...), not the persisted session stage.
    Processing {
        stage: String,
    },
    ClarificationQuestion {
        index: u32,
        total: u32,
        question: String,
    },
    StreamingChunk {
        chunk_index: u64,
        content: String,
        is_final: bool,
    },
    AnswerComplete,
    SummaryComplete,
    /// Curriculum checker's terminology verdict. Advisory only; never
    /// rewrites user-visible content.
    Observation {
        terms: Vec<String>,
        hint: String,
    },
    SessionStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Complete,
}

impl ResponseEvent {
    pub fn chunk(chunk_index: u64, content: impl Into<String>, is_final: bool) -> Self {
        ResponseEvent::StreamingChunk {
            chunk_index,
            content: content.into(),
            is_final,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ResponseEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Terminal events end the request lifecycle on the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseEvent::Complete | ResponseEvent::Error { .. })
    }

    /// Control events are never dropped under backpressure.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ResponseEvent::Error { .. }
                | ResponseEvent::Complete
                | ResponseEvent::ClarificationQuestion { .. }
                | ResponseEvent::AnswerComplete
        )
    }

}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serializes_with_type_tag() {
        let ev = ResponseEvent::chunk(0, "A derivative", false);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "streaming_chunk");
        assert_eq!(json["chunk_index"], 0);
        assert_eq!(json["content"], "A derivative");
        assert_eq!(json["is_final"], false);
    }

    #[test]
    fn error_code_is_snake_case_on_the_wire() {
        let ev = ResponseEvent::error(ErrorCode::Busy, "session busy");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "busy");
    }

    #[test]
    fn control_classification() {
        assert!(ResponseEvent::Complete.is_control());
        assert!(ResponseEvent::AnswerComplete.is_control());
        assert!(!ResponseEvent::chunk(3, "x", false).is_control());
        assert!(!ResponseEvent::Connected.is_control());
    }

    #[test]
    fn terminal_classification() {
        assert!(ResponseEvent::Complete.is_terminal());
        assert!(ResponseEvent::error(ErrorCode::Internal, "boom").is_terminal());
        assert!(!ResponseEvent::AnswerComplete.is_terminal());
    }

    #[test]
    fn roundtrips_through_json() {
        let ev = ResponseEvent::ClarificationQuestion {
            index: 0,
            total: 2,
            question: "What topic?".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ResponseEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
