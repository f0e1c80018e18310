// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Who authored a message in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Maice,
}

/// Classification of a conversation-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserQuestion,
    UserClarificationAnswer,
    MaiceProcessing,
    MaiceClarificationQuestion,
    MaiceAnswer,
    MaiceSummary,
    System,
    /// Machine-to-machine bookkeeping (e.g. the clarifier's planned-question
    /// list). Never rendered to the user.
    Internal,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserQuestion => "user_question",
            MessageType::UserClarificationAnswer => "user_clarification_answer",
            MessageType::MaiceProcessing => "maice_processing",
            MessageType::MaiceClarificationQuestion => "maice_clarification_question",
            MessageType::MaiceAnswer => "maice_answer",
            MessageType::MaiceSummary => "maice_summary",
            MessageType::System => "system",
            MessageType::Internal => "internal",
        }
    }
}

/// One persisted row of a session's conversation log.
///
/// Rows are totally ordered within a session by `created_at`, ties broken
/// by `id`. For `sender = maice` the tuple
/// `(session_id, content, message_type)` is unique; the repository enforces
/// this so no duplicate AI message is ever persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: i64,
    pub session_id: SessionId,
    pub sender: Sender,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

/// A message about to be appended (no id / timestamp yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub session_id: SessionId,
    pub sender: Sender,
    pub content: String,
    pub message_type: MessageType,
}

impl NewMessage {
    pub fn user(session_id: SessionId, content: impl Into<String>, kind: MessageType) -> Self {
        Self {
            session_id,
            sender: Sender::User,
            content: content.into(),
            message_type: kind,
        }
    }

    pub fn maice(session_id: SessionId, content: impl Into<String>, kind: MessageType) -> Self {
        Self {
            session_id,
            sender: Sender::Maice,
            content: content.into(),
            message_type: kind,
        }
    }
}
