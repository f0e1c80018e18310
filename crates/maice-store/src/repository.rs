// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use maice_types::{
    EvaluationRecord, MessageType, NewMessage, SessionId, SessionMessage, Stage, UserId,
};

/// Persisted session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub title: String,
    pub current_stage: Stage,
    pub last_message_type: Option<MessageType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Persisted user row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub display_name: String,
    /// Free-talk users bypass classification entirely.
    pub free_talk: bool,
    /// School level used by the curriculum checker (grade number).
    pub school_level: u8,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("stage transition conflict on session {session_id}: expected {expected}, found {found}")]
    StageConflict {
        session_id: SessionId,
        expected: Stage,
        found: Stage,
    },

    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Abstract persistence for users, sessions, messages and evaluations.
///
/// Every method is transactional: it either fully applies or fails with
/// no partial effect.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<UserRecord, RepositoryError>;

    async fn upsert_user(&self, user: UserRecord) -> Result<(), RepositoryError>;

    /// Create a session; the repository assigns the next monotonically
    /// increasing id.
    async fn create_session(
        &self,
        user_id: &str,
        title: &str,
    ) -> Result<SessionRecord, RepositoryError>;

    async fn get_session(&self, session_id: SessionId) -> Result<SessionRecord, RepositoryError>;

    /// Messages of a session in log order, optionally only those with
    /// `id > since`.
    async fn list_session_messages(
        &self,
        session_id: SessionId,
        since: Option<i64>,
    ) -> Result<Vec<SessionMessage>, RepositoryError>;

    /// Append a message. For `sender = maice` the
    /// `(session_id, content, message_type)` tuple is unique: a duplicate
    /// append returns the existing row unchanged.
    async fn append_session_message(
        &self,
        msg: NewMessage,
    ) -> Result<SessionMessage, RepositoryError>;

    /// Compare-and-swap on `current_stage`. Fails with
    /// [`RepositoryError::StageConflict`] when the observed stage is not
    /// `from`; of two concurrent racers exactly one succeeds.
    async fn update_session_stage(
        &self,
        session_id: SessionId,
        from: Stage,
        to: Stage,
    ) -> Result<(), RepositoryError>;

    /// Mark the session inactive and completed.
    async fn close_session(&self, session_id: SessionId) -> Result<(), RepositoryError>;

    async fn upsert_evaluation(&self, record: EvaluationRecord) -> Result<(), RepositoryError>;

    async fn list_evaluations(
        &self,
        session_id: Option<SessionId>,
    ) -> Result<Vec<EvaluationRecord>, RepositoryError>;

    /// All session ids, oldest first. Drives the batch evaluation sweep.
    async fn list_session_ids(&self) -> Result<Vec<SessionId>, RepositoryError>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
