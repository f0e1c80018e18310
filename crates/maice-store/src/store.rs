// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info};

use maice_types::{MessageType, NewMessage, SessionId, SessionMessage, Stage};

use crate::repository::{Repository, RepositoryError, SessionRecord, UserRecord};

/// Current stage plus the trailing slice of the conversation log.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: SessionRecord,
    pub messages: Vec<SessionMessage>,
}

/// The sole gatekeeper for session state.
///
/// Every stage transition is a compare-and-swap persisted before the next
/// agent fires, and every log write funnels through the repository's
/// idempotent append.
pub struct SessionStore {
    repo: Arc<dyn Repository>,
    snapshot_limit: usize,
}

impl SessionStore {
    pub fn new(repo: Arc<dyn Repository>, cfg: &maice_config::StoreConfig) -> Arc<Self> {
        Arc::new(Self {
            repo,
            snapshot_limit: cfg.snapshot_limit,
        })
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Atomically create a session, seeding the log with the initial
    /// question when one was supplied. The title derives from the
    /// question.
    pub async fn create(
        &self,
        user_id: &str,
        initial_question: Option<&str>,
    ) -> Result<SessionRecord, RepositoryError> {
        let title = initial_question
            .map(derive_title)
            .unwrap_or_else(|| "New session".to_string());
        let session = self.repo.create_session(user_id, &title).await?;
        if let Some(q) = initial_question {
            self.repo
                .append_session_message(NewMessage::user(
                    session.session_id,
                    q,
                    MessageType::UserQuestion,
                ))
                .await?;
        }
        info!(session_id = session.session_id, user_id, "session created");
        Ok(session)
    }

    /// Idempotent for the maice sender: an exact duplicate returns the
    /// already-persisted row.
    pub async fn append(&self, msg: NewMessage) -> Result<SessionMessage, RepositoryError> {
        self.repo.append_session_message(msg).await
    }

    /// Compare-and-swap the stage. Of two concurrent callers exactly one
    /// succeeds; an illegal forward move is rejected before touching the
    /// repository.
    pub async fn transition(
        &self,
        session_id: SessionId,
        from: Stage,
        to: Stage,
    ) -> Result<(), RepositoryError> {
        if !from.can_advance_to(to) {
            return Err(RepositoryError::Storage(anyhow!(
                "illegal stage transition {from} -> {to} on session {session_id}"
            )));
        }
        self.repo.update_session_stage(session_id, from, to).await?;
        debug!(session_id, %from, %to, "stage transition");
        Ok(())
    }

    /// Current stage, metadata and the last N messages.
    pub async fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, RepositoryError> {
        let session = self.repo.get_session(session_id).await?;
        let mut messages = self.repo.list_session_messages(session_id, None).await?;
        if messages.len() > self.snapshot_limit {
            messages = messages.split_off(messages.len() - self.snapshot_limit);
        }
        Ok(SessionSnapshot { session, messages })
    }

    /// The full conversation log, unbounded.
    pub async fn list_messages(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<SessionMessage>, RepositoryError> {
        self.repo.list_session_messages(session_id, None).await
    }

    pub async fn close(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        self.repo.close_session(session_id).await?;
        info!(session_id, "session closed");
        Ok(())
    }

    pub async fn session(&self, session_id: SessionId) -> Result<SessionRecord, RepositoryError> {
        self.repo.get_session(session_id).await
    }

    /// Fetch a user, creating a default record on first contact.
    /// Authentication lives with the HTTP collaborator; by the time a
    /// request reaches the store the user id is trusted.
    pub async fn ensure_user(&self, user_id: &str) -> Result<UserRecord, RepositoryError> {
        match self.repo.get_user(user_id).await {
            Ok(user) => Ok(user),
            Err(RepositoryError::UserNotFound(_)) => {
                let user = UserRecord {
                    user_id: user_id.to_string(),
                    display_name: user_id.to_string(),
                    free_talk: false,
                    school_level: 9,
                };
                self.repo.upsert_user(user.clone()).await?;
                Ok(user)
            }
            Err(e) => Err(e),
        }
    }
}

fn derive_title(question: &str) -> String {
    let line = question.lines().next().unwrap_or("").trim();
    if line.chars().count() <= 48 {
        line.to_string()
    } else {
        let cut: String = line.chars().take(48).collect();
        format!("{cut}…")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
