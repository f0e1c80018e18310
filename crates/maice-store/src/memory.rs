// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use maice_types::{
    EvaluationRecord, NewMessage, Sender, SessionId, SessionMessage, Stage, UserId,
};

use crate::repository::{Repository, RepositoryError, SessionRecord, UserRecord};

/// In-process repository. One async mutex around the whole state gives
/// per-call transactionality; contention is irrelevant at test scale.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserRecord>,
    sessions: BTreeMap<SessionId, SessionRecord>,
    next_session_id: SessionId,
    messages: Vec<SessionMessage>,
    next_message_id: i64,
    /// Uniqueness index for maice-sender messages:
    /// (session_id, content, message_type as str).
    maice_index: HashSet<(SessionId, String, &'static str)>,
    evaluations: BTreeMap<SessionId, EvaluationRecord>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_user(&self, user_id: &str) -> Result<UserRecord, RepositoryError> {
        self.inner
            .lock()
            .await
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| RepositoryError::UserNotFound(user_id.to_string()))
    }

    async fn upsert_user(&self, user: UserRecord) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .await
            .users
            .insert(user.user_id.clone(), user);
        Ok(())
    }

    async fn create_session(
        &self,
        user_id: &str,
        title: &str,
    ) -> Result<SessionRecord, RepositoryError> {
        let mut inner = self.inner.lock().await;
        inner.next_session_id += 1;
        let now = Utc::now();
        let record = SessionRecord {
            session_id: inner.next_session_id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            current_stage: Stage::Initial,
            last_message_type: None,
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        inner.sessions.insert(record.session_id, record.clone());
        Ok(record)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionRecord, RepositoryError> {
        self.inner
            .lock()
            .await
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(RepositoryError::SessionNotFound(session_id))
    }

    async fn list_session_messages(
        &self,
        session_id: SessionId,
        since: Option<i64>,
    ) -> Result<Vec<SessionMessage>, RepositoryError> {
        let inner = self.inner.lock().await;
        let floor = since.unwrap_or(i64::MIN);
        let mut msgs: Vec<SessionMessage> = inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && m.id > floor)
            .cloned()
            .collect();
        msgs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(msgs)
    }

    async fn append_session_message(
        &self,
        msg: NewMessage,
    ) -> Result<SessionMessage, RepositoryError> {
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(&msg.session_id) {
            return Err(RepositoryError::SessionNotFound(msg.session_id));
        }

        if msg.sender == Sender::Maice {
            let key = (
                msg.session_id,
                msg.content.clone(),
                msg.message_type.as_str(),
            );
            if inner.maice_index.contains(&key) {
                // Duplicate AI message: return the existing row.
                let existing = inner
                    .messages
                    .iter()
                    .find(|m| {
                        m.session_id == msg.session_id
                            && m.sender == Sender::Maice
                            && m.content == msg.content
                            && m.message_type == msg.message_type
                    })
                    .cloned();
                if let Some(existing) = existing {
                    return Ok(existing);
                }
            }
            inner.maice_index.insert(key);
        }

        inner.next_message_id += 1;
        let row = SessionMessage {
            id: inner.next_message_id,
            session_id: msg.session_id,
            sender: msg.sender,
            content: msg.content,
            message_type: msg.message_type,
            created_at: Utc::now(),
        };
        inner.messages.push(row.clone());
        if let Some(session) = inner.sessions.get_mut(&msg.session_id) {
            session.last_message_type = Some(row.message_type);
            session.updated_at = row.created_at;
        }
        Ok(row)
    }

    async fn update_session_stage(
        &self,
        session_id: SessionId,
        from: Stage,
        to: Stage,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(RepositoryError::SessionNotFound(session_id))?;
        if session.current_stage != from {
            return Err(RepositoryError::StageConflict {
                session_id,
                expected: from,
                found: session.current_stage,
            });
        }
        session.current_stage = to;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn close_session(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(RepositoryError::SessionNotFound(session_id))?;
        session.is_active = false;
        session.current_stage = Stage::Completed;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_evaluation(&self, record: EvaluationRecord) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .await
            .evaluations
            .insert(record.session_id, record);
        Ok(())
    }

    async fn list_evaluations(
        &self,
        session_id: Option<SessionId>,
    ) -> Result<Vec<EvaluationRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .evaluations
            .values()
            .filter(|e| session_id.map(|id| e.session_id == id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, RepositoryError> {
        Ok(self.inner.lock().await.sessions.keys().copied().collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use maice_types::MessageType;

    async fn repo_with_session() -> (MemoryRepository, SessionId) {
        let repo = MemoryRepository::new();
        let session = repo.create_session("u1", "derivatives").await.unwrap();
        (repo, session.session_id)
    }

    #[tokio::test]
    async fn session_ids_increase_monotonically() {
        let repo = MemoryRepository::new();
        let a = repo.create_session("u1", "t1").await.unwrap();
        let b = repo.create_session("u1", "t2").await.unwrap();
        assert!(b.session_id > a.session_id);
    }

    #[tokio::test]
    async fn maice_append_is_idempotent_on_exact_tuple() {
        let (repo, sid) = repo_with_session().await;
        let msg = NewMessage::maice(sid, "the answer", MessageType::MaiceAnswer);

        let first = repo.append_session_message(msg.clone()).await.unwrap();
        let second = repo.append_session_message(msg).await.unwrap();
        assert_eq!(first.id, second.id);

        let all = repo.list_session_messages(sid, None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn same_content_different_type_is_not_a_duplicate() {
        let (repo, sid) = repo_with_session().await;
        repo.append_session_message(NewMessage::maice(sid, "text", MessageType::MaiceAnswer))
            .await
            .unwrap();
        repo.append_session_message(NewMessage::maice(sid, "text", MessageType::MaiceSummary))
            .await
            .unwrap();
        let all = repo.list_session_messages(sid, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn user_messages_may_repeat() {
        let (repo, sid) = repo_with_session().await;
        let msg = NewMessage::user(sid, "help", MessageType::UserQuestion);
        repo.append_session_message(msg.clone()).await.unwrap();
        repo.append_session_message(msg).await.unwrap();
        let all = repo.list_session_messages(sid, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn stage_cas_admits_exactly_one_of_two_racers() {
        let (repo, sid) = repo_with_session().await;
        let a = repo
            .update_session_stage(sid, Stage::Initial, Stage::Answering)
            .await;
        let b = repo
            .update_session_stage(sid, Stage::Initial, Stage::Clarifying)
            .await;
        assert!(a.is_ok());
        assert!(matches!(b, Err(RepositoryError::StageConflict { .. })));
        let session = repo.get_session(sid).await.unwrap();
        assert_eq!(session.current_stage, Stage::Answering);
    }

    #[tokio::test]
    async fn close_marks_inactive_and_completed() {
        let (repo, sid) = repo_with_session().await;
        repo.close_session(sid).await.unwrap();
        let session = repo.get_session(sid).await.unwrap();
        assert!(!session.is_active);
        assert_eq!(session.current_stage, Stage::Completed);
    }

    #[tokio::test]
    async fn since_filter_excludes_older_rows() {
        let (repo, sid) = repo_with_session().await;
        let first = repo
            .append_session_message(NewMessage::user(sid, "a", MessageType::UserQuestion))
            .await
            .unwrap();
        repo.append_session_message(NewMessage::user(sid, "b", MessageType::UserQuestion))
            .await
            .unwrap();
        let newer = repo.list_session_messages(sid, Some(first.id)).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].content, "b");
    }

    #[tokio::test]
    async fn evaluation_upsert_replaces_prior_row() {
        let (repo, sid) = repo_with_session().await;
        let rec =
            EvaluationRecord::from_checklist(sid, maice_types::RubricChecklist::default(), "v1");
        repo.upsert_evaluation(rec).await.unwrap();
        let rec2 =
            EvaluationRecord::from_checklist(sid, maice_types::RubricChecklist::default(), "v2");
        repo.upsert_evaluation(rec2).await.unwrap();

        let all = repo.list_evaluations(Some(sid)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].feedback, "v2");
    }
}
