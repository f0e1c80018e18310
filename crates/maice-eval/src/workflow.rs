// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maice_agents::render_transcript;
use maice_llm::{GenerationRequest, TextGenerator};
use maice_store::{Repository, SessionStore};
use maice_types::{EvaluationRecord, SessionId};

use crate::rubric::{parse_checklist, rubric_prompt};

/// One failed session inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalError {
    pub session_id: SessionId,
    pub error: String,
}

/// Batch outcome; failures are isolated per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<EvalError>,
}

pub struct Evaluator {
    store: Arc<SessionStore>,
    llm: Arc<dyn TextGenerator>,
    parallelism: usize,
}

impl Evaluator {
    pub fn new(
        store: Arc<SessionStore>,
        llm: Arc<dyn TextGenerator>,
        cfg: &maice_config::EvalConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            llm,
            parallelism: cfg.parallelism.max(1),
        })
    }

    /// Evaluate one session and upsert its record.
    pub async fn evaluate_session(&self, session_id: SessionId) -> anyhow::Result<EvaluationRecord> {
        let messages = self
            .store
            .list_messages(session_id)
            .await
            .with_context(|| format!("loading transcript of session {session_id}"))?;
        if messages.is_empty() {
            return Err(anyhow!("session {session_id} has no transcript"));
        }

        let reply = self
            .llm
            .generate_text(
                GenerationRequest::new(rubric_prompt(&render_transcript(&messages))),
                CancellationToken::new(),
            )
            .await
            .context("rubric completion failed")?;

        // The model only supplies booleans; every score is derived here.
        let (checklist, feedback) = parse_checklist(&reply)?;
        let record = EvaluationRecord::from_checklist(session_id, checklist, feedback);
        self.store
            .repository()
            .upsert_evaluation(record.clone())
            .await?;
        info!(session_id, overall = record.overall, "session evaluated");
        Ok(record)
    }

    /// Evaluate an explicit list in a bounded worker pool.
    pub async fn evaluate_batch(self: &Arc<Self>, ids: Vec<SessionId>) -> BatchReport {
        let mut report = BatchReport {
            total: ids.len(),
            ..BatchReport::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<(SessionId, anyhow::Result<EvaluationRecord>)> = JoinSet::new();

        for id in ids {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                (id, this.evaluate_session(id).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => report.successful += 1,
                Ok((id, Err(e))) => {
                    warn!(session_id = id, "evaluation failed: {e:#}");
                    report.failed += 1;
                    report.errors.push(EvalError {
                        session_id: id,
                        error: format!("{e:#}"),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(EvalError {
                        session_id: -1,
                        error: format!("evaluation task failed: {e}"),
                    });
                }
            }
        }
        report
    }

    /// Evaluate every session, optionally skipping ones that already
    /// have a record.
    pub async fn evaluate_all(self: &Arc<Self>, only_unevaluated: bool) -> anyhow::Result<BatchReport> {
        let mut ids = self.store.repository().list_session_ids().await?;
        if only_unevaluated {
            let evaluated: HashSet<SessionId> = self
                .store
                .repository()
                .list_evaluations(None)
                .await?
                .into_iter()
                .map(|r| r.session_id)
                .collect();
            ids.retain(|id| !evaluated.contains(id));
        }
        Ok(self.evaluate_batch(ids).await)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use maice_llm::ScriptedGenerator;
    use maice_store::MemoryRepository;
    use maice_types::{MessageType, NewMessage};

    fn full_marks_reply() -> String {
        let item = "{\"elements\": [true,true,true,true]}";
        format!(
            "{{\"items\": [{}], \"feedback\": \"excellent\"}}",
            vec![item; 8].join(",")
        )
    }

    async fn store_with_sessions(n: usize) -> Arc<SessionStore> {
        let store = SessionStore::new(
            Arc::new(MemoryRepository::new()),
            &maice_config::StoreConfig::default(),
        );
        for i in 0..n {
            let s = store
                .create("u1", Some(&format!("question {i}")))
                .await
                .unwrap();
            store
                .append(NewMessage::maice(
                    s.session_id,
                    format!("answer {i}"),
                    MessageType::MaiceAnswer,
                ))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn single_session_evaluation_scores_deterministically() {
        let store = store_with_sessions(1).await;
        let llm = Arc::new(ScriptedGenerator::always(vec![&full_marks_reply()]));
        let evaluator = Evaluator::new(store.clone(), llm, &maice_config::EvalConfig::default());

        let record = evaluator.evaluate_session(1).await.unwrap();
        assert_eq!(record.overall, 40);
        assert_eq!(record.section_a, 15);
        assert_eq!(record.section_c, 10);
        assert_eq!(record.feedback, "excellent");

        let stored = store.repository().list_evaluations(Some(1)).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let store = store_with_sessions(2).await;
        // First script is garbage, second parses: one failure, one success
        // (ordering of pops matches spawn order at parallelism 1).
        let llm = Arc::new(ScriptedGenerator::new(vec![
            vec!["not json at all".into()],
            vec![full_marks_reply()],
        ]));
        let evaluator = Evaluator::new(
            store,
            llm,
            &maice_config::EvalConfig { parallelism: 1 },
        );

        let report = evaluator.evaluate_batch(vec![1, 2]).await;
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn evaluate_all_skips_already_evaluated() {
        let store = store_with_sessions(3).await;
        let llm = Arc::new(ScriptedGenerator::new(vec![
            vec![full_marks_reply()],
            vec![full_marks_reply()],
            vec![full_marks_reply()],
        ]));
        let evaluator = Evaluator::new(store, llm, &maice_config::EvalConfig { parallelism: 1 });

        evaluator.evaluate_session(2).await.unwrap();
        let report = evaluator.evaluate_all(true).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 2);
    }

    #[tokio::test]
    async fn empty_session_fails_cleanly() {
        let store = SessionStore::new(
            Arc::new(MemoryRepository::new()),
            &maice_config::StoreConfig::default(),
        );
        let s = store.create("u1", None).await.unwrap();
        let llm = Arc::new(ScriptedGenerator::always(vec!["unused"]));
        let evaluator = Evaluator::new(store, llm, &maice_config::EvalConfig::default());

        let err = evaluator.evaluate_session(s.session_id).await.unwrap_err();
        assert!(err.to_string().contains("no transcript"));
    }
}
