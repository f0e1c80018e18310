// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use maice_runtime::{AgentBehavior, AgentContext, Outcome};
use maice_types::{AgentName, AgentRequest, MaiceError, MessageType, ResponseEvent};

/// Terminology corpus: (term, minimum school grade it is introduced at).
/// Deliberately static; curating it is a content concern, not a code one.
const CORPUS: &[(&str, u8)] = &[
    ("fraction", 4),
    ("equation", 6),
    ("function", 8),
    ("polynomial", 9),
    ("logarithm", 9),
    ("limit", 10),
    ("derivative", 10),
    ("integral", 11),
    ("matrix", 11),
    ("vector space", 12),
    ("eigenvalue", 13),
    ("manifold", 14),
];

/// Verifies that the delivered answer sticks to terminology the student's
/// level has met. Advisory only: it emits an observation and a hint but
/// never rewrites user-visible content.
pub struct CurriculumBehavior;

#[async_trait]
impl AgentBehavior for CurriculumBehavior {
    fn name(&self) -> AgentName {
        AgentName::Curriculum
    }

    async fn handle(
        &self,
        req: AgentRequest,
        cx: Arc<AgentContext>,
        _cancel: CancellationToken,
    ) -> Result<Outcome, MaiceError> {
        let user = cx
            .store
            .ensure_user(&req.user_id)
            .await
            .map_err(MaiceError::transient)?;
        let log = cx
            .store
            .list_messages(req.session_id)
            .await
            .map_err(MaiceError::transient)?;
        let Some(answer) = log
            .iter()
            .rev()
            .find(|m| m.message_type == MessageType::MaiceAnswer)
        else {
            return Ok(Outcome::Done);
        };

        let flagged = check_terms(&answer.content, user.school_level);
        cx.metrics
            .append_log(
                req.session_id,
                "curriculum",
                if flagged.is_empty() {
                    "terminology appropriate"
                } else {
                    "terminology above student level"
                },
                json!({ "flagged": flagged, "school_level": user.school_level }),
            )
            .await
            .map_err(MaiceError::transient)?;

        if flagged.is_empty() {
            return Ok(Outcome::Done);
        }

        cx.metrics.inc("terms_flagged_total", flagged.len() as u64, &[]);
        debug!(session_id = req.session_id, ?flagged, "curriculum observation");
        let hint = format!(
            "The answer uses terms typically introduced later: {}. Consider a simpler framing.",
            flagged.join(", ")
        );
        Ok(Outcome::Produced(vec![ResponseEvent::Observation {
            terms: flagged,
            hint,
        }]))
    }
}

/// Terms in `text` above the student's level, in corpus order.
fn check_terms(text: &str, school_level: u8) -> Vec<String> {
    let lower = text.to_lowercase();
    CORPUS
        .iter()
        .filter(|(term, level)| *level > school_level && lower.contains(term))
        .map(|(term, _)| term.to_string())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
