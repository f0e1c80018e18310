// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Coarse state of a session: which agent class is currently responsible.
///
/// Within one request the stage only moves forward; every transition is
/// persisted through the session store before the next agent fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Initial,
    Clarifying,
    Answering,
    Observing,
    Completed,
    /// Free-talk sessions bypass classification and observation entirely.
    Freepass,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Clarifying => "clarifying",
            Stage::Answering => "answering",
            Stage::Observing => "observing",
            Stage::Completed => "completed",
            Stage::Freepass => "freepass",
        }
    }

    /// Whether `next` is a legal forward move from this stage.
    ///
    /// `Completed` re-opens to the head of the pipeline (a finished session
    /// accepts a fresh question); everything else only moves forward.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Initial, Clarifying)
                | (Initial, Answering)
                | (Initial, Freepass)
                | (Clarifying, Clarifying)
                | (Clarifying, Answering)
                | (Answering, Observing)
                | (Observing, Completed)
                | (Completed, Initial)
                | (Completed, Clarifying)
                | (Completed, Answering)
                | (Completed, Freepass)
                | (Freepass, Freepass)
                | (Freepass, Completed)
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Stage::Initial),
            "clarifying" => Ok(Stage::Clarifying),
            "answering" => Ok(Stage::Answering),
            "observing" => Ok(Stage::Observing),
            "completed" => Ok(Stage::Completed),
            "freepass" => Ok(Stage::Freepass),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_legal() {
        assert!(Stage::Initial.can_advance_to(Stage::Answering));
        assert!(Stage::Initial.can_advance_to(Stage::Clarifying));
        assert!(Stage::Clarifying.can_advance_to(Stage::Answering));
        assert!(Stage::Answering.can_advance_to(Stage::Observing));
        assert!(Stage::Observing.can_advance_to(Stage::Completed));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!Stage::Answering.can_advance_to(Stage::Clarifying));
        assert!(!Stage::Observing.can_advance_to(Stage::Answering));
        assert!(!Stage::Clarifying.can_advance_to(Stage::Initial));
    }

    #[test]
    fn completed_reopens_to_pipeline_head() {
        assert!(Stage::Completed.can_advance_to(Stage::Answering));
        assert!(Stage::Completed.can_advance_to(Stage::Clarifying));
        assert!(!Stage::Completed.can_advance_to(Stage::Observing));
    }

    #[test]
    fn roundtrips_through_str() {
        for s in [
            Stage::Initial,
            Stage::Clarifying,
            Stage::Answering,
            Stage::Observing,
            Stage::Completed,
            Stage::Freepass,
        ] {
            assert_eq!(s.as_str().parse::<Stage>().unwrap(), s);
        }
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Stage::Clarifying).unwrap(),
            "\"clarifying\""
        );
    }
}
