// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// The six agent classes of the fleet. Each runs behind its own consumer
/// group on its own request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Classifier,
    Clarifier,
    Answerer,
    Observer,
    Curriculum,
    FreeTalker,
}

impl AgentName {
    pub const ALL: [AgentName; 6] = [
        AgentName::Classifier,
        AgentName::Clarifier,
        AgentName::Answerer,
        AgentName::Observer,
        AgentName::Curriculum,
        AgentName::FreeTalker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Classifier => "classifier",
            AgentName::Clarifier => "clarifier",
            AgentName::Answerer => "answerer",
            AgentName::Observer => "observer",
            AgentName::Curriculum => "curriculum",
            AgentName::FreeTalker => "free_talker",
        }
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classifier" => Ok(AgentName::Classifier),
            "clarifier" => Ok(AgentName::Clarifier),
            "answerer" => Ok(AgentName::Answerer),
            "observer" => Ok(AgentName::Observer),
            "curriculum" => Ok(AgentName::Curriculum),
            "free_talker" | "freetalker" => Ok(AgentName::FreeTalker),
            other => Err(format!("unknown agent: {other}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_names_roundtrip() {
        for a in AgentName::ALL {
            assert_eq!(a.as_str().parse::<AgentName>().unwrap(), a);
        }
    }

    #[test]
    fn freetalker_alias_parses() {
        assert_eq!(
            "freetalker".parse::<AgentName>().unwrap(),
            AgentName::FreeTalker
        );
    }
}
