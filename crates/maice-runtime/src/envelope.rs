// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use maice_types::AgentRequest;

/// Wire envelope for request streams. The attempt counter travels with
/// the payload so the retry schedule survives redelivery and re-publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request: AgentRequest,
    /// 0 on first publish; bumped by each runtime-scheduled retry.
    #[serde(default)]
    pub attempt: u32,
}

impl RequestEnvelope {
    pub fn new(request: AgentRequest) -> Self {
        Self {
            request,
            attempt: 0,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            request: self.request.clone(),
            attempt: self.attempt + 1,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
