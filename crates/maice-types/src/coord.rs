// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Payloads of the coordination topics. These are lossy, fire-and-forget
//! shapes: the orchestrator treats a missed verdict the same way as a
//! slow classifier (timeout fallback).

use serde::{Deserialize, Serialize};

use crate::RequestId;

/// Knowledge-domain code assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnowledgeCode {
    K1,
    K2,
    K3,
    K4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictDecision {
    Answerable,
    NeedsClarify,
}

/// Classifier verdict, broadcast on `maice:coord:verdict_<request_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub request_id: RequestId,
    pub knowledge_code: KnowledgeCode,
    pub decision: VerdictDecision,
    /// 0.0 (off-topic) to 1.0 (clearly mathematics).
    pub math_relatedness: f32,
}

/// Clarifier progress, broadcast on `maice:coord:clarify_done_<request_id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyProgress {
    pub request_id: RequestId,
    pub asked: u32,
    pub total: u32,
    /// All questions asked; the orchestrator promotes to the answerer.
    pub exhausted: bool,
}
