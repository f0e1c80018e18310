// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Ingress contract types. The HTTP collaborator deserializes request
//! bodies into these and forwards the typed values; authentication has
//! already happened by the time they arrive here.

use serde::{Deserialize, Serialize};

use maice_types::SessionId;

/// `POST /chat` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub message: String,
    /// Opaque reference to a previously uploaded image.
    #[serde(default)]
    pub image: Option<String>,
}

/// `POST /clarification` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub session_id: SessionId,
    pub clarification_answer: String,
    pub question_index: u32,
    pub total_questions: u32,
}

/// `POST /session` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub initial_question: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

/// One multipart upload for `POST /image_to_latex`.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// `POST /image_to_latex` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageToLatexResponse {
    pub latex: String,
    pub filename: String,
    pub file_size: usize,
    pub content_type: String,
    pub success: bool,
}
