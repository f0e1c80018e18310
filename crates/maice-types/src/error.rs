// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error code carried by `error` response events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Auth,
    Busy,
    Timeout,
    Internal,
    Cancelled,
}

/// The fleet-wide error taxonomy.
///
/// Only `Transient` is ever retried, and only by the agent runtime with
/// bounded backoff. Everything else surfaces on the response stream as an
/// `error` event followed by `complete`, except `Cancelled`, which is
/// silent.
#[derive(Debug, Error)]
pub enum MaiceError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("session {0} already has a request in flight")]
    Busy(crate::SessionId),

    #[error("deadline expired: {0}")]
    Timeout(String),

    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),

    #[error("cancelled by client")]
    Cancelled,
}

impl MaiceError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        MaiceError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        MaiceError::Permanent(err.into())
    }

    /// Whether the runtime may re-enqueue the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MaiceError::Transient(_))
    }

    /// The code surfaced to the client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            MaiceError::Validation(_) => ErrorCode::Validation,
            MaiceError::Auth(_) => ErrorCode::Auth,
            MaiceError::Busy(_) => ErrorCode::Busy,
            MaiceError::Timeout(_) => ErrorCode::Timeout,
            MaiceError::Transient(_) | MaiceError::Permanent(_) => ErrorCode::Internal,
            MaiceError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(MaiceError::transient(std::io::Error::other("ECONNRESET")).is_retryable());
        assert!(!MaiceError::permanent(std::io::Error::other("bad")).is_retryable());
        assert!(!MaiceError::Busy(7).is_retryable());
        assert!(!MaiceError::Cancelled.is_retryable());
    }

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(MaiceError::Busy(1).code(), ErrorCode::Busy);
        assert_eq!(
            MaiceError::Timeout("request deadline".into()).code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            MaiceError::permanent(std::io::Error::other("x")).code(),
            ErrorCode::Internal
        );
    }
}
