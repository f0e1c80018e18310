// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Contract for the text-generation collaborator.
//!
//! The production client (HTTP, auth, model selection) lives outside this
//! system; agents only depend on [`TextGenerator`]. The bundled
//! implementations are deterministic doubles used by the CLI demo and the
//! test suite.

pub mod mock;

pub use mock::{FlakyGenerator, MockGenerator, ScriptedGenerator};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

/// Stream of generated text chunks.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub stop: Option<Vec<String>>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Provider name for status display.
    fn name(&self) -> &str;

    /// Start a completion and return its token stream. Implementations
    /// must stop emitting promptly once `cancel` fires; a cancelled
    /// stream simply ends.
    async fn generate_stream(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream>;

    /// Collect a full (non-streamed) completion.
    async fn generate_text(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        use futures::StreamExt;
        let mut stream = self.generate_stream(req, cancel).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}
