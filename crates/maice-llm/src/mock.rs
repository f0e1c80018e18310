// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{GenerationRequest, TextGenerator, TokenStream};

/// Turn a list of chunks into a cancellation-aware token stream with an
/// optional inter-chunk delay.
fn chunk_stream(chunks: Vec<String>, delay: Option<Duration>, cancel: CancellationToken) -> TokenStream {
    Box::pin(async_stream::stream! {
        for chunk in chunks {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(d) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(d) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            yield Ok(chunk);
        }
    })
}

/// Deterministic generator for demos: echoes the tail of the prompt back
/// word by word.
#[derive(Default)]
pub struct MockGenerator;

#[async_trait]
impl TextGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_stream(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        let tail: String = req.prompt.chars().rev().take(120).collect::<String>()
            .chars().rev().collect();
        let mut chunks: Vec<String> = vec!["MOCK:".to_string()];
        chunks.extend(tail.split_whitespace().map(|w| format!(" {w}")));
        Ok(chunk_stream(chunks, None, cancel))
    }
}

/// Pre-scripted generator. Each call pops the next script from the front
/// of the queue; tests specify exact chunk sequences without network
/// access. The last request is recorded for inspection.
pub struct ScriptedGenerator {
    scripts: Mutex<Vec<Vec<String>>>,
    /// Inter-chunk delay, for tests exercising cancellation mid-stream.
    delay: Option<Duration>,
    pub last_request: Arc<Mutex<Option<GenerationRequest>>>,
}

impl ScriptedGenerator {
    pub fn new(scripts: Vec<Vec<String>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            delay: None,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: generator that always yields one script.
    pub fn always(chunks: Vec<&str>) -> Self {
        Self::new(vec![chunks.into_iter().map(String::from).collect()])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_stream(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        *self.last_request.lock().expect("lock poisoned") = Some(req);
        let chunks = {
            let mut scripts = self.scripts.lock().expect("lock poisoned");
            if scripts.is_empty() {
                // Repeat the shape of the exhausted-queue fallback so tests
                // fail visibly rather than hang.
                vec!["[no more scripts]".to_string()]
            } else {
                scripts.remove(0)
            }
        };
        Ok(chunk_stream(chunks, self.delay, cancel))
    }
}

/// Fails the first `failures` calls with a connection-reset style error,
/// then delegates. Exercises the runtime's transient-retry path.
pub struct FlakyGenerator {
    failures: AtomicU32,
    inner: Arc<dyn TextGenerator>,
}

impl FlakyGenerator {
    pub fn new(failures: u32, inner: Arc<dyn TextGenerator>) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            inner,
        }
    }
}

#[async_trait]
impl TextGenerator for FlakyGenerator {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn generate_stream(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("ECONNRESET: connection reset by peer"));
        }
        self.inner.generate_stream(req, cancel).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
