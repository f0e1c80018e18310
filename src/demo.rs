// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Deterministic generator backing the CLI demo commands. The real
//! text-generation collaborator is external; this double answers each
//! prompt family with a plausible fixed shape so `maice serve` and
//! `maice chat` work offline.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use maice_llm::{GenerationRequest, TextGenerator, TokenStream};

pub struct DemoGenerator;

#[async_trait]
impl TextGenerator for DemoGenerator {
    fn name(&self) -> &str {
        "demo"
    }

    async fn generate_stream(
        &self,
        req: GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        let chunks: Vec<String> = if req.prompt.contains("intake classifier") {
            vec![r#"{"knowledge_code": "K2", "decision": "answerable", "math_relatedness": 0.9}"#
                .to_string()]
        } else if req.prompt.contains("clarification questions") {
            vec![r#"["Which topic is this about?", "What grade are you in?"]"#.to_string()]
        } else if req.prompt.contains("grading one tutoring session") {
            let item = r#"{"elements": [true, true, true, false]}"#;
            vec![format!(
                "{{\"items\": [{}], \"feedback\": \"clear and correct\"}}",
                vec![item; 8].join(",")
            )]
        } else if req.prompt.contains("Summarize this tutoring exchange") {
            vec!["The student asked a math question and received a worked answer.".to_string()]
        } else {
            "This demo build answers every question the same way: break the problem \
             into steps, solve each step, and check the result."
                .split_inclusive(' ')
                .map(str::to_string)
                .collect()
        };

        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                if cancel.is_cancelled() {
                    break;
                }
                yield Ok(chunk);
            }
        }))
    }
}
