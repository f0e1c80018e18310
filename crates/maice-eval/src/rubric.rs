// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{anyhow, Context};

use maice_agents::parse::extract_json;
use maice_types::{RubricChecklist, RubricItem, RUBRIC_ELEMENTS, RUBRIC_ITEMS};

/// The rubric prompt. Item semantics live here so the checklist shape
/// and the parser stay in one file.
pub fn rubric_prompt(transcript: &str) -> String {
    format!(
        "You are grading one tutoring session against a fixed checklist.\n\
         For each of the 8 items mark its 4 binary elements true/false.\n\
         Items 1-3: mathematical correctness (A). Items 4-6: pedagogical\n\
         quality (B). Items 7-8: communication (C).\n\n\
         Session transcript:\n{transcript}\n\n\
         Reply with a single JSON object and nothing else:\n\
         {{\"items\": [{{\"elements\": [true,false,true,false]}}, ... 8 items],\n\
           \"feedback\": \"one short paragraph\"}}"
    )
}

/// Parse the model's checklist reply. Strict on shape (8 items of 4
/// elements); tolerant on the prose around the JSON.
pub fn parse_checklist(reply: &str) -> anyhow::Result<(RubricChecklist, String)> {
    let v = extract_json(reply).ok_or_else(|| anyhow!("no JSON object in rubric reply"))?;
    let items = v["items"]
        .as_array()
        .context("rubric reply missing items array")?;
    if items.len() != RUBRIC_ITEMS {
        return Err(anyhow!(
            "expected {RUBRIC_ITEMS} rubric items, got {}",
            items.len()
        ));
    }

    let mut checklist = RubricChecklist::default();
    for (i, item) in items.iter().enumerate() {
        // Accept both {"elements": [..]} and a bare [..] per item.
        let elements = item
            .get("elements")
            .and_then(|e| e.as_array())
            .or_else(|| item.as_array())
            .with_context(|| format!("rubric item {i} has no elements"))?;
        if elements.len() != RUBRIC_ELEMENTS {
            return Err(anyhow!(
                "rubric item {i}: expected {RUBRIC_ELEMENTS} elements, got {}",
                elements.len()
            ));
        }
        let mut parsed = RubricItem::default();
        for (j, e) in elements.iter().enumerate() {
            parsed.elements[j] = e.as_bool().unwrap_or(false);
        }
        checklist.items[i] = parsed;
    }

    let feedback = v["feedback"].as_str().unwrap_or("").to_string();
    Ok((checklist, feedback))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
