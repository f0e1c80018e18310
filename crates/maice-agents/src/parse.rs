// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tolerant extraction of structured replies. Models wrap JSON in prose
//! and code fences no matter how firmly the prompt forbids it.

use serde_json::Value;

/// Extract the first JSON object or array embedded in `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    for open in ['{', '['] {
        let close = if open == '{' { '}' } else { ']' };
        let Some(start) = text.find(open) else {
            continue;
        };
        // Walk to the matching close, respecting nesting and strings.
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in text[start..].char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                c if c == open && !in_string => depth += 1,
                c if c == close && !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + i + c.len_utf8()];
                        if let Ok(v) = serde_json::from_str(candidate) {
                            return Some(v);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Extract a list of strings: a JSON array if present, otherwise
/// non-empty lines (numbered bullets stripped).
pub fn extract_string_list(text: &str) -> Vec<String> {
    if let Some(Value::Array(items)) = extract_json(text) {
        let strings: Vec<String> = items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if !strings.is_empty() {
            return strings;
        }
    }
    text.lines()
        .map(|l| l.trim().trim_start_matches(['-', '*', ' ']))
        .map(|l| l.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')'))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_object_parses() {
        let v = extract_json(r#"{"decision": "answerable"}"#).unwrap();
        assert_eq!(v["decision"], "answerable");
    }

    #[test]
    fn object_in_prose_and_fences_parses() {
        let text = "Sure! Here is the verdict:\n```json\n{\"decision\": \"needs_clarify\", \"math_relatedness\": 0.9}\n```\nHope that helps.";
        let v = extract_json(text).unwrap();
        assert_eq!(v["decision"], "needs_clarify");
    }

    #[test]
    fn nested_braces_and_strings_survive() {
        let text = r#"prefix {"a": {"b": "close } brace in string"}, "c": 1} suffix"#;
        let v = extract_json(text).unwrap();
        assert_eq!(v["c"], 1);
        assert_eq!(v["a"]["b"], "close } brace in string");
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{broken").is_none());
    }

    #[test]
    fn string_list_from_json_array() {
        let items = extract_string_list(r#"["What topic?", "What level?"]"#);
        assert_eq!(items, vec!["What topic?", "What level?"]);
    }

    #[test]
    fn string_list_from_numbered_lines() {
        let items = extract_string_list("1. What topic?\n2) What level?\n");
        assert_eq!(items, vec!["What topic?", "What level?"]);
    }

    #[test]
    fn json_array_roundtrip_value() {
        assert_eq!(
            extract_json(r#"[1, 2]"#),
            Some(json!([1, 2]))
        );
    }
}
