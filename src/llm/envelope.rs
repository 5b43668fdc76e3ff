//! Three-tier JSON extraction for `LlmEnvelope.result` (§6): the LLM is
//! asked to emit a single JSON object conforming to `StructuredReview`, but
//! may wrap it in prose or a fenced code block. Styled after the
//! `LazyLock<Regex>` statics in the teacher's `signals::parser`.

use std::sync::LazyLock;

use regex::Regex;
use vigil_common::StructuredReview;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Tier 1: the whole string is already valid JSON. Tier 2: a fenced
/// ` ```json ` block contains it. Tier 3: scan for the last well-formed
/// `{...}` object in mixed output by brace-depth counting. Returns `None`
/// (triggering freeform fallback, per §6) if no tier produces a value that
/// validates against `StructuredReview`.
pub fn extract_json(text: &str) -> Option<StructuredReview> {
    let trimmed = text.trim();

    if let Ok(review) = serde_json::from_str::<StructuredReview>(trimmed) {
        return Some(review);
    }

    if let Some(caps) = FENCED_JSON.captures(text) {
        let candidate = caps.get(1).unwrap().as_str();
        if let Ok(review) = serde_json::from_str::<StructuredReview>(candidate) {
            return Some(review);
        }
    }

    if let Some(candidate) = last_balanced_object(text) {
        if let Ok(review) = serde_json::from_str::<StructuredReview>(&candidate) {
            return Some(review);
        }
    }

    None
}

/// Scans `text` for the last top-level `{...}` span by tracking brace depth,
/// ignoring braces inside string literals. Handles mixed prose-then-JSON
/// output where the model talks before or after the object.
fn last_balanced_object(text: &str) -> Option<String> {
    let bytes: Vec<char> = text.chars().collect();
    let mut best: Option<String> = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == '{' {
            if let Some(end) = find_matching_brace(&bytes, i) {
                best = Some(bytes[i..=end].iter().collect());
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    best
}

fn find_matching_brace(bytes: &[char], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &c) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(offset);
                }
            }
            _ => {}
        }
    }
    None
}
