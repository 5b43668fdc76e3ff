//! `DiffAnalyzer` (§4.3): commentable-line tracking over a unified diff,
//! nearest-commentable snapping, path-glob filtering, and security-path
//! detection.
//!
//! Parsing is done directly against the diff text via `Regex` statics,
//! grounded in the `LazyLock<Regex>` idiom from the teacher's
//! `signals::parser` — the analyzer works on diff text handed to it by the
//! abstract forge client, independent of any local clone.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

static DIFF_GIT_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^diff --git a/(.+?) b/(.+)$").unwrap());
static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,\d+)? @@").unwrap());
static RENAME_TO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^rename to (.+)$").unwrap());
static NEW_FILE_PATH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+\+\+ b/(.+)$").unwrap());

/// `require_literal_separator: true` so a single `*` never crosses a `/`,
/// matching §4.3's segment-scoped glob semantics (`*` within a segment,
/// `**` across segments) rather than `glob`'s default star-crosses-slash
/// behavior.
const GLOB_OPTIONS: glob::MatchOptions = glob::MatchOptions { case_sensitive: true, require_literal_separator: true, require_literal_leading_dot: false };

/// Right-side line numbers a file accepts inline comments on.
pub type CommentableLines = HashMap<String, BTreeSet<u32>>;

/// Walks a unified diff and returns, per file, the set of right-side line
/// numbers that may carry an inline review comment: context lines and
/// additions contribute; deletions do not.
pub fn parse_commentable_lines(diff: &str) -> CommentableLines {
    let mut result: CommentableLines = HashMap::new();
    let mut current_path: Option<String> = None;
    let mut right_line: u32 = 0;
    let mut in_hunk = false;

    for line in diff.lines() {
        if let Some(caps) = DIFF_GIT_HEADER.captures(line) {
            current_path = Some(caps.get(2).unwrap().as_str().to_string());
            in_hunk = false;
            continue;
        }
        if let Some(caps) = NEW_FILE_PATH.captures(line) {
            // `+++ b/path` is authoritative over the `diff --git` guess when
            // present (handles renames/quoted paths more precisely).
            let path = caps.get(1).unwrap().as_str();
            if path != "/dev/null" {
                current_path = Some(path.to_string());
            }
            continue;
        }
        if let Some(caps) = RENAME_TO.captures(line) {
            current_path = Some(caps.get(1).unwrap().as_str().to_string());
            continue;
        }
        if let Some(caps) = HUNK_HEADER.captures(line) {
            right_line = caps.get(1).unwrap().as_str().parse().unwrap_or(0);
            in_hunk = true;
            continue;
        }
        if !in_hunk || current_path.is_none() {
            continue;
        }
        let path = current_path.as_ref().unwrap();
        if let Some(rest) = line.strip_prefix('+') {
            let _ = rest;
            result.entry(path.clone()).or_default().insert(right_line);
            right_line += 1;
        } else if line.strip_prefix('-').is_some() {
            // deletions do not occupy a right-side line
        } else {
            // context line
            result.entry(path.clone()).or_default().insert(right_line);
            right_line += 1;
        }
    }

    result
}

/// Finds the nearest commentable line to `(path, line)` within
/// `max_distance`. Ties prefer downward (`line + d` before `line - d`).
/// Returns `None` if nothing qualifies (an orphan finding).
pub fn find_nearest_commentable(lines: &CommentableLines, path: &str, line: u32, max_distance: u32) -> Option<u32> {
    let set = lines.get(path)?;
    if set.contains(&line) {
        return Some(line);
    }
    for d in 1..=max_distance {
        let down = line + d;
        if set.contains(&down) {
            return Some(down);
        }
        if line > d {
            let up = line - d;
            if set.contains(&up) {
                return Some(up);
            }
        }
    }
    None
}

/// Strips whole-file diff sections whose new-file path matches any glob.
/// `*` matches within a path segment, `**` across segments; everything else
/// is escaped, per §4.3.
pub fn filter_diff(diff: &str, globs: &[String]) -> String {
    if globs.is_empty() {
        return diff.to_string();
    }
    let compiled: Vec<glob::Pattern> = globs.iter().filter_map(|g| glob::Pattern::new(g).ok()).collect();

    let mut out = String::new();
    let mut skipping = false;
    for line in diff.lines() {
        if let Some(caps) = DIFF_GIT_HEADER.captures(line) {
            let path = caps.get(2).unwrap().as_str();
            skipping = compiled.iter().any(|p| p.matches_with(path, GLOB_OPTIONS));
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// All distinct new-file paths touched by the diff, in first-seen order.
pub fn diff_paths(diff: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut paths = Vec::new();
    for line in diff.lines() {
        if let Some(caps) = DIFF_GIT_HEADER.captures(line) {
            let path = caps.get(2).unwrap().as_str().to_string();
            if seen.insert(path.clone()) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Intersection of the diff's paths with the configured security globs,
/// surfaced to the LLM prompt for elevated scrutiny.
pub fn find_security_paths(diff: &str, security_globs: &[String]) -> Vec<String> {
    let compiled: Vec<glob::Pattern> = security_globs.iter().filter_map(|g| glob::Pattern::new(g).ok()).collect();
    diff_paths(diff).into_iter().filter(|p| compiled.iter().any(|g| g.matches_with(p, GLOB_OPTIONS))).collect()
}
