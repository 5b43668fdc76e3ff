//! Shared data model for the review lifecycle: PR identity, persisted state,
//! the structured review shape produced by the LLM, and the small value
//! types threaded between the state store, the decision engine, and the
//! review coordinator.
//!
//! Kept dependency-free of any I/O so it can be shared by the core crate and
//! by anything that wants to read `state.json` without pulling in tokio.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod key;
pub use key::PrKey;

/// Current schema version of the persisted state file. Bump and add a
/// migration arm in `vigil`'s `state::migrate` whenever this shape changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Default cap on the number of `ReviewRecord`s retained per PR.
pub const DEFAULT_MAX_REVIEW_HISTORY: usize = 20;

/// Default cap on the number of `FeatureExecution`s retained per PR.
pub const DEFAULT_MAX_FEATURE_EXECUTIONS: usize = 40;

/// Lifecycle status of a tracked pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    /// Seen, never reviewed, eligible.
    PendingReview,
    /// A review is actively in flight (never persists across a restart).
    Reviewing,
    /// `lastReviewedSha == headSha`; nothing new to review.
    Reviewed,
    /// Reviewed once, then new commits landed.
    ChangesPushed,
    /// Deliberately not reviewed (draft, wip title, diff too large, ...).
    Skipped,
    /// Review attempts have failed; see `last_error`.
    Error,
    /// Terminal: merged.
    Merged,
    /// Terminal: closed without merging.
    Closed,
}

impl PrStatus {
    /// Terminal sink states never leave once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, PrStatus::Merged | PrStatus::Closed)
    }
}

impl fmt::Display for PrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrStatus::PendingReview => "pending_review",
            PrStatus::Reviewing => "reviewing",
            PrStatus::Reviewed => "reviewed",
            PrStatus::ChangesPushed => "changes_pushed",
            PrStatus::Skipped => "skipped",
            PrStatus::Error => "error",
            PrStatus::Merged => "merged",
            PrStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Overall recommendation of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
    Comment,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReviewVerdict::Approve => "APPROVE",
            ReviewVerdict::RequestChanges => "REQUEST_CHANGES",
            ReviewVerdict::Comment => "COMMENT",
            ReviewVerdict::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Severity of a single review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Issue,
    Suggestion,
    Nitpick,
    Question,
    Praise,
}

impl FindingSeverity {
    /// `praise` findings are never inline; they always live in the orphan
    /// section of the review body.
    pub fn always_orphan(self) -> bool {
        matches!(self, FindingSeverity::Praise)
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FindingSeverity::Issue => "issue",
            FindingSeverity::Suggestion => "suggestion",
            FindingSeverity::Nitpick => "nitpick",
            FindingSeverity::Question => "question",
            FindingSeverity::Praise => "praise",
        };
        write!(f, "{s}")
    }
}

/// A single reviewer observation with severity, blocking flag, and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: FindingSeverity,
    #[serde(default)]
    pub blocking: bool,
    pub path: String,
    pub line: u32,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_related: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_new: Option<bool>,
}

impl Finding {
    pub fn new(severity: FindingSeverity, path: impl Into<String>, line: u32, body: impl Into<String>) -> Self {
        Self {
            severity,
            blocking: false,
            path: path.into(),
            line,
            body: body.into(),
            confidence: None,
            security_related: None,
            is_new: None,
        }
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_security_related(mut self, security_related: bool) -> Self {
        self.security_related = Some(security_related);
        self
    }

    pub fn with_is_new(mut self, is_new: bool) -> Self {
        self.is_new = Some(is_new);
        self
    }

    /// A key unique to `path:line:body`, used to deduplicate prior findings
    /// across re-reviews and to match resolutions against them.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.path, self.line, self.body)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}:{} — {}", self.severity, self.path, self.line, self.body)
    }
}

/// Disposition of a previously-raised finding, reported only on re-reviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Resolved,
    WontFix,
    Open,
}

/// How the LLM judges a previously-raised finding at `path:line` on re-review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub path: String,
    pub line: u32,
    pub body: String,
    pub resolution: ResolutionState,
}

/// The JSON-validated shape produced by the LLM after parsing the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReview {
    #[serde(default = "default_unknown_verdict")]
    pub verdict: Option<ReviewVerdict>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_summary: Option<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<Vec<Resolution>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<String>,
}

fn default_unknown_verdict() -> Option<ReviewVerdict> {
    Some(ReviewVerdict::Unknown)
}

impl StructuredReview {
    pub fn verdict(&self) -> ReviewVerdict {
        self.verdict.unwrap_or(ReviewVerdict::Unknown)
    }

    pub fn non_praise_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.severity.always_orphan())
    }
}

/// One completed review of a PR at a given `sha`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub sha: String,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    pub verdict: ReviewVerdict,
    pub posted: bool,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

/// The kind of a recorded error, per §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Which phase of the coordinator an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialize,
    FetchDiff,
    PreReviewFeatures,
    PrepareWorktree,
    InvokeLlm,
    PostReview,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initialize => "initialize",
            Phase::FetchDiff => "fetch_diff",
            Phase::PreReviewFeatures => "pre_review_features",
            Phase::PrepareWorktree => "prepare_worktree",
            Phase::InvokeLlm => "invoke_llm",
            Phase::PostReview => "post_review",
            Phase::Finalize => "finalize",
        };
        write!(f, "{s}")
    }
}

/// The last recorded phase error for a PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    pub sha: String,
    pub occurred_at: DateTime<Utc>,
}

/// Outcome of a single feature's dispatch, recorded into the PR's bounded
/// `feature_executions` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Success,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureExecution {
    pub feature: String,
    pub phase: String,
    pub status: FeatureStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Durable, per-PR state. Identity is `(owner, repo, number)`; see `PrKey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrState {
    pub owner: String,
    pub repo: String,
    pub number: u64,

    pub status: PrStatus,

    pub title: String,
    pub head_sha: String,
    pub base_branch: String,
    pub head_branch: String,
    pub is_draft: bool,

    #[serde(default)]
    pub reviews: VecDeque<ReviewRecord>,
    #[serde(default)]
    pub last_reviewed_sha: Option<String>,
    #[serde(default)]
    pub last_reviewed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub skip_diff_lines: Option<u64>,
    #[serde(default)]
    pub skipped_at_sha: Option<String>,

    #[serde(default)]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub consecutive_errors: u32,

    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub review_id: Option<String>,
    #[serde(default)]
    pub last_verified_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub jira_key: Option<String>,
    #[serde(default)]
    pub jira_validated: Option<bool>,
    #[serde(default)]
    pub description_generated: bool,
    #[serde(default)]
    pub labels_applied: bool,
    #[serde(default)]
    pub feature_executions: VecDeque<FeatureExecution>,

    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_push_at: Option<DateTime<Utc>>,
}

impl PrState {
    /// A fresh entry for a PR sighted for the first time.
    pub fn new_seen(owner: &str, repo: &str, number: u64, title: &str, head_sha: &str, base_branch: &str, head_branch: &str, is_draft: bool, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
            status: PrStatus::PendingReview,
            title: title.to_string(),
            head_sha: head_sha.to_string(),
            base_branch: base_branch.to_string(),
            head_branch: head_branch.to_string(),
            is_draft,
            reviews: VecDeque::new(),
            last_reviewed_sha: None,
            last_reviewed_at: None,
            skip_reason: None,
            skip_diff_lines: None,
            skipped_at_sha: None,
            last_error: None,
            consecutive_errors: 0,
            comment_id: None,
            review_id: None,
            last_verified_at: None,
            jira_key: None,
            jira_validated: None,
            description_generated: false,
            labels_applied: false,
            feature_executions: VecDeque::new(),
            first_seen_at: now,
            updated_at: now,
            closed_at: None,
            last_push_at: None,
        }
    }

    pub fn key(&self) -> PrKey {
        PrKey::new(&self.owner, &self.repo, self.number)
    }

    /// Most recent review record, used as "previous review" context.
    pub fn previous_review(&self) -> Option<&ReviewRecord> {
        self.reviews.back()
    }

    pub fn push_review(&mut self, record: ReviewRecord, max_history: usize) {
        self.reviews.push_back(record);
        while self.reviews.len() > max_history {
            self.reviews.pop_front();
        }
    }

    pub fn push_feature_execution(&mut self, exec: FeatureExecution, max_executions: usize) {
        self.feature_executions.push_back(exec);
        while self.feature_executions.len() > max_executions {
            self.feature_executions.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(PrStatus::Merged.is_terminal());
        assert!(PrStatus::Closed.is_terminal());
        assert!(!PrStatus::Reviewed.is_terminal());
    }

    #[test]
    fn verdict_display() {
        assert_eq!(ReviewVerdict::Approve.to_string(), "APPROVE");
        assert_eq!(ReviewVerdict::RequestChanges.to_string(), "REQUEST_CHANGES");
    }

    #[test]
    fn finding_dedup_key() {
        let f = Finding::new(FindingSeverity::Issue, "src/x.ts", 10, "null deref");
        assert_eq!(f.dedup_key(), "src/x.ts:10:null deref");
    }

    #[test]
    fn praise_is_always_orphan() {
        assert!(FindingSeverity::Praise.always_orphan());
        assert!(!FindingSeverity::Issue.always_orphan());
    }

    #[test]
    fn review_history_truncates_from_head() {
        let mut state = PrState::new_seen("acme", "widgets", 1, "t", "a1", "main", "feat", false, Utc::now());
        for i in 0..5 {
            state.push_review(
                ReviewRecord {
                    sha: format!("sha{i}"),
                    reviewed_at: Utc::now(),
                    comment_id: None,
                    review_id: None,
                    verdict: ReviewVerdict::Comment,
                    posted: true,
                    findings: vec![],
                },
                3,
            );
        }
        assert_eq!(state.reviews.len(), 3);
        assert_eq!(state.reviews.front().unwrap().sha, "sha2");
        assert_eq!(state.reviews.back().unwrap().sha, "sha4");
    }

    #[test]
    fn structured_review_unknown_verdict_default() {
        let raw = r#"{"summary":"looks fine","findings":[]}"#;
        let review: StructuredReview = serde_json::from_str(raw).unwrap();
        assert_eq!(review.verdict(), ReviewVerdict::Unknown);
    }

    #[test]
    fn structured_review_rejects_nothing_but_tolerates_unknown_verdict_string() {
        let raw = r#"{"verdict":"WAT","summary":"x","findings":[]}"#;
        let review: StructuredReview = serde_json::from_str(raw).unwrap();
        assert_eq!(review.verdict(), ReviewVerdict::Unknown);
    }
}
