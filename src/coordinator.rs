//! `ReviewCoordinator` (§4.5): the lifecycle executor. Per-PR mutex with
//! re-check-after-wait, a seven-phase pipeline (initialize, fetch diff,
//! pre-review features, prepare worktree, invoke LLM, post review,
//! finalize), error classification, and per-phase timing into
//! `MetricsCollector`.
//!
//! The per-phase timing follows the teacher's `orchestrator::runner` pattern
//! of wrapping a phase in `Instant::now()`/`elapsed()` and recording into a
//! bounded rolling-window structure (`metrics.rs`). The per-PR mutex map is
//! `Mutex<HashMap<PrKey, Arc<tokio::sync::Mutex<()>>>>` with opportunistic
//! eviction of entries no longer referenced, per §9's "must release entries
//! after use to avoid unbounded growth".

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use vigil_common::{
    ErrorKind, Finding, FindingSeverity, LastError, Phase, PrKey, PrState, PrStatus, Resolution,
    ResolutionState, ReviewRecord, ReviewVerdict, StructuredReview,
};

use crate::config::{OperationalConfig, ReviewConfig};
use crate::decision::{Clock, should_review};
use crate::diff::{filter_diff, find_nearest_commentable, find_security_paths, parse_commentable_lines};
use crate::errors::ReviewError;
use crate::features::{FeatureContext, FeaturePhase, FeatureRunner};
use crate::forge::{ForgeClient, InlineComment, PrDetails, PullRequest, ReviewEvent};
use crate::llm::{LlmClient, LlmInvocation, RateSignal, envelope::extract_json};
use crate::metrics::MetricsCollector;
use crate::ratelimit::{PauseKind, RateLimitGuard};
use crate::state::StateStore;
use crate::worktree::WorktreeManager;

/// Per-request overrides parsed from a `/review` comment-trigger (§4.8).
#[derive(Debug, Clone, Default)]
pub struct ReviewOverrides {
    pub max_turns: Option<u32>,
    pub focus_paths: Option<Vec<String>>,
    pub skip_description: bool,
    pub skip_labels: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Reviewed,
    NotReviewed(String),
    Errored(String),
}

/// Default cooldowns for `RateLimitGuard::report` when the LLM CLI's own
/// wording is the only signal available (no `Retry-After` header to read at
/// this layer). Spending-limit pauses get a longer cooldown since they
/// reflect a billing-cycle condition rather than a short-lived throttle.
const RATE_LIMIT_COOLDOWN_SECS: u64 = 300;
const SPENDING_LIMIT_COOLDOWN_SECS: u64 = 3600;

pub struct ReviewCoordinator {
    state: Arc<StateStore>,
    forge: Arc<dyn ForgeClient>,
    llm: Arc<LlmClient>,
    worktree: Arc<WorktreeManager>,
    rate_limit: Arc<RateLimitGuard>,
    metrics: Arc<MetricsCollector>,
    features: Arc<FeatureRunner>,
    clock: Arc<dyn Clock>,
    review_cfg: ReviewConfig,
    operational_cfg: OperationalConfig,
    pr_locks: Mutex<HashMap<PrKey, Arc<Mutex<()>>>>,
    concurrency: Arc<Semaphore>,
    inflight: AtomicUsize,
}

impl ReviewCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateStore>,
        forge: Arc<dyn ForgeClient>,
        llm: Arc<LlmClient>,
        worktree: Arc<WorktreeManager>,
        rate_limit: Arc<RateLimitGuard>,
        metrics: Arc<MetricsCollector>,
        features: Arc<FeatureRunner>,
        clock: Arc<dyn Clock>,
        review_cfg: ReviewConfig,
        operational_cfg: OperationalConfig,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(operational_cfg.max_concurrent_reviews.max(1)));
        Self {
            state,
            forge,
            llm,
            worktree,
            rate_limit,
            metrics,
            features,
            clock,
            review_cfg,
            operational_cfg,
            pr_locks: Mutex::new(HashMap::new()),
            concurrency,
            inflight: AtomicUsize::new(0),
        }
    }

    /// Number of `process_pr` calls currently past the per-PR mutex and
    /// concurrency permit, i.e. actually mid-review. Used by the shutdown
    /// sequence (§5 "wait up to 60s for inflight > 0 to drain").
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Polls `inflight()` until it reaches zero or `timeout` elapses.
    pub async fn wait_for_drain(&self, timeout: std::time::Duration) {
        let start = Instant::now();
        while self.inflight() > 0 {
            if start.elapsed() >= timeout {
                warn!(remaining = self.inflight(), "shutdown drain timed out with reviews still in flight");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Returns the mutex for `key`, pruning entries that nothing else
    /// references before inserting/reusing one. A waiter that blocks here
    /// re-checks the PR's persisted state once the lock resolves — it always
    /// reads through `StateStore` fresh, never a value captured before
    /// waiting.
    async fn lock_for(&self, key: &PrKey) -> Arc<Mutex<()>> {
        let mut map = self.pr_locks.lock().await;
        map.retain(|_, v| Arc::strong_count(v) > 1);
        map.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Top-level entry point (§4.5 `processPR`). Acquires the per-PR mutex,
    /// a bounded concurrency permit, then runs the seven phases in order.
    pub async fn process_pr(&self, pr: &PullRequest, force_hint: bool, overrides: ReviewOverrides) -> ProcessOutcome {
        let key = PrKey::new(&pr.owner, &pr.repo, pr.number);
        let lock = self.lock_for(&key).await;
        let _pr_guard = lock.lock().await;
        let _permit = match self.concurrency.acquire().await {
            Ok(p) => p,
            Err(_) => return ProcessOutcome::Errored("concurrency semaphore closed".into()),
        };

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let total_start = Instant::now();
        let outcome = self.run_phases(&key, pr, force_hint, &overrides).await;
        self.metrics.record_phase(
            Phase::Finalize,
            total_start.elapsed(),
            matches!(outcome, ProcessOutcome::Errored(_)),
        );
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn run_phases(&self, key: &PrKey, pr: &PullRequest, force_hint: bool, overrides: &ReviewOverrides) -> ProcessOutcome {
        // Phase 1 — Initialize.
        let state = match self.phase_initialize(key, pr, force_hint).await {
            Ok(Some(state)) => state,
            Ok(None) => return ProcessOutcome::NotReviewed("decision engine declined".into()),
            Err(e) => return self.record_error(key, e).await,
        };

        // Phase 2 — Fetch diff.
        let (diff, status_comment_id) = match self.phase_fetch_diff(key, pr, &state).await {
            Ok(Outcome2::Continue(diff, comment_id)) => (diff, comment_id),
            Ok(Outcome2::Skipped(reason)) => return ProcessOutcome::NotReviewed(reason),
            Err(e) => return self.record_error(key, e).await,
        };

        // Phase 3 — Pre-review features.
        let state_after_features = self.phase_pre_review_features(key, &state, &diff, overrides).await;

        // Phase 4 — Prepare worktree.
        if let Err(e) = self.phase_prepare_worktree(pr, &state_after_features).await {
            self.delete_status_comment(pr, &status_comment_id).await;
            return self.record_error(key, e).await;
        }

        // Phase 5 — Invoke LLM.
        let structured = match self.phase_invoke_llm(pr, &state_after_features, &diff, overrides).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.delete_status_comment(pr, &status_comment_id).await;
                return self.record_error(key, e).await;
            }
        };

        // Phase 6 — Post review.
        let post_result = self.phase_post_review(pr, &state_after_features, &diff, structured).await;
        self.delete_status_comment(pr, &status_comment_id).await;

        let review_record = match post_result {
            Ok(record) => record,
            Err(e) => return self.record_error(key, e).await,
        };

        // Phase 7 — Finalize.
        self.phase_finalize(key, &state_after_features, &diff, review_record).await;
        ProcessOutcome::Reviewed
    }

    async fn record_error(&self, key: &PrKey, err: ReviewError) -> ProcessOutcome {
        warn!(%key, phase = %err.phase, kind = ?err.kind, message = %err.message, "review phase failed");
        let is_permanent = err.kind == ErrorKind::Permanent;
        let max_retries = self.review_cfg.max_retries;
        let _ = self
            .state
            .update(key, |s| {
                s.consecutive_errors = if is_permanent { max_retries } else { s.consecutive_errors + 1 };
                s.last_error = Some(LastError {
                    phase: err.phase,
                    kind: err.kind,
                    message: err.message.clone(),
                    sha: s.head_sha.clone(),
                    occurred_at: Utc::now(),
                });
                s.status = PrStatus::Error;
            })
            .await;
        self.metrics.incr("reviews_errored");
        ProcessOutcome::Errored(err.message)
    }

    // -- Phase 1: Initialize -------------------------------------------------

    async fn phase_initialize(&self, key: &PrKey, pr: &PullRequest, force_hint: bool) -> Result<Option<PrState>, ReviewError> {
        let start = Instant::now();
        let now = Utc::now();
        let state = self
            .state
            .get_or_create(key, || PrState::new_seen(&pr.owner, &pr.repo, pr.number, &pr.title, &pr.head_sha, &pr.base_branch, &pr.head_branch, pr.is_draft, now))
            .await
            .map_err(|e| ReviewError::transient(Phase::Initialize, e.to_string()))?;

        let head_sha_changed = state.head_sha != pr.head_sha;
        let cfg = &self.review_cfg;
        let updated = self
            .state
            .update(key, |s| {
                s.title = pr.title.clone();
                s.is_draft = pr.is_draft;
                s.base_branch = pr.base_branch.clone();
                s.head_branch = pr.head_branch.clone();
                if head_sha_changed {
                    s.head_sha = pr.head_sha.clone();
                    s.last_push_at = Some(now);
                }

                // Auto-transitions.
                if s.status == PrStatus::Reviewed && s.last_reviewed_sha.as_deref() != Some(s.head_sha.as_str()) {
                    s.status = PrStatus::ChangesPushed;
                }
                if s.status == PrStatus::Skipped {
                    let still_draft = cfg.skip_drafts && s.is_draft;
                    let still_wip = cfg.skip_wip && s.title.to_lowercase().starts_with("wip");
                    if !still_draft && !still_wip && s.skip_reason.as_deref() != Some("diff_too_large") {
                        s.status = PrStatus::PendingReview;
                        s.skip_reason = None;
                    }
                }

                // Skip policies.
                if cfg.skip_drafts && s.is_draft && s.status != PrStatus::Skipped {
                    s.status = PrStatus::Skipped;
                    s.skip_reason = Some("draft".into());
                } else if cfg.skip_wip && s.title.to_lowercase().starts_with("wip") && s.status != PrStatus::Skipped {
                    s.status = PrStatus::Skipped;
                    s.skip_reason = Some("wip_title".into());
                }
            })
            .await
            .map_err(|e| ReviewError::transient(Phase::Initialize, e.to_string()))?;

        self.metrics.record_phase(Phase::Initialize, start.elapsed(), false);

        let decision = should_review(&updated, cfg, force_hint, self.clock.as_ref());
        if !decision.should_review {
            info!(%key, reason = %decision.reason, "decision engine declined review");
            return Ok(None);
        }
        Ok(Some(updated))
    }

    // -- Phase 2: Fetch diff --------------------------------------------------

    async fn phase_fetch_diff(&self, key: &PrKey, pr: &PullRequest, _state: &PrState) -> Result<Outcome2, ReviewError> {
        let start = Instant::now();
        let raw_diff = self
            .forge
            .get_pr_diff(&pr.owner, &pr.repo, pr.number)
            .await
            .map_err(|e| ReviewError::new(Phase::FetchDiff, e.kind(), e.to_string()))?;
        let filtered = filter_diff(&raw_diff, &self.review_cfg.exclude_paths);
        let line_count = filtered.lines().count() as u64;
        self.metrics.record_phase(Phase::FetchDiff, start.elapsed(), false);

        if line_count > self.review_cfg.max_diff_lines {
            self.state
                .update(key, |s| {
                    s.status = PrStatus::Skipped;
                    s.skip_reason = Some("diff_too_large".into());
                    s.skip_diff_lines = Some(line_count);
                    s.skipped_at_sha = Some(s.head_sha.clone());
                })
                .await
                .map_err(|e| ReviewError::transient(Phase::FetchDiff, e.to_string()))?;
            return Ok(Outcome2::Skipped("diff_too_large".into()));
        }

        self.state
            .set_status(key, PrStatus::Reviewing)
            .await
            .map_err(|e| ReviewError::transient(Phase::FetchDiff, e.to_string()))?;

        let comment_id = if self.review_cfg.dry_run {
            None
        } else {
            match self.forge.post_comment(&pr.owner, &pr.repo, pr.number, "vigil is reviewing this PR...").await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(%key, error = %e, "failed to post transient status comment");
                    None
                }
            }
        };

        Ok(Outcome2::Continue(filtered, comment_id))
    }

    async fn delete_status_comment(&self, pr: &PullRequest, comment_id: &Option<String>) {
        if let Some(id) = comment_id {
            if let Err(e) = self.forge.delete_comment(&pr.owner, &pr.repo, id).await {
                warn!(owner = %pr.owner, repo = %pr.repo, number = pr.number, error = %e, "failed to delete transient status comment");
            }
        }
    }

    // -- Phase 3: Pre-review features ------------------------------------------

    async fn phase_pre_review_features(&self, key: &PrKey, state: &PrState, diff: &str, overrides: &ReviewOverrides) -> PrState {
        let start = Instant::now();
        let ctx = FeatureContext { phase: FeaturePhase::PreReview, state, diff: Some(diff) };
        let mut exclude: Vec<&str> = Vec::new();
        if overrides.skip_description {
            exclude.push("auto_description");
        }
        if overrides.skip_labels {
            exclude.push("auto_label");
        }
        let executions = self.features.run_excluding(FeaturePhase::PreReview, &ctx, &exclude).await;
        self.metrics.record_phase(Phase::PreReviewFeatures, start.elapsed(), false);

        let max_executions = self.review_cfg.max_feature_executions;
        match self
            .state
            .update(key, |s| {
                for exec in executions {
                    s.push_feature_execution(exec, max_executions);
                }
            })
            .await
        {
            Ok(updated) => updated,
            Err(_) => state.clone(),
        }
    }

    // -- Phase 4: Prepare worktree ---------------------------------------------

    async fn phase_prepare_worktree(&self, pr: &PullRequest, _state: &PrState) -> Result<(), ReviewError> {
        if !self.operational_cfg.enable_worktree {
            return Ok(());
        }
        let start = Instant::now();
        let clone_url = self
            .forge
            .get_clone_url(&pr.owner, &pr.repo)
            .await
            .map_err(|e| ReviewError::new(Phase::PrepareWorktree, e.kind(), e.to_string()))?;
        let result = self.worktree.prepare_for_pr(&pr.owner, &pr.repo, &clone_url, pr.number, &pr.head_sha).await;
        let is_error = result.is_err();
        self.metrics.record_phase(Phase::PrepareWorktree, start.elapsed(), is_error);
        result.map(|_| ()).map_err(|e| ReviewError::new(Phase::PrepareWorktree, e.kind(), e.to_string()))
    }

    // -- Phase 5: Invoke LLM -----------------------------------------------------

    async fn phase_invoke_llm(&self, pr: &PullRequest, state: &PrState, diff: &str, overrides: &ReviewOverrides) -> Result<LlmOutcomeKind, ReviewError> {
        let start = Instant::now();
        let prompt = self.build_prompt(pr, state, diff, overrides);
        let max_turns = overrides.max_turns.unwrap_or(self.review_cfg.llm_max_turns);
        let timeout = std::time::Duration::from_secs(self.review_cfg.llm_timeout_secs);

        self.rate_limit.acquire().await;
        let result = self.llm.invoke(LlmInvocation { prompt: &prompt, max_turns, timeout }).await;
        let is_error = result.is_err();
        self.metrics.record_phase(Phase::InvokeLlm, start.elapsed(), is_error);

        if let Err(e) = &result {
            match e.rate_signal() {
                Some(RateSignal::RateLimit) => self.rate_limit.report(PauseKind::RateLimit, RATE_LIMIT_COOLDOWN_SECS),
                Some(RateSignal::SpendingLimit) => self.rate_limit.report(PauseKind::SpendingLimit, SPENDING_LIMIT_COOLDOWN_SECS),
                None => {}
            }
        }

        let outcome = result.map_err(|e| ReviewError::transient(Phase::InvokeLlm, e.to_string()))?;
        match extract_json(&outcome.envelope.result) {
            Some(review) => Ok(LlmOutcomeKind::Structured(review)),
            None => Ok(LlmOutcomeKind::Freeform(outcome.envelope.result)),
        }
    }

    fn build_prompt(&self, pr: &PullRequest, state: &PrState, diff: &str, overrides: &ReviewOverrides) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("# Pull request: {}\n\n", pr.title));

        if let Some(previous) = state.previous_review() {
            prompt.push_str(&format!(
                "## Previous review\nverdict: {}\nsha: {}\nprior findings:\n",
                previous.verdict, previous.sha
            ));
            for finding in &previous.findings {
                prompt.push_str(&format!("- {}\n", finding));
            }
            prompt.push('\n');
        }

        let security_paths = find_security_paths(diff, &self.review_cfg.security_paths);
        if !security_paths.is_empty() {
            prompt.push_str("## Security-sensitive paths (elevated scrutiny)\n");
            for path in &security_paths {
                prompt.push_str(&format!("- {path}\n"));
            }
            prompt.push('\n');
        }

        if let Some(focus) = &overrides.focus_paths {
            prompt.push_str("## Focus paths requested by reviewer\n");
            for path in focus {
                prompt.push_str(&format!("- {path}\n"));
            }
            prompt.push('\n');
        }

        prompt.push_str("## Diff\n```diff\n");
        prompt.push_str(diff);
        prompt.push_str("\n```\n\n");
        prompt.push_str(
            "Respond with a single JSON object matching: {verdict, summary, prSummary?, findings: \
             [{severity, blocking, path, line, body, confidence?, securityRelated?, isNew?}], \
             resolutions?: [{path, line, body, resolution}], overall?}.",
        );
        prompt
    }

    // -- Phase 6: Post review -----------------------------------------------------

    async fn phase_post_review(&self, pr: &PullRequest, state: &PrState, diff: &str, outcome: LlmOutcomeKind) -> Result<ReviewRecord, ReviewError> {
        let start = Instant::now();
        let record = match outcome {
            LlmOutcomeKind::Structured(mut review) => {
                self.escalate_verdict(state, &mut review);
                let record = self.post_structured_review(pr, state, diff, &review).await?;
                record
            }
            LlmOutcomeKind::Freeform(text) => self.post_freeform_fallback(pr, &text).await?,
        };
        self.metrics.record_phase(Phase::PostReview, start.elapsed(), false);
        Ok(record)
    }

    /// §4.5 Phase 6 "Verdict escalation": any previously-blocking finding
    /// left unresolved in the current review's `resolutions` forces
    /// REQUEST_CHANGES.
    fn escalate_verdict(&self, state: &PrState, review: &mut StructuredReview) {
        let Some(previous) = state.previous_review() else { return };
        let blocking: Vec<&Finding> = previous.findings.iter().filter(|f| f.blocking).collect();
        if blocking.is_empty() {
            return;
        }
        let resolutions = review.resolutions.clone().unwrap_or_default();
        let any_unresolved = blocking.iter().any(|finding| {
            let resolution = resolutions.iter().find(|r| r.path == finding.path && r.line == finding.line);
            match resolution {
                Some(r) => r.resolution == ResolutionState::Open,
                None => true,
            }
        });
        if any_unresolved {
            review.verdict = Some(ReviewVerdict::RequestChanges);
        }
    }

    async fn post_structured_review(&self, pr: &PullRequest, state: &PrState, diff: &str, review: &StructuredReview) -> Result<ReviewRecord, ReviewError> {
        let commentable = parse_commentable_lines(diff);
        let mut inline_comments = Vec::new();
        let mut orphans: Vec<&Finding> = Vec::new();

        for finding in review.non_praise_findings() {
            match find_nearest_commentable(&commentable, &finding.path, finding.line, self.review_cfg.snap_max_distance) {
                Some(line) => inline_comments.push(InlineComment { path: finding.path.clone(), line, body: finding.body.clone() }),
                None => orphans.push(finding),
            }
        }

        let body = self.compose_review_body(state, review, &orphans);
        let verdict = review.verdict();
        let event = if verdict == ReviewVerdict::Approve { ReviewEvent::Approve } else { ReviewEvent::Comment };

        let review_id = if self.review_cfg.dry_run {
            None
        } else {
            let id = self
                .forge
                .post_review(&pr.owner, &pr.repo, pr.number, &body, &pr.head_sha, &inline_comments, event)
                .await
                .map_err(|e| ReviewError::new(Phase::PostReview, e.kind(), e.to_string()))?;
            self.try_resolve_threads(pr, state, review).await;
            Some(id)
        };

        Ok(ReviewRecord {
            sha: pr.head_sha.clone(),
            reviewed_at: Utc::now(),
            comment_id: None,
            review_id,
            verdict,
            posted: !self.review_cfg.dry_run,
            findings: review.findings.clone(),
        })
    }

    fn compose_review_body(&self, state: &PrState, review: &StructuredReview, orphans: &[&Finding]) -> String {
        let mut body = String::new();
        body.push_str(&format!("### Summary\n{}\n\n", review.summary));

        if let Some(pr_summary) = &review.pr_summary {
            body.push_str(&format!("### PR summary\n{pr_summary}\n\n"));
        }

        for severity in [FindingSeverity::Issue, FindingSeverity::Suggestion, FindingSeverity::Nitpick, FindingSeverity::Question, FindingSeverity::Praise] {
            let group: Vec<&Finding> = review.findings.iter().filter(|f| f.severity == severity).collect();
            if group.is_empty() {
                continue;
            }
            body.push_str(&format!("### {severity}\n"));
            for finding in group {
                body.push_str(&format!("- {finding}\n"));
            }
            body.push('\n');
        }

        if !orphans.is_empty() {
            body.push_str("### Additional notes (outside the diff's commentable range)\n");
            for finding in orphans {
                body.push_str(&format!("- {finding}\n"));
            }
            body.push('\n');
        }

        if let Some(resolutions) = &review.resolutions {
            body.push_str("### Resolution of prior findings\n");
            for r in resolutions {
                body.push_str(&format!("- {}:{} — {:?}: {}\n", r.path, r.line, r.resolution, r.body));
            }
            body.push('\n');
        }

        if let Some(overall) = &review.overall {
            body.push_str(&format!("### Overall\n{overall}\n\n"));
        }

        body.push_str(&format!("---\n_Reviewed at `{}`._\n", state.head_sha));
        body
    }

    /// Best-effort thread resolution (§4.5): matches by textual body
    /// containment against the union of prior finding bodies at the same
    /// `path:line`, per the open question in §9 accepted as-is.
    async fn try_resolve_threads(&self, pr: &PullRequest, state: &PrState, review: &StructuredReview) {
        let Some(resolutions) = &review.resolutions else { return };
        let resolved: Vec<&Resolution> = resolutions.iter().filter(|r| r.resolution == ResolutionState::Resolved).collect();
        if resolved.is_empty() {
            return;
        }
        let prior_bodies: Vec<&Finding> = state.reviews.iter().flat_map(|r| r.findings.iter()).collect();

        let threads = match self.forge.get_review_threads(&pr.owner, &pr.repo, pr.number).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to fetch review threads for resolution pass");
                return;
            }
        };

        for resolution in resolved {
            let candidate_bodies: Vec<&str> = prior_bodies
                .iter()
                .filter(|f| f.path == resolution.path && f.line == resolution.line)
                .map(|f| f.body.as_str())
                .collect();
            for thread in &threads {
                if thread.is_resolved || thread.path != resolution.path || thread.line != resolution.line {
                    continue;
                }
                let matches = candidate_bodies.iter().any(|b| thread.body.contains(b) || b.contains(thread.body.as_str()));
                if matches {
                    if let Err(e) = self.forge.resolve_review_thread(&pr.owner, &pr.repo, &thread.id).await {
                        warn!(error = %e, thread = %thread.id, "failed to resolve review thread");
                    }
                }
            }
        }
    }

    async fn post_freeform_fallback(&self, pr: &PullRequest, text: &str) -> Result<ReviewRecord, ReviewError> {
        let tag = &self.review_cfg.comment_tag;
        let body = format!("{tag}\n{text}");
        let comment_id = if self.review_cfg.dry_run {
            None
        } else {
            match self.forge.find_existing_comment(&pr.owner, &pr.repo, pr.number, tag).await {
                Ok(Some(existing)) => {
                    self.forge
                        .update_comment(&pr.owner, &pr.repo, &existing, &body)
                        .await
                        .map_err(|e| ReviewError::new(Phase::PostReview, e.kind(), e.to_string()))?;
                    Some(existing)
                }
                _ => {
                    let id = self
                        .forge
                        .post_comment(&pr.owner, &pr.repo, pr.number, &body)
                        .await
                        .map_err(|e| ReviewError::new(Phase::PostReview, e.kind(), e.to_string()))?;
                    Some(id)
                }
            }
        };

        Ok(ReviewRecord {
            sha: pr.head_sha.clone(),
            reviewed_at: Utc::now(),
            comment_id,
            review_id: None,
            verdict: ReviewVerdict::Unknown,
            posted: !self.review_cfg.dry_run,
            findings: Vec::new(),
        })
    }

    // -- Phase 7: Finalize ---------------------------------------------------

    async fn phase_finalize(&self, key: &PrKey, state: &PrState, diff: &str, record: ReviewRecord) {
        let start = Instant::now();
        let max_history = self.review_cfg.max_review_history;
        let max_executions = self.review_cfg.max_feature_executions;
        let sha = record.sha.clone();
        let comment_id = record.comment_id.clone();
        let review_id = record.review_id.clone();

        let ctx = FeatureContext { phase: FeaturePhase::PostReview, state, diff: Some(diff) };
        let executions = self.features.run(FeaturePhase::PostReview, &ctx).await;

        let result = self
            .state
            .update(key, |s| {
                // A concurrent lifecycle webhook may have transitioned this
                // PR to a terminal status while we were mid-review; never
                // clobber that with a stale review record.
                if s.status.is_terminal() {
                    return;
                }
                for exec in executions {
                    s.push_feature_execution(exec, max_executions);
                }
                s.push_review(record, max_history);
                s.last_reviewed_sha = Some(sha.clone());
                s.last_reviewed_at = Some(Utc::now());
                s.comment_id = comment_id.clone();
                s.review_id = review_id.clone();
                s.consecutive_errors = 0;
                s.last_error = None;
                s.skip_reason = None;
                s.skip_diff_lines = None;
                s.status = PrStatus::Reviewed;
            })
            .await;

        if let Err(e) = result {
            warn!(%key, error = %e, "failed to finalize review state");
        }
        self.metrics.incr("reviews_posted");
        self.metrics.record_phase(Phase::Finalize, start.elapsed(), false);
    }
}

enum Outcome2 {
    Continue(String, Option<String>),
    Skipped(String),
}

enum LlmOutcomeKind {
    Structured(StructuredReview),
    Freeform(String),
}
