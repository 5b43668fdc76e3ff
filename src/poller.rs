//! `PollerLoop` (§4.7), `VerificationLoop` (§4.11 — `poller::verify`) and
//! `Cleanup` (§4.12 — `poller::cleanup`).
//!
//! The tick loop follows the teacher's `orchestrator::runner::run_iteration`
//! elapsed-time updater: a `tokio::spawn`ed task looping on
//! `tokio::time::interval(...).tick().await` until told to stop. Here the
//! loop body does real work instead of a UI tick, and stop is a
//! `CancellationToken`-free flag — a single `AtomicBool` checked at the top of
//! each iteration, since the only consumer is `main`'s shutdown sequence.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{info, warn};

use vigil_common::{PrKey, PrStatus};

use crate::audit::{AuditEvent, AuditLogger};
use crate::config::Settings;
use crate::coordinator::{ReviewCoordinator, ReviewOverrides};
use crate::forge::{ForgeClient, PrState as ForgePrState};
use crate::worktree::WorktreeManager;

/// Shared stop flag checked between ticks. `main` flips it during graceful
/// shutdown; the spawned loop task notices within one tick.
#[derive(Default)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PollerLoop {
    settings: Settings,
    coordinator: Arc<ReviewCoordinator>,
    forge: Arc<dyn ForgeClient>,
    state: Arc<crate::state::StateStore>,
    worktree: Arc<WorktreeManager>,
    audit: Arc<AuditLogger>,
    stop: Arc<StopFlag>,
}

impl PollerLoop {
    pub fn new(
        settings: Settings,
        coordinator: Arc<ReviewCoordinator>,
        forge: Arc<dyn ForgeClient>,
        state: Arc<crate::state::StateStore>,
        worktree: Arc<WorktreeManager>,
        audit: Arc<AuditLogger>,
        stop: Arc<StopFlag>,
    ) -> Self {
        Self { settings, coordinator, forge, state, worktree, audit, stop }
    }

    /// Runs until `stop` is flipped. Each tick: sweep open PRs per tracked
    /// repo, reconcile untouched state entries, then run verification and
    /// cleanup. A failing repo is logged and skipped — it never blocks the
    /// rest of the tick, per §4.7 "each repo's errors are isolated".
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.settings.polling_interval());
        interval.tick().await;
        loop {
            if self.stop.is_stopped() {
                info!("poller loop stopping");
                return;
            }
            interval.tick().await;
            if self.stop.is_stopped() {
                return;
            }
            self.tick().await;
        }
    }

    /// §4.7's "the poll itself is single-threaded, concurrency across PRs
    /// comes from ReviewCoordinator's own parallelism": listing PRs stays
    /// sequential per repo, but each PR is handed off as a spawned task so
    /// the sweep doesn't serialize on review duration — the coordinator's
    /// own semaphore and per-PR mutex are what bound and order the work.
    async fn tick(&self) {
        let mut seen: HashSet<PrKey> = HashSet::new();
        let mut submitted = Vec::new();

        for repo in &self.settings.repos {
            match self.forge.list_open_prs(&repo.owner, &repo.repo).await {
                Ok(prs) => {
                    for pr in prs {
                        let key = PrKey::new(&pr.owner, &pr.repo, pr.number);
                        seen.insert(key);
                        let coordinator = self.coordinator.clone();
                        submitted.push(tokio::spawn(async move {
                            let outcome = coordinator.process_pr(&pr, false, ReviewOverrides::default()).await;
                            (pr.repo, pr.number, outcome)
                        }));
                    }
                }
                Err(e) => {
                    warn!(owner = %repo.owner, repo = %repo.repo, error = %e, "failed to list open prs, skipping repo this tick");
                }
            }
        }

        for handle in submitted {
            match handle.await {
                Ok((repo, number, outcome)) => {
                    tracing::debug!(repo = %repo, number, outcome = ?outcome, "poll sweep processed pr");
                }
                Err(e) => warn!(error = %e, "poll sweep task panicked"),
            }
        }

        self.reconcile_unseen(&seen).await;
        self.verify().await;
        self.cleanup().await;
    }

    /// Any tracked-repo entry in `StateStore` not present in this tick's
    /// sweep has left the open-PR set on the forge side; ask the forge what
    /// actually happened and reconcile to `merged`/`closed`.
    async fn reconcile_unseen(&self, seen: &HashSet<PrKey>) {
        for key in self.state.keys().await {
            if seen.contains(&key) || !self.settings.is_tracked(key.owner(), key.repo()) {
                continue;
            }
            let Some(current) = self.state.get(&key).await else { continue };
            if current.status.is_terminal() {
                continue;
            }
            match self.forge.get_pr_details(key.owner(), key.repo(), key.number()).await {
                Ok(details) => {
                    let new_status = match details.state {
                        ForgePrState::Merged => Some(PrStatus::Merged),
                        ForgePrState::Closed => Some(PrStatus::Closed),
                        ForgePrState::Open => None,
                    };
                    if let Some(status) = new_status {
                        let _ = self
                            .state
                            .update(&key, |s| {
                                s.status = status;
                                s.closed_at = Some(Utc::now());
                            })
                            .await;
                        self.audit.record(AuditEvent::new(&key, "reconciled").with_detail(format!("{status}"))).await;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to reconcile unseen pr");
                }
            }
        }
    }

    /// VerificationLoop (§4.11). For each `reviewed` entry due per
    /// `commentVerifyIntervalMinutes`, probe the forge for whether the
    /// posted artifact still exists; if it was dismissed or deleted, reset to
    /// `pending_review` so the next sweep re-reviews.
    async fn verify(&self) {
        let interval = chrono::Duration::minutes(self.settings.operational.comment_verify_interval_minutes);
        let now = Utc::now();

        for state in self.state.get_all().await {
            if state.status != PrStatus::Reviewed {
                continue;
            }
            if let Some(last) = state.last_verified_at
                && now - last < interval
            {
                continue;
            }

            let key = state.key();
            let still_present = self.probe_artifact(&state).await;

            let _ = self.state.update(&key, |s| s.last_verified_at = Some(now)).await;

            if !still_present {
                let _ = self
                    .state
                    .update(&key, |s| {
                        s.status = PrStatus::PendingReview;
                        s.review_id = None;
                        s.comment_id = None;
                    })
                    .await;
                self.audit.record(AuditEvent::new(&key, "verification_reset")).await;
            }
        }
    }

    async fn probe_artifact(&self, state: &vigil_common::PrState) -> bool {
        if let Some(review_id) = &state.review_id {
            return match self.forge.review_exists(&state.owner, &state.repo, state.number, review_id).await {
                Ok(existence) => existence.exists && !existence.dismissed,
                Err(e) => {
                    warn!(owner = %state.owner, repo = %state.repo, number = state.number, error = %e, "review_exists probe failed, assuming present");
                    true
                }
            };
        }
        if let Some(comment_id) = &state.comment_id {
            return match self.forge.comment_exists(&state.owner, &state.repo, comment_id).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(owner = %state.owner, repo = %state.repo, number = state.number, error = %e, "comment_exists probe failed, assuming present");
                    true
                }
            };
        }
        true
    }

    /// Cleanup (§4.12). Removes old terminal/error entries and prunes
    /// worktree state.
    async fn cleanup(&self) {
        let now = Utc::now();
        let stale_closed = chrono::Duration::days(self.settings.operational.stale_closed_days);
        let stale_error = chrono::Duration::days(self.settings.operational.stale_error_days);
        let max_retries = self.settings.review.max_retries;

        let mut to_remove = Vec::new();
        for state in self.state.get_all().await {
            let age_ref = state.closed_at.unwrap_or(state.updated_at);
            let is_stale_closed = matches!(state.status, PrStatus::Closed | PrStatus::Merged) && now - age_ref >= stale_closed;
            let is_stale_error = state.status == PrStatus::Error && state.consecutive_errors >= max_retries && now - state.updated_at >= stale_error;
            if is_stale_closed || is_stale_error {
                to_remove.push(state.key());
            }
        }

        if !to_remove.is_empty() {
            match self.state.delete_many(&to_remove).await {
                Ok(n) => info!(count = n, "pruned stale state entries"),
                Err(e) => warn!(error = %e, "failed to prune stale state entries"),
            }
        }

        let pruned_worktrees = self.worktree.prune_stale_worktrees(self.settings.operational.stale_worktree_minutes).await;
        if pruned_worktrees > 0 {
            info!(count = pruned_worktrees, "pruned stale worktrees");
        }
        let pruned_clones = self.worktree.prune_untracked(&self.settings.tracked_slugs()).await;
        if pruned_clones > 0 {
            info!(count = pruned_clones, "pruned untracked bare clones");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureToggles, OperationalConfig, ReviewConfig, TrackedRepo};
    use crate::decision::SystemClock;
    use crate::features::FeatureRunner;
    use crate::forge::{InlineComment, PrDetails, PullRequest, ReviewEvent, ReviewExistence, ReviewThread};
    use crate::llm::LlmClient;
    use crate::metrics::MetricsCollector;
    use crate::ratelimit::RateLimitGuard;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use vigil_common::PrState;

    #[derive(Default)]
    struct StubForge {
        details: StdMutex<Option<PrDetails>>,
    }

    #[async_trait]
    impl ForgeClient for StubForge {
        async fn list_open_prs(&self, _owner: &str, _repo: &str) -> Result<Vec<PullRequest>, crate::errors::ForgeError> {
            Ok(vec![])
        }
        async fn get_pr_details(&self, _owner: &str, _repo: &str, _number: u64) -> Result<PrDetails, crate::errors::ForgeError> {
            Ok(self.details.lock().unwrap().clone().unwrap_or(PrDetails { state: ForgePrState::Open, merged_at: None }))
        }
        async fn get_pr_diff(&self, _owner: &str, _repo: &str, _number: u64) -> Result<String, crate::errors::ForgeError> {
            Ok(String::new())
        }
        async fn get_pr_body(&self, _owner: &str, _repo: &str, _number: u64) -> Result<String, crate::errors::ForgeError> {
            Ok(String::new())
        }
        async fn update_pr_body(&self, _owner: &str, _repo: &str, _number: u64, _body: &str) -> Result<(), crate::errors::ForgeError> {
            Ok(())
        }
        async fn get_pr_labels(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<String>, crate::errors::ForgeError> {
            Ok(vec![])
        }
        async fn add_labels(&self, _owner: &str, _repo: &str, _number: u64, _labels: &[String]) -> Result<(), crate::errors::ForgeError> {
            Ok(())
        }
        async fn remove_labels(&self, _owner: &str, _repo: &str, _number: u64, _labels: &[String]) -> Result<(), crate::errors::ForgeError> {
            Ok(())
        }
        async fn find_existing_comment(&self, _owner: &str, _repo: &str, _number: u64, _tag: &str) -> Result<Option<String>, crate::errors::ForgeError> {
            Ok(None)
        }
        async fn post_comment(&self, _owner: &str, _repo: &str, _number: u64, _body: &str) -> Result<String, crate::errors::ForgeError> {
            Ok("c1".into())
        }
        async fn update_comment(&self, _owner: &str, _repo: &str, _comment_id: &str, _body: &str) -> Result<(), crate::errors::ForgeError> {
            Ok(())
        }
        async fn delete_comment(&self, _owner: &str, _repo: &str, _comment_id: &str) -> Result<(), crate::errors::ForgeError> {
            Ok(())
        }
        async fn comment_exists(&self, _owner: &str, _repo: &str, _comment_id: &str) -> Result<bool, crate::errors::ForgeError> {
            Ok(false)
        }
        async fn post_review(
            &self,
            _owner: &str,
            _repo: &str,
            _number: u64,
            _body: &str,
            _commit_id: &str,
            _inline_comments: &[InlineComment],
            _event: ReviewEvent,
        ) -> Result<String, crate::errors::ForgeError> {
            Ok("r1".into())
        }
        async fn review_exists(&self, _owner: &str, _repo: &str, _number: u64, _review_id: &str) -> Result<ReviewExistence, crate::errors::ForgeError> {
            Ok(ReviewExistence { exists: false, dismissed: true })
        }
        async fn get_review_threads(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<ReviewThread>, crate::errors::ForgeError> {
            Ok(vec![])
        }
        async fn resolve_review_thread(&self, _owner: &str, _repo: &str, _thread_id: &str) -> Result<(), crate::errors::ForgeError> {
            Ok(())
        }
        async fn get_clone_url(&self, _owner: &str, _repo: &str) -> Result<String, crate::errors::ForgeError> {
            Ok("https://example.invalid/repo.git".into())
        }
    }

    async fn make_poller(dir: &std::path::Path) -> PollerLoop {
        let settings = Settings {
            repos: vec![TrackedRepo { owner: "acme".into(), repo: "widgets".into() }],
            mode: crate::config::Mode::Polling,
            forge_token: "t".into(),
            webhook_secret: None,
            llm_cmd: "true".into(),
            review: ReviewConfig::default(),
            operational: OperationalConfig::default(),
            features: FeatureToggles::default(),
        };
        let forge: Arc<dyn ForgeClient> = Arc::new(StubForge::default());
        let state = Arc::new(crate::state::StateStore::load(dir.join("state.json")).await);
        let worktree = Arc::new(WorktreeManager::new(dir.join("clones"), std::time::Duration::from_secs(5)));
        let audit = Arc::new(AuditLogger::new(dir.join("audit"), 100).await);
        let coordinator = Arc::new(ReviewCoordinator::new(
            state.clone(),
            forge.clone(),
            Arc::new(LlmClient::new("true")),
            worktree.clone(),
            Arc::new(RateLimitGuard::new()),
            Arc::new(MetricsCollector::new()),
            Arc::new(FeatureRunner::new(vec![])),
            Arc::new(SystemClock),
            ReviewConfig::default(),
            OperationalConfig::default(),
        ));
        PollerLoop::new(settings, coordinator, forge, state, worktree, audit, Arc::new(StopFlag::new()))
    }

    #[tokio::test]
    async fn reconcile_unseen_leaves_open_prs_alone() {
        let dir = tempfile::tempdir().unwrap();
        let poller = make_poller(dir.path()).await;
        let key = PrKey::new("acme", "widgets", 7);
        poller
            .state
            .get_or_create(&key, || PrState::new_seen("acme", "widgets", 7, "t", "a1", "main", "feat", false, Utc::now()))
            .await
            .unwrap();

        let seen = HashSet::new();
        poller.reconcile_unseen(&seen).await;
        // The stub forge reports Open by default, so an entry missing from
        // this tick's sweep is left as-is rather than force-closed.
        let after = poller.state.get(&key).await.unwrap();
        assert_eq!(after.status, PrStatus::PendingReview);
    }

    #[tokio::test]
    async fn cleanup_prunes_stale_closed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let poller = make_poller(dir.path()).await;
        let key = PrKey::new("acme", "widgets", 9);
        poller
            .state
            .get_or_create(&key, || {
                let mut s = PrState::new_seen("acme", "widgets", 9, "t", "a1", "main", "feat", false, Utc::now() - chrono::Duration::days(60));
                s.status = PrStatus::Closed;
                s.closed_at = Some(Utc::now() - chrono::Duration::days(60));
                s
            })
            .await
            .unwrap();

        poller.cleanup().await;
        assert!(poller.state.get(&key).await.is_none());
    }
}
