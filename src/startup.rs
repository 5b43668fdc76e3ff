//! `StartupRecovery` (§4.10): on boot, scans persisted state for PRs that
//! need re-queueing because the process was down when something changed.
//!
//! Bounded-batch concurrency via `futures::stream::iter(...).buffer_unordered(n)`,
//! grounded in the same bounded-worker-pool shape `ReviewCoordinator` uses
//! for `maxConcurrentReviews` (there a `tokio::sync::Semaphore`, here a
//! stream combinator — both cap in-flight work at a fixed N).

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use vigil_common::{PrState, PrStatus};

use crate::config::Settings;
use crate::coordinator::{ReviewCoordinator, ReviewOverrides};
use crate::forge::{ForgeClient, PrState as ForgePrState, PullRequest};
use crate::state::StateStore;

const RECOVERY_CONCURRENCY: usize = 3;

pub struct StartupRecovery {
    settings: Settings,
    state: Arc<StateStore>,
    forge: Arc<dyn ForgeClient>,
    coordinator: Arc<ReviewCoordinator>,
}

impl StartupRecovery {
    pub fn new(settings: Settings, state: Arc<StateStore>, forge: Arc<dyn ForgeClient>, coordinator: Arc<ReviewCoordinator>) -> Self {
        Self { settings, state, forge, coordinator }
    }

    /// `StateStore::load` already reset any `reviewing` entry to
    /// `pending_review`; this pass additionally reconciles merges/closes and
    /// new pushes that happened while the process was down, then re-queues
    /// whatever is left in a ready status.
    pub async fn run(&self) {
        let candidates: Vec<PrState> = self
            .state
            .get_all()
            .await
            .into_iter()
            .filter(|s| self.settings.is_tracked(&s.owner, &s.repo))
            .filter(|s| !s.status.is_terminal() && s.status != PrStatus::Skipped)
            .collect();

        if candidates.is_empty() {
            return;
        }
        info!(count = candidates.len(), "startup recovery scanning non-terminal entries");

        stream::iter(candidates)
            .for_each_concurrent(RECOVERY_CONCURRENCY, |entry| async move {
                self.recover_one(entry).await;
            })
            .await;
    }

    async fn recover_one(&self, entry: PrState) {
        let key = entry.key();
        let details = match self.forge.get_pr_details(&entry.owner, &entry.repo, entry.number).await {
            Ok(d) => d,
            Err(e) => {
                warn!(key = %key, error = %e, "startup recovery could not fetch pr details, leaving as-is");
                return;
            }
        };

        match details.state {
            ForgePrState::Merged => {
                let _ = self.state.update(&key, |s| {
                    s.status = PrStatus::Merged;
                    s.closed_at = Some(chrono::Utc::now());
                }).await;
                return;
            }
            ForgePrState::Closed => {
                let _ = self.state.update(&key, |s| {
                    s.status = PrStatus::Closed;
                    s.closed_at = Some(chrono::Utc::now());
                }).await;
                return;
            }
            ForgePrState::Open => {}
        }

        let new_commits = entry.last_reviewed_sha.as_deref() != Some(entry.head_sha.as_str());
        if new_commits && entry.status != PrStatus::ChangesPushed {
            let _ = self.state.update(&key, |s| s.status = PrStatus::ChangesPushed).await;
        }

        let pr = PullRequest {
            owner: entry.owner.clone(),
            repo: entry.repo.clone(),
            number: entry.number,
            title: entry.title.clone(),
            head_sha: entry.head_sha.clone(),
            base_branch: entry.base_branch.clone(),
            head_branch: entry.head_branch.clone(),
            is_draft: entry.is_draft,
        };
        let outcome = self.coordinator.process_pr(&pr, false, ReviewOverrides::default()).await;
        info!(key = %key, outcome = ?outcome, "startup recovery processed pr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureToggles, Mode, OperationalConfig, ReviewConfig, TrackedRepo};
    use crate::decision::SystemClock;
    use crate::errors::ForgeError;
    use crate::features::FeatureRunner;
    use crate::forge::{InlineComment, PrDetails, ReviewEvent, ReviewExistence, ReviewThread};
    use crate::llm::LlmClient;
    use crate::metrics::MetricsCollector;
    use crate::ratelimit::RateLimitGuard;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    struct ScriptedForge {
        state: StdMutex<ForgePrState>,
    }

    #[async_trait]
    impl ForgeClient for ScriptedForge {
        async fn list_open_prs(&self, _owner: &str, _repo: &str) -> Result<Vec<PullRequest>, ForgeError> {
            Ok(vec![])
        }
        async fn get_pr_details(&self, _owner: &str, _repo: &str, _number: u64) -> Result<PrDetails, ForgeError> {
            Ok(PrDetails { state: *self.state.lock().unwrap(), merged_at: None })
        }
        async fn get_pr_diff(&self, _owner: &str, _repo: &str, _number: u64) -> Result<String, ForgeError> {
            Ok(String::new())
        }
        async fn get_pr_body(&self, _owner: &str, _repo: &str, _number: u64) -> Result<String, ForgeError> {
            Ok(String::new())
        }
        async fn update_pr_body(&self, _owner: &str, _repo: &str, _number: u64, _body: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn get_pr_labels(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<String>, ForgeError> {
            Ok(vec![])
        }
        async fn add_labels(&self, _owner: &str, _repo: &str, _number: u64, _labels: &[String]) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn remove_labels(&self, _owner: &str, _repo: &str, _number: u64, _labels: &[String]) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn find_existing_comment(&self, _owner: &str, _repo: &str, _number: u64, _tag: &str) -> Result<Option<String>, ForgeError> {
            Ok(None)
        }
        async fn post_comment(&self, _owner: &str, _repo: &str, _number: u64, _body: &str) -> Result<String, ForgeError> {
            Ok("c1".into())
        }
        async fn update_comment(&self, _owner: &str, _repo: &str, _comment_id: &str, _body: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn delete_comment(&self, _owner: &str, _repo: &str, _comment_id: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn comment_exists(&self, _owner: &str, _repo: &str, _comment_id: &str) -> Result<bool, ForgeError> {
            Ok(true)
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
        ) -> Result<String, ForgeError> {
            Ok("r1".into())
        }
        async fn review_exists(&self, _owner: &str, _repo: &str, _number: u64, _review_id: &str) -> Result<ReviewExistence, ForgeError> {
            Ok(ReviewExistence { exists: true, dismissed: false })
        }
        async fn get_review_threads(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<ReviewThread>, ForgeError> {
            Ok(vec![])
        }
        async fn resolve_review_thread(&self, _owner: &str, _repo: &str, _thread_id: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn get_clone_url(&self, _owner: &str, _repo: &str) -> Result<String, ForgeError> {
            Ok("https://example.invalid/repo.git".into())
        }
    }

    async fn make_recovery(dir: &std::path::Path, forge_state: ForgePrState) -> (StartupRecovery, Arc<StateStore>) {
        let settings = Settings {
            repos: vec![TrackedRepo { owner: "acme".into(), repo: "widgets".into() }],
            mode: Mode::Polling,
            forge_token: "t".into(),
            webhook_secret: None,
            llm_cmd: "true".into(),
            review: ReviewConfig::default(),
            operational: OperationalConfig::default(),
            features: FeatureToggles::default(),
        };
        let state = Arc::new(StateStore::load(dir.join("state.json")).await);
        let forge: Arc<dyn ForgeClient> = Arc::new(ScriptedForge { state: StdMutex::new(forge_state) });
        let worktree = Arc::new(crate::worktree::WorktreeManager::new(dir.join("clones"), std::time::Duration::from_secs(5)));
        let coordinator = Arc::new(ReviewCoordinator::new(
            state.clone(),
            forge.clone(),
            Arc::new(LlmClient::new("true")),
            worktree,
            Arc::new(RateLimitGuard::new()),
            Arc::new(MetricsCollector::new()),
            Arc::new(FeatureRunner::new(vec![])),
            Arc::new(SystemClock),
            ReviewConfig::default(),
            OperationalConfig::default(),
        ));
        let recovery = StartupRecovery::new(settings, state.clone(), forge, coordinator);
        (recovery, state)
    }

    #[tokio::test]
    async fn merged_pr_is_transitioned_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let (recovery, state) = make_recovery(dir.path(), ForgePrState::Merged).await;
        let key = vigil_common::PrKey::new("acme", "widgets", 1);
        state
            .get_or_create(&key, || PrState::new_seen("acme", "widgets", 1, "t", "a1", "main", "feat", false, Utc::now()))
            .await
            .unwrap();

        recovery.run().await;
        assert_eq!(state.get(&key).await.unwrap().status, PrStatus::Merged);
    }

    #[tokio::test]
    async fn skipped_entries_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (recovery, state) = make_recovery(dir.path(), ForgePrState::Open).await;
        let key = vigil_common::PrKey::new("acme", "widgets", 2);
        state
            .get_or_create(&key, || {
                let mut s = PrState::new_seen("acme", "widgets", 2, "t", "a1", "main", "feat", false, Utc::now());
                s.status = PrStatus::Skipped;
                s
            })
            .await
            .unwrap();

        recovery.run().await;
        assert_eq!(state.get(&key).await.unwrap().status, PrStatus::Skipped);
    }
}
