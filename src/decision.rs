//! `DecisionEngine`: the pure `shouldReview` function (§4.2). No I/O, no
//! mutation, no hidden clock — time is injected via the `Clock` trait so
//! tests can supply fixed instants, resolving the "time injection" open
//! question from §9 by trait injection rather than a global.

use chrono::{DateTime, Utc};
use vigil_common::{PrState, PrStatus};

use crate::config::ReviewConfig;

/// A one-method clock abstraction. Production uses `Utc::now()`; tests
/// supply a fixed instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fixed instant, for deterministic tests.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub should_review: bool,
    pub reason: String,
}

impl Decision {
    fn yes(reason: impl Into<String>) -> Self {
        Self { should_review: true, reason: reason.into() }
    }
    fn no(reason: impl Into<String>) -> Self {
        Self { should_review: false, reason: reason.into() }
    }
}

/// Pure function `shouldReview(state, reviewCfg, forceHint) -> Decision`.
/// Ordered rules, first match wins, exactly as enumerated in §4.2.
pub fn should_review(state: &PrState, cfg: &ReviewConfig, force_hint: bool, clock: &dyn Clock) -> Decision {
    // 1. Terminal statuses never leave.
    if state.status.is_terminal() {
        return Decision::no(format!("terminal status {}", state.status));
    }

    // 2. Already in progress.
    if state.status == PrStatus::Reviewing {
        return Decision::no("already in progress");
    }

    // 3. Draft / WIP skip policies.
    if cfg.skip_drafts && state.is_draft {
        return Decision::no("draft");
    }
    if cfg.skip_wip && state.title.to_lowercase().starts_with("wip") {
        return Decision::no("wip_title");
    }

    // 4. Explicitly skipped; only an external transition clears this.
    if state.status == PrStatus::Skipped {
        return Decision::no(state.skip_reason.clone().unwrap_or_else(|| "skipped".to_string()));
    }

    // 5. Already reviewed at this sha, unless forced.
    if state.status == PrStatus::Reviewed && state.last_reviewed_sha.as_deref() == Some(state.head_sha.as_str()) {
        if force_hint {
            return Decision::yes("forced");
        }
        return Decision::no("already reviewed at head sha");
    }

    // 6. Debounce: let further pushes coalesce.
    if let Some(last_push_at) = state.last_push_at {
        let elapsed = clock.now() - last_push_at;
        if elapsed < chrono::Duration::seconds(cfg.debounce_period_seconds) {
            let pushed_again_since_review = state.previous_review().map(|r| r.sha != state.head_sha).unwrap_or(false);
            let has_new_commits_while_pushed = state.status == PrStatus::ChangesPushed;
            if !force_hint && !pushed_again_since_review && !has_new_commits_while_pushed {
                return Decision::no("debouncing recent push");
            }
        }
    }

    // 7. Error backoff.
    if state.status == PrStatus::Error && !force_hint {
        if state.consecutive_errors >= cfg.max_retries {
            return Decision::no("max retries exceeded");
        }
        if let Some(last_error) = &state.last_error {
            let backoff_secs = 60i64 * 2i64.pow(state.consecutive_errors.saturating_sub(1));
            let retry_at = last_error.occurred_at + chrono::Duration::seconds(backoff_secs);
            if clock.now() < retry_at {
                return Decision::no(format!("backing off until {retry_at}"));
            }
        }
    }

    // 8. Otherwise, review.
    Decision::yes(state.status.to_string())
}
