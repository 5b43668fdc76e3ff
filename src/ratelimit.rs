//! `RateLimitGuard` (§4.6): the process-wide backpressure gate for LLM
//! invocations. Three states (`Active`, `PausedRateLimit`,
//! `PausedSpendingLimit`, the latter never downgraded), a FIFO queue of
//! waiters, and a one-shot resume timer.
//!
//! Modeled as a queue of awaitable tokens per §9's "cooperative suspension"
//! design note: waiters register a `tokio::sync::oneshot` receiver and are
//! released in FIFO order on `resume`/`shutdown`, so both are cancellable.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Active,
    PausedRateLimit,
    PausedSpendingLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    RateLimit,
    SpendingLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeBy {
    Timer,
    Manual,
}

#[derive(Debug, Clone)]
pub struct GuardEvent {
    pub kind: PauseKind,
    pub cooldown_seconds: u64,
    pub at: DateTime<Utc>,
}

struct Inner {
    state: GuardState,
    waiters: VecDeque<oneshot::Sender<()>>,
    events: VecDeque<GuardEvent>,
    paused_since: Option<DateTime<Utc>>,
    cooldown_seconds: u64,
    resume_generation: u64,
}

const MAX_EVENT_HISTORY: usize = 100;

/// Single process-wide instance, constructed once at startup and passed
/// explicitly (no ambient access, per §9).
pub struct RateLimitGuard {
    inner: StdMutex<Inner>,
}

impl Default for RateLimitGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitGuard {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner {
                state: GuardState::Active,
                waiters: VecDeque::new(),
                events: VecDeque::new(),
                paused_since: None,
                cooldown_seconds: 0,
                resume_generation: 0,
            }),
        }
    }

    /// Resolves immediately when active; otherwise queues the caller until
    /// `resume` or `shutdown` releases it.
    pub async fn acquire(&self) {
        let rx = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == GuardState::Active {
                return;
            }
            let (tx, rx) = oneshot::channel();
            guard.waiters.push_back(tx);
            rx
        };
        // If the sender is dropped without sending (shouldn't happen, but
        // defends against a future refactor), treat it as released.
        let _ = rx.await;
    }

    /// Transitions to paused, starts a one-shot resume timer, and records
    /// the event. `SpendingLimit` is never downgraded by a subsequent
    /// `RateLimit` report.
    pub fn report(self: &std::sync::Arc<Self>, kind: PauseKind, cooldown_seconds: u64) {
        let generation = {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == GuardState::PausedSpendingLimit && kind == PauseKind::RateLimit {
                return;
            }
            guard.state = match kind {
                PauseKind::RateLimit => GuardState::PausedRateLimit,
                PauseKind::SpendingLimit => GuardState::PausedSpendingLimit,
            };
            guard.paused_since = Some(Utc::now());
            guard.cooldown_seconds = cooldown_seconds;
            guard.events.push_back(GuardEvent { kind, cooldown_seconds, at: Utc::now() });
            while guard.events.len() > MAX_EVENT_HISTORY {
                guard.events.pop_front();
            }
            guard.resume_generation += 1;
            guard.resume_generation
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(cooldown_seconds)).await;
            this.resume_if_current(ResumeBy::Timer, generation);
        });
        info!(?kind, cooldown_seconds, "rate limit guard paused");
    }

    fn resume_if_current(&self, by: ResumeBy, generation: u64) {
        let mut guard = self.inner.lock().unwrap();
        if guard.resume_generation != generation {
            // A newer report/resume has already superseded this timer.
            return;
        }
        Self::do_resume(&mut guard, by);
    }

    /// Clears paused state, cancels any pending timer (by generation bump),
    /// and releases all queued callers in FIFO order.
    pub fn resume(&self, by: ResumeBy) {
        let mut guard = self.inner.lock().unwrap();
        guard.resume_generation += 1;
        Self::do_resume(&mut guard, by);
    }

    fn do_resume(guard: &mut Inner, by: ResumeBy) {
        guard.state = GuardState::Active;
        guard.paused_since = None;
        guard.cooldown_seconds = 0;
        let waiters = std::mem::take(&mut guard.waiters);
        for tx in waiters {
            let _ = tx.send(());
        }
        info!(?by, "rate limit guard resumed");
    }

    /// Releases all queued callers so shutdown does not hang, without
    /// declaring the guard active again.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock().unwrap();
        let waiters = std::mem::take(&mut guard.waiters);
        for tx in waiters {
            let _ = tx.send(());
        }
    }

    pub fn status(&self) -> GuardStatus {
        let guard = self.inner.lock().unwrap();
        let remaining = guard.paused_since.map(|since| {
            let elapsed = (Utc::now() - since).num_seconds().max(0) as u64;
            guard.cooldown_seconds.saturating_sub(elapsed)
        });
        GuardStatus {
            state: guard.state,
            queue_depth: guard.waiters.len(),
            events: guard.events.iter().cloned().collect(),
            cooldown_remaining_seconds: remaining,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardStatus {
    pub state: GuardState,
    pub queue_depth: usize,
    pub events: Vec<GuardEvent>,
    pub cooldown_remaining_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_resolves_immediately_when_active() {
        let guard = RateLimitGuard::new();
        tokio::time::timeout(Duration::from_millis(50), guard.acquire()).await.expect("should not block");
    }

    #[tokio::test]
    async fn acquire_blocks_while_paused_and_releases_on_resume() {
        let guard = Arc::new(RateLimitGuard::new());
        guard.report(PauseKind::RateLimit, 3600);
        assert_eq!(guard.status().state, GuardState::PausedRateLimit);

        let waiter = tokio::spawn({
            let guard = guard.clone();
            async move {
                guard.acquire().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(guard.status().queue_depth, 1);

        guard.resume(ResumeBy::Manual);
        tokio::time::timeout(Duration::from_millis(200), waiter).await.unwrap().unwrap();
        assert_eq!(guard.status().state, GuardState::Active);
    }

    #[tokio::test]
    async fn spending_limit_is_not_downgraded_by_rate_limit_report() {
        let guard = Arc::new(RateLimitGuard::new());
        guard.report(PauseKind::SpendingLimit, 3600);
        guard.report(PauseKind::RateLimit, 60);
        assert_eq!(guard.status().state, GuardState::PausedSpendingLimit);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_without_reactivating() {
        let guard = Arc::new(RateLimitGuard::new());
        guard.report(PauseKind::RateLimit, 3600);

        let waiter = tokio::spawn({
            let guard = guard.clone();
            async move {
                guard.acquire().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.shutdown();
        tokio::time::timeout(Duration::from_millis(200), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resume_via_timer_fires_after_cooldown() {
        let guard = Arc::new(RateLimitGuard::new());
        guard.report(PauseKind::RateLimit, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(guard.status().state, GuardState::Active);
    }

    #[tokio::test]
    async fn queue_releases_waiters_in_fifo_order() {
        let guard = Arc::new(RateLimitGuard::new());
        guard.report(PauseKind::RateLimit, 3600);

        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let guard = guard.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                guard.acquire().await;
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        guard.resume(ResumeBy::Manual);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
