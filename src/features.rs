//! `FeatureRunner` (§4.9): ordered dispatch of pluggable pre-review and
//! post-review collaborators with per-feature timing/error isolation.
//!
//! Generalizes the teacher's `hooks::{HookManager, HookEvent, HookResult,
//! HookContext}` dispatch machinery, narrowed to the spec's `pre_review`/
//! `post_review` phases and `{success, skipped, error}` statuses. Key
//! behavioral divergence from the teacher (recorded in DESIGN.md): the
//! teacher's `HookManager::run_hooks` stops at the first non-`Continue`
//! result; `FeatureRunner::run` here always executes every registered
//! feature for the given phase regardless of earlier results, per §4.9/§7
//! ("errors in features never abort the main review").

pub mod audit_log;
pub mod auto_description;
pub mod auto_label;
pub mod jira;
pub mod slack;

use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;
use vigil_common::{FeatureExecution, FeatureStatus, PrState};

/// Which half of the review lifecycle a feature runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeaturePhase {
    PreReview,
    PostReview,
}

impl FeaturePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            FeaturePhase::PreReview => "pre_review",
            FeaturePhase::PostReview => "post_review",
        }
    }
}

/// Context handed to a feature. Carries a read-only snapshot of the PR state;
/// features that want to mutate state do so through the caller's
/// `StateStore`, keyed by `ctx.state.key()`, not through this struct.
pub struct FeatureContext<'a> {
    pub phase: FeaturePhase,
    pub state: &'a PrState,
    pub diff: Option<&'a str>,
}

/// Outcome of a single feature's `execute` call.
#[derive(Debug, Clone)]
pub struct FeatureOutcome {
    pub status: FeatureStatus,
    pub message: Option<String>,
}

impl FeatureOutcome {
    pub fn success() -> Self {
        Self { status: FeatureStatus::Success, message: None }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self { status: FeatureStatus::Skipped, message: Some(reason.into()) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: FeatureStatus::Error, message: Some(message.into()) }
    }
}

/// A pluggable feature. Object-safe via `async_trait` so the runner can hold
/// a homogeneous `Vec<Box<dyn Feature>>` spanning built-in and stub features.
#[async_trait]
pub trait Feature: Send + Sync {
    /// Stable identifier, recorded into `FeatureExecution.feature`.
    fn name(&self) -> &'static str;

    /// Which phase(s) this feature participates in.
    fn phases(&self) -> &'static [FeaturePhase];

    /// Cheap pre-check; `false` records a `skipped` execution without
    /// calling `execute`.
    fn should_run(&self, ctx: &FeatureContext<'_>) -> bool {
        let _ = ctx;
        true
    }

    async fn execute(&self, ctx: &FeatureContext<'_>) -> FeatureOutcome;
}

/// Dispatches every registered feature whose `phases()` includes the given
/// phase, in registration order, unconditionally — unlike the teacher's
/// `HookManager`, a non-success outcome from one feature never prevents the
/// next feature (or the main review) from running.
pub struct FeatureRunner {
    features: Vec<Box<dyn Feature>>,
}

impl FeatureRunner {
    pub fn new(features: Vec<Box<dyn Feature>>) -> Self {
        Self { features }
    }

    /// Runs every feature registered for `phase`, returning the executions
    /// to be appended (bounded) into `PrState.feature_executions` by the
    /// caller.
    pub async fn run(&self, phase: FeaturePhase, ctx: &FeatureContext<'_>) -> Vec<FeatureExecution> {
        self.run_excluding(phase, ctx, &[]).await
    }

    /// Same as `run`, but any feature whose `name()` appears in `exclude` is
    /// recorded as `skipped` without calling `should_run`/`execute` — used to
    /// honor a comment-trigger's `--skip-description`/`--skip-labels`
    /// override (§4.8) without mutating the registered feature set.
    pub async fn run_excluding(&self, phase: FeaturePhase, ctx: &FeatureContext<'_>, exclude: &[&str]) -> Vec<FeatureExecution> {
        let mut executions = Vec::new();
        for feature in &self.features {
            if !feature.phases().contains(&phase) {
                continue;
            }
            if exclude.contains(&feature.name()) {
                executions.push(FeatureExecution {
                    feature: feature.name().to_string(),
                    phase: phase.as_str().to_string(),
                    status: FeatureStatus::Skipped,
                    duration_ms: 0,
                    message: Some("skipped by reviewer override".to_string()),
                    at: chrono::Utc::now(),
                });
                continue;
            }
            let start = Instant::now();
            let outcome = if feature.should_run(ctx) {
                feature.execute(ctx).await
            } else {
                FeatureOutcome::skipped("should_run returned false")
            };
            match outcome.status {
                FeatureStatus::Error => warn!(feature = feature.name(), message = ?outcome.message, "feature execution failed"),
                FeatureStatus::Skipped => {}
                FeatureStatus::Success => {}
            }
            executions.push(FeatureExecution {
                feature: feature.name().to_string(),
                phase: phase.as_str().to_string(),
                status: outcome.status,
                duration_ms: start.elapsed().as_millis() as u64,
                message: outcome.message,
                at: chrono::Utc::now(),
            });
        }
        executions
    }
}
