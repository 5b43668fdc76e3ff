//! Minimal concrete feature: applies a `security` label via the forge when
//! the diff touches any configured security-sensitive path. A working
//! example of the "auto-labeling" plugin named in §1, not a full labeling
//! policy engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::diff::find_security_paths;
use crate::features::{Feature, FeatureContext, FeatureOutcome, FeaturePhase};
use crate::forge::ForgeClient;

const SECURITY_LABEL: &str = "security-sensitive";

pub struct AutoLabelFeature {
    forge: Arc<dyn ForgeClient>,
    security_paths: Vec<String>,
}

impl AutoLabelFeature {
    pub fn new(forge: Arc<dyn ForgeClient>, security_paths: Vec<String>) -> Self {
        Self { forge, security_paths }
    }
}

#[async_trait]
impl Feature for AutoLabelFeature {
    fn name(&self) -> &'static str {
        "auto_label"
    }

    fn phases(&self) -> &'static [FeaturePhase] {
        &[FeaturePhase::PreReview]
    }

    fn should_run(&self, ctx: &FeatureContext<'_>) -> bool {
        ctx.diff.is_some() && !self.security_paths.is_empty()
    }

    async fn execute(&self, ctx: &FeatureContext<'_>) -> FeatureOutcome {
        let Some(diff) = ctx.diff else {
            return FeatureOutcome::skipped("no diff available");
        };
        let touched = find_security_paths(diff, &self.security_paths);
        if touched.is_empty() {
            return FeatureOutcome::skipped("no security-sensitive paths touched");
        }
        match self
            .forge
            .add_labels(&ctx.state.owner, &ctx.state.repo, ctx.state.number, &[SECURITY_LABEL.to_string()])
            .await
        {
            Ok(()) => FeatureOutcome::success(),
            Err(e) => FeatureOutcome::error(e.to_string()),
        }
    }
}
