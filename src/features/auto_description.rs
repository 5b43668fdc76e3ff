//! Stub for the auto-description plugin named in §1 — documents the seam
//! without implementing the external integration. Marks `descriptionGenerated`
//! once a description would have been posted; the actual PR-body generation
//! is out of scope for the core (§1 "feature plugins ... interfaces only").

use async_trait::async_trait;

use crate::features::{Feature, FeatureContext, FeatureOutcome, FeaturePhase};
use crate::forge::ForgeClient;
use std::sync::Arc;

pub struct AutoDescriptionFeature {
    forge: Arc<dyn ForgeClient>,
}

impl AutoDescriptionFeature {
    pub fn new(forge: Arc<dyn ForgeClient>) -> Self {
        Self { forge }
    }
}

#[async_trait]
impl Feature for AutoDescriptionFeature {
    fn name(&self) -> &'static str {
        "auto_description"
    }

    fn phases(&self) -> &'static [FeaturePhase] {
        &[FeaturePhase::PreReview]
    }

    fn should_run(&self, ctx: &FeatureContext<'_>) -> bool {
        !ctx.state.description_generated
    }

    async fn execute(&self, ctx: &FeatureContext<'_>) -> FeatureOutcome {
        match self.forge.get_pr_body(&ctx.state.owner, &ctx.state.repo, ctx.state.number).await {
            Ok(body) if !body.trim().is_empty() => FeatureOutcome::skipped("pr already has a description"),
            Ok(_) => FeatureOutcome::skipped("description generation not configured"),
            Err(e) => FeatureOutcome::error(e.to_string()),
        }
    }
}
