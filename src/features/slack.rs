//! Stub for the Slack-notification plugin named in §1 — documents the seam
//! without implementing the external integration. Returns `skipped` whenever
//! no webhook URL is configured, which is always true here.

use async_trait::async_trait;

use crate::features::{Feature, FeatureContext, FeatureOutcome, FeaturePhase};

#[derive(Default)]
pub struct SlackFeature {
    webhook_url: Option<String>,
}

impl SlackFeature {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self { webhook_url }
    }
}

#[async_trait]
impl Feature for SlackFeature {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn phases(&self) -> &'static [FeaturePhase] {
        &[FeaturePhase::PostReview]
    }

    fn should_run(&self, _ctx: &FeatureContext<'_>) -> bool {
        self.webhook_url.is_some()
    }

    async fn execute(&self, _ctx: &FeatureContext<'_>) -> FeatureOutcome {
        FeatureOutcome::skipped("slack integration not configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_common::PrState;

    #[tokio::test]
    async fn unconfigured_slack_feature_always_skips() {
        let feature = SlackFeature::new(None);
        let state = PrState::new_seen("acme", "widgets", 1, "t", "a1", "main", "feat", false, Utc::now());
        let ctx = FeatureContext { phase: FeaturePhase::PostReview, state: &state, diff: None };
        assert!(!feature.should_run(&ctx));
    }
}
