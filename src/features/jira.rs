//! Stub for the Jira-extraction plugin named in §1 — documents the seam
//! without implementing the external integration. Returns `skipped` whenever
//! no Jira project key is configured, which is always true here.

use async_trait::async_trait;

use crate::features::{Feature, FeatureContext, FeatureOutcome, FeaturePhase};

#[derive(Default)]
pub struct JiraFeature {
    project_key: Option<String>,
}

impl JiraFeature {
    pub fn new(project_key: Option<String>) -> Self {
        Self { project_key }
    }
}

#[async_trait]
impl Feature for JiraFeature {
    fn name(&self) -> &'static str {
        "jira"
    }

    fn phases(&self) -> &'static [FeaturePhase] {
        &[FeaturePhase::PreReview]
    }

    fn should_run(&self, _ctx: &FeatureContext<'_>) -> bool {
        self.project_key.is_some()
    }

    async fn execute(&self, _ctx: &FeatureContext<'_>) -> FeatureOutcome {
        FeatureOutcome::skipped("jira integration not configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_common::PrState;

    #[tokio::test]
    async fn unconfigured_jira_feature_always_skips() {
        let feature = JiraFeature::new(None);
        let state = PrState::new_seen("acme", "widgets", 1, "t", "a1", "main", "feat", false, Utc::now());
        let ctx = FeatureContext { phase: FeaturePhase::PreReview, state: &state, diff: None };
        assert!(!feature.should_run(&ctx));
        let outcome = feature.execute(&ctx).await;
        assert_eq!(outcome.status, vigil_common::FeatureStatus::Skipped);
    }
}
