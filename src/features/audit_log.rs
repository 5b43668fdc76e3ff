//! Minimal concrete feature: records a line to the audit log on both
//! pre-review and post-review, proving the dispatcher works end-to-end
//! (§1 "feature plugins... not production hardened").

use async_trait::async_trait;
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditLogger};
use crate::features::{Feature, FeatureContext, FeatureOutcome, FeaturePhase};

pub struct AuditLogFeature {
    logger: Arc<AuditLogger>,
}

impl AuditLogFeature {
    pub fn new(logger: Arc<AuditLogger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Feature for AuditLogFeature {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    fn phases(&self) -> &'static [FeaturePhase] {
        &[FeaturePhase::PreReview, FeaturePhase::PostReview]
    }

    async fn execute(&self, ctx: &FeatureContext<'_>) -> FeatureOutcome {
        let key = ctx.state.key();
        let kind = match ctx.phase {
            FeaturePhase::PreReview => "feature_pre_review",
            FeaturePhase::PostReview => "feature_post_review",
        };
        self.logger.record(AuditEvent::new(&key, kind)).await;
        FeatureOutcome::success()
    }
}
