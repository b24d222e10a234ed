use super::pipeline::{EnrichmentPipeline, EnrichmentRequest};
use crate::modules::jobs::domain::entities::{EnrichEntityPayload, JobType, RefreshInsightsPayload};
use crate::modules::jobs::worker::{JobContext, JobHandler};
use crate::shared::errors::AppResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Runs enrichment jobs one at a time for a `Worker`
pub struct EnrichmentJobHandler {
    pipeline: Arc<EnrichmentPipeline>,
}

impl EnrichmentJobHandler {
    pub fn new(pipeline: Arc<EnrichmentPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for EnrichmentJobHandler {
    async fn handle(&self, ctx: &JobContext) -> AppResult<serde_json::Value> {
        let job = ctx.job();
        let report = match job.job_type {
            JobType::EnrichEntity => {
                let request: EnrichmentRequest = job.parse_payload::<EnrichEntityPayload>()?.into();
                self.pipeline.enrich(&request, ctx.lease(), ctx).await?
            }
            JobType::RefreshInsights => {
                let request: EnrichmentRequest =
                    job.parse_payload::<RefreshInsightsPayload>()?.into();
                self.pipeline
                    .refresh_insights(&request, ctx.lease(), ctx)
                    .await?
            }
        };
        Ok(serde_json::to_value(&report)?)
    }
}
