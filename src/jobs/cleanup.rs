//! Maintenance job: raw-archive retention and key probes.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use super::{BatchJob, JobContext, JobOutcome};
use crate::error::BatchError;
use crate::providers::{kma, kto, Provider};
use crate::scheduler::{JobDefinition, JobPriority, Trigger};

pub const JOB_ID: &str = "raw-ttl-cleanup";

pub struct RawCleanupJob {
    definition: JobDefinition,
}

impl RawCleanupJob {
    pub fn new() -> Self {
        Self {
            definition: JobDefinition {
                id: JOB_ID.to_string(),
                name: "Raw archive cleanup".to_string(),
                job_type: "maintenance".to_string(),
                trigger: Trigger::Interval(Duration::from_secs(6 * 3600)),
                timeout: Duration::from_secs(300),
                max_retries: 1,
                retry_backoff_base: Duration::from_secs(60),
                priority: JobPriority::Low,
                dependencies: Vec::new(),
                enabled: true,
            },
        }
    }
}

impl Default for RawCleanupJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchJob for RawCleanupJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, BatchError> {
        let purged = ctx.raw().purge_expired().await?;
        info!("raw archive cleanup: {purged} expired row(s) removed");

        // Disabled keys whose cooldown lapsed get a cheap probe while the
        // system is otherwise quiet.
        let (kto_endpoint, kto_params) = kto::KtoApi::probe_spec();
        let kto_reactivated = ctx
            .executor()
            .probe(Provider::Kto, kto_endpoint, kto_params)
            .await;
        let (kma_endpoint, kma_params) = kma::KmaApi::probe_spec(ctx.settings().timezone);
        let kma_reactivated = ctx
            .executor()
            .probe(Provider::Kma, kma_endpoint, kma_params)
            .await;

        Ok(JobOutcome {
            processed_records: purged,
            failed_records: 0,
            detail: json!({
                "purged_rows": purged,
                "reactivated_keys": kto_reactivated + kma_reactivated,
            }),
        })
    }
}
