//! Quality-gate job.
//!
//! Scores every published table and fails its own execution when any table
//! lands below threshold, which is how downstream jobs observe a failed
//! dependency.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use super::{BatchJob, JobContext, JobOutcome};
use crate::error::BatchError;
use crate::quality::QualityGate;
use crate::scheduler::{JobDefinition, JobPriority, Trigger};

pub const JOB_ID: &str = "data-quality-check";

pub struct QualityCheckJob {
    definition: JobDefinition,
}

impl QualityCheckJob {
    pub fn new(dependencies: Vec<String>) -> Self {
        Self {
            definition: JobDefinition {
                id: JOB_ID.to_string(),
                name: "Data quality check".to_string(),
                job_type: "data_quality_check".to_string(),
                // Daily at 05:00 local, after the sync jobs land.
                trigger: Trigger::Cron("0 0 5 * * *".to_string()),
                timeout: Duration::from_secs(600),
                max_retries: 1,
                retry_backoff_base: Duration::from_secs(120),
                priority: JobPriority::Medium,
                dependencies,
                enabled: true,
            },
        }
    }
}

#[async_trait]
impl BatchJob for QualityCheckJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, BatchError> {
        let specs = ctx
            .quality()
            .with_overrides(QualityGate::default_specs())
            .await?;
        let reports = ctx.quality().evaluate_all(&specs).await?;

        let mut failing: Vec<String> = Vec::new();
        for report in &reports {
            if report.passed {
                info!(
                    "quality: {} scored {:.3} over {} rows",
                    report.table, report.overall, report.row_count
                );
            } else {
                warn!(
                    "quality: {} FAILED at {:.3} (completeness {:.2}, validity {:.2}, \
                     consistency {:.2}, freshness {:.2})",
                    report.table,
                    report.overall,
                    report.completeness,
                    report.validity,
                    report.consistency,
                    report.freshness
                );
                failing.push(report.table.clone());
            }
        }

        ctx.detail("quality_reports", &json!(reports)).await;

        let checked = reports.len() as u64;
        if failing.is_empty() {
            Ok(JobOutcome {
                processed_records: checked,
                failed_records: 0,
                detail: json!({ "tables_checked": checked }),
            })
        } else {
            Err(BatchError::QualityGateFailed {
                tables: failing.join(", "),
            })
        }
    }
}
