//! Nationwide tourism harvest.
//!
//! Walks every configured content type across every area code, page by
//! page, lands the typed rows in their content tables, and records
//! per-content-type counts on the execution.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use super::{BatchJob, JobContext, JobOutcome, JobParams};
use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::BatchError;
use crate::pipeline::transform::{self, ContentType};
use crate::providers::kto::KtoApi;
use crate::providers::AREA_CODES;
use crate::repository::domain;
use crate::scheduler::{JobDefinition, JobPriority, Trigger};

pub const JOB_ID: &str = "comprehensive-tourism";

pub struct TourismSyncJob {
    definition: JobDefinition,
}

impl TourismSyncJob {
    pub fn new() -> Self {
        Self {
            definition: JobDefinition {
                id: JOB_ID.to_string(),
                name: "Comprehensive tourism sync".to_string(),
                job_type: "tourism_sync".to_string(),
                // Daily at 02:00 local, before the quality gate runs.
                trigger: Trigger::Cron("0 0 2 * * *".to_string()),
                timeout: Duration::from_secs(2 * 3600),
                max_retries: 2,
                retry_backoff_base: Duration::from_secs(60),
                priority: JobPriority::High,
                dependencies: Vec::new(),
                enabled: true,
            },
        }
    }
}

impl Default for TourismSyncJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchJob for TourismSyncJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, BatchError> {
        let (content_types, area_codes) = match &ctx.params {
            JobParams::Tourism {
                content_types,
                area_codes,
            } => (content_types.clone(), area_codes.clone()),
            _ => (
                ContentType::ALL.to_vec(),
                AREA_CODES.iter().map(|(code, _)| code.to_string()).collect(),
            ),
        };

        let api = KtoApi::new(ctx.executor().clone(), DEFAULT_PAGE_SIZE);
        let chunk_size = ctx.settings().batch_size;
        let mut outcome = JobOutcome::default();

        for content_type in content_types {
            let mut type_processed: u64 = 0;
            let mut type_discarded: u64 = 0;
            let mut type_pages: u64 = 0;

            for area_code in &area_codes {
                let mut pager = api.area_based_list(content_type, area_code);
                while let Some(page) = pager.next_page().await? {
                    type_pages += 1;
                    let transformed = transform::tourism_rows(
                        content_type,
                        &page.items,
                        page.raw_id.as_deref(),
                    );
                    for discard in &transformed.discarded {
                        debug!(
                            "{}: dropped row ({}) in area {area_code}: {}",
                            content_type, discard.context, discard.reason
                        );
                    }
                    type_discarded += transformed.discarded.len() as u64;

                    let upsert_enabled =
                        ctx.upsert().profile_for(content_type.table()).upsert_enabled;
                    for chunk in transform::chunked(transformed.rows, chunk_size) {
                        let report = ctx
                            .upsert()
                            .execute(content_type.table(), chunk, move |conn, rows| {
                                domain::upsert_tourism_chunk(
                                    conn,
                                    content_type,
                                    rows,
                                    upsert_enabled,
                                )
                            })
                            .await?;
                        type_processed += report.successful_records;
                        outcome.failed_records += report.failed_records;
                    }
                }
            }

            info!(
                "{}: {type_processed} rows across {type_pages} page(s), {type_discarded} discarded",
                content_type
            );
            ctx.detail(
                content_type.table(),
                &json!({
                    "processed": type_processed,
                    "discarded": type_discarded,
                    "pages": type_pages,
                }),
            )
            .await;

            outcome.processed_records += type_processed;
            outcome.failed_records += type_discarded;
        }

        outcome.detail = json!({ "areas": area_codes.len() });
        Ok(outcome)
    }
}
