//! Weather collection jobs: current conditions + forecasts, and the daily
//! historical backfill.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use super::{BatchJob, JobContext, JobOutcome, JobParams};
use crate::error::BatchError;
use crate::pipeline::transform;
use crate::providers::kma::KmaApi;
use crate::providers::{RegionGrid, REGIONS};
use crate::repository::domain;
use crate::scheduler::{JobDefinition, JobPriority, Trigger};

pub const WEATHER_SYNC_JOB_ID: &str = "weather-sync";
pub const HISTORICAL_JOB_ID: &str = "historical-weather";

fn selected_regions(params: &JobParams) -> Vec<&'static RegionGrid> {
    match params {
        JobParams::Weather { region_codes } if !region_codes.is_empty() => REGIONS
            .iter()
            .filter(|r| region_codes.iter().any(|code| code == r.code))
            .collect(),
        _ => REGIONS.iter().collect(),
    }
}

/// Hourly nowcast plus village forecast for every region.
pub struct WeatherSyncJob {
    definition: JobDefinition,
}

impl WeatherSyncJob {
    pub fn new() -> Self {
        Self {
            definition: JobDefinition {
                id: WEATHER_SYNC_JOB_ID.to_string(),
                name: "Weather sync".to_string(),
                job_type: "weather_sync".to_string(),
                trigger: Trigger::Interval(Duration::from_secs(3600)),
                timeout: Duration::from_secs(1200),
                max_retries: 3,
                retry_backoff_base: Duration::from_secs(30),
                priority: JobPriority::High,
                dependencies: Vec::new(),
                enabled: true,
            },
        }
    }
}

impl Default for WeatherSyncJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchJob for WeatherSyncJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, BatchError> {
        let api = KmaApi::new(ctx.executor().clone(), ctx.settings().timezone);
        let chunk_size = ctx.settings().batch_size;
        let mut outcome = JobOutcome::default();
        let mut current_rows = 0u64;
        let mut forecast_rows = 0u64;

        for region in selected_regions(&ctx.params) {
            let (items, raw_id) = api.ultra_srt_ncst(region).await?;
            let transformed = transform::nowcast_rows(region, &items, raw_id.as_deref());
            outcome.failed_records += transformed.discarded.len() as u64;
            if !transformed.rows.is_empty() {
                let upsert_enabled = ctx.upsert().profile_for("weather_current").upsert_enabled;
                let report = ctx
                    .upsert()
                    .execute("weather_current", transformed.rows, move |conn, rows| {
                        domain::upsert_weather_current_chunk(conn, rows, upsert_enabled)
                    })
                    .await?;
                current_rows += report.successful_records;
                outcome.failed_records += report.failed_records;
            }

            let (items, raw_id) = api.vilage_fcst(region).await?;
            let transformed =
                transform::forecast_rows(region, &items, "village", raw_id.as_deref());
            outcome.failed_records += transformed.discarded.len() as u64;
            let upsert_enabled = ctx.upsert().profile_for("weather_forecasts").upsert_enabled;
            for chunk in transform::chunked(transformed.rows, chunk_size) {
                let report = ctx
                    .upsert()
                    .execute("weather_forecasts", chunk, move |conn, rows| {
                        domain::upsert_forecast_chunk(conn, rows, upsert_enabled)
                    })
                    .await?;
                forecast_rows += report.successful_records;
                outcome.failed_records += report.failed_records;
            }
        }

        info!("weather sync: {current_rows} current rows, {forecast_rows} forecast rows");
        ctx.detail(
            "weather",
            &json!({ "current": current_rows, "forecasts": forecast_rows }),
        )
        .await;
        outcome.processed_records = current_rows + forecast_rows;
        Ok(outcome)
    }
}

/// Previous-day surface observation summaries.
pub struct HistoricalWeatherJob {
    definition: JobDefinition,
}

impl HistoricalWeatherJob {
    pub fn new() -> Self {
        Self {
            definition: JobDefinition {
                id: HISTORICAL_JOB_ID.to_string(),
                name: "Historical weather backfill".to_string(),
                job_type: "historical_weather".to_string(),
                // Daily at 03:30 local, after the observation day closes.
                trigger: Trigger::Cron("0 30 3 * * *".to_string()),
                timeout: Duration::from_secs(900),
                max_retries: 2,
                retry_backoff_base: Duration::from_secs(60),
                priority: JobPriority::Medium,
                dependencies: Vec::new(),
                enabled: true,
            },
        }
    }
}

impl Default for HistoricalWeatherJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchJob for HistoricalWeatherJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, BatchError> {
        let api = KmaApi::new(ctx.executor().clone(), ctx.settings().timezone);
        let yesterday = (Utc::now().with_timezone(&ctx.settings().timezone)
            - ChronoDuration::days(1))
        .date_naive();
        let mut outcome = JobOutcome::default();

        for region in selected_regions(&ctx.params) {
            if region.station.is_none() {
                warn!("{}: no observation station, skipping backfill", region.name);
                continue;
            }
            let (items, raw_id) = api.asos_daily(region, yesterday).await?;
            let transformed = transform::historical_rows(region, &items, raw_id.as_deref());
            outcome.failed_records += transformed.discarded.len() as u64;
            if transformed.rows.is_empty() {
                continue;
            }
            let upsert_enabled = ctx
                .upsert()
                .profile_for("historical_weather_daily")
                .upsert_enabled;
            let report = ctx
                .upsert()
                .execute(
                    "historical_weather_daily",
                    transformed.rows,
                    move |conn, rows| domain::upsert_historical_chunk(conn, rows, upsert_enabled),
                )
                .await?;
            outcome.processed_records += report.successful_records;
            outcome.failed_records += report.failed_records;
        }

        ctx.detail(
            "historical_weather",
            &json!({
                "date": yesterday.to_string(),
                "rows": outcome.processed_records,
            }),
        )
        .await;
        Ok(outcome)
    }
}
