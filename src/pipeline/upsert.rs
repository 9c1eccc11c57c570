//! Chunked, memory-bounded bulk loading.
//!
//! The engine owns chunking, per-chunk retry, the memory pre-flight, and
//! failure accounting; the actual SQL lives in per-table closures from the
//! repository layer. A chunk that keeps failing is skipped and counted;
//! five consecutive skipped chunks abort the call with a partial-failure
//! error, leaving already-committed chunks committed.

use std::time::{Duration, Instant};

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::QueryResult;
use diesel::SqliteConnection;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::TuningPreset;
use crate::error::BatchError;
use crate::repository::pool::{run_blocking, SqlitePool};

/// Consecutive failed chunks tolerated before the call aborts.
const MAX_CONSECUTIVE_CHUNK_FAILURES: u32 = 5;
/// Cap on per-chunk error strings kept in the report.
const MAX_REPORTED_CHUNK_ERRORS: usize = 10;

/// Per-call tuning knobs.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    pub chunk_size: usize,
    pub max_memory_mb: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub parallel_degree: usize,
    pub upsert_enabled: bool,
}

impl TuningProfile {
    pub fn for_preset(preset: TuningPreset) -> Self {
        match preset {
            TuningPreset::Conservative => Self {
                chunk_size: 500,
                max_memory_mb: 50,
                retry_attempts: 5,
                retry_delay: Duration::from_secs(2),
                parallel_degree: 1,
                upsert_enabled: true,
            },
            TuningPreset::Balanced => Self {
                chunk_size: 1000,
                max_memory_mb: 100,
                retry_attempts: 3,
                retry_delay: Duration::from_secs(1),
                parallel_degree: 2,
                upsert_enabled: true,
            },
            TuningPreset::Aggressive => Self {
                chunk_size: 2000,
                max_memory_mb: 200,
                retry_attempts: 2,
                retry_delay: Duration::from_millis(500),
                parallel_degree: 4,
                upsert_enabled: true,
            },
            TuningPreset::MemoryConstrained => Self {
                chunk_size: 250,
                max_memory_mb: 25,
                retry_attempts: 3,
                retry_delay: Duration::from_secs(1),
                parallel_degree: 1,
                upsert_enabled: true,
            },
        }
    }

    /// Per-table adjustment on top of the preset.
    pub fn for_table(preset: TuningPreset, table: &str) -> Self {
        let mut profile = Self::for_preset(preset);
        // Forecast rows are narrow and arrive in large series.
        if table == "weather_forecasts" {
            profile.chunk_size *= 2;
        }
        profile
    }
}

/// Outcome of one bulk call.
#[derive(Debug, Clone)]
pub struct UpsertReport {
    pub table: String,
    pub total_records: u64,
    pub successful_records: u64,
    pub failed_records: u64,
    pub execution_time: Duration,
    pub records_per_second: f64,
    pub chunk_errors: Vec<String>,
}

impl UpsertReport {
    fn new(table: &str, total: u64) -> Self {
        Self {
            table: table.to_string(),
            total_records: total,
            successful_records: 0,
            failed_records: 0,
            execution_time: Duration::ZERO,
            records_per_second: 0.0,
            chunk_errors: Vec::new(),
        }
    }
}

pub struct BulkUpsertEngine {
    pool: SqlitePool,
    preset: TuningPreset,
}

impl BulkUpsertEngine {
    pub fn new(pool: SqlitePool, preset: TuningPreset) -> Self {
        Self { pool, preset }
    }

    pub fn profile_for(&self, table: &str) -> TuningProfile {
        TuningProfile::for_table(self.preset, table)
    }

    /// Load `rows` into `table` through the per-chunk `apply` statement.
    pub async fn execute<R, F>(
        &self,
        table: &str,
        rows: Vec<R>,
        apply: F,
    ) -> Result<UpsertReport, BatchError>
    where
        R: Serialize + Clone + Send + Sync + 'static,
        F: Fn(&mut SqliteConnection, &[R]) -> QueryResult<usize> + Clone + Send + Sync + 'static,
    {
        let profile = self.profile_for(table);
        let started = Instant::now();
        let mut report = UpsertReport::new(table, rows.len() as u64);
        if rows.is_empty() {
            return Ok(report);
        }

        let row_size = estimated_row_bytes(&rows[0]);
        let mut chunk_size = profile.chunk_size.max(1);

        // Pre-flight: shrink the chunk until its estimate fits the cap. The
        // reduced size sticks for the remainder of this call.
        let cap_bytes = profile.max_memory_mb * 1024 * 1024;
        while chunk_size > 1 && row_size.saturating_mul(chunk_size) > cap_bytes {
            chunk_size /= 2;
        }
        if chunk_size < profile.chunk_size {
            debug!(
                "memory cap {}MB reduced {table} chunk size {} -> {chunk_size}",
                profile.max_memory_mb, profile.chunk_size
            );
        }

        let degree = profile.parallel_degree.max(1);
        let mut consecutive_failures = 0u32;
        let mut idx = 0usize;

        while idx < rows.len() {
            // Assemble one wave of up to `degree` chunks.
            let mut wave: Vec<(usize, Vec<R>)> = Vec::with_capacity(degree);
            while wave.len() < degree && idx < rows.len() {
                let end = (idx + chunk_size).min(rows.len());
                wave.push((idx, rows[idx..end].to_vec()));
                idx = end;
            }

            let mut outcomes: Vec<(usize, usize, Result<usize, BatchError>)> =
                Vec::with_capacity(wave.len());
            if wave.len() == 1 {
                let (offset, chunk) = wave.pop().expect("wave has one chunk");
                let len = chunk.len();
                let outcome = run_chunk(
                    self.pool.clone(),
                    apply.clone(),
                    chunk,
                    profile.retry_attempts,
                    profile.retry_delay,
                )
                .await;
                outcomes.push((offset, len, outcome));
            } else {
                let mut join = JoinSet::new();
                for (offset, chunk) in wave {
                    let pool = self.pool.clone();
                    let apply = apply.clone();
                    let len = chunk.len();
                    let attempts = profile.retry_attempts;
                    let delay = profile.retry_delay;
                    join.spawn(async move {
                        (offset, len, run_chunk(pool, apply, chunk, attempts, delay).await)
                    });
                }
                while let Some(joined) = join.join_next().await {
                    match joined {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(e) => outcomes.push((
                            usize::MAX,
                            0,
                            Err(BatchError::Transient {
                                detail: format!("chunk task failed: {e}"),
                            }),
                        )),
                    }
                }
                outcomes.sort_by_key(|(offset, _, _)| *offset);
            }

            for (offset, len, outcome) in outcomes {
                match outcome {
                    Ok(written) => {
                        report.successful_records += written as u64;
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        report.failed_records += len as u64;
                        if report.chunk_errors.len() < MAX_REPORTED_CHUNK_ERRORS {
                            report.chunk_errors.push(format!("chunk@{offset}: {e}"));
                        }
                        consecutive_failures += 1;
                        warn!("{table} chunk at {offset} failed ({len} rows): {e}");
                        if consecutive_failures >= MAX_CONSECUTIVE_CHUNK_FAILURES {
                            return Err(BatchError::PartialFailure {
                                table: table.to_string(),
                                completed: report.successful_records,
                            });
                        }
                    }
                }
            }
        }

        report.execution_time = started.elapsed();
        let secs = report.execution_time.as_secs_f64();
        if secs > 0.0 {
            report.records_per_second = report.successful_records as f64 / secs;
        }
        Ok(report)
    }
}

/// One chunk, retried on transient database errors with linear backoff.
async fn run_chunk<R, F>(
    pool: SqlitePool,
    apply: F,
    chunk: Vec<R>,
    attempts: u32,
    delay: Duration,
) -> Result<usize, BatchError>
where
    R: Clone + Send + Sync + 'static,
    F: Fn(&mut SqliteConnection, &[R]) -> QueryResult<usize> + Clone + Send + Sync + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        let apply = apply.clone();
        let chunk = chunk.clone();
        let result = run_blocking(pool.clone(), move |conn| apply(conn, &chunk)).await;
        match result {
            Ok(written) => return Ok(written),
            Err(e) if attempt + 1 < attempts.max(1) && is_transient_chunk_error(&e) => {
                attempt += 1;
                debug!("chunk retry {attempt}/{attempts} after: {e}");
                tokio::time::sleep(delay * attempt).await;
            }
            Err(e) => return Err(finalize_chunk_error(e)),
        }
    }
}

/// Pool churn and a lost worker arrive as transient errors alongside
/// retryable database errors; both get another attempt.
fn is_transient_chunk_error(e: &BatchError) -> bool {
    match e {
        BatchError::Db(db) => is_transient_db_error(db),
        BatchError::Transient { .. } => true,
        _ => false,
    }
}

fn finalize_chunk_error(e: BatchError) -> BatchError {
    match e {
        BatchError::Db(db) => classify_db_error(db),
        other => other,
    }
}

/// Constraint violations are deterministic; everything else (locking,
/// busy handles, pool churn) is worth another attempt.
fn is_transient_db_error(e: &DieselError) -> bool {
    match e {
        DieselError::DatabaseError(kind, _) => !matches!(
            kind,
            DatabaseErrorKind::UniqueViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::ForeignKeyViolation
                | DatabaseErrorKind::CheckViolation
        ),
        _ => false,
    }
}

fn classify_db_error(e: DieselError) -> BatchError {
    match &e {
        DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation
            | DatabaseErrorKind::NotNullViolation
            | DatabaseErrorKind::ForeignKeyViolation
            | DatabaseErrorKind::CheckViolation,
            info,
        ) => BatchError::Conflict {
            detail: info.message().to_string(),
        },
        _ => BatchError::Db(e),
    }
}

fn estimated_row_bytes<R: Serialize>(row: &R) -> usize {
    serde_json::to_vec(row).map(|v| v.len()).unwrap_or(64)
}
