//! Durable record of every job execution attempt.
//!
//! Envelope rows are written start-first, closed exactly once, and never
//! reordered. Detail documents and log lines hang off the execution id.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use super::models::{JobExecutionRecord, NewJobDetail, NewJobExecution, NewJobLog};
use super::pool::{run_blocking, SqlitePool};
use crate::error::{BatchError, Severity};

/// Terminal and transitional execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Whether a failed execution got another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    NotRetried,
    Scheduled,
    Exhausted,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::NotRetried => "not_retried",
            RetryStatus::Scheduled => "scheduled",
            RetryStatus::Exhausted => "exhausted",
        }
    }
}

/// Closing half of an execution envelope.
pub struct ExecutionClose {
    pub status: ExecutionStatus,
    pub processed_records: u64,
    pub failed_records: u64,
    pub error: Option<(String, Severity)>,
    pub retry_status: RetryStatus,
}

#[derive(Clone)]
pub struct ExecutionLedger {
    pool: SqlitePool,
}

impl ExecutionLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open an envelope: insert the Running row and return the execution id.
    pub async fn record_start(
        &self,
        job_id: &str,
        retry_attempt: u32,
    ) -> Result<String, BatchError> {
        let execution_id = Uuid::new_v4().to_string();
        let row = NewJobExecution {
            id: execution_id.clone(),
            job_id: job_id.to_string(),
            status: ExecutionStatus::Running.as_str().to_string(),
            started_at: super::format_ts(Utc::now()),
            ended_at: None,
            processed_records: 0,
            failed_records: 0,
            error_message: None,
            error_severity: None,
            retry_attempt: retry_attempt as i32,
            retry_status: RetryStatus::NotRetried.as_str().to_string(),
        };
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(crate::schema::batch_job_executions::table)
                .values(&row)
                .execute(conn)
        })
        .await?;
        Ok(execution_id)
    }

    /// Close an envelope. Only a Running row transitions; closed rows stay
    /// as written.
    pub async fn record_end(
        &self,
        execution_id: &str,
        close: ExecutionClose,
    ) -> Result<(), BatchError> {
        use crate::schema::batch_job_executions::dsl;
        let execution_id = execution_id.to_string();
        let (error_message, error_severity) = match close.error {
            Some((msg, severity)) => (Some(msg), Some(severity.as_str().to_string())),
            None => (None, None),
        };
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::update(
                dsl::batch_job_executions
                    .find(&execution_id)
                    .filter(dsl::status.eq(ExecutionStatus::Running.as_str())),
            )
            .set((
                dsl::status.eq(close.status.as_str()),
                dsl::ended_at.eq(Some(super::format_ts(Utc::now()))),
                dsl::processed_records.eq(close.processed_records as i32),
                dsl::failed_records.eq(close.failed_records as i32),
                dsl::error_message.eq(error_message),
                dsl::error_severity.eq(error_severity),
                dsl::retry_status.eq(close.retry_status.as_str()),
            ))
            .execute(conn)
        })
        .await?;
        Ok(())
    }

    /// Record a fire that never ran its body (dependency not satisfied).
    pub async fn record_skipped(&self, job_id: &str, reason: &str) -> Result<String, BatchError> {
        let execution_id = Uuid::new_v4().to_string();
        let now = super::format_ts(Utc::now());
        let row = NewJobExecution {
            id: execution_id.clone(),
            job_id: job_id.to_string(),
            status: ExecutionStatus::Skipped.as_str().to_string(),
            started_at: now.clone(),
            ended_at: Some(now),
            processed_records: 0,
            failed_records: 0,
            error_message: Some(reason.to_string()),
            error_severity: None,
            retry_attempt: 0,
            retry_status: RetryStatus::NotRetried.as_str().to_string(),
        };
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(crate::schema::batch_job_executions::table)
                .values(&row)
                .execute(conn)
        })
        .await?;
        Ok(execution_id)
    }

    /// End time of the most recent Success for a job, if any.
    pub async fn latest_success(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, BatchError> {
        use crate::schema::batch_job_executions::dsl;
        let job_id = job_id.to_string();
        let pool = self.pool.clone();
        let ended: Option<Option<String>> = run_blocking(pool, move |conn| {
            dsl::batch_job_executions
                .filter(dsl::job_id.eq(&job_id))
                .filter(dsl::status.eq(ExecutionStatus::Success.as_str()))
                .order(dsl::ended_at.desc())
                .select(dsl::ended_at)
                .first::<Option<String>>(conn)
                .optional()
        })
        .await?;
        Ok(ended.flatten().and_then(|raw| super::parse_ts(&raw)))
    }

    /// Most recent execution row for a job, regardless of outcome.
    pub async fn latest_execution(
        &self,
        job_id: &str,
    ) -> Result<Option<JobExecutionRecord>, BatchError> {
        use crate::schema::batch_job_executions::dsl;
        let job_id = job_id.to_string();
        let pool = self.pool.clone();
        let record = run_blocking(pool, move |conn| {
            dsl::batch_job_executions
                .filter(dsl::job_id.eq(&job_id))
                .order(dsl::started_at.desc())
                .first::<JobExecutionRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record)
    }

    /// Recent executions across all jobs, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<JobExecutionRecord>, BatchError> {
        use crate::schema::batch_job_executions::dsl;
        let pool = self.pool.clone();
        let records = run_blocking(pool, move |conn| {
            dsl::batch_job_executions
                .order(dsl::started_at.desc())
                .limit(limit)
                .load::<JobExecutionRecord>(conn)
        })
        .await?;
        Ok(records)
    }

    /// Count of open Running rows for one job.
    pub async fn running_count(&self, job_id: &str) -> Result<u64, BatchError> {
        use crate::schema::batch_job_executions::dsl;
        let job_id = job_id.to_string();
        let pool = self.pool.clone();
        let count: i64 = run_blocking(pool, move |conn| {
            dsl::batch_job_executions
                .filter(dsl::job_id.eq(&job_id))
                .filter(dsl::status.eq(ExecutionStatus::Running.as_str()))
                .count()
                .get_result(conn)
        })
        .await?;
        Ok(count as u64)
    }

    /// Attach a structured detail document to an execution.
    pub async fn append_detail(
        &self,
        execution_id: &str,
        key: &str,
        detail: &Value,
    ) -> Result<(), BatchError> {
        let row = NewJobDetail {
            execution_id: execution_id.to_string(),
            detail_key: key.to_string(),
            detail: detail.to_string(),
            created_at: super::format_ts(Utc::now()),
        };
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(crate::schema::batch_job_details::table)
                .values(&row)
                .execute(conn)
        })
        .await?;
        Ok(())
    }

    /// Attach a coarse log line to an execution.
    pub async fn append_log(
        &self,
        execution_id: &str,
        level: &str,
        message: &str,
    ) -> Result<(), BatchError> {
        let row = NewJobLog {
            execution_id: execution_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            created_at: super::format_ts(Utc::now()),
        };
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(crate::schema::batch_job_logs::table)
                .values(&row)
                .execute(conn)
        })
        .await?;
        Ok(())
    }
}
