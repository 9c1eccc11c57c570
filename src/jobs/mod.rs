//! Job contract and shared execution context.
//!
//! Every job follows validate → execute → cleanup; cleanup runs on every
//! exit path. Jobs receive everything they touch through `JobContext` —
//! there is no global state — and report a structured outcome that the
//! scheduler folds into the execution envelope.

pub mod cleanup;
pub mod quality;
pub mod tourism;
pub mod weather;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Settings;
use crate::error::BatchError;
use crate::gateway::executor::HttpExecutor;
use crate::pipeline::transform::ContentType;
use crate::pipeline::upsert::BulkUpsertEngine;
use crate::quality::QualityGate;
use crate::repository::ledger::ExecutionLedger;
use crate::repository::pool::SqlitePool;
use crate::repository::raw::RawDataRepository;
use crate::scheduler::JobDefinition;

/// Typed parameter bundle, delivered opaquely by the scheduler.
#[derive(Debug, Clone, Default)]
pub enum JobParams {
    #[default]
    None,
    Tourism {
        content_types: Vec<ContentType>,
        area_codes: Vec<String>,
    },
    Weather {
        region_codes: Vec<String>,
    },
}

/// What a job body reports back on success.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub processed_records: u64,
    pub failed_records: u64,
    pub detail: Value,
}

/// Long-lived collaborators shared by every job execution.
pub struct JobServices {
    pub settings: Arc<Settings>,
    pub pool: SqlitePool,
    pub executor: Arc<HttpExecutor>,
    pub upsert: Arc<BulkUpsertEngine>,
    pub quality: Arc<QualityGate>,
    pub ledger: Arc<ExecutionLedger>,
    pub raw: Arc<RawDataRepository>,
}

/// Everything one execution can reach.
#[derive(Clone)]
pub struct JobContext {
    pub services: Arc<JobServices>,
    pub execution_id: String,
    pub params: JobParams,
}

impl JobContext {
    /// Per-run view: the shared services plus this run's identity and
    /// parameters.
    pub fn new(services: Arc<JobServices>, execution_id: String, params: JobParams) -> Self {
        Self {
            services,
            execution_id,
            params,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    pub fn executor(&self) -> &Arc<HttpExecutor> {
        &self.services.executor
    }

    pub fn upsert(&self) -> &BulkUpsertEngine {
        &self.services.upsert
    }

    pub fn quality(&self) -> &QualityGate {
        &self.services.quality
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.services.ledger
    }

    pub fn raw(&self) -> &RawDataRepository {
        &self.services.raw
    }

    /// Attach a detail document to this execution; failures are logged by
    /// the ledger, never fatal for the job.
    pub async fn detail(&self, key: &str, value: &Value) {
        if let Err(e) = self
            .services
            .ledger
            .append_detail(&self.execution_id, key, value)
            .await
        {
            tracing::warn!("detail write failed for {}: {e}", self.execution_id);
        }
    }
}

/// Contract every batch job implements.
#[async_trait]
pub trait BatchJob: Send + Sync {
    fn definition(&self) -> &JobDefinition;

    /// Cheap prerequisite checks before the body runs.
    async fn validate(&self, _ctx: &JobContext) -> Result<(), BatchError> {
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, BatchError>;

    /// Invoked on every exit path, success or failure.
    async fn cleanup(&self, _ctx: &JobContext) {}
}

/// Run one job through its full contract.
pub async fn run_job(job: &dyn BatchJob, ctx: &JobContext) -> Result<JobOutcome, BatchError> {
    if let Err(e) = job.validate(ctx).await {
        job.cleanup(ctx).await;
        return Err(e);
    }
    let outcome = job.execute(ctx).await;
    job.cleanup(ctx).await;
    outcome
}
