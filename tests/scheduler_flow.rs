//! Scheduler dispatch semantics: envelopes, dependency windows, the
//! single-running-instance rule, retries, and timeouts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tourbatch::config::Settings;
use tourbatch::error::BatchError;
use tourbatch::gateway::archive::RawArchiveWriter;
use tourbatch::gateway::executor::{ExecutorConfig, HttpExecutor};
use tourbatch::gateway::governor::{ConcurrencyGovernor, GovernorConfig};
use tourbatch::jobs::{BatchJob, JobContext, JobOutcome, JobParams, JobServices};
use tourbatch::keys::quota_store::MemoryQuotaStore;
use tourbatch::keys::KeyRegistry;
use tourbatch::notify::{AlertDispatcher, LogAlertChannel};
use tourbatch::pipeline::upsert::BulkUpsertEngine;
use tourbatch::providers::Provider;
use tourbatch::quality::QualityGate;
use tourbatch::repository::ledger::{ExecutionLedger, ExecutionStatus};
use tourbatch::repository::migrations;
use tourbatch::repository::pool::create_pool;
use tourbatch::repository::raw::RawDataRepository;
use tourbatch::repository::parse_ts;
use tourbatch::scheduler::{JobDefinition, JobPriority, Scheduler, Trigger};

async fn setup_services() -> (Arc<JobServices>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = create_pool(&dir.path().join("test.db")).expect("Failed to create pool");
    migrations::run_migrations(pool.clone())
        .await
        .expect("Failed to run migrations");

    let mut settings = Settings::default();
    settings.data_dir = dir.path().to_path_buf();
    settings.database_path = dir.path().join("test.db");
    settings.quota_db_path = dir.path().join("quota.db");
    let settings = Arc::new(settings);

    let registry = Arc::new(KeyRegistry::new(
        settings.timezone,
        &["test-key".to_string()],
        100,
        &[],
        100,
        Arc::new(MemoryQuotaStore::new()),
    ));
    let governor = Arc::new(ConcurrencyGovernor::new(GovernorConfig::default()));
    let archive = Arc::new(RawArchiveWriter::new(RawDataRepository::new(pool.clone())));
    let executor = Arc::new(
        HttpExecutor::new(
            registry,
            governor,
            archive,
            ExecutorConfig::from_settings(&settings),
        )
        .expect("executor"),
    );

    let services = Arc::new(JobServices {
        pool: pool.clone(),
        executor,
        upsert: Arc::new(BulkUpsertEngine::new(pool.clone(), settings.preset)),
        quality: Arc::new(QualityGate::new(pool.clone(), settings.timezone)),
        ledger: Arc::new(ExecutionLedger::new(pool.clone())),
        raw: Arc::new(RawDataRepository::new(pool)),
        settings,
    });
    (services, dir)
}

struct TestJob {
    definition: JobDefinition,
    runs: Arc<AtomicU32>,
    failures_remaining: Arc<AtomicU32>,
    body_delay: Duration,
    error: fn() -> BatchError,
}

impl TestJob {
    fn new(id: &str, dependencies: Vec<String>) -> Self {
        Self {
            definition: JobDefinition {
                id: id.to_string(),
                name: id.to_string(),
                job_type: "test".to_string(),
                trigger: Trigger::Interval(Duration::from_secs(3600)),
                timeout: Duration::from_secs(5),
                max_retries: 2,
                retry_backoff_base: Duration::ZERO,
                priority: JobPriority::Medium,
                dependencies,
                enabled: true,
            },
            runs: Arc::new(AtomicU32::new(0)),
            failures_remaining: Arc::new(AtomicU32::new(0)),
            body_delay: Duration::ZERO,
            error: || BatchError::Transient {
                detail: "synthetic failure".to_string(),
            },
        }
    }

    fn failing_times(mut self, failures: u32) -> Self {
        self.failures_remaining = Arc::new(AtomicU32::new(failures));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.body_delay = delay;
        self
    }

    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout = timeout;
        self
    }

    fn with_error(mut self, error: fn() -> BatchError) -> Self {
        self.error = error;
        self
    }
}

#[async_trait]
impl BatchJob for TestJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, BatchError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.body_delay.is_zero() {
            tokio::time::sleep(self.body_delay).await;
        }
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err((self.error)());
        }
        Ok(JobOutcome {
            processed_records: 5,
            failed_records: 0,
            detail: serde_json::json!({}),
        })
    }
}

fn scheduler_with(services: &Arc<JobServices>, jobs: Vec<Arc<dyn BatchJob>>) -> Arc<Scheduler> {
    let alerts = Arc::new(AlertDispatcher::new(
        Arc::new(LogAlertChannel),
        Duration::from_secs(3600),
    ));
    let mut scheduler = Scheduler::new(services.clone(), alerts, 4, services.settings.timezone);
    for job in jobs {
        scheduler.register(job).expect("register job");
    }
    Arc::new(scheduler)
}

#[tokio::test]
async fn success_writes_a_closed_envelope() {
    let (services, _dir) = setup_services().await;
    let job = Arc::new(TestJob::new("job-a", vec![]));
    let scheduler = scheduler_with(&services, vec![job.clone()]);

    let summary = scheduler
        .clone()
        .run_job_now("job-a", JobParams::None)
        .await
        .expect("dispatch");
    assert_eq!(summary.status, ExecutionStatus::Success);
    assert_eq!(summary.processed_records, 5);
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);

    let record = services
        .ledger
        .latest_execution("job-a")
        .await
        .expect("ledger")
        .expect("row present");
    assert_eq!(record.status, "success");
    assert_eq!(record.processed_records, 5);
    let started = parse_ts(&record.started_at).expect("started");
    let ended = parse_ts(record.ended_at.as_deref().expect("ended")).expect("ended ts");
    assert!(ended >= started);
}

#[tokio::test]
async fn unsatisfied_dependency_skips_without_running_the_body() {
    let (services, _dir) = setup_services().await;
    let job_a = Arc::new(TestJob::new("job-a", vec![]));
    let job_b = Arc::new(TestJob::new("job-b", vec!["job-a".to_string()]));
    let scheduler = scheduler_with(&services, vec![job_a, job_b.clone()]);

    let summary = scheduler
        .clone()
        .run_job_now("job-b", JobParams::None)
        .await
        .expect("dispatch");
    assert_eq!(summary.status, ExecutionStatus::Skipped);
    assert_eq!(job_b.runs.load(Ordering::SeqCst), 0);

    let record = services
        .ledger
        .latest_execution("job-b")
        .await
        .expect("ledger")
        .expect("skip recorded");
    assert_eq!(record.status, "skipped");
    assert!(record.error_message.unwrap().contains("job-a"));
}

#[tokio::test]
async fn satisfied_dependency_lets_the_job_run() {
    let (services, _dir) = setup_services().await;
    let job_a = Arc::new(TestJob::new("job-a", vec![]));
    let job_b = Arc::new(TestJob::new("job-b", vec!["job-a".to_string()]));
    let scheduler = scheduler_with(&services, vec![job_a, job_b.clone()]);

    let summary = scheduler
        .clone()
        .run_job_now("job-a", JobParams::None)
        .await
        .expect("run a");
    assert_eq!(summary.status, ExecutionStatus::Success);

    let summary = scheduler
        .clone()
        .run_job_now("job-b", JobParams::None)
        .await
        .expect("run b");
    assert_eq!(summary.status, ExecutionStatus::Success);
    assert_eq!(job_b.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn the_same_job_never_runs_twice_concurrently() {
    let (services, _dir) = setup_services().await;
    let job = Arc::new(TestJob::new("slow", vec![]).with_delay(Duration::from_millis(300)));
    let scheduler = scheduler_with(&services, vec![job.clone()]);

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_job_now("slow", JobParams::None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        services.ledger.running_count("slow").await.expect("count"),
        1
    );
    let second = scheduler
        .clone()
        .run_job_now("slow", JobParams::None)
        .await
        .expect("second dispatch");

    assert_eq!(second.status, ExecutionStatus::Skipped);
    let first = first.await.expect("join").expect("first dispatch");
    assert_eq!(first.status, ExecutionStatus::Success);
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failure_is_retried_until_success() {
    let (services, _dir) = setup_services().await;
    let job = Arc::new(TestJob::new("flaky", vec![]).failing_times(1));
    let scheduler = scheduler_with(&services, vec![job.clone()]);

    let summary = scheduler
        .clone()
        .run_job_now("flaky", JobParams::None)
        .await
        .expect("dispatch");
    assert_eq!(summary.status, ExecutionStatus::Failed);

    // Backoff base is zero; the retry lands almost immediately.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    assert!(services
        .ledger
        .latest_success("flaky")
        .await
        .expect("ledger")
        .is_some());

    let recent = services.ledger.recent(10).await.expect("recent");
    let first_attempt = recent
        .iter()
        .find(|r| r.job_id == "flaky" && r.retry_attempt == 0)
        .expect("first attempt row");
    assert_eq!(first_attempt.retry_status, "scheduled");
}

#[tokio::test]
async fn non_retryable_failure_is_terminal() {
    let (services, _dir) = setup_services().await;
    let job = Arc::new(
        TestJob::new("quota", vec![])
            .failing_times(5)
            .with_error(|| BatchError::QuotaExhausted {
                provider: Provider::Kto,
            }),
    );
    let scheduler = scheduler_with(&services, vec![job.clone()]);

    let summary = scheduler
        .clone()
        .run_job_now("quota", JobParams::None)
        .await
        .expect("dispatch");
    assert_eq!(summary.status, ExecutionStatus::Failed);
    assert_eq!(summary.error_kind, Some("quota_exhausted"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);

    let record = services
        .ledger
        .latest_execution("quota")
        .await
        .expect("ledger")
        .expect("row");
    assert_eq!(record.error_severity.as_deref(), Some("critical"));
    assert_eq!(record.retry_status, "not_retried");
}

#[tokio::test]
async fn timeout_is_recorded_as_timeout() {
    let (services, _dir) = setup_services().await;
    let job = Arc::new(
        TestJob::new("sluggish", vec![])
            .with_delay(Duration::from_secs(5))
            .with_timeout(Duration::from_millis(100)),
    );
    let scheduler = scheduler_with(&services, vec![job]);

    let summary = scheduler
        .clone()
        .run_job_now("sluggish", JobParams::None)
        .await
        .expect("dispatch");
    assert_eq!(summary.status, ExecutionStatus::Timeout);

    let record = services
        .ledger
        .latest_execution("sluggish")
        .await
        .expect("ledger")
        .expect("row");
    assert_eq!(record.status, "timeout");
    assert_eq!(record.error_severity.as_deref(), Some("high"));
}

#[tokio::test]
async fn unknown_job_is_a_configuration_error() {
    let (services, _dir) = setup_services().await;
    let scheduler = scheduler_with(&services, vec![]);
    let result = scheduler.clone().run_job_now("nope", JobParams::None).await;
    assert!(matches!(result, Err(BatchError::Config { .. })));
}
