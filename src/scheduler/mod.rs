//! Job scheduling: triggers, dependencies, retries, timeouts, and the
//! bounded worker pool.
//!
//! One scheduler owns the whole job registry. Trigger loops only decide
//! *when* to fire; every fire funnels through `dispatch`, which enforces
//! the single-running-instance rule, the dependency window, the timeout,
//! and the retry policy, and writes the execution envelope around the body.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{sanitize_detail, BatchError, Severity};
use crate::jobs::{run_job, BatchJob, JobContext, JobParams, JobServices};
use crate::notify::{Alert, AlertDispatcher};
use crate::repository::ledger::{ExecutionClose, ExecutionStatus, RetryStatus};
use crate::repository::parse_ts;

/// Ceiling on the exponential retry backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(3600);
/// Dependencies must have succeeded within this window.
const DEPENDENCY_WINDOW_HOURS: i64 = 24;
/// How long shutdown waits for running jobs to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed wall-time spacing between fires.
    Interval(Duration),
    /// Six-field cron expression (seconds first), evaluated in the
    /// scheduler's timezone.
    Cron(String),
}

impl Trigger {
    /// Next fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(period) => {
                Some(after + chrono::Duration::from_std(*period).ok()?)
            }
            Trigger::Cron(expr) => {
                let schedule = cron::Schedule::from_str(expr).ok()?;
                let local = after.with_timezone(&tz);
                schedule
                    .after(&local)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }

    /// Approximate spacing between fires, used for the misfire grace
    /// window.
    pub fn period_hint(&self, tz: Tz) -> Duration {
        match self {
            Trigger::Interval(period) => *period,
            Trigger::Cron(expr) => {
                let now = Utc::now();
                let first = self.next_after(now, tz);
                let second = first.and_then(|f| self.next_after(f, tz));
                match (first, second) {
                    (Some(a), Some(b)) => (b - a).to_std().unwrap_or(Duration::from_secs(86400)),
                    _ => Duration::from_secs(86400),
                }
            }
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Interval(period) => write!(f, "every {}s", period.as_secs()),
            Trigger::Cron(expr) => write!(f, "cron {expr}"),
        }
    }
}

/// Queue-ordering priority. Does not preempt running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// Static description of one schedulable job.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub trigger: Trigger,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub priority: JobPriority,
    /// Job ids that must have a Success within the last 24 hours.
    pub dependencies: Vec<String>,
    pub enabled: bool,
}

/// What one dispatch produced, for callers that wait on it.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub job_id: String,
    pub execution_id: Option<String>,
    pub status: ExecutionStatus,
    pub processed_records: u64,
    pub failed_records: u64,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
}

impl ExecutionSummary {
    fn skipped(job_id: &str, execution_id: Option<String>, reason: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            execution_id,
            status: ExecutionStatus::Skipped,
            processed_records: 0,
            failed_records: 0,
            error: Some(reason.to_string()),
            error_kind: None,
        }
    }
}

/// Removes the job id from the running set when the dispatch ends, on
/// every exit path.
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .expect("running set lock poisoned")
            .remove(&self.job_id);
    }
}

pub struct Scheduler {
    services: Arc<JobServices>,
    alerts: Arc<AlertDispatcher>,
    jobs: HashMap<String, Arc<dyn BatchJob>>,
    running: Arc<Mutex<HashSet<String>>>,
    worker_slots: Arc<Semaphore>,
    tz: Tz,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        services: Arc<JobServices>,
        alerts: Arc<AlertDispatcher>,
        workers: usize,
        tz: Tz,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            alerts,
            jobs: HashMap::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            worker_slots: Arc::new(Semaphore::new(workers.max(1))),
            tz,
            shutdown,
        }
    }

    /// Add a job to the registry. Rejects duplicate ids and unparseable
    /// cron expressions at startup rather than at fire time.
    pub fn register(&mut self, job: Arc<dyn BatchJob>) -> Result<(), BatchError> {
        let def = job.definition().clone();
        if self.jobs.contains_key(&def.id) {
            return Err(BatchError::Config {
                detail: format!("duplicate job id: {}", def.id),
            });
        }
        if let Trigger::Cron(expr) = &def.trigger {
            cron::Schedule::from_str(expr).map_err(|e| BatchError::Config {
                detail: format!("job {}: invalid cron expression {expr}: {e}", def.id),
            })?;
        }
        self.jobs.insert(def.id.clone(), job);
        Ok(())
    }

    pub fn definitions(&self) -> Vec<JobDefinition> {
        let mut defs: Vec<JobDefinition> =
            self.jobs.values().map(|j| j.definition().clone()).collect();
        defs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        defs
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Fire one job immediately and wait for its outcome.
    pub async fn run_job_now(
        self: Arc<Self>,
        job_id: &str,
        params: JobParams,
    ) -> Result<ExecutionSummary, BatchError> {
        if !self.jobs.contains_key(job_id) {
            return Err(BatchError::Config {
                detail: format!("unknown job id: {job_id}"),
            });
        }
        Ok(self.dispatch(job_id.to_string(), params, 0).await)
    }

    /// Run trigger loops until shutdown is signalled.
    pub async fn run(self: Arc<Self>) {
        self.clone().misfire_pass().await;

        let mut join = JoinSet::new();
        for (job_id, job) in &self.jobs {
            if !job.definition().enabled {
                info!("job {job_id} is disabled, not scheduling");
                continue;
            }
            let scheduler = self.clone();
            let job_id = job_id.clone();
            join.spawn(async move { scheduler.trigger_loop(job_id).await });
        }

        let mut shutdown = self.shutdown.subscribe();
        if shutdown.changed().await.is_ok() {
            info!("scheduler shutting down");
        }
        join.abort_all();
        while join.join_next().await.is_some() {}
        self.drain().await;
    }

    /// One-period misfire grace: a job whose last fire is older than one
    /// trigger period but younger than two runs once immediately; older
    /// misses are dropped to avoid storms.
    async fn misfire_pass(self: Arc<Self>) {
        for (job_id, job) in &self.jobs {
            let def = job.definition();
            if !def.enabled {
                continue;
            }
            let period = def.trigger.period_hint(self.tz);
            let last = match self.services.ledger.latest_execution(job_id).await {
                Ok(Some(record)) => parse_ts(&record.started_at),
                Ok(None) => None,
                Err(e) => {
                    warn!("misfire check failed for {job_id}: {e}");
                    None
                }
            };
            let Some(last) = last else { continue };
            let Ok(elapsed) = (Utc::now() - last).to_std() else {
                continue;
            };
            if elapsed > period && elapsed < period * 2 {
                info!(
                    "misfire grace: {job_id} last fired {:?} ago, running once now",
                    elapsed
                );
                let scheduler = self.clone();
                let job_id = job_id.clone();
                tokio::spawn(scheduler.dispatch_boxed(job_id, JobParams::None, 0));
            }
        }
    }

    async fn trigger_loop(self: Arc<Self>, job_id: String) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let trigger = match self.jobs.get(&job_id) {
                Some(job) => job.definition().trigger.clone(),
                None => return,
            };
            let now = Utc::now();
            let Some(next) = trigger.next_after(now, self.tz) else {
                warn!("trigger for {job_id} yields no further fires");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!("{job_id} next fire in {wait:?}");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let scheduler = self.clone();
                    let id = job_id.clone();
                    tokio::spawn(scheduler.dispatch_boxed(id, JobParams::None, 0));
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn dispatch_boxed(
        self: Arc<Self>,
        job_id: String,
        params: JobParams,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = ExecutionSummary> + Send>> {
        Box::pin(async move { self.dispatch(job_id, params, attempt).await })
    }

    /// The single execution path for every fire: manual, triggered, misfire
    /// and retry re-entry all come through here.
    async fn dispatch(
        self: Arc<Self>,
        job_id: String,
        params: JobParams,
        attempt: u32,
    ) -> ExecutionSummary {
        let Some(job) = self.jobs.get(&job_id).cloned() else {
            return ExecutionSummary::skipped(&job_id, None, "job not registered");
        };
        let def = job.definition().clone();

        // The same job never runs twice concurrently. A fire that lands
        // while the previous run is still open is dropped, not queued.
        let guard = {
            let mut running = self.running.lock().expect("running set lock poisoned");
            if !running.insert(job_id.clone()) {
                info!("{job_id} is already running, skipping this fire");
                return ExecutionSummary::skipped(&job_id, None, "already running");
            }
            RunGuard {
                running: self.running.clone(),
                job_id: job_id.clone(),
            }
        };

        // Dependency window check happens between the fire and Running.
        for dep in &def.dependencies {
            let satisfied = match self.services.ledger.latest_success(dep).await {
                Ok(Some(ended)) => {
                    (Utc::now() - ended).num_hours() < DEPENDENCY_WINDOW_HOURS
                }
                Ok(None) => false,
                Err(e) => {
                    warn!("dependency lookup failed for {job_id} -> {dep}: {e}");
                    false
                }
            };
            if !satisfied {
                let reason = format!("dependency {dep} has no success in the last 24h");
                warn!("skipping {job_id}: {reason}");
                let execution_id = self
                    .services
                    .ledger
                    .record_skipped(&job_id, &reason)
                    .await
                    .ok();
                drop(guard);
                return ExecutionSummary::skipped(&job_id, execution_id, &reason);
            }
        }

        let Ok(_slot) = self.worker_slots.clone().acquire_owned().await else {
            drop(guard);
            return ExecutionSummary::skipped(&job_id, None, "worker pool closed");
        };

        let execution_id = match self.services.ledger.record_start(&job_id, attempt).await {
            Ok(id) => id,
            Err(e) => {
                error!("could not open execution envelope for {job_id}: {e}");
                drop(guard);
                return ExecutionSummary::skipped(&job_id, None, "ledger unavailable");
            }
        };
        info!("{job_id} execution {execution_id} started (attempt {attempt})");
        let _ = self
            .services
            .ledger
            .append_log(&execution_id, "info", &format!("started (attempt {attempt})"))
            .await;

        let ctx = JobContext::new(self.services.clone(), execution_id.clone(), params.clone());
        let body = tokio::time::timeout(def.timeout, run_job(job.as_ref(), &ctx)).await;
        // `guard` stays alive until the envelope is closed below, so a new
        // fire cannot open a second Running row for this job id.

        match body {
            Ok(Ok(outcome)) => {
                let close = ExecutionClose {
                    status: ExecutionStatus::Success,
                    processed_records: outcome.processed_records,
                    failed_records: outcome.failed_records,
                    error: None,
                    retry_status: RetryStatus::NotRetried,
                };
                if let Err(e) = self.services.ledger.record_end(&execution_id, close).await {
                    error!("could not close execution {execution_id}: {e}");
                }
                info!(
                    "{job_id} execution {execution_id} succeeded ({} records)",
                    outcome.processed_records
                );
                let _ = self
                    .services
                    .ledger
                    .append_log(
                        &execution_id,
                        "info",
                        &format!("completed: {} record(s)", outcome.processed_records),
                    )
                    .await;
                ExecutionSummary {
                    job_id,
                    execution_id: Some(execution_id),
                    status: ExecutionStatus::Success,
                    processed_records: outcome.processed_records,
                    failed_records: outcome.failed_records,
                    error: None,
                    error_kind: None,
                }
            }
            Ok(Err(error)) => {
                self.handle_failure(&job_id, &def, execution_id, params, attempt, error, guard)
                    .await
            }
            Err(_elapsed) => {
                let seconds = def.timeout.as_secs();
                let close = ExecutionClose {
                    status: ExecutionStatus::Timeout,
                    processed_records: 0,
                    failed_records: 0,
                    error: Some((format!("timed out after {seconds}s"), Severity::High)),
                    retry_status: RetryStatus::NotRetried,
                };
                if let Err(e) = self.services.ledger.record_end(&execution_id, close).await {
                    error!("could not close execution {execution_id}: {e}");
                }
                let alert = Alert::new(
                    Severity::High,
                    format!("job timeout: {job_id}"),
                    format!("cancelled after {seconds}s"),
                )
                .for_job(&job_id, Some(&execution_id));
                self.alerts.dispatch(alert).await;
                ExecutionSummary {
                    job_id,
                    execution_id: Some(execution_id),
                    status: ExecutionStatus::Timeout,
                    processed_records: 0,
                    failed_records: 0,
                    error: Some(format!("timed out after {seconds}s")),
                    error_kind: Some("timeout"),
                }
            }
        }
    }

    async fn handle_failure(
        self: Arc<Self>,
        job_id: &str,
        def: &JobDefinition,
        execution_id: String,
        params: JobParams,
        attempt: u32,
        error: BatchError,
        guard: RunGuard,
    ) -> ExecutionSummary {
        let severity = error.severity();
        let kind = error.kind();
        let message = sanitize_detail(&error.to_string());
        let will_retry = attempt < def.max_retries && error.is_retryable();
        let retry_status = if will_retry {
            RetryStatus::Scheduled
        } else if error.is_retryable() {
            RetryStatus::Exhausted
        } else {
            RetryStatus::NotRetried
        };

        let close = ExecutionClose {
            status: ExecutionStatus::Failed,
            processed_records: 0,
            failed_records: 0,
            error: Some((message.clone(), severity)),
            retry_status,
        };
        if let Err(e) = self.services.ledger.record_end(&execution_id, close).await {
            error!("could not close execution {execution_id}: {e}");
        }
        let _ = self
            .services
            .ledger
            .append_log(&execution_id, "error", &format!("{kind}: {message}"))
            .await;
        // Release the running slot before the retry is scheduled; with a
        // short backoff the re-entry could otherwise race the guard and be
        // dropped as "already running".
        drop(guard);

        if will_retry {
            let backoff = def
                .retry_backoff_base
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(MAX_RETRY_BACKOFF);
            warn!(
                "{job_id} execution {execution_id} failed ({kind}), retry {} of {} in {backoff:?}",
                attempt + 1,
                def.max_retries
            );
            let scheduler = self.clone();
            let job_id_owned = job_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                scheduler.dispatch_boxed(job_id_owned, params, attempt + 1).await
            });
        } else {
            error!("{job_id} execution {execution_id} failed terminally ({kind}): {message}");
            let alert = Alert::new(
                severity,
                format!("job failed: {job_id}"),
                format!("{kind}: {message}"),
            )
            .for_job(job_id, Some(&execution_id));
            self.alerts.dispatch(alert).await;
        }

        ExecutionSummary {
            job_id: job_id.to_string(),
            execution_id: Some(execution_id),
            status: ExecutionStatus::Failed,
            processed_records: 0,
            failed_records: 0,
            error: Some(message),
            error_kind: Some(kind),
        }
    }

    /// Give running jobs a bounded window to finish after shutdown.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let open = self
                .running
                .lock()
                .expect("running set lock poisoned")
                .len();
            if open == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("{open} job(s) still running at shutdown deadline");
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_trigger_fires_one_period_later() {
        let trigger = Trigger::Interval(Duration::from_secs(600));
        let now = Utc::now();
        let next = trigger.next_after(now, chrono_tz::Asia::Seoul).unwrap();
        assert_eq!((next - now).num_seconds(), 600);
        assert_eq!(
            trigger.period_hint(chrono_tz::Asia::Seoul),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn cron_trigger_evaluates_in_zone() {
        // Daily at 02:00 local.
        let trigger = Trigger::Cron("0 0 2 * * *".to_string());
        let next = trigger
            .next_after(Utc::now(), chrono_tz::Asia::Seoul)
            .unwrap();
        let local = next.with_timezone(&chrono_tz::Asia::Seoul);
        assert_eq!(local.format("%H:%M:%S").to_string(), "02:00:00");

        let hint = trigger.period_hint(chrono_tz::Asia::Seoul);
        assert_eq!(hint, Duration::from_secs(86400));
    }

    #[test]
    fn invalid_cron_yields_nothing() {
        let trigger = Trigger::Cron("not a cron".to_string());
        assert!(trigger.next_after(Utc::now(), chrono_tz::Asia::Seoul).is_none());
    }
}
