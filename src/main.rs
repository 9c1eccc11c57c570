//! Batch engine entry point.
//!
//! Without a subcommand the process runs the scheduler daemon; the
//! subcommands cover the operator surface. Exit codes: 0 success, 1
//! failure, 2 misuse (argument errors), 3 quota exhausted.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tourbatch::config::Settings;
use tourbatch::gateway::archive::RawArchiveWriter;
use tourbatch::gateway::executor::{CallSpec, ExecutorConfig, HttpExecutor};
use tourbatch::gateway::governor::{ConcurrencyGovernor, GovernorConfig};
use tourbatch::jobs::cleanup::RawCleanupJob;
use tourbatch::jobs::quality::QualityCheckJob;
use tourbatch::jobs::tourism::TourismSyncJob;
use tourbatch::jobs::weather::{HistoricalWeatherJob, WeatherSyncJob};
use tourbatch::jobs::{JobParams, JobServices};
use tourbatch::keys::quota_store::SqliteQuotaStore;
use tourbatch::keys::KeyRegistry;
use tourbatch::notify::{AlertDispatcher, LogAlertChannel};
use tourbatch::pipeline::upsert::BulkUpsertEngine;
use tourbatch::providers::{kma, kto, Provider};
use tourbatch::quality::QualityGate;
use tourbatch::repository::ledger::{ExecutionLedger, ExecutionStatus};
use tourbatch::repository::pool::create_pool;
use tourbatch::repository::raw::RawDataRepository;
use tourbatch::repository::{migrations, parse_ts};
use tourbatch::scheduler::Scheduler;
use tourbatch::BatchError;

const EXIT_FAILURE: u8 = 1;
const EXIT_QUOTA_EXHAUSTED: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "tourbatch")]
#[command(about = "Tourism and weather batch ingestion engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List registered jobs and their triggers.
    List,
    /// Run one job immediately and wait for it.
    Run { job_id: String },
    /// Run every enabled job once, in priority order.
    RunAll,
    /// Show key usage and recent executions.
    Status,
    /// Issue one cheap request per provider to verify connectivity.
    Test,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::try_new(level)
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("startup aborted: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match run(cli, settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

struct App {
    scheduler: Arc<Scheduler>,
    services: Arc<JobServices>,
    registry: Arc<KeyRegistry>,
}

async fn bootstrap(settings: Arc<Settings>) -> Result<App> {
    settings
        .ensure_directories()
        .context("could not create data directories")?;

    let pool = create_pool(&settings.database_path).context("database pool")?;
    migrations::run_migrations(pool.clone())
        .await
        .context("migrations")?;

    let quota_store =
        Arc::new(SqliteQuotaStore::open(&settings.quota_db_path).context("quota ledger")?);
    let registry = Arc::new(KeyRegistry::new(
        settings.timezone,
        &settings.kto.keys,
        settings.kto.daily_limit,
        &settings.kma.keys,
        settings.kma.daily_limit,
        quota_store,
    ));

    let governor = Arc::new(ConcurrencyGovernor::new(GovernorConfig {
        max_concurrent_kto: settings.kto.max_concurrent,
        max_concurrent_kma: settings.kma.max_concurrent,
        max_concurrent_total: settings.max_concurrent_total,
        min_interval: settings.min_interval,
        ..GovernorConfig::default()
    }));

    let raw = Arc::new(RawDataRepository::new(pool.clone()));
    let archive = Arc::new(RawArchiveWriter::new(RawDataRepository::new(pool.clone())));
    let executor = Arc::new(HttpExecutor::new(
        registry.clone(),
        governor,
        archive,
        ExecutorConfig::from_settings(&settings),
    )?);

    let services = Arc::new(JobServices {
        pool: pool.clone(),
        executor,
        upsert: Arc::new(BulkUpsertEngine::new(pool.clone(), settings.preset)),
        quality: Arc::new(QualityGate::new(pool.clone(), settings.timezone)),
        ledger: Arc::new(ExecutionLedger::new(pool)),
        raw,
        settings: settings.clone(),
    });

    let alerts = Arc::new(AlertDispatcher::new(
        Arc::new(LogAlertChannel),
        settings.alert_cooldown,
    ));

    let mut scheduler = Scheduler::new(
        services.clone(),
        alerts,
        settings.workers,
        settings.timezone,
    );
    scheduler.register(Arc::new(TourismSyncJob::new()))?;
    scheduler.register(Arc::new(WeatherSyncJob::new()))?;
    scheduler.register(Arc::new(HistoricalWeatherJob::new()))?;
    scheduler.register(Arc::new(QualityCheckJob::new(vec![
        tourbatch::jobs::tourism::JOB_ID.to_string(),
        tourbatch::jobs::weather::WEATHER_SYNC_JOB_ID.to_string(),
    ])))?;
    scheduler.register(Arc::new(RawCleanupJob::new()))?;

    Ok(App {
        scheduler: Arc::new(scheduler),
        services,
        registry,
    })
}

async fn run(cli: Cli, settings: Arc<Settings>) -> Result<u8> {
    let app = bootstrap(settings.clone()).await?;

    match cli.command {
        None => {
            info!("starting scheduler daemon ({} jobs)", app.scheduler.definitions().len());
            let run_handle = tokio::spawn(app.scheduler.clone().run());
            tokio::signal::ctrl_c().await.context("signal handler")?;
            app.scheduler.signal_shutdown();
            let _ = run_handle.await;
            Ok(0)
        }
        Some(Commands::List) => {
            for def in app.scheduler.definitions() {
                let deps = if def.dependencies.is_empty() {
                    String::new()
                } else {
                    format!("  deps: {}", def.dependencies.join(", "))
                };
                let state = if def.enabled { "" } else { "  [disabled]" };
                println!("{:<24} {:<20} {}{deps}{state}", def.id, def.trigger.to_string(), def.name);
            }
            Ok(0)
        }
        Some(Commands::Run { job_id }) => {
            let summary = match app
                .scheduler
                .clone()
                .run_job_now(&job_id, JobParams::None)
                .await
            {
                Ok(summary) => summary,
                Err(BatchError::Config { detail }) => {
                    eprintln!("{detail}");
                    return Ok(2);
                }
                Err(e) => return Err(e.into()),
            };
            print_summary(&summary);
            Ok(exit_code_for(&summary))
        }
        Some(Commands::RunAll) => {
            let mut worst = 0u8;
            for def in app.scheduler.definitions() {
                if !def.enabled {
                    continue;
                }
                let summary = app
                    .scheduler
                    .clone()
                    .run_job_now(&def.id, JobParams::None)
                    .await
                    .map_err(anyhow::Error::from)?;
                print_summary(&summary);
                worst = worst.max(exit_code_for(&summary));
            }
            Ok(worst)
        }
        Some(Commands::Status) => {
            print_status(&app).await?;
            Ok(0)
        }
        Some(Commands::Test) => {
            let mut code = 0u8;
            code = code.max(test_provider(&app, Provider::Kto).await);
            code = code.max(test_provider(&app, Provider::Kma).await);
            Ok(code)
        }
    }
}

fn exit_code_for(summary: &tourbatch::scheduler::ExecutionSummary) -> u8 {
    match summary.status {
        ExecutionStatus::Success => 0,
        _ if summary.error_kind == Some("quota_exhausted") => EXIT_QUOTA_EXHAUSTED,
        _ => EXIT_FAILURE,
    }
}

fn print_summary(summary: &tourbatch::scheduler::ExecutionSummary) {
    match &summary.error {
        None => println!(
            "{}: {} ({} records)",
            summary.job_id,
            summary.status.as_str(),
            summary.processed_records
        ),
        Some(error) => println!(
            "{}: {} - {error}",
            summary.job_id,
            summary.status.as_str()
        ),
    }
}

async fn print_status(app: &App) -> Result<()> {
    let snapshot = app.registry.snapshot();
    println!("quota day: {}", snapshot.day);
    for (provider, keys) in [("KTO", &snapshot.kto), ("KMA", &snapshot.kma)] {
        if keys.is_empty() {
            println!("{provider}: no keys configured");
            continue;
        }
        for key in keys {
            println!(
                "{provider} {}  {}  usage {}/{}  errors {}  calls {} ({} ok)",
                key.hash,
                key.state.as_str(),
                key.usage,
                key.quota,
                key.consecutive_errors,
                key.total_calls,
                key.total_successes
            );
        }
    }

    println!();
    println!("recent executions:");
    for record in app.services.ledger.recent(10).await? {
        let started = parse_ts(&record.started_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| record.started_at.clone());
        println!(
            "{:<24} {:<9} {}  processed {}  attempt {}",
            record.job_id, record.status, started, record.processed_records, record.retry_attempt
        );
    }
    Ok(())
}

async fn test_provider(app: &App, provider: Provider) -> u8 {
    let configured = match provider {
        Provider::Kto => !app.services.settings.kto.keys.is_empty(),
        Provider::Kma => !app.services.settings.kma.keys.is_empty(),
    };
    if !configured {
        println!("{provider}: no keys configured, skipping");
        return 0;
    }

    let (endpoint, params) = match provider {
        Provider::Kto => kto::KtoApi::probe_spec(),
        Provider::Kma => kma::KmaApi::probe_spec(app.services.settings.timezone),
    };
    let result = app
        .services
        .executor
        .call(CallSpec {
            provider,
            endpoint,
            params,
            store_raw: false,
        })
        .await;
    match result {
        Ok(response) => {
            println!(
                "{provider}: ok (HTTP {} in {}ms, key {})",
                response.status, response.duration_ms, response.key_hash
            );
            0
        }
        Err(e @ BatchError::QuotaExhausted { .. }) => {
            println!("{provider}: {e}");
            EXIT_QUOTA_EXHAUSTED
        }
        Err(e) => {
            println!("{provider}: {e}");
            EXIT_FAILURE
        }
    }
}
