//! Embedded schema migrations.
//!
//! The whole schema is created idempotently at startup. SQLite DDL is
//! transactional, so a partially applied migration cannot survive a crash.

use diesel::connection::SimpleConnection;

use super::pool::{run_blocking, SqlitePool};
use crate::error::BatchError;

const TOURISM_TABLE_COLUMNS: &str = "\
    content_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    address TEXT,
    address_detail TEXT,
    zipcode TEXT,
    region_code TEXT,
    sigungu_code TEXT,
    category_large_code TEXT,
    category_medium_code TEXT,
    category_small_code TEXT,
    longitude REAL,
    latitude REAL,
    phone_number TEXT,
    homepage_url TEXT,
    first_image TEXT,
    thumbnail_image TEXT,
    overview TEXT,
    event_start_date TEXT,
    event_end_date TEXT,
    created_time TEXT,
    modified_time TEXT,
    raw_data_id TEXT,
    last_sync_at TEXT NOT NULL,
    data_quality_score REAL,
    processing_status TEXT NOT NULL DEFAULT 'processed'";

const TOURISM_TABLES: &[&str] = &[
    "tourist_attractions",
    "cultural_facilities",
    "festivals_events",
    "travel_courses",
    "leisure_sports",
    "accommodations",
    "shopping",
    "restaurants",
];

const BASE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS api_raw_data (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'GET',
    request_params TEXT NOT NULL,
    response_status INTEGER NOT NULL,
    response_body TEXT NOT NULL,
    response_size INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    api_key_hash TEXT NOT NULL,
    archive_file_path TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_raw_data_expires ON api_raw_data(expires_at);
CREATE INDEX IF NOT EXISTS idx_raw_data_provider ON api_raw_data(provider, endpoint);

CREATE TABLE IF NOT EXISTS batch_job_executions (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    processed_records INTEGER NOT NULL DEFAULT 0,
    failed_records INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    error_severity TEXT,
    retry_attempt INTEGER NOT NULL DEFAULT 0,
    retry_status TEXT NOT NULL DEFAULT 'not_retried'
);
CREATE INDEX IF NOT EXISTS idx_job_exec_job ON batch_job_executions(job_id, started_at);

CREATE TABLE IF NOT EXISTS batch_job_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    detail_key TEXT NOT NULL,
    detail TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_details_exec ON batch_job_details(execution_id);

CREATE TABLE IF NOT EXISTS batch_job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_quality_thresholds (
    table_name TEXT PRIMARY KEY,
    min_overall_score REAL NOT NULL,
    completeness_weight REAL NOT NULL DEFAULT 0.25,
    validity_weight REAL NOT NULL DEFAULT 0.25,
    consistency_weight REAL NOT NULL DEFAULT 0.25,
    freshness_weight REAL NOT NULL DEFAULT 0.25,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS weather_current (
    region_code TEXT NOT NULL,
    region_name TEXT,
    weather_date TEXT NOT NULL,
    temperature REAL,
    humidity REAL,
    precipitation REAL,
    wind_speed REAL,
    weather_condition TEXT,
    nx INTEGER,
    ny INTEGER,
    raw_data_id TEXT,
    last_sync_at TEXT NOT NULL,
    data_quality_score REAL,
    processing_status TEXT NOT NULL DEFAULT 'processed',
    PRIMARY KEY (region_code, weather_date)
);

CREATE TABLE IF NOT EXISTS weather_forecasts (
    region_code TEXT NOT NULL,
    nx INTEGER,
    ny INTEGER,
    forecast_date TEXT NOT NULL,
    forecast_time TEXT NOT NULL,
    temperature REAL,
    min_temp REAL,
    max_temp REAL,
    humidity REAL,
    precipitation_prob REAL,
    wind_speed REAL,
    weather_condition TEXT,
    forecast_type TEXT NOT NULL DEFAULT 'village',
    raw_data_id TEXT,
    last_sync_at TEXT NOT NULL,
    data_quality_score REAL,
    processing_status TEXT NOT NULL DEFAULT 'processed',
    PRIMARY KEY (region_code, forecast_date, forecast_time)
);

CREATE TABLE IF NOT EXISTS historical_weather_daily (
    region_code TEXT NOT NULL,
    weather_date TEXT NOT NULL,
    avg_temp REAL,
    max_temp REAL,
    min_temp REAL,
    precipitation REAL,
    humidity REAL,
    wind_speed REAL,
    raw_data_id TEXT,
    last_sync_at TEXT NOT NULL,
    data_quality_score REAL,
    processing_status TEXT NOT NULL DEFAULT 'processed',
    PRIMARY KEY (region_code, weather_date)
);
"#;

/// Full schema DDL, including the eight tourism tables.
pub fn schema_sql() -> String {
    let mut sql = String::from(BASE_SQL);
    for table in TOURISM_TABLES {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({TOURISM_TABLE_COLUMNS});\n"
        ));
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_region ON {table}(region_code);\n"
        ));
    }
    sql
}

/// Apply the schema to the pooled database.
pub async fn run_migrations(pool: SqlitePool) -> Result<(), BatchError> {
    let sql = schema_sql();
    run_blocking(pool, move |conn| {
        super::pool::init_connection_pragmas(conn)?;
        conn.batch_execute(&sql)?;
        Ok(())
    })
    .await?;
    Ok(())
}
