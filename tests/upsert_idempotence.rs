//! Bulk upsert behavior against a real database: idempotence on conflict
//! keys, update-on-conflict semantics, and report accounting.

use std::sync::Arc;

use diesel::prelude::*;
use tourbatch::config::TuningPreset;
use tourbatch::pipeline::transform::{ContentType, ForecastRecord, TourismRecord};
use tourbatch::pipeline::upsert::BulkUpsertEngine;
use tourbatch::repository::domain;
use tourbatch::repository::migrations;
use tourbatch::repository::pool::{create_pool, run_blocking, SqlitePool};

/// Create a temporary SQLite database with the schema applied.
async fn setup_test_db() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("test.db");
    let pool = create_pool(&db_path).expect("Failed to create pool");
    migrations::run_migrations(pool.clone())
        .await
        .expect("Failed to run migrations");
    (pool, dir)
}

fn attraction(content_id: u32, title: &str) -> TourismRecord {
    TourismRecord {
        content_id: content_id.to_string(),
        content_type_code: "12".to_string(),
        title: title.to_string(),
        address: Some("1 Test-ro".to_string()),
        address_detail: None,
        zipcode: None,
        region_code: Some("1".to_string()),
        sigungu_code: None,
        category_large_code: Some("A01".to_string()),
        category_medium_code: None,
        category_small_code: None,
        longitude: Some(127.0),
        latitude: Some(37.5),
        phone_number: None,
        homepage_url: None,
        first_image: None,
        thumbnail_image: None,
        overview: None,
        event_start_date: None,
        event_end_date: None,
        created_time: None,
        modified_time: Some("20260801120000".to_string()),
        raw_data_id: None,
        quality_score: 0.6,
    }
}

fn forecast(region: &str, date: &str, time: &str, temp: f64) -> ForecastRecord {
    ForecastRecord {
        region_code: region.to_string(),
        nx: Some(60),
        ny: Some(127),
        forecast_date: date.to_string(),
        forecast_time: time.to_string(),
        temperature: Some(temp),
        min_temp: None,
        max_temp: None,
        humidity: Some(60.0),
        precipitation_prob: Some(10.0),
        wind_speed: Some(2.0),
        weather_condition: Some("clear".to_string()),
        forecast_type: "village".to_string(),
        raw_data_id: None,
        quality_score: 1.0,
    }
}

async fn count_rows(pool: &SqlitePool, table: &'static str) -> i64 {
    #[derive(QueryableByName)]
    struct CountRow {
        #[diesel(sql_type = diesel::sql_types::BigInt)]
        n: i64,
    }
    run_blocking(pool.clone(), move |conn| {
        diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table}"))
            .get_result::<CountRow>(conn)
    })
    .await
    .expect("count query")
    .n
}

#[tokio::test]
async fn replaying_the_same_rows_adds_nothing() {
    let (pool, _dir) = setup_test_db().await;
    let engine = Arc::new(BulkUpsertEngine::new(pool.clone(), TuningPreset::Balanced));

    let rows: Vec<TourismRecord> = (0..2500).map(|i| attraction(i, "First pass")).collect();
    let report = engine
        .execute("tourist_attractions", rows.clone(), |conn, chunk| {
            domain::upsert_tourism_chunk(conn, ContentType::Attraction, chunk, true)
        })
        .await
        .expect("first pass");
    assert_eq!(report.total_records, 2500);
    assert_eq!(report.successful_records, 2500);
    assert_eq!(report.failed_records, 0);
    assert_eq!(count_rows(&pool, "tourist_attractions").await, 2500);

    let report = engine
        .execute("tourist_attractions", rows, |conn, chunk| {
            domain::upsert_tourism_chunk(conn, ContentType::Attraction, chunk, true)
        })
        .await
        .expect("second pass");
    assert_eq!(report.successful_records, 2500);
    assert_eq!(count_rows(&pool, "tourist_attractions").await, 2500);
}

#[tokio::test]
async fn conflict_updates_non_key_columns() {
    let (pool, _dir) = setup_test_db().await;
    let engine = BulkUpsertEngine::new(pool.clone(), TuningPreset::Conservative);

    let first = vec![attraction(42, "Old title")];
    engine
        .execute("tourist_attractions", first, |conn, chunk| {
            domain::upsert_tourism_chunk(conn, ContentType::Attraction, chunk, true)
        })
        .await
        .expect("insert");

    let mut updated = attraction(42, "New title");
    updated.address = None;
    engine
        .execute("tourist_attractions", vec![updated], |conn, chunk| {
            domain::upsert_tourism_chunk(conn, ContentType::Attraction, chunk, true)
        })
        .await
        .expect("update");

    #[derive(QueryableByName)]
    struct Row {
        #[diesel(sql_type = diesel::sql_types::Text)]
        title: String,
        #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
        address: Option<String>,
    }
    let row = run_blocking(pool, move |conn| {
        diesel::sql_query("SELECT title, address FROM tourist_attractions WHERE content_id = '42'")
            .get_result::<Row>(conn)
    })
    .await
    .expect("read back");
    assert_eq!(row.title, "New title");
    // treat_none_as_null: the update clears columns the new row lacks.
    assert_eq!(row.address, None);
}

#[tokio::test]
async fn composite_conflict_keys_deduplicate_forecasts() {
    let (pool, _dir) = setup_test_db().await;
    let engine = BulkUpsertEngine::new(pool.clone(), TuningPreset::Balanced);

    let mut rows = Vec::new();
    for hour in 0..24 {
        rows.push(forecast("1", "2026-08-03", &format!("{hour:02}00"), 20.0));
    }
    engine
        .execute("weather_forecasts", rows, |conn, chunk| {
            domain::upsert_forecast_chunk(conn, chunk, true)
        })
        .await
        .expect("first pass");

    // Same slots again with a new temperature.
    let rows: Vec<ForecastRecord> = (0..24)
        .map(|hour| forecast("1", "2026-08-03", &format!("{hour:02}00"), 25.0))
        .collect();
    engine
        .execute("weather_forecasts", rows, |conn, chunk| {
            domain::upsert_forecast_chunk(conn, chunk, true)
        })
        .await
        .expect("second pass");

    assert_eq!(count_rows(&pool, "weather_forecasts").await, 24);

    #[derive(QueryableByName)]
    struct TempRow {
        #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Double>)]
        temperature: Option<f64>,
    }
    let row = run_blocking(pool, move |conn| {
        diesel::sql_query(
            "SELECT temperature FROM weather_forecasts \
             WHERE region_code = '1' AND forecast_date = '2026-08-03' AND forecast_time = '0600'",
        )
        .get_result::<TempRow>(conn)
    })
    .await
    .expect("read back");
    assert_eq!(row.temperature, Some(25.0));
}

#[tokio::test]
async fn report_reflects_throughput() {
    let (pool, _dir) = setup_test_db().await;
    let engine = BulkUpsertEngine::new(pool, TuningPreset::MemoryConstrained);

    let rows: Vec<TourismRecord> = (0..600).map(|i| attraction(i, "Throughput")).collect();
    let report = engine
        .execute("tourist_attractions", rows, |conn, chunk| {
            domain::upsert_tourism_chunk(conn, ContentType::Attraction, chunk, true)
        })
        .await
        .expect("load");

    assert_eq!(report.successful_records, 600);
    assert!(report.records_per_second > 0.0);
    assert!(report.chunk_errors.is_empty());
}
