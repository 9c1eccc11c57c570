//! Diesel row types for the engine's tables.
//!
//! Covers the raw-response archive, the job execution ledger (envelopes,
//! details, logs), the quality threshold overrides, and the typed
//! tourism/weather domain rows. The eight tourism tables share one column
//! shape, so `tourism_row!` generates each table's row struct together
//! with its conversion from the transform's `TourismRecord`.

use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;

use crate::pipeline::transform::{
    CurrentWeatherRecord, ForecastRecord, HistoricalDailyRecord, TourismRecord,
};
use crate::schema;

/// Archived raw API response row.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::api_raw_data)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawDataRecord {
    pub id: String,
    pub provider: String,
    pub endpoint: String,
    pub method: String,
    pub request_params: String,
    pub response_status: i32,
    pub response_body: String,
    pub response_size: i32,
    pub duration_ms: i32,
    pub api_key_hash: String,
    pub archive_file_path: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

/// New raw response for insertion.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = schema::api_raw_data)]
pub struct NewRawData {
    pub id: String,
    pub provider: String,
    pub endpoint: String,
    pub method: String,
    pub request_params: String,
    pub response_status: i32,
    pub response_body: String,
    pub response_size: i32,
    pub duration_ms: i32,
    pub api_key_hash: String,
    pub archive_file_path: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

/// Job execution envelope row.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::batch_job_executions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobExecutionRecord {
    pub id: String,
    pub job_id: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub processed_records: i32,
    pub failed_records: i32,
    pub error_message: Option<String>,
    pub error_severity: Option<String>,
    pub retry_attempt: i32,
    pub retry_status: String,
}

/// New execution row, written when a job enters Running.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = schema::batch_job_executions)]
pub struct NewJobExecution {
    pub id: String,
    pub job_id: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub processed_records: i32,
    pub failed_records: i32,
    pub error_message: Option<String>,
    pub error_severity: Option<String>,
    pub retry_attempt: i32,
    pub retry_status: String,
}

/// New per-execution detail document.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::batch_job_details)]
pub struct NewJobDetail {
    pub execution_id: String,
    pub detail_key: String,
    pub detail: String,
    pub created_at: String,
}

/// New per-execution log line.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::batch_job_logs)]
pub struct NewJobLog {
    pub execution_id: String,
    pub level: String,
    pub message: String,
    pub created_at: String,
}

/// Configured quality threshold override for one table.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::data_quality_thresholds)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QualityThresholdRecord {
    pub table_name: String,
    pub min_overall_score: f64,
    pub completeness_weight: f64,
    pub validity_weight: f64,
    pub consistency_weight: f64,
    pub freshness_weight: f64,
    pub updated_at: String,
}

macro_rules! tourism_row {
    ($row:ident, $table:ident) => {
        #[derive(Insertable, AsChangeset, Debug, Clone, Serialize)]
        #[diesel(table_name = schema::$table)]
        #[diesel(primary_key(content_id))]
        #[diesel(treat_none_as_null = true)]
        pub struct $row {
            pub content_id: String,
            pub title: String,
            pub address: Option<String>,
            pub address_detail: Option<String>,
            pub zipcode: Option<String>,
            pub region_code: Option<String>,
            pub sigungu_code: Option<String>,
            pub category_large_code: Option<String>,
            pub category_medium_code: Option<String>,
            pub category_small_code: Option<String>,
            pub longitude: Option<f64>,
            pub latitude: Option<f64>,
            pub phone_number: Option<String>,
            pub homepage_url: Option<String>,
            pub first_image: Option<String>,
            pub thumbnail_image: Option<String>,
            pub overview: Option<String>,
            pub event_start_date: Option<String>,
            pub event_end_date: Option<String>,
            pub created_time: Option<String>,
            pub modified_time: Option<String>,
            pub raw_data_id: Option<String>,
            pub last_sync_at: String,
            pub data_quality_score: Option<f64>,
            pub processing_status: String,
        }

        impl From<&TourismRecord> for $row {
            fn from(r: &TourismRecord) -> Self {
                Self {
                    content_id: r.content_id.clone(),
                    title: r.title.clone(),
                    address: r.address.clone(),
                    address_detail: r.address_detail.clone(),
                    zipcode: r.zipcode.clone(),
                    region_code: r.region_code.clone(),
                    sigungu_code: r.sigungu_code.clone(),
                    category_large_code: r.category_large_code.clone(),
                    category_medium_code: r.category_medium_code.clone(),
                    category_small_code: r.category_small_code.clone(),
                    longitude: r.longitude,
                    latitude: r.latitude,
                    phone_number: r.phone_number.clone(),
                    homepage_url: r.homepage_url.clone(),
                    first_image: r.first_image.clone(),
                    thumbnail_image: r.thumbnail_image.clone(),
                    overview: r.overview.clone(),
                    event_start_date: r.event_start_date.clone(),
                    event_end_date: r.event_end_date.clone(),
                    created_time: r.created_time.clone(),
                    modified_time: r.modified_time.clone(),
                    raw_data_id: r.raw_data_id.clone(),
                    last_sync_at: super::format_ts(Utc::now()),
                    data_quality_score: Some(r.quality_score),
                    processing_status: "processed".to_string(),
                }
            }
        }
    };
}

tourism_row!(AttractionRow, tourist_attractions);
tourism_row!(CulturalFacilityRow, cultural_facilities);
tourism_row!(FestivalRow, festivals_events);
tourism_row!(TravelCourseRow, travel_courses);
tourism_row!(LeisureSportsRow, leisure_sports);
tourism_row!(AccommodationRow, accommodations);
tourism_row!(ShoppingRow, shopping);
tourism_row!(RestaurantRow, restaurants);

/// Current-conditions row keyed (region_code, weather_date).
#[derive(Insertable, AsChangeset, Debug, Clone, Serialize)]
#[diesel(table_name = schema::weather_current)]
#[diesel(primary_key(region_code, weather_date))]
#[diesel(treat_none_as_null = true)]
pub struct CurrentWeatherRow {
    pub region_code: String,
    pub region_name: Option<String>,
    pub weather_date: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub wind_speed: Option<f64>,
    pub weather_condition: Option<String>,
    pub nx: Option<i32>,
    pub ny: Option<i32>,
    pub raw_data_id: Option<String>,
    pub last_sync_at: String,
    pub data_quality_score: Option<f64>,
    pub processing_status: String,
}

impl From<&CurrentWeatherRecord> for CurrentWeatherRow {
    fn from(r: &CurrentWeatherRecord) -> Self {
        Self {
            region_code: r.region_code.clone(),
            region_name: r.region_name.clone(),
            weather_date: r.weather_date.clone(),
            temperature: r.temperature,
            humidity: r.humidity,
            precipitation: r.precipitation,
            wind_speed: r.wind_speed,
            weather_condition: r.weather_condition.clone(),
            nx: r.nx,
            ny: r.ny,
            raw_data_id: r.raw_data_id.clone(),
            last_sync_at: super::format_ts(Utc::now()),
            data_quality_score: Some(r.quality_score),
            processing_status: "processed".to_string(),
        }
    }
}

/// Forecast row keyed (region_code, forecast_date, forecast_time).
#[derive(Insertable, AsChangeset, Debug, Clone, Serialize)]
#[diesel(table_name = schema::weather_forecasts)]
#[diesel(primary_key(region_code, forecast_date, forecast_time))]
#[diesel(treat_none_as_null = true)]
pub struct ForecastRow {
    pub region_code: String,
    pub nx: Option<i32>,
    pub ny: Option<i32>,
    pub forecast_date: String,
    pub forecast_time: String,
    pub temperature: Option<f64>,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation_prob: Option<f64>,
    pub wind_speed: Option<f64>,
    pub weather_condition: Option<String>,
    pub forecast_type: String,
    pub raw_data_id: Option<String>,
    pub last_sync_at: String,
    pub data_quality_score: Option<f64>,
    pub processing_status: String,
}

impl From<&ForecastRecord> for ForecastRow {
    fn from(r: &ForecastRecord) -> Self {
        Self {
            region_code: r.region_code.clone(),
            nx: r.nx,
            ny: r.ny,
            forecast_date: r.forecast_date.clone(),
            forecast_time: r.forecast_time.clone(),
            temperature: r.temperature,
            min_temp: r.min_temp,
            max_temp: r.max_temp,
            humidity: r.humidity,
            precipitation_prob: r.precipitation_prob,
            wind_speed: r.wind_speed,
            weather_condition: r.weather_condition.clone(),
            forecast_type: r.forecast_type.clone(),
            raw_data_id: r.raw_data_id.clone(),
            last_sync_at: super::format_ts(Utc::now()),
            data_quality_score: Some(r.quality_score),
            processing_status: "processed".to_string(),
        }
    }
}

/// Daily historical row keyed (region_code, weather_date).
#[derive(Insertable, AsChangeset, Debug, Clone, Serialize)]
#[diesel(table_name = schema::historical_weather_daily)]
#[diesel(primary_key(region_code, weather_date))]
#[diesel(treat_none_as_null = true)]
pub struct HistoricalDailyRow {
    pub region_code: String,
    pub weather_date: String,
    pub avg_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub precipitation: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub raw_data_id: Option<String>,
    pub last_sync_at: String,
    pub data_quality_score: Option<f64>,
    pub processing_status: String,
}

impl From<&HistoricalDailyRecord> for HistoricalDailyRow {
    fn from(r: &HistoricalDailyRecord) -> Self {
        Self {
            region_code: r.region_code.clone(),
            weather_date: r.weather_date.clone(),
            avg_temp: r.avg_temp,
            max_temp: r.max_temp,
            min_temp: r.min_temp,
            precipitation: r.precipitation,
            humidity: r.humidity,
            wind_speed: r.wind_speed,
            raw_data_id: r.raw_data_id.clone(),
            last_sync_at: super::format_ts(Utc::now()),
            data_quality_score: Some(r.quality_score),
            processing_status: "processed".to_string(),
        }
    }
}
