//! Hand-maintained diesel schema.
//!
//! The eight tourism tables share one column shape, declared once through
//! `tourism_table!`. Composite primary keys double as the upsert conflict
//! targets.

diesel::table! {
    api_raw_data (id) {
        id -> Text,
        provider -> Text,
        endpoint -> Text,
        method -> Text,
        request_params -> Text,
        response_status -> Integer,
        response_body -> Text,
        response_size -> Integer,
        duration_ms -> Integer,
        api_key_hash -> Text,
        archive_file_path -> Nullable<Text>,
        created_at -> Text,
        expires_at -> Text,
    }
}

diesel::table! {
    batch_job_executions (id) {
        id -> Text,
        job_id -> Text,
        status -> Text,
        started_at -> Text,
        ended_at -> Nullable<Text>,
        processed_records -> Integer,
        failed_records -> Integer,
        error_message -> Nullable<Text>,
        error_severity -> Nullable<Text>,
        retry_attempt -> Integer,
        retry_status -> Text,
    }
}

diesel::table! {
    batch_job_details (id) {
        id -> Integer,
        execution_id -> Text,
        detail_key -> Text,
        detail -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    batch_job_logs (id) {
        id -> Integer,
        execution_id -> Text,
        level -> Text,
        message -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    data_quality_thresholds (table_name) {
        table_name -> Text,
        min_overall_score -> Double,
        completeness_weight -> Double,
        validity_weight -> Double,
        consistency_weight -> Double,
        freshness_weight -> Double,
        updated_at -> Text,
    }
}

macro_rules! tourism_table {
    ($name:ident) => {
        diesel::table! {
            $name (content_id) {
                content_id -> Text,
                title -> Text,
                address -> Nullable<Text>,
                address_detail -> Nullable<Text>,
                zipcode -> Nullable<Text>,
                region_code -> Nullable<Text>,
                sigungu_code -> Nullable<Text>,
                category_large_code -> Nullable<Text>,
                category_medium_code -> Nullable<Text>,
                category_small_code -> Nullable<Text>,
                longitude -> Nullable<Double>,
                latitude -> Nullable<Double>,
                phone_number -> Nullable<Text>,
                homepage_url -> Nullable<Text>,
                first_image -> Nullable<Text>,
                thumbnail_image -> Nullable<Text>,
                overview -> Nullable<Text>,
                event_start_date -> Nullable<Text>,
                event_end_date -> Nullable<Text>,
                created_time -> Nullable<Text>,
                modified_time -> Nullable<Text>,
                raw_data_id -> Nullable<Text>,
                last_sync_at -> Text,
                data_quality_score -> Nullable<Double>,
                processing_status -> Text,
            }
        }
    };
}

tourism_table!(tourist_attractions);
tourism_table!(cultural_facilities);
tourism_table!(festivals_events);
tourism_table!(travel_courses);
tourism_table!(leisure_sports);
tourism_table!(accommodations);
tourism_table!(shopping);
tourism_table!(restaurants);

diesel::table! {
    weather_current (region_code, weather_date) {
        region_code -> Text,
        region_name -> Nullable<Text>,
        weather_date -> Text,
        temperature -> Nullable<Double>,
        humidity -> Nullable<Double>,
        precipitation -> Nullable<Double>,
        wind_speed -> Nullable<Double>,
        weather_condition -> Nullable<Text>,
        nx -> Nullable<Integer>,
        ny -> Nullable<Integer>,
        raw_data_id -> Nullable<Text>,
        last_sync_at -> Text,
        data_quality_score -> Nullable<Double>,
        processing_status -> Text,
    }
}

diesel::table! {
    weather_forecasts (region_code, forecast_date, forecast_time) {
        region_code -> Text,
        nx -> Nullable<Integer>,
        ny -> Nullable<Integer>,
        forecast_date -> Text,
        forecast_time -> Text,
        temperature -> Nullable<Double>,
        min_temp -> Nullable<Double>,
        max_temp -> Nullable<Double>,
        humidity -> Nullable<Double>,
        precipitation_prob -> Nullable<Double>,
        wind_speed -> Nullable<Double>,
        weather_condition -> Nullable<Text>,
        forecast_type -> Text,
        raw_data_id -> Nullable<Text>,
        last_sync_at -> Text,
        data_quality_score -> Nullable<Double>,
        processing_status -> Text,
    }
}

diesel::table! {
    historical_weather_daily (region_code, weather_date) {
        region_code -> Text,
        weather_date -> Text,
        avg_temp -> Nullable<Double>,
        max_temp -> Nullable<Double>,
        min_temp -> Nullable<Double>,
        precipitation -> Nullable<Double>,
        humidity -> Nullable<Double>,
        wind_speed -> Nullable<Double>,
        raw_data_id -> Nullable<Text>,
        last_sync_at -> Text,
        data_quality_score -> Nullable<Double>,
        processing_status -> Text,
    }
}
