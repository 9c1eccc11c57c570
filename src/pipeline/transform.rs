//! Stateless mapping from raw provider payloads to typed domain rows.
//!
//! The transform never fails a whole page: rows that cannot be shaped are
//! returned on the discard list with a reason, everything else comes back
//! typed, normalized, and scored. Re-running the transform over the same
//! archived payload yields the same rows.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::providers::RegionGrid;

/// Tourism content classes and their numeric provider tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Attraction,
    CulturalFacility,
    Festival,
    TravelCourse,
    LeisureSports,
    Accommodation,
    Shopping,
    Restaurant,
}

impl ContentType {
    pub const ALL: [ContentType; 8] = [
        ContentType::Attraction,
        ContentType::CulturalFacility,
        ContentType::Festival,
        ContentType::TravelCourse,
        ContentType::LeisureSports,
        ContentType::Accommodation,
        ContentType::Shopping,
        ContentType::Restaurant,
    ];

    /// Numeric tag used by the tourism provider.
    pub fn code(&self) -> &'static str {
        match self {
            ContentType::Attraction => "12",
            ContentType::CulturalFacility => "14",
            ContentType::Festival => "15",
            ContentType::TravelCourse => "25",
            ContentType::LeisureSports => "28",
            ContentType::Accommodation => "32",
            ContentType::Shopping => "38",
            ContentType::Restaurant => "39",
        }
    }

    pub fn from_code(code: &str) -> Option<ContentType> {
        Self::ALL.iter().copied().find(|ct| ct.code() == code)
    }

    /// Target table for this content class.
    pub fn table(&self) -> &'static str {
        match self {
            ContentType::Attraction => "tourist_attractions",
            ContentType::CulturalFacility => "cultural_facilities",
            ContentType::Festival => "festivals_events",
            ContentType::TravelCourse => "travel_courses",
            ContentType::LeisureSports => "leisure_sports",
            ContentType::Accommodation => "accommodations",
            ContentType::Shopping => "shopping",
            ContentType::Restaurant => "restaurants",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// One row dropped by the transform, with the reason it was dropped.
#[derive(Debug, Clone)]
pub struct Discard {
    pub reason: String,
    pub context: String,
}

/// Typed rows plus the discard list for one raw page.
#[derive(Debug, Clone)]
pub struct TransformOutcome<T> {
    pub rows: Vec<T>,
    pub discarded: Vec<Discard>,
}

impl<T> TransformOutcome<T> {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            discarded: Vec::new(),
        }
    }

    fn discard(&mut self, reason: impl Into<String>, context: impl Into<String>) {
        self.discarded.push(Discard {
            reason: reason.into(),
            context: context.into(),
        });
    }
}

/// Typed tourism row shared by all eight content tables.
#[derive(Debug, Clone, Serialize)]
pub struct TourismRecord {
    pub content_id: String,
    pub content_type_code: String,
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
    pub quality_score: f64,
}

/// Current-conditions row produced from a nowcast payload.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentWeatherRecord {
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
    pub quality_score: f64,
}

/// One forecast slot keyed by (region, date, time).
#[derive(Debug, Clone, Serialize)]
pub struct ForecastRecord {
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
    pub quality_score: f64,
}

/// One daily surface observation summary.
#[derive(Debug, Clone, Serialize)]
pub struct HistoricalDailyRecord {
    pub region_code: String,
    pub weather_date: String,
    pub avg_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub precipitation: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub raw_data_id: Option<String>,
    pub quality_score: f64,
}

// Korea bounding box used for coordinate sanity checks.
const LAT_RANGE: (f64, f64) = (32.0, 39.0);
const LON_RANGE: (f64, f64) = (123.0, 132.0);

/// Transform one page of tourism items.
pub fn tourism_rows(
    content_type: ContentType,
    items: &[Value],
    raw_data_id: Option<&str>,
) -> TransformOutcome<TourismRecord> {
    let mut out = TransformOutcome::new();

    for (idx, item) in items.iter().enumerate() {
        let context = text(item, "contentid").unwrap_or_else(|| format!("item #{idx}"));

        let Some(content_id) = text(item, "contentid") else {
            out.discard("missing required field contentid", context);
            continue;
        };
        let Some(title) = text(item, "title") else {
            out.discard("missing required field title", context);
            continue;
        };

        let (longitude, latitude) = parse_coordinates(item);

        let mut record = TourismRecord {
            content_id,
            content_type_code: content_type.code().to_string(),
            title,
            address: text(item, "addr1"),
            address_detail: text(item, "addr2"),
            zipcode: text(item, "zipcode"),
            region_code: text(item, "areacode"),
            sigungu_code: text(item, "sigungucode"),
            category_large_code: text(item, "cat1"),
            category_medium_code: text(item, "cat2"),
            category_small_code: text(item, "cat3"),
            longitude,
            latitude,
            phone_number: text(item, "tel"),
            homepage_url: text(item, "homepage"),
            first_image: text(item, "firstimage"),
            thumbnail_image: text(item, "firstimage2"),
            overview: text(item, "overview"),
            event_start_date: None,
            event_end_date: None,
            created_time: text(item, "createdtime").and_then(|s| normalize_timestamp(&s)),
            modified_time: text(item, "modifiedtime").and_then(|s| normalize_timestamp(&s)),
            raw_data_id: raw_data_id.map(str::to_string),
            quality_score: 0.0,
        };

        if content_type == ContentType::Festival {
            record.event_start_date = text(item, "eventstartdate");
            record.event_end_date = text(item, "eventenddate");
        }

        record.quality_score = tourism_quality_score(&record);
        out.rows.push(record);
    }

    out
}

/// Fraction of populated important fields.
fn tourism_quality_score(r: &TourismRecord) -> f64 {
    let important = [
        r.address.is_some(),
        r.region_code.is_some(),
        r.longitude.is_some(),
        r.latitude.is_some(),
        r.first_image.is_some(),
        r.overview.is_some(),
        r.phone_number.is_some(),
    ];
    let filled = important.iter().filter(|b| **b).count();
    filled as f64 / important.len() as f64
}

/// Pivot one nowcast payload (category/obsrValue pairs) into a single
/// current-conditions row for the region.
pub fn nowcast_rows(
    region: &RegionGrid,
    items: &[Value],
    raw_data_id: Option<&str>,
) -> TransformOutcome<CurrentWeatherRecord> {
    let mut out = TransformOutcome::new();
    if items.is_empty() {
        return out;
    }

    let Some(base_date) = items.iter().find_map(|i| text(i, "baseDate")) else {
        out.discard("nowcast payload missing baseDate", region.name);
        return out;
    };

    let mut record = CurrentWeatherRecord {
        region_code: region.code.to_string(),
        region_name: Some(region.name.to_string()),
        weather_date: ymd_to_iso(&base_date),
        temperature: None,
        humidity: None,
        precipitation: None,
        wind_speed: None,
        weather_condition: None,
        nx: Some(region.nx),
        ny: Some(region.ny),
        raw_data_id: raw_data_id.map(str::to_string),
        quality_score: 0.0,
    };

    for item in items {
        let (Some(category), Some(value)) = (text(item, "category"), text(item, "obsrValue"))
        else {
            out.discard("observation missing category or obsrValue", region.name);
            continue;
        };
        match category.as_str() {
            "T1H" => record.temperature = value.parse().ok(),
            "REH" => record.humidity = value.parse().ok(),
            "RN1" => record.precipitation = value.parse().ok().or(Some(0.0)),
            "WSD" => record.wind_speed = value.parse().ok(),
            "PTY" => record.weather_condition = precipitation_condition(&value),
            _ => {}
        }
    }

    record.quality_score = weather_quality_score(&[
        record.temperature.is_some(),
        record.humidity.is_some(),
        record.precipitation.is_some(),
        record.wind_speed.is_some(),
    ]);
    out.rows.push(record);
    out
}

/// Pivot forecast category/fcstValue items into per-slot rows.
pub fn forecast_rows(
    region: &RegionGrid,
    items: &[Value],
    forecast_type: &str,
    raw_data_id: Option<&str>,
) -> TransformOutcome<ForecastRecord> {
    let mut out = TransformOutcome::new();
    let mut slots: BTreeMap<(String, String), ForecastRecord> = BTreeMap::new();
    // SKY is weaker evidence than PTY; remember it separately and only use
    // it for slots without precipitation.
    let mut sky_codes: BTreeMap<(String, String), String> = BTreeMap::new();

    for item in items {
        let (Some(date), Some(time)) = (text(item, "fcstDate"), text(item, "fcstTime")) else {
            out.discard("forecast item missing fcstDate or fcstTime", region.name);
            continue;
        };
        let (Some(category), Some(value)) = (text(item, "category"), text(item, "fcstValue"))
        else {
            out.discard("forecast item missing category or fcstValue", region.name);
            continue;
        };

        let key = (ymd_to_iso(&date), time.clone());
        let record = slots.entry(key.clone()).or_insert_with(|| ForecastRecord {
            region_code: region.code.to_string(),
            nx: Some(region.nx),
            ny: Some(region.ny),
            forecast_date: key.0.clone(),
            forecast_time: key.1.clone(),
            temperature: None,
            min_temp: None,
            max_temp: None,
            humidity: None,
            precipitation_prob: None,
            wind_speed: None,
            weather_condition: None,
            forecast_type: forecast_type.to_string(),
            raw_data_id: raw_data_id.map(str::to_string),
            quality_score: 0.0,
        });

        match category.as_str() {
            "TMP" | "T1H" => record.temperature = value.parse().ok(),
            "TMN" => record.min_temp = value.parse().ok(),
            "TMX" => record.max_temp = value.parse().ok(),
            "REH" => record.humidity = value.parse().ok(),
            "POP" => record.precipitation_prob = value.parse().ok(),
            "WSD" => record.wind_speed = value.parse().ok(),
            "PTY" => {
                if let Some(cond) = precipitation_condition(&value) {
                    record.weather_condition = Some(cond);
                }
            }
            "SKY" => {
                sky_codes.insert(key, value);
            }
            _ => {}
        }
    }

    for (key, sky) in sky_codes {
        if let Some(record) = slots.get_mut(&key) {
            if record.weather_condition.is_none() {
                record.weather_condition = sky_condition(&sky);
            }
        }
    }

    for (_, mut record) in slots {
        record.quality_score = weather_quality_score(&[
            record.temperature.is_some(),
            record.humidity.is_some(),
            record.precipitation_prob.is_some(),
            record.wind_speed.is_some(),
            record.weather_condition.is_some(),
        ]);
        out.rows.push(record);
    }
    out
}

/// Map daily surface observation summaries.
pub fn historical_rows(
    region: &RegionGrid,
    items: &[Value],
    raw_data_id: Option<&str>,
) -> TransformOutcome<HistoricalDailyRecord> {
    let mut out = TransformOutcome::new();

    for item in items {
        let Some(date) = text(item, "tm") else {
            out.discard("daily observation missing tm date", region.name);
            continue;
        };

        let mut record = HistoricalDailyRecord {
            region_code: region.code.to_string(),
            weather_date: date,
            avg_temp: number(item, "avgTa"),
            max_temp: number(item, "maxTa"),
            min_temp: number(item, "minTa"),
            precipitation: number(item, "sumRn").or(Some(0.0)),
            humidity: number(item, "avgRhm"),
            wind_speed: number(item, "avgWs"),
            raw_data_id: raw_data_id.map(str::to_string),
            quality_score: 0.0,
        };
        record.quality_score = weather_quality_score(&[
            record.avg_temp.is_some(),
            record.max_temp.is_some(),
            record.min_temp.is_some(),
            record.humidity.is_some(),
        ]);
        out.rows.push(record);
    }

    out
}

fn weather_quality_score(fields: &[bool]) -> f64 {
    if fields.is_empty() {
        return 0.0;
    }
    fields.iter().filter(|b| **b).count() as f64 / fields.len() as f64
}

/// Yields owned chunks of at most `size` rows.
pub fn chunked<T>(rows: Vec<T>, size: usize) -> Chunks<T> {
    Chunks {
        items: rows.into_iter(),
        size: size.max(1),
    }
}

pub struct Chunks<T> {
    items: std::vec::IntoIter<T>,
    size: usize,
}

impl<T> Iterator for Chunks<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Vec<T>> {
        let chunk: Vec<T> = self.items.by_ref().take(self.size).collect();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

/// Read a field as trimmed text, accepting numeric payloads.
fn text(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(item: &Value, key: &str) -> Option<f64> {
    match item.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `mapx`/`mapy` and keep them only when they land inside Korea.
fn parse_coordinates(item: &Value) -> (Option<f64>, Option<f64>) {
    let lon = number(item, "mapx");
    let lat = number(item, "mapy");
    match (lon, lat) {
        (Some(lon), Some(lat))
            if (LON_RANGE.0..=LON_RANGE.1).contains(&lon)
                && (LAT_RANGE.0..=LAT_RANGE.1).contains(&lat) =>
        {
            (Some(lon), Some(lat))
        }
        _ => (None, None),
    }
}

/// Normalize provider timestamps to `YYYYMMDDHHMMSS`.
///
/// List endpoints deliver `20230115123456`; some detail endpoints shorten to
/// the date. Anything that does not contain a full date is rejected.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        14 => Some(digits),
        8 => Some(format!("{digits}000000")),
        12 => Some(format!("{digits}00")),
        _ => None,
    }
}

/// `YYYYMMDD` to `YYYY-MM-DD`; anything else passes through untouched.
pub fn ymd_to_iso(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 8 {
        format!("{}-{}-{}", &digits[0..4], &digits[4..6], &digits[6..8])
    } else {
        raw.to_string()
    }
}

fn precipitation_condition(code: &str) -> Option<String> {
    match code.trim() {
        "0" => None,
        "1" => Some("rain".to_string()),
        "2" => Some("rain/snow".to_string()),
        "3" => Some("snow".to_string()),
        "4" => Some("shower".to_string()),
        _ => None,
    }
}

fn sky_condition(code: &str) -> Option<String> {
    match code.trim() {
        "1" => Some("clear".to_string()),
        "3" => Some("mostly cloudy".to_string()),
        "4" => Some("cloudy".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::REGIONS;
    use serde_json::json;

    fn attraction_item() -> Value {
        json!({
            "contentid": "126508",
            "title": " Gyeongbokgung Palace ",
            "addr1": "161 Sajik-ro, Jongno-gu",
            "areacode": 1,
            "sigungucode": "23",
            "cat1": "A02",
            "mapx": "126.9769930325",
            "mapy": "37.5788222356",
            "tel": "02-3700-3900",
            "firstimage": "http://tong.visitkorea.or.kr/x.jpg",
            "modifiedtime": "20240105142301",
            "createdtime": "20031230090000"
        })
    }

    #[test]
    fn tourism_row_maps_fields() {
        let out = tourism_rows(ContentType::Attraction, &[attraction_item()], Some("raw-1"));
        assert_eq!(out.rows.len(), 1);
        assert!(out.discarded.is_empty());

        let row = &out.rows[0];
        assert_eq!(row.content_id, "126508");
        assert_eq!(row.title, "Gyeongbokgung Palace");
        assert_eq!(row.region_code.as_deref(), Some("1"));
        assert!(row.longitude.unwrap() > 126.0);
        assert_eq!(row.modified_time.as_deref(), Some("20240105142301"));
        assert_eq!(row.raw_data_id.as_deref(), Some("raw-1"));
        assert!(row.quality_score > 0.5);
    }

    #[test]
    fn tourism_row_without_content_id_is_discarded() {
        let out = tourism_rows(
            ContentType::Attraction,
            &[json!({"title": "No id"})],
            None,
        );
        assert!(out.rows.is_empty());
        assert_eq!(out.discarded.len(), 1);
        assert!(out.discarded[0].reason.contains("contentid"));
    }

    #[test]
    fn out_of_bounds_coordinates_are_dropped() {
        let mut item = attraction_item();
        item["mapx"] = json!("10.5");
        item["mapy"] = json!("99.0");
        let out = tourism_rows(ContentType::Attraction, &[item], None);
        let row = &out.rows[0];
        assert!(row.longitude.is_none());
        assert!(row.latitude.is_none());
    }

    #[test]
    fn festival_keeps_event_dates() {
        let mut item = attraction_item();
        item["eventstartdate"] = json!("20260901");
        item["eventenddate"] = json!("20260905");
        let out = tourism_rows(ContentType::Festival, &[item], None);
        let row = &out.rows[0];
        assert_eq!(row.event_start_date.as_deref(), Some("20260901"));
        assert_eq!(row.event_end_date.as_deref(), Some("20260905"));
    }

    #[test]
    fn nowcast_pivots_categories() {
        let region = &REGIONS[0];
        let items = vec![
            json!({"baseDate": "20260802", "category": "T1H", "obsrValue": "28.4"}),
            json!({"baseDate": "20260802", "category": "REH", "obsrValue": "62"}),
            json!({"baseDate": "20260802", "category": "PTY", "obsrValue": "1"}),
        ];
        let out = nowcast_rows(region, &items, None);
        assert_eq!(out.rows.len(), 1);
        let row = &out.rows[0];
        assert_eq!(row.weather_date, "2026-08-02");
        assert_eq!(row.temperature, Some(28.4));
        assert_eq!(row.humidity, Some(62.0));
        assert_eq!(row.weather_condition.as_deref(), Some("rain"));
    }

    #[test]
    fn forecast_groups_by_slot() {
        let region = &REGIONS[0];
        let items = vec![
            json!({"fcstDate": "20260803", "fcstTime": "0600", "category": "TMP", "fcstValue": "24"}),
            json!({"fcstDate": "20260803", "fcstTime": "0600", "category": "SKY", "fcstValue": "1"}),
            json!({"fcstDate": "20260803", "fcstTime": "0900", "category": "TMP", "fcstValue": "27"}),
        ];
        let out = forecast_rows(region, &items, "village", None);
        assert_eq!(out.rows.len(), 2);
        let first = &out.rows[0];
        assert_eq!(first.forecast_date, "2026-08-03");
        assert_eq!(first.forecast_time, "0600");
        assert_eq!(first.temperature, Some(24.0));
        assert_eq!(first.weather_condition.as_deref(), Some("clear"));
    }

    #[test]
    fn normalize_timestamp_variants() {
        assert_eq!(
            normalize_timestamp("20240105142301").as_deref(),
            Some("20240105142301")
        );
        assert_eq!(
            normalize_timestamp("20240105").as_deref(),
            Some("20240105000000")
        );
        assert_eq!(
            normalize_timestamp("2024-01-05 14:23").as_deref(),
            Some("20240105142300")
        );
        assert!(normalize_timestamp("junk").is_none());
    }

    #[test]
    fn chunked_splits_evenly() {
        let rows: Vec<u32> = (0..2500).collect();
        let chunks: Vec<Vec<u32>> = chunked(rows, 1000).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[2].len(), 500);
    }

    #[test]
    fn content_type_round_trip() {
        for ct in ContentType::ALL {
            assert_eq!(ContentType::from_code(ct.code()), Some(ct));
        }
        assert!(ContentType::from_code("99").is_none());
    }
}
