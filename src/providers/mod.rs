//! Upstream provider definitions and the shared data.go.kr response shape.
//!
//! Both providers answer through the same gateway envelope:
//! `response.header.{resultCode,resultMsg}` and `response.body.items.item`,
//! where `item` is an array for multi-row pages but a bare object for
//! single-row pages. `Items` normalizes that at the edge so nothing
//! downstream ever sees the difference.

pub mod kma;
pub mod kto;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::BatchError;
use crate::gateway::executor::{CallSpec, HttpExecutor};

/// Upstream third-party API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Korea Tourism Organization.
    Kto,
    /// Korea Meteorological Administration.
    Kma,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Kto => "KTO",
            Provider::Kma => "KMA",
        }
    }

    pub fn from_str(s: &str) -> Option<Provider> {
        match s {
            "KTO" => Some(Provider::Kto),
            "KMA" => Some(Provider::Kma),
            _ => None,
        }
    }

    /// Retention of archived raw responses for this provider class.
    /// Tourism payloads change slowly; weather observations go stale fast.
    pub fn raw_ttl(&self) -> chrono::Duration {
        match self {
            Provider::Kto => chrono::Duration::days(7),
            Provider::Kma => chrono::Duration::hours(6),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `items.item` as the gateway actually delivers it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Items {
    Many(Vec<Value>),
    One(Value),
}

impl Items {
    pub fn normalize(self) -> Vec<Value> {
        match self {
            Items::Many(v) => v,
            Items::One(v) => vec![v],
        }
    }
}

/// One decoded page body.
#[derive(Debug, Clone)]
pub struct PageBody {
    pub total_count: u64,
    pub items: Vec<Value>,
}

/// Result codes the gateway uses for a successful call.
pub fn is_success_code(code: &str) -> bool {
    matches!(code, "00" | "0000")
}

/// Pull `response.header.resultCode` out of a decoded body, if present.
pub fn result_code(body: &Value) -> Option<&str> {
    body.get("response")?.get("header")?.get("resultCode")?.as_str()
}

/// Pull `response.header.resultMsg` out of a decoded body, if present.
pub fn result_msg(body: &Value) -> Option<&str> {
    body.get("response")?.get("header")?.get("resultMsg")?.as_str()
}

/// Decode `response.body` into a page.
///
/// Empty pages arrive either without an `items` key or with `items` set to
/// an empty string instead of an object; both decode to zero items.
pub fn extract_page(body: &Value) -> Result<PageBody, BatchError> {
    let resp_body = body
        .get("response")
        .and_then(|r| r.get("body"))
        .ok_or_else(|| BatchError::Transient {
            detail: "response body missing from provider envelope".into(),
        })?;

    let total_count = resp_body
        .get("totalCount")
        .map(count_field)
        .unwrap_or(0);

    let items = match resp_body.get("items").and_then(|i| i.get("item")) {
        Some(raw) => serde_json::from_value::<Items>(raw.clone())
            .map(Items::normalize)
            .unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(PageBody { total_count, items })
}

/// `totalCount` arrives as a number or a numeric string depending on the
/// endpoint.
fn count_field(v: &Value) -> u64 {
    match v {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// One fetched page, ready for the transform.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_no: u32,
    pub total_count: u64,
    pub items: Vec<Value>,
    /// Archive row id of the raw response, when archival was requested.
    pub raw_id: Option<String>,
}

/// Explicit sequential pager over a list endpoint.
///
/// `next_page` returns `Ok(None)` when the stream is done; running past the
/// end is not an error. Each page is archived before the next request is
/// issued.
pub struct Paginator {
    executor: Arc<HttpExecutor>,
    provider: Provider,
    endpoint: String,
    base_params: Vec<(String, String)>,
    num_of_rows: u32,
    page_no: u32,
    fetched: u64,
    done: bool,
}

impl Paginator {
    pub fn new(
        executor: Arc<HttpExecutor>,
        provider: Provider,
        endpoint: impl Into<String>,
        base_params: Vec<(String, String)>,
        num_of_rows: u32,
    ) -> Self {
        Self {
            executor,
            provider,
            endpoint: endpoint.into(),
            base_params,
            num_of_rows,
            page_no: 1,
            fetched: 0,
            done: false,
        }
    }

    /// Fetch the next page, or `None` at end of stream.
    pub async fn next_page(&mut self) -> Result<Option<Page>, BatchError> {
        if self.done {
            return Ok(None);
        }

        let mut params = self.base_params.clone();
        params.push(("pageNo".into(), self.page_no.to_string()));
        params.push(("numOfRows".into(), self.num_of_rows.to_string()));

        let response = self
            .executor
            .call(CallSpec {
                provider: self.provider,
                endpoint: &self.endpoint,
                params,
                store_raw: true,
            })
            .await?;

        let page_body = extract_page(&response.body)?;
        if page_body.items.is_empty() {
            self.done = true;
            return Ok(None);
        }

        self.fetched += page_body.items.len() as u64;
        if self.fetched >= page_body.total_count
            || (page_body.items.len() as u32) < self.num_of_rows
        {
            self.done = true;
        }

        let page = Page {
            page_no: self.page_no,
            total_count: page_body.total_count,
            items: page_body.items,
            raw_id: response.raw_id,
        };
        self.page_no += 1;
        Ok(Some(page))
    }
}

/// KMA forecast grid cell and area code for one collected region.
#[derive(Debug, Clone, Copy)]
pub struct RegionGrid {
    pub name: &'static str,
    /// Area code shared with the tourism provider.
    pub code: &'static str,
    pub nx: i32,
    pub ny: i32,
    pub lat: f64,
    pub lon: f64,
    /// ASOS surface observation station, where one exists.
    pub station: Option<&'static str>,
}

/// Major metropolitan regions collected by the weather jobs.
pub const REGIONS: &[RegionGrid] = &[
    RegionGrid { name: "Seoul", code: "1", nx: 60, ny: 127, lat: 37.5665, lon: 126.9780, station: Some("108") },
    RegionGrid { name: "Incheon", code: "2", nx: 55, ny: 124, lat: 37.4563, lon: 126.7052, station: Some("112") },
    RegionGrid { name: "Daejeon", code: "3", nx: 67, ny: 100, lat: 36.3504, lon: 127.3845, station: Some("133") },
    RegionGrid { name: "Daegu", code: "4", nx: 89, ny: 90, lat: 35.8714, lon: 128.6014, station: Some("143") },
    RegionGrid { name: "Gwangju", code: "5", nx: 58, ny: 74, lat: 35.1595, lon: 126.8526, station: Some("156") },
    RegionGrid { name: "Busan", code: "6", nx: 98, ny: 76, lat: 35.1796, lon: 129.0756, station: Some("159") },
    RegionGrid { name: "Ulsan", code: "7", nx: 102, ny: 84, lat: 35.5384, lon: 129.3114, station: Some("152") },
    RegionGrid { name: "Sejong", code: "8", nx: 66, ny: 103, lat: 36.4800, lon: 127.2890, station: None },
    RegionGrid { name: "Jeju", code: "39", nx: 52, ny: 38, lat: 33.4996, lon: 126.5312, station: Some("184") },
];

/// Tourism area codes for nationwide sweeps.
pub const AREA_CODES: &[(&str, &str)] = &[
    ("1", "Seoul"),
    ("2", "Incheon"),
    ("3", "Daejeon"),
    ("4", "Daegu"),
    ("5", "Gwangju"),
    ("6", "Busan"),
    ("7", "Ulsan"),
    ("8", "Sejong"),
    ("31", "Gyeonggi"),
    ("32", "Gangwon"),
    ("33", "Chungbuk"),
    ("34", "Chungnam"),
    ("35", "Gyeongbuk"),
    ("36", "Gyeongnam"),
    ("37", "Jeonbuk"),
    ("38", "Jeonnam"),
    ("39", "Jeju"),
];

pub fn region_by_code(code: &str) -> Option<&'static RegionGrid> {
    REGIONS.iter().find(|r| r.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn items_normalizes_single_object() {
        let raw = json!({"contentid": "100"});
        let items: Items = serde_json::from_value(raw).unwrap();
        assert_eq!(items.normalize().len(), 1);
    }

    #[test]
    fn items_normalizes_array() {
        let raw = json!([{"contentid": "100"}, {"contentid": "200"}]);
        let items: Items = serde_json::from_value(raw).unwrap();
        assert_eq!(items.normalize().len(), 2);
    }

    #[test]
    fn extract_page_reads_count_and_items() {
        let body = json!({
            "response": {
                "header": {"resultCode": "0000", "resultMsg": "OK"},
                "body": {
                    "totalCount": 2,
                    "items": {"item": [{"a": 1}, {"a": 2}]}
                }
            }
        });
        let page = extract_page(&body).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.items.len(), 2);
    }

    #[test]
    fn extract_page_tolerates_empty_items_string() {
        let body = json!({
            "response": {
                "header": {"resultCode": "0000"},
                "body": {"totalCount": "0", "items": ""}
            }
        });
        let page = extract_page(&body).unwrap();
        assert_eq!(page.total_count, 0);
        assert!(page.items.is_empty());
    }

    #[test]
    fn result_code_success_variants() {
        assert!(is_success_code("00"));
        assert!(is_success_code("0000"));
        assert!(!is_success_code("22"));
    }

    #[test]
    fn region_lookup_by_area_code() {
        let seoul = region_by_code("1").unwrap();
        assert_eq!(seoul.nx, 60);
        assert_eq!(seoul.ny, 127);
        assert!(region_by_code("99").is_none());
    }
}
