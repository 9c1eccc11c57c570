//! Weather provider client: nowcast, village forecast, and daily surface
//! observations.
//!
//! Forecast endpoints require a `base_date`/`base_time` pair naming an
//! issuance slot that already exists; asking for the current hour before
//! the provider publishes it returns an empty page. The slot helpers below
//! stay one step behind the wall clock for that reason.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde_json::Value;

use super::{extract_page, Provider, RegionGrid};
use crate::error::BatchError;
use crate::gateway::executor::{CallSpec, HttpExecutor};

pub const ULTRA_SRT_NCST: &str = "VilageFcstInfoService_2.0/getUltraSrtNcst";
pub const VILAGE_FCST: &str = "VilageFcstInfoService_2.0/getVilageFcst";
pub const ASOS_DAILY: &str = "AsosDalyInfoService/getWthrDataList";

/// Hours at which village forecasts are issued.
const VILLAGE_SLOTS: [u32; 8] = [2, 5, 8, 11, 14, 17, 20, 23];

pub struct KmaApi {
    executor: Arc<HttpExecutor>,
    tz: Tz,
}

impl KmaApi {
    pub fn new(executor: Arc<HttpExecutor>, tz: Tz) -> Self {
        Self { executor, tz }
    }

    /// Latest nowcast observations for one grid cell.
    pub async fn ultra_srt_ncst(
        &self,
        region: &RegionGrid,
    ) -> Result<(Vec<Value>, Option<String>), BatchError> {
        let now = chrono::Utc::now().with_timezone(&self.tz);
        let (base_date, base_time) = nowcast_base(now);
        self.fetch_grid(ULTRA_SRT_NCST, region, &base_date, &base_time, 60)
            .await
    }

    /// Village forecast series for one grid cell.
    pub async fn vilage_fcst(
        &self,
        region: &RegionGrid,
    ) -> Result<(Vec<Value>, Option<String>), BatchError> {
        let now = chrono::Utc::now().with_timezone(&self.tz);
        let (base_date, base_time) = village_base(now);
        self.fetch_grid(VILAGE_FCST, region, &base_date, &base_time, 1000)
            .await
    }

    async fn fetch_grid(
        &self,
        endpoint: &str,
        region: &RegionGrid,
        base_date: &str,
        base_time: &str,
        num_of_rows: u32,
    ) -> Result<(Vec<Value>, Option<String>), BatchError> {
        let response = self
            .executor
            .call(CallSpec {
                provider: Provider::Kma,
                endpoint,
                params: vec![
                    ("base_date".to_string(), base_date.to_string()),
                    ("base_time".to_string(), base_time.to_string()),
                    ("nx".to_string(), region.nx.to_string()),
                    ("ny".to_string(), region.ny.to_string()),
                    ("numOfRows".to_string(), num_of_rows.to_string()),
                    ("pageNo".to_string(), "1".to_string()),
                ],
                store_raw: true,
            })
            .await?;

        let page = extract_page(&response.body)?;
        Ok((page.items, response.raw_id))
    }

    /// Daily surface observation summary for one station and date.
    /// Regions without a station yield an empty page.
    pub async fn asos_daily(
        &self,
        region: &RegionGrid,
        date: NaiveDate,
    ) -> Result<(Vec<Value>, Option<String>), BatchError> {
        let Some(station) = region.station else {
            return Ok((Vec::new(), None));
        };
        let day = date.format("%Y%m%d").to_string();

        let response = self
            .executor
            .call(CallSpec {
                provider: Provider::Kma,
                endpoint: ASOS_DAILY,
                params: vec![
                    ("dataCd".to_string(), "ASOS".to_string()),
                    ("dateCd".to_string(), "DAY".to_string()),
                    ("startDt".to_string(), day.clone()),
                    ("endDt".to_string(), day),
                    ("stnIds".to_string(), station.to_string()),
                    ("numOfRows".to_string(), "10".to_string()),
                    ("pageNo".to_string(), "1".to_string()),
                ],
                store_raw: true,
            })
            .await?;

        let page = extract_page(&response.body)?;
        Ok((page.items, response.raw_id))
    }

    /// Minimal request used to probe disabled keys.
    pub fn probe_spec(tz: Tz) -> (&'static str, Vec<(String, String)>) {
        let now = chrono::Utc::now().with_timezone(&tz);
        let (base_date, base_time) = nowcast_base(now);
        (
            ULTRA_SRT_NCST,
            vec![
                ("base_date".to_string(), base_date),
                ("base_time".to_string(), base_time),
                ("nx".to_string(), "60".to_string()),
                ("ny".to_string(), "127".to_string()),
                ("numOfRows".to_string(), "1".to_string()),
                ("pageNo".to_string(), "1".to_string()),
            ],
        )
    }
}

/// Nowcast issuance slot for a wall-clock instant.
///
/// Observations for HH:00 publish around HH:40, so before :40 the previous
/// hour is the newest complete slot.
pub fn nowcast_base(now: DateTime<Tz>) -> (String, String) {
    let slot = if now.minute() < 40 {
        now - Duration::hours(1)
    } else {
        now
    };
    (
        format!("{:04}{:02}{:02}", slot.year(), slot.month(), slot.day()),
        format!("{:02}00", slot.hour()),
    )
}

/// Latest published village-forecast slot for a wall-clock instant.
pub fn village_base(now: DateTime<Tz>) -> (String, String) {
    // Issuance completes roughly an hour after the slot time.
    let effective = now - Duration::hours(1);
    let slot_hour = VILLAGE_SLOTS
        .iter()
        .rev()
        .find(|h| **h <= effective.hour())
        .copied();

    match slot_hour {
        Some(hour) => (
            format!(
                "{:04}{:02}{:02}",
                effective.year(),
                effective.month(),
                effective.day()
            ),
            format!("{hour:02}00"),
        ),
        None => {
            let prev = effective - Duration::days(1);
            (
                format!("{:04}{:02}{:02}", prev.year(), prev.month(), prev.day()),
                "2300".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seoul(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
    }

    #[test]
    fn nowcast_uses_previous_hour_before_minute_forty() {
        let (date, time) = nowcast_base(seoul(2026, 8, 2, 14, 10));
        assert_eq!(date, "20260802");
        assert_eq!(time, "1300");

        let (date, time) = nowcast_base(seoul(2026, 8, 2, 14, 45));
        assert_eq!(date, "20260802");
        assert_eq!(time, "1400");
    }

    #[test]
    fn nowcast_crosses_midnight_backwards() {
        let (date, time) = nowcast_base(seoul(2026, 8, 2, 0, 5));
        assert_eq!(date, "20260801");
        assert_eq!(time, "2300");
    }

    #[test]
    fn village_base_picks_latest_published_slot() {
        let (date, time) = village_base(seoul(2026, 8, 2, 12, 30));
        assert_eq!(date, "20260802");
        assert_eq!(time, "1100");

        let (date, time) = village_base(seoul(2026, 8, 2, 2, 30));
        // 02:00 slot is not out yet at 02:30; yesterday 23:00 is newest.
        assert_eq!(date, "20260801");
        assert_eq!(time, "2300");
    }

    #[test]
    fn village_base_early_morning_rolls_to_previous_day() {
        let (date, time) = village_base(seoul(2026, 8, 1, 0, 10));
        assert_eq!(date, "20260731");
        assert_eq!(time, "2300");
    }
}
