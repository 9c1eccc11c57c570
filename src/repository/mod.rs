//! Database access layer.
//!
//! All relational state lives in SQLite behind an r2d2 pool; async callers
//! go through `pool::run_blocking`. Repositories are cheap handles that
//! clone the pool.

pub mod domain;
pub mod ledger;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod raw;

use chrono::{DateTime, Utc};

/// Render a timestamp the way every table stores it.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a stored timestamp, tolerating missing offsets.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&format_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_ts("not a time").is_none());
    }
}
