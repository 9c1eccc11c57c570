//! Repository for the raw response archive.

use chrono::Utc;
use diesel::prelude::*;

use super::models::{NewRawData, RawDataRecord};
use super::pool::{run_blocking, SqlitePool};
use crate::error::BatchError;

/// Append-only access to `api_raw_data`.
#[derive(Clone)]
pub struct RawDataRepository {
    pool: SqlitePool,
}

impl RawDataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one archived response row.
    pub async fn insert(&self, row: NewRawData) -> Result<(), BatchError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(crate::schema::api_raw_data::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Fetch one archived row by id.
    pub async fn get(&self, raw_id: &str) -> Result<Option<RawDataRecord>, BatchError> {
        use crate::schema::api_raw_data::dsl;
        let raw_id = raw_id.to_string();
        let pool = self.pool.clone();
        let record = run_blocking(pool, move |conn| {
            dsl::api_raw_data
                .find(raw_id)
                .first::<RawDataRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record)
    }

    pub async fn count(&self) -> Result<u64, BatchError> {
        use crate::schema::api_raw_data::dsl;
        let pool = self.pool.clone();
        let count: i64 = run_blocking(pool, move |conn| {
            dsl::api_raw_data.count().get_result(conn)
        })
        .await?;
        Ok(count as u64)
    }

    /// Delete rows past their retention deadline. Returns how many went.
    pub async fn purge_expired(&self) -> Result<u64, BatchError> {
        use crate::schema::api_raw_data::dsl;
        let cutoff = super::format_ts(Utc::now());
        let pool = self.pool.clone();
        let deleted = run_blocking(pool, move |conn| {
            diesel::delete(dsl::api_raw_data.filter(dsl::expires_at.lt(cutoff))).execute(conn)
        })
        .await?;
        Ok(deleted as u64)
    }
}
