//! Persistent per-day quota ledger.
//!
//! Key usage must survive restarts or a crash-loop would silently burn the
//! daily quota. Rows are keyed (provider, key_hash, day); the write-through
//! happens after every registry mutation and yesterday's rows are purged on
//! load. Only key fingerprints are stored, never secrets.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::error::BatchError;
use crate::providers::Provider;

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyLedgerRow {
    pub key_hash: String,
    pub usage: u32,
    pub consecutive_errors: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub state: String,
    pub cooldown_until: Option<String>,
}

/// Backing store seam for the quota ledger.
///
/// The SQLite implementation is the single-node default; a shared key/value
/// store can implement the same contract for horizontally scaled
/// deployments.
pub trait QuotaStore: Send + Sync {
    fn load_day(&self, provider: Provider, day: &str) -> Result<Vec<KeyLedgerRow>, BatchError>;
    fn write_through(
        &self,
        provider: Provider,
        day: &str,
        row: &KeyLedgerRow,
    ) -> Result<(), BatchError>;
    /// Drop rows for days before `day`. Returns how many went.
    fn purge_before(&self, day: &str) -> Result<u64, BatchError>;
}

/// SQLite-backed ledger with WAL for multi-process tolerance.
pub struct SqliteQuotaStore {
    conn: Mutex<Connection>,
}

impl SqliteQuotaStore {
    pub fn open(db_path: &Path) -> Result<Self, BatchError> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS api_quota_ledger (
                provider TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                day TEXT NOT NULL,
                usage INTEGER NOT NULL DEFAULT 0,
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                total_calls INTEGER NOT NULL DEFAULT 0,
                total_successes INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'active',
                cooldown_until TEXT,
                PRIMARY KEY (provider, key_hash, day)
            );
        "#,
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl QuotaStore for SqliteQuotaStore {
    fn load_day(&self, provider: Provider, day: &str) -> Result<Vec<KeyLedgerRow>, BatchError> {
        let conn = self.conn.lock().expect("quota store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT key_hash, usage, consecutive_errors, total_calls, total_successes,
                        state, cooldown_until
                 FROM api_quota_ledger WHERE provider = ? AND day = ?",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![provider.as_str(), day], |row| {
                Ok(KeyLedgerRow {
                    key_hash: row.get(0)?,
                    usage: row.get::<_, i64>(1)? as u32,
                    consecutive_errors: row.get::<_, i64>(2)? as u32,
                    total_calls: row.get::<_, i64>(3)? as u64,
                    total_successes: row.get::<_, i64>(4)? as u64,
                    state: row.get(5)?,
                    cooldown_until: row.get(6)?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(rows)
    }

    fn write_through(
        &self,
        provider: Provider,
        day: &str,
        row: &KeyLedgerRow,
    ) -> Result<(), BatchError> {
        let conn = self.conn.lock().expect("quota store lock poisoned");
        conn.execute(
            r#"INSERT INTO api_quota_ledger
                   (provider, key_hash, day, usage, consecutive_errors,
                    total_calls, total_successes, state, cooldown_until)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (provider, key_hash, day) DO UPDATE SET
                   usage = excluded.usage,
                   consecutive_errors = excluded.consecutive_errors,
                   total_calls = excluded.total_calls,
                   total_successes = excluded.total_successes,
                   state = excluded.state,
                   cooldown_until = excluded.cooldown_until"#,
            params![
                provider.as_str(),
                row.key_hash,
                day,
                row.usage as i64,
                row.consecutive_errors as i64,
                row.total_calls as i64,
                row.total_successes as i64,
                row.state,
                row.cooldown_until,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn purge_before(&self, day: &str) -> Result<u64, BatchError> {
        let conn = self.conn.lock().expect("quota store lock poisoned");
        let deleted = conn
            .execute("DELETE FROM api_quota_ledger WHERE day < ?", params![day])
            .map_err(db_err)?;
        Ok(deleted as u64)
    }
}

/// In-memory ledger for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryQuotaStore {
    rows: Mutex<Vec<(String, String, KeyLedgerRow)>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn load_day(&self, provider: Provider, day: &str) -> Result<Vec<KeyLedgerRow>, BatchError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows
            .iter()
            .filter(|(p, d, _)| p == provider.as_str() && d == day)
            .map(|(_, _, row)| row.clone())
            .collect())
    }

    fn write_through(
        &self,
        provider: Provider,
        day: &str,
        row: &KeyLedgerRow,
    ) -> Result<(), BatchError> {
        let mut rows = self.rows.lock().expect("memory store lock poisoned");
        if let Some(existing) = rows
            .iter_mut()
            .find(|(p, d, r)| p == provider.as_str() && d == day && r.key_hash == row.key_hash)
        {
            existing.2 = row.clone();
        } else {
            rows.push((provider.as_str().to_string(), day.to_string(), row.clone()));
        }
        Ok(())
    }

    fn purge_before(&self, day: &str) -> Result<u64, BatchError> {
        let mut rows = self.rows.lock().expect("memory store lock poisoned");
        let before = rows.len();
        rows.retain(|(_, d, _)| d.as_str() >= day);
        Ok((before - rows.len()) as u64)
    }
}

fn db_err(e: rusqlite::Error) -> BatchError {
    BatchError::Transient {
        detail: format!("quota ledger: {e}"),
    }
}
