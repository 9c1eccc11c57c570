//! Diesel connection pool management for SQLite.
//!
//! diesel-async does not support SQLite, so operations use sync Diesel with
//! r2d2 pooling, wrapped in spawn_blocking.

use std::path::Path;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};

use crate::error::BatchError;

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// r2d2 pool error type alias.
pub type R2D2Error = diesel::r2d2::PoolError;

/// Connection pool for SQLite using r2d2.
pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Pooled connection type.
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Create a Diesel connection pool for SQLite.
pub fn create_pool(db_path: &Path) -> Result<SqlitePool, R2D2Error> {
    create_pool_sized(db_path, 10)
}

/// Create a pool with an explicit size (bulk loads size this to the
/// configured parallel degree).
pub fn create_pool_sized(db_path: &Path, max_size: u32) -> Result<SqlitePool, R2D2Error> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path.display().to_string());

    Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(30))
        .build(manager)
}

/// Initialize SQLite pragmas for a connection.
///
/// Call once per connection acquired for long-lived use; WAL keeps readers
/// unblocked while a chunk commits.
pub fn init_connection_pragmas(conn: &mut SqliteConnection) -> Result<(), DieselError> {
    diesel::sql_query("PRAGMA journal_mode = WAL").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous = NORMAL").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys = ON").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout = 30000").execute(conn)?;
    Ok(())
}

/// Run a blocking Diesel operation asynchronously.
///
/// Wraps a sync closure in spawn_blocking so Diesel can be used from async
/// contexts without stalling the runtime. Query errors surface as the
/// database kind; failing to get a connection or losing the worker task is
/// an infrastructure problem and classified as transient instead.
pub async fn run_blocking<F, T>(pool: SqlitePool, f: F) -> Result<T, BatchError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, DieselError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| BatchError::Transient {
            detail: format!("connection pool: {e}"),
        })?;
        f(&mut conn).map_err(BatchError::Db)
    })
    .await
    .map_err(|e| BatchError::Transient {
        detail: format!("blocking task failed: {e}"),
    })?
}
