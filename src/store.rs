//! p2panda-store bootstrap helpers.
//!
//! `LogCore` (§4.1) is a thin wrapper around a single shared `SqliteStore`
//! instance pinned to one `log_id`; this module owns opening that store (and
//! the separate read-model pool the `view` module materializes into). No
//! process-wide singleton lives here — `CoreContext` (`config.rs`) is the
//! only place a store handle is owned, per the redesign note in §9.

use p2panda_store::sqlite::store::{
    connection_pool, create_database, run_pending_migrations, SqliteStore,
};
use sqlx::SqlitePool;
use thiserror::Error;

/// p2panda-store instance parameterised with `String` log ids and no extensions.
pub type RoomOpStore = SqliteStore<String, ()>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store init error: {0}")]
    Init(String),
}

/// Open (creating if absent) the operation store backing every room's
/// command log and blob-core at `{db_dir}/ops.db`.
pub async fn open_op_store(db_dir: &str) -> Result<RoomOpStore, StoreError> {
    let url = if db_dir == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{db_dir}/ops.db")
    };
    if db_dir != ":memory:" {
        create_database(&url)
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;
    }
    let pool = connection_pool(&url, 5)
        .await
        .map_err(|e| StoreError::Init(e.to_string()))?;
    run_pending_migrations(&pool)
        .await
        .map_err(|e| StoreError::Init(e.to_string()))?;
    Ok(SqliteStore::new(pool))
}

/// Open (creating if absent) the read-model pool the `view` module
/// materializes `metadata`/`invite`/`messages`/`drive-metadata` into, at
/// `{db_dir}/view.db`.
pub async fn open_view_pool(db_dir: &str) -> Result<SqlitePool, StoreError> {
    let url = if db_dir == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{db_dir}/view.db?mode=rwc")
    };
    SqlitePool::connect(&url)
        .await
        .map_err(|e| StoreError::Init(e.to_string()))
}
