//! Persistent state: a single SQLite database behind a pool handle.
//!
//! Every multi-row invariant (lease claim, awakeable resolution, lifecycle
//! transition + event emission) runs as one transaction on this pool. Model
//! modules own their SQL; this module owns opening, migrating, and the
//! transaction helper.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;

/// Shared handle to the engine's storage. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) `windlass.db` under `storage_dir` and run migrations.
    pub async fn open(storage_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_dir).map_err(|e| {
            crate::error::WindlassError::Validation(format!(
                "cannot create storage dir {}: {e}",
                storage_dir.display()
            ))
        })?;
        let db_path = storage_dir.join("windlass.db");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(db = %db_path.display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests. Single connection: each SQLite `:memory:`
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("static connection string")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            crate::error::WindlassError::Validation(format!("migration failed: {e}"))
        })?;
        Ok(())
    }

    /// The underlying pool, for model-owned queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}
