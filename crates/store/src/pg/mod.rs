//! PostgreSQL store backend.
//!
//! Every coordination primitive is a single conditional `UPDATE` (claims,
//! timers, the lease) or a `FOR UPDATE SKIP LOCKED` selection (jobs), so
//! correctness does not depend on any in-process locking.

mod directory;
mod incidents;
mod jobs;
mod lease;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use oncall_core::config::PostgresConfig;

use crate::error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a connection pool sized from the config.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url())
            .await?;
        info!(host = %config.host, database = %config.database, "PostgreSQL connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied successfully");
        Ok(())
    }
}

// ── Column conversions ───────────────────────────────────────

pub(crate) fn index_to_db(index: usize) -> StoreResult<i32> {
    i32::try_from(index).map_err(|_| StoreError::Corrupt(format!("step index {index} out of range")))
}

pub(crate) fn index_from_db(value: i32) -> StoreResult<usize> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative step index {value}")))
}

pub(crate) fn count_from_db(column: &str, value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column} {value}")))
}
