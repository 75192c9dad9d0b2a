//! PostgreSQL-backed store implementation.

use crate::error::MetadataResult;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::str::FromStr;

/// Schema (embedded). Idempotent; applied on every connect.
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// PostgreSQL store shared by the web edge and the cron jobs.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect with a full connection string (the `pg-connstring` flag).
    pub async fn connect(connstring: &str, max_connections: u32) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(connstring)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests).
    pub async fn from_pool(pool: Pool<Postgres>) -> MetadataResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded schema.
    pub async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(POSTGRES_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}
