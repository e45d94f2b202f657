use crate::cache_store::PgCacheStore;
use crate::persistence::PgPersistenceSink;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Postgres pool shared by the cache table and the persistence sink.
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Cache store over `lead_analysis_cache`, creating the table when missing.
    pub async fn cache_store(&self, ttl: Duration) -> anyhow::Result<PgCacheStore> {
        let store = PgCacheStore::new(self.pool.clone(), ttl);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn persistence_sink(&self) -> PgPersistenceSink {
        PgPersistenceSink::new(self.pool.clone())
    }
}
