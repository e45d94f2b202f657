use std::env;
use std::time::Duration;

use chrono::Utc;
use lead_qualifier::cache_store::{CacheStore, LeadIdentity};
use lead_qualifier::db::Database;
use lead_qualifier::models::{AnalysisResult, IcpLevel};
use uuid::Uuid;

/// Smoke test for the Postgres cache table: upsert twice, read back the latest write.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn pg_cache_last_write_wins_smoke_test() -> anyhow::Result<()> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    let cache = db.cache_store(Duration::from_secs(3600)).await?;

    // Unique business name so repeated runs never collide
    let name = format!("Clínica Teste {}", Uuid::new_v4());
    let identity = LeadIdentity::new(&name, "Curitiba", "PR", None);

    let mut first = AnalysisResult::baseline("primeira");
    first.icp_score = 1;
    first.icp_level = IcpLevel::N3;
    let mut second = AnalysisResult::baseline("segunda");
    second.icp_score = 3;
    second.icp_level = IcpLevel::N1;

    cache.store(&identity, "", &first, Utc::now()).await?;
    cache.store(&identity, "", &second, Utc::now()).await?;

    let hit = cache
        .lookup(&identity)
        .await?
        .ok_or_else(|| anyhow::anyhow!("expected a cache hit"))?;
    assert_eq!(hit.analysis, second);

    sqlx::query("DELETE FROM lead_analysis_cache WHERE cache_key = $1")
        .bind(identity.cache_key())
        .execute(&db.pool)
        .await?;

    Ok(())
}

/// Entries older than the TTL are misses even though the row still exists.
#[tokio::test]
#[ignore]
async fn pg_cache_ignores_expired_rows() -> anyhow::Result<()> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    let cache = db.cache_store(Duration::from_secs(3600)).await?;

    let identity = LeadIdentity::new(&format!("Clínica Antiga {}", Uuid::new_v4()), "Recife", "PE", None);
    let stale = Utc::now() - chrono::Duration::hours(2);
    cache
        .store(&identity, "", &AnalysisResult::baseline("antiga"), stale)
        .await?;

    assert!(cache.lookup(&identity).await?.is_none());

    sqlx::query("DELETE FROM lead_analysis_cache WHERE cache_key = $1")
        .bind(identity.cache_key())
        .execute(&db.pool)
        .await?;

    Ok(())
}
