//! Lookup of previously computed lead analyses, keyed by normalized business identity.
//!
//! The cache is a performance optimisation only. Callers treat every backend error as a
//! miss (see [`crate::batch`]); nothing here is consistency-critical.

use crate::cache_validator::ValidatedCacheEntry;
use crate::circuit_breaker::{create_db_circuit_breaker, guarded, DbCircuitBreaker, Guarded};
use crate::errors::{AppError, ResultExt};
use crate::models::{AnalysisResult, Lead};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::time::Duration;

/// Normalized (business_name, city, uf, website) tuple.
///
/// Every component is trimmed and lowercased. A missing website is the empty string,
/// which is a distinct value and never a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeadIdentity {
    pub business_name: String,
    pub city: String,
    pub uf: String,
    pub website: String,
}

impl LeadIdentity {
    pub fn new(business_name: &str, city: &str, uf: &str, website: Option<&str>) -> Self {
        Self {
            business_name: normalize(business_name),
            city: normalize(city),
            uf: normalize(uf),
            website: website.map(normalize).unwrap_or_default(),
        }
    }

    pub fn from_lead(lead: &Lead) -> Self {
        Self::new(&lead.business_name, &lead.city, &lead.uf, lead.website())
    }

    /// Hex SHA-256 of the normalized tuple; stable across processes.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (i, part) in [&self.business_name, &self.city, &self.uf, &self.website]
            .iter()
            .enumerate()
        {
            if i > 0 {
                hasher.update(b"\x1f");
            }
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// A cached analysis and when it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnalysis {
    pub analysis: AnalysisResult,
    pub cached_at: DateTime<Utc>,
}

/// Key/value store of lead analyses.
///
/// Implementations must tolerate concurrent readers and writers. `store` is an upsert:
/// the newest write for an identity wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the stored analysis for `identity` unless it is missing or expired.
    async fn lookup(&self, identity: &LeadIdentity) -> Result<Option<CachedAnalysis>, AppError>;

    /// Writes `analysis` for `identity`, replacing any previous entry.
    async fn store(
        &self,
        identity: &LeadIdentity,
        maps_url: &str,
        analysis: &AnalysisResult,
        cached_at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

// ============ In-memory backend ============

/// Process-local cache built on `moka`, with checksummed entries.
#[derive(Clone)]
pub struct MemoryCacheStore {
    entries: Cache<String, String>,
    ttl: Duration,
}

impl MemoryCacheStore {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self { entries, ttl }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, identity: &LeadIdentity) -> Result<Option<CachedAnalysis>, AppError> {
        let key = identity.cache_key();
        let Some(raw) = self.entries.get(&key).await else {
            return Ok(None);
        };

        let Some(entry) = ValidatedCacheEntry::deserialize_and_validate(&key, &raw) else {
            self.entries.invalidate(&key).await;
            return Ok(None);
        };

        if entry.is_expired(Utc::now(), self.ttl) {
            tracing::debug!(business = %identity.business_name, "Cache entry expired");
            return Ok(None);
        }

        Ok(Some(CachedAnalysis {
            analysis: entry.analysis,
            cached_at: entry.cached_at,
        }))
    }

    async fn store(
        &self,
        identity: &LeadIdentity,
        _maps_url: &str,
        analysis: &AnalysisResult,
        cached_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let key = identity.cache_key();
        let entry = ValidatedCacheEntry::seal(&key, analysis.clone(), cached_at);
        self.entries.insert(key, entry.serialize()).await;
        Ok(())
    }
}

// ============ Postgres backend ============

/// Shared cache table, upserted by concurrent batch runs (last write wins).
pub const CACHE_TABLE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS lead_analysis_cache (
        cache_key TEXT PRIMARY KEY,
        business_name TEXT NOT NULL,
        city TEXT NOT NULL,
        uf TEXT NOT NULL,
        website TEXT NOT NULL,
        maps_url TEXT,
        icp_score SMALLINT NOT NULL,
        icp_level TEXT NOT NULL,
        faturamento_score SMALLINT NOT NULL,
        faturamento_nivel TEXT NOT NULL,
        analysis JSONB NOT NULL,
        cached_at TIMESTAMPTZ NOT NULL
    )
"#;

/// Cache backed by the `lead_analysis_cache` table.
pub struct PgCacheStore {
    pool: PgPool,
    ttl: Duration,
    breaker: DbCircuitBreaker,
}

impl PgCacheStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            breaker: create_db_circuit_breaker(),
        }
    }

    /// Creates the cache table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::query(CACHE_TABLE_DDL)
            .execute(&self.pool)
            .await
            .context("Failed to create lead_analysis_cache")?;
        Ok(())
    }

    fn unavailable(err: Guarded<sqlx::Error>) -> AppError {
        match err {
            Guarded::Rejected => AppError::CacheUnavailable("circuit open".to_string()),
            Guarded::Failed(e) => AppError::CacheUnavailable(e.to_string()),
        }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn lookup(&self, identity: &LeadIdentity) -> Result<Option<CachedAnalysis>, AppError> {
        let key = identity.cache_key();
        let ttl_secs = self.ttl.as_secs_f64();

        let row = guarded(
            &self.breaker,
            sqlx::query_as::<_, (serde_json::Value, DateTime<Utc>)>(
                r#"
                SELECT analysis, cached_at
                FROM lead_analysis_cache
                WHERE cache_key = $1
                  AND cached_at > now() - make_interval(secs => $2)
                "#,
            )
            .bind(&key)
            .bind(ttl_secs)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(Self::unavailable)?;

        let Some((analysis, cached_at)) = row else {
            return Ok(None);
        };

        match serde_json::from_value::<AnalysisResult>(analysis) {
            Ok(analysis) => Ok(Some(CachedAnalysis {
                analysis,
                cached_at,
            })),
            Err(e) => {
                tracing::warn!(
                    business = %identity.business_name,
                    "Discarding unreadable cache row: {}",
                    e
                );
                Ok(None)
            }
        }
    }

    async fn store(
        &self,
        identity: &LeadIdentity,
        maps_url: &str,
        analysis: &AnalysisResult,
        cached_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_value(analysis)
            .map_err(|e| AppError::InternalError(format!("Failed to encode analysis: {}", e)))?;

        guarded(
            &self.breaker,
            sqlx::query(
                r#"
                INSERT INTO lead_analysis_cache (
                    cache_key, business_name, city, uf, website, maps_url,
                    icp_score, icp_level, faturamento_score, faturamento_nivel,
                    analysis, cached_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (cache_key) DO UPDATE SET
                    maps_url = EXCLUDED.maps_url,
                    icp_score = EXCLUDED.icp_score,
                    icp_level = EXCLUDED.icp_level,
                    faturamento_score = EXCLUDED.faturamento_score,
                    faturamento_nivel = EXCLUDED.faturamento_nivel,
                    analysis = EXCLUDED.analysis,
                    cached_at = EXCLUDED.cached_at
                "#,
            )
            .bind(identity.cache_key())
            .bind(&identity.business_name)
            .bind(&identity.city)
            .bind(&identity.uf)
            .bind(&identity.website)
            .bind(Some(maps_url).filter(|u| !u.is_empty()))
            .bind(i16::from(analysis.icp_score))
            .bind(analysis.icp_level.as_str())
            .bind(i16::from(analysis.faturamento_score))
            .bind(analysis.faturamento_nivel.as_str())
            .bind(payload)
            .bind(cached_at)
            .execute(&self.pool),
        )
        .await
        .map_err(Self::unavailable)?;

        Ok(())
    }
}
