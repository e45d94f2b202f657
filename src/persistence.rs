use crate::circuit_breaker::{create_db_circuit_breaker, guarded, DbCircuitBreaker};
use crate::errors::{AppError, ResultExt};
use crate::models::{AnalyzedLead, SessionContext, SessionDelta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Mutex;
use uuid::Uuid;

/// One persisted row per lead outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    #[serde(flatten)]
    pub outcome: AnalyzedLead,
    /// "completed" or "error".
    pub analysis_status: &'static str,
    pub error_message: Option<String>,
    pub cache_hit_at: Option<DateTime<Utc>>,
}

impl LeadRecord {
    pub fn from_outcome(session: &SessionContext, outcome: &AnalyzedLead) -> Self {
        Self {
            session_id: session.session_id,
            user_id: session.user_id,
            outcome: outcome.clone(),
            analysis_status: if outcome.success { "completed" } else { "error" },
            error_message: outcome.error.clone(),
            cache_hit_at: outcome.from_cache.then_some(outcome.analyzed_at),
        }
    }
}

/// Append-only destination for lead outcomes, owned outside the pipeline.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Appends one outcome row. Each call is independent of every other.
    async fn persist(&self, record: &LeadRecord) -> Result<(), AppError>;

    /// Applies counter increments (and optionally a status) to the session aggregate.
    async fn report_session(
        &self,
        session: &SessionContext,
        delta: &SessionDelta,
    ) -> Result<(), AppError>;
}

/// Sink writing to the `leads` and `analysis_sessions` tables.
pub struct PgPersistenceSink {
    pool: PgPool,
    breaker: DbCircuitBreaker,
}

impl PgPersistenceSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            breaker: create_db_circuit_breaker(),
        }
    }
}

#[async_trait]
impl PersistenceSink for PgPersistenceSink {
    async fn persist(&self, record: &LeadRecord) -> Result<(), AppError> {
        let lead = &record.outcome.lead;
        let analysis = &record.outcome.analysis;

        guarded(
            &self.breaker,
            sqlx::query(
                r#"
                INSERT INTO leads (
                    session_id, user_id, source, business_name, maps_url, website, phone,
                    address, city, uf, raw_description, status_processamento,
                    analysis_status, error_message,
                    icp_score, icp_level, faturamento_score, faturamento_estimado,
                    faturamento_nivel, brecha, script_video, texto_direct, justificativa,
                    analyzed_at, from_cache, cache_hit_at
                )
                VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
                )
                "#,
            )
            .bind(record.session_id)
            .bind(record.user_id)
            .bind(&lead.source)
            .bind(&lead.business_name)
            .bind(&lead.maps_url)
            .bind(lead.website())
            .bind(lead.phone())
            .bind(&lead.address)
            .bind(&lead.city)
            .bind(&lead.uf)
            .bind(&lead.raw_description)
            .bind(&lead.status_processamento)
            .bind(record.analysis_status)
            .bind(record.error_message.as_deref())
            .bind(i16::from(analysis.icp_score))
            .bind(analysis.icp_level.as_str())
            .bind(i16::from(analysis.faturamento_score))
            .bind(&analysis.faturamento_estimado)
            .bind(analysis.faturamento_nivel.as_str())
            .bind(&analysis.brecha)
            .bind(&analysis.script_video)
            .bind(&analysis.texto_direct)
            .bind(&analysis.justificativa)
            .bind(record.outcome.analyzed_at)
            .bind(record.outcome.from_cache)
            .bind(record.cache_hit_at)
            .execute(&self.pool),
        )
        .await
        .map_err(AppError::from)
        .context("Failed to persist lead")?;

        Ok(())
    }

    async fn report_session(
        &self,
        session: &SessionContext,
        delta: &SessionDelta,
    ) -> Result<(), AppError> {
        guarded(
            &self.breaker,
            sqlx::query(
                r#"
                UPDATE analysis_sessions
                SET total_leads = total_leads + $3,
                    processed_leads = processed_leads + $4,
                    successful_leads = successful_leads + $5,
                    failed_leads = failed_leads + $6,
                    status = COALESCE($7, status),
                    updated_at = now()
                WHERE id = $1 AND user_id = $2
                "#,
            )
            .bind(session.session_id)
            .bind(session.user_id)
            .bind(delta.total as i32)
            .bind(delta.processed as i32)
            .bind(delta.successful as i32)
            .bind(delta.failed as i32)
            .bind(delta.status.map(|s| s.as_str()))
            .execute(&self.pool),
        )
        .await
        .map_err(AppError::from)
        .context("Failed to update session")?;

        Ok(())
    }
}

/// Sink that keeps everything in memory; used by the CLI and tests.
#[derive(Default)]
pub struct MemoryPersistenceSink {
    records: Mutex<Vec<LeadRecord>>,
    deltas: Mutex<Vec<SessionDelta>>,
}

impl MemoryPersistenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LeadRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn session_deltas(&self) -> Vec<SessionDelta> {
        self.deltas.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceSink for MemoryPersistenceSink {
    async fn persist(&self, record: &LeadRecord) -> Result<(), AppError> {
        self.records
            .lock()
            .map_err(|_| AppError::InternalError("sink lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }

    async fn report_session(
        &self,
        _session: &SessionContext,
        delta: &SessionDelta,
    ) -> Result<(), AppError> {
        self.deltas
            .lock()
            .map_err(|_| AppError::InternalError("sink lock poisoned".to_string()))?
            .push(*delta);
        Ok(())
    }
}
