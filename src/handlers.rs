use crate::batch::BatchOrchestrator;
use crate::config::Config;
use crate::errors::AppError;
use crate::export::to_csv;
use crate::models::*;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Pipeline over the configured model; `None` when no API key is set.
    pub orchestrator: Option<Arc<BatchOrchestrator>>,
    /// Cancelled on shutdown; running batches stop after their current window.
    pub shutdown: CancellationToken,
}

impl AppState {
    fn orchestrator(&self) -> Result<&BatchOrchestrator, AppError> {
        self.orchestrator
            .as_deref()
            .ok_or_else(|| AppError::MissingCredential("GOOGLE_AI_API_KEY".to_string()))
    }
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "lead-qualifier",
            "version": env!("CARGO_PKG_VERSION"),
            "model": state.config.model,
            "scoring_enabled": state.orchestrator.is_some(),
            "in_flight": state.orchestrator.as_ref().map(|o| o.in_flight()).unwrap_or(0),
        })),
    )
}

/// POST /api/v1/leads/analyze-batch
///
/// Scores every lead in the body. Outcomes are persisted against the session only when
/// both `session_id` and `user_id` are supplied.
pub async fn analyze_batch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    let session = payload.session_context();
    let leads = payload.leads.unwrap_or_default();
    if leads.is_empty() {
        return Err(AppError::NoLeads);
    }

    let orchestrator = state.orchestrator()?;
    tracing::info!(
        "POST /leads/analyze-batch - {} leads, session: {:?}",
        leads.len(),
        session.map(|s| s.session_id)
    );

    let response = orchestrator
        .process(leads, session, state.shutdown.child_token())
        .await?;

    Ok(Json(response))
}

/// POST /api/v1/leads/analyze
///
/// Single-lead variant; scoring failures still return 200 with `success: false`.
pub async fn analyze_one(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SingleLeadRequest>,
) -> Result<Json<AnalyzedLead>, AppError> {
    let orchestrator = state.orchestrator()?;
    tracing::info!("POST /leads/analyze - {}", payload.lead.business_name);

    Ok(Json(orchestrator.analyze_one(payload.lead, None).await))
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub results: Vec<AnalyzedLead>,
}

/// POST /api/v1/leads/export.csv
pub async fn export_csv(Json(payload): Json<ExportRequest>) -> impl IntoResponse {
    tracing::info!("POST /leads/export.csv - {} rows", payload.results.len());
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"leads_qualificados.csv\"",
            ),
        ],
        to_csv(&payload.results),
    )
}
