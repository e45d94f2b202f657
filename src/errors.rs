use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use crate::circuit_breaker::Guarded;
use serde_json::json;
use std::fmt;

/// Application-level errors surfaced to callers of the pipeline and the HTTP layer.
///
/// Per-lead scoring failures never become an `AppError`; they are recorded on the
/// lead outcome as a [`ScoringError`].
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// The batch entry point was called without leads.
    NoLeads,
    /// No credential configured for the generative model.
    MissingCredential(String),
    /// Cache backend could not be reached or returned garbage.
    CacheUnavailable(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NoLeads => write!(f, "No leads provided"),
            AppError::MissingCredential(name) => write!(f, "{} not configured", name),
            AppError::CacheUnavailable(msg) => write!(f, "Cache unavailable: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Maps each variant to an HTTP status and a JSON `{"error": ...}` body.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NoLeads => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::MissingCredential(_) => {
                tracing::error!("{}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::CacheUnavailable(msg) => {
                tracing::warn!("Cache unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Cache unavailable".to_string(),
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl Clone for AppError {
    /// `sqlx::Error` is not cloneable, so `DatabaseError` degrades to its message.
    fn clone(&self) -> Self {
        match self {
            AppError::DatabaseError(e) => AppError::InternalError(format!("Database error: {}", e)),
            AppError::NoLeads => AppError::NoLeads,
            AppError::MissingCredential(name) => AppError::MissingCredential(name.clone()),
            AppError::CacheUnavailable(msg) => AppError::CacheUnavailable(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<Guarded<sqlx::Error>> for AppError {
    fn from(err: Guarded<sqlx::Error>) -> Self {
        match err {
            Guarded::Rejected => AppError::InternalError("database circuit open".to_string()),
            Guarded::Failed(e) => AppError::DatabaseError(e),
        }
    }
}

/// Terminal failure of a single scoring call, after retries and fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringError {
    #[error("API key inválida ou sem permissão")]
    Unauthorized,

    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    #[error("Server error {status} after {attempts} attempts: {message}")]
    ServerError {
        status: u16,
        message: String,
        attempts: u32,
    },

    #[error("Resposta vazia da API. FinishReason: {finish_reason}")]
    EmptyResponse { finish_reason: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Invalid lead: {0}")]
    InvalidLead(String),
}

impl ScoringError {
    /// Stable machine-readable code for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ScoringError::Unauthorized => "unauthorized",
            ScoringError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ScoringError::ServerError { .. } => "server_error",
            ScoringError::EmptyResponse { .. } => "empty_response",
            ScoringError::ParseError(_) => "parse_error",
            ScoringError::ApiError { .. } => "api_error",
            ScoringError::ConnectionError(_) => "connection_error",
            ScoringError::InvalidLead(_) => "invalid_lead",
        }
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }
}

impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }
}
