//! Client for the Gemini `generateContent` endpoint.
//!
//! One [`LeadScorer::score`] call runs a bounded attempt loop: every attempt is a full,
//! independent request, and the loop may switch model or output limit between attempts.

use crate::analysis_parser::parse_analysis;
use crate::config::{Config, GenerationSettings, PipelineConfig, RetryPolicy};
use crate::errors::{AppError, ScoringError};
use crate::gemini_models::{
    ApiErrorBody, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
};
use crate::models::{AnalysisResult, Lead};
use crate::prompt::build_prompt;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};

/// Result of scoring one lead, with the model that produced the final attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub result: Result<AnalysisResult, ScoringError>,
    pub model_used: String,
    /// Requests made, including the first.
    pub attempts: u32,
}

impl ScoreOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Anything that can turn a lead into an analysis.
///
/// Implementations never panic or return early with an error; every failure is
/// reported inside [`ScoreOutcome::result`].
#[async_trait]
pub trait LeadScorer: Send + Sync {
    async fn score(&self, lead: &Lead) -> ScoreOutcome;
}

/// Why a single attempt failed, before the retry decision is made.
#[derive(Debug)]
enum Failure {
    Unauthorized,
    RateLimited,
    Server { status: u16, message: String },
    Empty { finish_reason: String },
    /// Output was cut at the token limit and nothing usable came back.
    Truncated,
    Parse(String),
    Api { status: u16, message: String },
    Connection(String),
}

impl Failure {
    fn is_retryable(&self) -> bool {
        !matches!(self, Failure::Unauthorized | Failure::Api { .. })
    }

    fn into_error(self, attempts: u32) -> ScoringError {
        match self {
            Failure::Unauthorized => ScoringError::Unauthorized,
            Failure::RateLimited => ScoringError::RateLimitExceeded { attempts },
            Failure::Server { status, message } => ScoringError::ServerError {
                status,
                message,
                attempts,
            },
            Failure::Empty { finish_reason } => ScoringError::EmptyResponse { finish_reason },
            Failure::Truncated => ScoringError::EmptyResponse {
                finish_reason: crate::gemini_models::FINISH_REASON_MAX_TOKENS.to_string(),
            },
            Failure::Parse(msg) => ScoringError::ParseError(msg),
            Failure::Api { status, message } => ScoringError::ApiError { status, message },
            Failure::Connection(msg) => ScoringError::ConnectionError(msg),
        }
    }
}

pub struct ScoringClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    fallback_model: Option<String>,
    retry: RetryPolicy,
    generation: GenerationSettings,
}

impl ScoringClient {
    /// Builds a client from service configuration.
    ///
    /// Fails with [`AppError::MissingCredential`] when no API key is configured.
    pub fn new(config: &Config, pipeline: &PipelineConfig) -> Result<Self, AppError> {
        let api_key = config
            .google_ai_api_key
            .clone()
            .ok_or_else(|| AppError::MissingCredential("GOOGLE_AI_API_KEY".to_string()))?;

        Self::with_endpoint(
            &config.ai_base_url,
            api_key,
            config.model.clone(),
            config.fallback_model.clone(),
            pipeline,
        )
    }

    /// Builds a client against an explicit endpoint (used by tests and the CLI).
    pub fn with_endpoint(
        base_url: &str,
        api_key: String,
        model: String,
        fallback_model: Option<String>,
        pipeline: &PipelineConfig,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(pipeline.request_timeout)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            fallback_model: fallback_model.filter(|m| !m.trim().is_empty()),
            retry: pipeline.retry,
            generation: pipeline.generation,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn attempt(
        &self,
        model: &str,
        prompt: &str,
        max_output_tokens: u32,
    ) -> Result<AnalysisResult, Failure> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/models/{}:generateContent", self.base_url, model),
            &[("key", self.api_key.as_str())],
        )
        .map_err(|e| Failure::Connection(format!("Failed to build URL: {}", e)))?;

        let body = GenerateContentRequest::single_prompt(
            prompt.to_string(),
            GenerationConfig {
                temperature: self.generation.temperature,
                max_output_tokens,
                top_p: self.generation.top_p,
                top_k: self.generation.top_k,
            },
        );

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Failure::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = ApiErrorBody::message_from(&raw);
            return Err(match status {
                StatusCode::FORBIDDEN => Failure::Unauthorized,
                StatusCode::TOO_MANY_REQUESTS => Failure::RateLimited,
                StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                    Failure::Server {
                        status: status.as_u16(),
                        message,
                    }
                }
                _ => Failure::Api {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let payload: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| Failure::Parse(format!("Unreadable response envelope: {}", e)))?;

        let Some(text) = payload.first_text() else {
            if payload.hit_length_limit() {
                return Err(Failure::Truncated);
            }
            return Err(Failure::Empty {
                finish_reason: payload.finish_reason().unwrap_or("unknown").to_string(),
            });
        };

        parse_analysis(text).map_err(|e| {
            if payload.hit_length_limit() {
                Failure::Truncated
            } else {
                Failure::Parse(e)
            }
        })
    }
}

#[async_trait]
impl LeadScorer for ScoringClient {
    async fn score(&self, lead: &Lead) -> ScoreOutcome {
        let prompt = build_prompt(lead);
        let mut model = self.model.clone();
        let mut max_output_tokens = self.generation.max_output_tokens;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match self.attempt(&model, &prompt, max_output_tokens).await {
                Ok(analysis) => {
                    tracing::debug!(
                        "Scored '{}' with {} (attempt {})",
                        lead.business_name,
                        model,
                        attempt
                    );
                    return ScoreOutcome {
                        result: Ok(analysis),
                        model_used: model,
                        attempts: attempt,
                    };
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() || attempt >= self.retry.max_attempts {
                let error = failure.into_error(attempt);
                tracing::warn!(
                    "Giving up on '{}' after {} attempt(s): {}",
                    lead.business_name,
                    attempt,
                    error
                );
                return ScoreOutcome {
                    result: Err(error),
                    model_used: model,
                    attempts: attempt,
                };
            }

            match &failure {
                Failure::Server { status, .. } => {
                    if let Some(fallback) = self.fallback_model.as_ref().filter(|f| **f != model) {
                        tracing::warn!(
                            "Model {} returned {}, switching to fallback {}",
                            model,
                            status,
                            fallback
                        );
                        model = fallback.clone();
                    }
                }
                Failure::Truncated => {
                    if let Some(extended) = self
                        .generation
                        .extended_max_output_tokens
                        .filter(|ext| *ext > max_output_tokens)
                    {
                        tracing::warn!(
                            "Output truncated at {} tokens, retrying with {}",
                            max_output_tokens,
                            extended
                        );
                        max_output_tokens = extended;
                    }
                }
                _ => {}
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                "Attempt {}/{} for '{}' failed ({:?}), retrying in {:?}",
                attempt,
                self.retry.max_attempts,
                lead.business_name,
                failure,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_rejected() {
        let config = Config {
            database_url: None,
            port: 3000,
            google_ai_api_key: None,
            ai_base_url: "http://localhost".to_string(),
            model: "gemini-2.5-flash".to_string(),
            fallback_model: None,
        };

        let err = ScoringClient::new(&config, &PipelineConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, AppError::MissingCredential(_)));
    }

    #[test]
    fn test_terminal_failures_are_not_retried() {
        assert!(!Failure::Unauthorized.is_retryable());
        assert!(!Failure::Api {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(Failure::RateLimited.is_retryable());
        assert!(Failure::Truncated.is_retryable());
        assert!(Failure::Connection("reset".into()).is_retryable());
    }

    #[test]
    fn test_truncation_maps_to_empty_response() {
        let err = Failure::Truncated.into_error(3);
        assert_eq!(err.kind(), "empty_response");
        assert_eq!(
            Failure::RateLimited.into_error(3),
            ScoringError::RateLimitExceeded { attempts: 3 }
        );
    }
}
