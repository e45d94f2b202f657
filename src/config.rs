use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_AI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_FALLBACK_MODEL: &str = "gemini-1.5-flash";

/// Service-level configuration loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres URL; without it the service runs with an in-memory cache and no sink.
    pub database_url: Option<String>,
    pub port: u16,
    /// Google AI Studio key. Checked by the orchestrator, not at load time.
    pub google_ai_api_key: Option<String>,
    pub ai_base_url: String,
    pub model: String,
    pub fallback_model: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            google_ai_api_key: std::env::var("GOOGLE_AI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            ai_base_url: std::env::var("GOOGLE_AI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_AI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: std::env::var("GEMINI_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            // An explicitly empty GEMINI_FALLBACK_MODEL disables the fallback
            fallback_model: match std::env::var("GEMINI_FALLBACK_MODEL") {
                Ok(m) if m.trim().is_empty() => None,
                Ok(m) => Some(m),
                Err(_) => Some(DEFAULT_FALLBACK_MODEL.to_string()),
            },
        };

        if !config.ai_base_url.starts_with("http://") && !config.ai_base_url.starts_with("https://")
        {
            anyhow::bail!("GOOGLE_AI_BASE_URL must start with http:// or https://");
        }

        tracing::info!("Configuration loaded successfully");
        if let Some(ref url) = config.database_url {
            tracing::debug!("Database URL: {}...", url_prefix(url));
        } else {
            tracing::warn!("No DB_URL configured, running with in-memory cache and no persistence");
        }
        if config.google_ai_api_key.is_none() {
            tracing::warn!("GOOGLE_AI_API_KEY not configured, analysis requests will be rejected");
        }
        tracing::debug!("AI base URL: {}", config.ai_base_url);
        tracing::debug!(
            "Model: {} (fallback: {:?})",
            config.model,
            config.fallback_model
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

/// Retry ceiling and exponential backoff for scoring calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls allowed per lead, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// First 20 characters of a connection string, for logs.
fn url_prefix(url: &str) -> String {
    url.chars().take(20).collect()
}

/// Bounds for the adaptive concurrency controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    pub min: usize,
    pub max: usize,
    pub initial: usize,
    /// Observations required before the controller re-evaluates.
    pub min_samples: usize,
}

impl ConcurrencyLimits {
    /// Repairs inconsistent bounds: `min` is at least 1, `max` at least `min`, and
    /// `initial` lies between them.
    pub fn normalized(self) -> Self {
        let min = self.min.max(1);
        let max = self.max.max(min);
        Self {
            min,
            max,
            initial: self.initial.clamp(min, max),
            min_samples: self.min_samples,
        }
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            initial: 2,
            min_samples: 5,
        }
    }
}

/// Sampling parameters sent with every generation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    /// Output limit used after a response was cut off by `max_output_tokens`.
    pub extended_max_output_tokens: Option<u32>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 4096,
            extended_max_output_tokens: Some(8192),
        }
    }
}

/// Immutable tuning for one orchestrator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub concurrency: ConcurrencyLimits,
    pub generation: GenerationSettings,
    /// Stagger between call starts inside one window.
    pub inter_request_delay: Duration,
    /// Pause between windows.
    pub inter_batch_delay: Duration,
    /// Age after which cached analyses are ignored.
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: ConcurrencyLimits::default(),
            generation: GenerationSettings::default(),
            inter_request_delay: Duration::from_millis(200),
            inter_batch_delay: Duration::from_millis(1000),
            cache_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by any tuning variables present in the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: env_or("RETRY_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: env_millis("RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
            max_delay: env_millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
        };
        if retry.max_attempts == 0 {
            anyhow::bail!("RETRY_ATTEMPTS must be at least 1");
        }

        let concurrency = ConcurrencyLimits {
            min: env_or("MIN_CONCURRENCY", defaults.concurrency.min)?,
            max: env_or("MAX_CONCURRENCY", defaults.concurrency.max)?,
            initial: env_or("INITIAL_CONCURRENCY", defaults.concurrency.initial)?,
            min_samples: env_or("CONCURRENCY_MIN_SAMPLES", defaults.concurrency.min_samples)?,
        };
        if concurrency.min == 0 || concurrency.min > concurrency.max {
            anyhow::bail!("MIN_CONCURRENCY must be >= 1 and <= MAX_CONCURRENCY");
        }

        let generation = GenerationSettings {
            max_output_tokens: env_or("MAX_OUTPUT_TOKENS", defaults.generation.max_output_tokens)?,
            ..defaults.generation
        };

        let config = Self {
            retry,
            concurrency,
            generation,
            inter_request_delay: env_millis("INTER_REQUEST_DELAY_MS", defaults.inter_request_delay)?,
            inter_batch_delay: env_millis("INTER_BATCH_DELAY_MS", defaults.inter_batch_delay)?,
            cache_ttl: Duration::from_secs(
                env_or::<u64>("CACHE_TTL_DAYS", defaults.cache_ttl.as_secs() / 86_400)? * 86_400,
            ),
            request_timeout: defaults.request_timeout,
        };

        tracing::debug!(
            "Pipeline: retries={} base={:?} max={:?} concurrency={}..{} (start {})",
            config.retry.max_attempts,
            config.retry.base_delay,
            config.retry.max_delay,
            config.concurrency.min,
            config.concurrency.max,
            config.concurrency.initial
        );

        Ok(config)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number", name)),
        _ => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> anyhow::Result<Duration> {
    let millis = env_or::<u64>(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
