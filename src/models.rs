use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============ Input Models ============

/// A business lead produced by the scraper/import step.
///
/// Leads are never mutated by the pipeline; each processing attempt yields a new
/// [`AnalyzedLead`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// Optional upstream identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Where the lead came from (e.g. "google_maps", "csv").
    #[serde(default)]
    pub source: String,
    /// Business (clinic) name.
    #[serde(default)]
    pub business_name: String,
    /// Google Maps URL of the place.
    #[serde(default)]
    pub maps_url: String,
    /// Website, if the business has one.
    #[serde(default)]
    pub website: Option<String>,
    /// Phone number as scraped.
    #[serde(default)]
    pub phone: Option<String>,
    /// Street address.
    #[serde(default)]
    pub address: String,
    /// City name.
    #[serde(default)]
    pub city: String,
    /// Two-letter state code (UF).
    #[serde(default)]
    pub uf: String,
    /// Free-text description gathered by the scraper.
    #[serde(default)]
    pub raw_description: String,
    /// Processing status string set by the import step.
    #[serde(default)]
    pub status_processamento: String,
}

impl Lead {
    /// Website with blank values collapsed to `None`.
    pub fn website(&self) -> Option<&str> {
        self.website
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
    }

    /// Phone with blank values collapsed to `None`.
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }

    /// Checks the minimum fields needed to score a lead.
    ///
    /// Returns every problem found, not just the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.business_name.trim().is_empty() {
            errors.push("business_name is required".to_string());
        }
        if self.city.trim().is_empty() {
            errors.push("city is required".to_string());
        }
        if self.uf.trim().chars().count() != 2 {
            errors.push("uf must be 2 characters".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Optional caller context used to persist outcomes against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub user_id: Uuid,
}

/// Body of the batch entry point.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub leads: Option<Vec<Lead>>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

impl BatchRequest {
    /// Session context, present only when both ids were supplied.
    pub fn session_context(&self) -> Option<SessionContext> {
        match (self.session_id, self.user_id) {
            (Some(session_id), Some(user_id)) => Some(SessionContext {
                session_id,
                user_id,
            }),
            _ => None,
        }
    }
}

/// Body of the single-lead entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct SingleLeadRequest {
    pub lead: Lead,
}

// ============ Analysis Models ============

/// ICP qualification tier, monotonic with `icp_score`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IcpLevel {
    #[default]
    #[serde(rename = "descartar")]
    Descartar,
    N3,
    N2,
    N1,
}

impl IcpLevel {
    /// Maps a score to its tier: 0 → descartar, 1 → N3, 2 → N2, 3 → N1.
    ///
    /// Scores above 3 are treated as 3.
    pub fn from_score(score: u8) -> Self {
        match score {
            0 => IcpLevel::Descartar,
            1 => IcpLevel::N3,
            2 => IcpLevel::N2,
            _ => IcpLevel::N1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IcpLevel::Descartar => "descartar",
            IcpLevel::N3 => "N3",
            IcpLevel::N2 => "N2",
            IcpLevel::N1 => "N1",
        }
    }
}

/// Revenue tier derived from `faturamento_score`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaturamentoNivel {
    #[default]
    Baixo,
    #[serde(rename = "médio")]
    Medio,
    Alto,
    Premium,
}

impl FaturamentoNivel {
    /// 0-2 → baixo, 3-5 → médio, 6-7 → alto, 8-10 → premium.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=2 => FaturamentoNivel::Baixo,
            3..=5 => FaturamentoNivel::Medio,
            6..=7 => FaturamentoNivel::Alto,
            _ => FaturamentoNivel::Premium,
        }
    }

    /// Annual revenue bucket label for this tier.
    pub fn estimado(&self) -> &'static str {
        match self {
            FaturamentoNivel::Baixo => "<100k",
            FaturamentoNivel::Medio => "100k-300k",
            FaturamentoNivel::Alto => "300k-500k",
            FaturamentoNivel::Premium => ">500k",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaturamentoNivel::Baixo => "baixo",
            FaturamentoNivel::Medio => "médio",
            FaturamentoNivel::Alto => "alto",
            FaturamentoNivel::Premium => "premium",
        }
    }
}

/// Operational signals some prompt revisions ask the model for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinaisVitais {
    #[serde(default)]
    pub tem_login: bool,
    #[serde(default)]
    pub ticket_medio_alto: bool,
    #[serde(default)]
    pub custo_fixo_alto: bool,
}

/// Structured scoring of one lead.
///
/// Always structurally valid: scores are within range and the level/bucket fields are
/// derived from the scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub icp_score: u8,
    pub icp_level: IcpLevel,
    pub faturamento_score: u8,
    pub faturamento_estimado: String,
    pub faturamento_nivel: FaturamentoNivel,
    pub brecha: String,
    pub script_video: String,
    pub texto_direct: String,
    pub justificativa: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quebra_gelo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sinais_vitais: Option<SinaisVitais>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_pixel: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub site_tech: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram: Option<String>,
}

pub const MAX_ICP_SCORE: u8 = 3;
pub const MAX_FATURAMENTO_SCORE: u8 = 10;

impl AnalysisResult {
    /// The "descartar"/"baixo" result used for failures and unusable model output.
    pub fn baseline(justificativa: impl Into<String>) -> Self {
        Self::from_scores(0, 0, justificativa.into())
    }

    fn from_scores(icp_score: u8, faturamento_score: u8, justificativa: String) -> Self {
        let nivel = FaturamentoNivel::from_score(faturamento_score);
        Self {
            icp_score,
            icp_level: IcpLevel::from_score(icp_score),
            faturamento_score,
            faturamento_estimado: nivel.estimado().to_string(),
            faturamento_nivel: nivel,
            brecha: String::new(),
            script_video: String::new(),
            texto_direct: String::new(),
            justificativa,
            quebra_gelo: None,
            sinais_vitais: None,
            has_pixel: None,
            site_tech: Vec::new(),
            instagram: None,
        }
    }

    /// Builds a result from loosely-shaped model output.
    ///
    /// Unknown fields are ignored. Missing, non-numeric or out-of-range scores fall back to
    /// 0, and the level/bucket fields are always recomputed from the scores. Returns `None`
    /// only when the value is not a JSON object.
    pub fn from_model_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        let icp_score = coerce_score(obj.get("icp_score"), MAX_ICP_SCORE);
        let faturamento_score = coerce_score(obj.get("faturamento_score"), MAX_FATURAMENTO_SCORE);

        let mut result = Self::from_scores(
            icp_score,
            faturamento_score,
            text_field(obj.get("justificativa")),
        );
        result.brecha = text_field(obj.get("brecha"));
        result.script_video = text_field(obj.get("script_video"));
        result.texto_direct = text_field(obj.get("texto_direct"));
        result.quebra_gelo = obj
            .get("quebra_gelo")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        result.sinais_vitais = obj
            .get("sinais_vitais")
            .and_then(|v| serde_json::from_value::<SinaisVitais>(v.clone()).ok());
        result.has_pixel = obj.get("has_pixel").and_then(Value::as_bool);
        result.site_tech = obj
            .get("site_tech")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        result.instagram = obj
            .get("instagram")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Some(result)
    }
}

/// Reads an integer score in `0..=max`; anything else becomes 0.
fn coerce_score(value: Option<&Value>, max: u8) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    match raw {
        Some(score) if (0..=i64::from(max)).contains(&score) => score as u8,
        _ => 0,
    }
}

fn text_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

// ============ Output Models ============

/// Outcome of processing one lead: the lead, its analysis, and how it was obtained.
///
/// Failed leads carry the baseline analysis with the error message in `justificativa`;
/// `success`/`error` are authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedLead {
    #[serde(flatten)]
    pub lead: Lead,
    #[serde(flatten)]
    pub analysis: AnalysisResult,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Stable error code (`rate_limit_exceeded`, `parse_error`, ...).
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub model_used: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalyzedLead {
    pub fn scored(lead: Lead, analysis: AnalysisResult, model_used: String) -> Self {
        Self {
            lead,
            analysis,
            success: true,
            error: None,
            error_kind: None,
            from_cache: false,
            model_used: Some(model_used),
            analyzed_at: Utc::now(),
        }
    }

    pub fn cached(lead: Lead, analysis: AnalysisResult) -> Self {
        Self {
            lead,
            analysis,
            success: true,
            error: None,
            error_kind: None,
            from_cache: true,
            model_used: None,
            analyzed_at: Utc::now(),
        }
    }

    pub fn failed(
        lead: Lead,
        kind: &str,
        message: impl Into<String>,
        model_used: Option<String>,
    ) -> Self {
        let message = message.into();
        Self {
            lead,
            analysis: AnalysisResult::baseline(message.clone()),
            success: false,
            error: Some(message),
            error_kind: Some(kind.to_string()),
            from_cache: false,
            model_used,
            analyzed_at: Utc::now(),
        }
    }
}

/// Aggregate counters for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cached: usize,
    /// Fraction of processed leads served from cache (0.0-1.0).
    pub cache_hit_rate: f64,
    /// Fraction of processed leads that succeeded (0.0-1.0).
    pub success_rate: f64,
    pub rate_limit_errors: usize,
    pub server_errors: usize,
    pub windows: usize,
    pub final_concurrency: usize,
    /// True when the caller paused the run before every lead was dispatched.
    pub cancelled: bool,
}

impl BatchStats {
    /// Recomputes the derived rates from the counters.
    pub fn finalize_rates(&mut self) {
        let processed = self.successful + self.failed;
        if processed == 0 {
            self.cache_hit_rate = 0.0;
            self.success_rate = 0.0;
        } else {
            self.cache_hit_rate = self.cached as f64 / processed as f64;
            self.success_rate = self.successful as f64 / processed as f64;
        }
    }
}

/// Batch entry point output: aggregate stats plus every outcome, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(flatten)]
    pub stats: BatchStats,
    pub results: Vec<AnalyzedLead>,
}

/// Lifecycle of an externally owned analysis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Processing,
    Completed,
    /// A run finished without a single successful lead.
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

/// Counter increments reported to the session store after each window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionDelta {
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub status: Option<SessionStatus>,
}
