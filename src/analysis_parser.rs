use crate::models::AnalysisResult;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json|JSON)?[ \t]*\r?\n?").expect("valid regex"));

/// Removes markdown code fences the model sometimes wraps its JSON in.
pub fn strip_code_fences(text: &str) -> String {
    CODE_FENCE_RE.replace_all(text, "").trim().to_string()
}

/// Parses model output into an [`AnalysisResult`].
///
/// Strict parsing is tried first. If it fails, the text is cut down to the span between
/// the first `{` and the last `}` and parsed again, which recovers from chatter around
/// the object and from trailing garbage after it. The error carries the strict parse
/// failure when both passes fail.
pub fn parse_analysis(text: &str) -> Result<AnalysisResult, String> {
    let cleaned = strip_code_fences(text);

    let strict_err = match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => return into_result(&value),
        Err(e) => e.to_string(),
    };

    let Some(repaired) = repair_candidate(&cleaned) else {
        return Err(strict_err);
    };

    match serde_json::from_str::<Value>(repaired) {
        Ok(value) => {
            tracing::debug!("Recovered analysis JSON after truncating at last '}}'");
            into_result(&value)
        }
        Err(_) => Err(strict_err),
    }
}

fn repair_candidate(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn into_result(value: &Value) -> Result<AnalysisResult, String> {
    AnalysisResult::from_model_value(value)
        .ok_or_else(|| "expected a JSON object".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FaturamentoNivel, IcpLevel};

    #[test]
    fn test_strips_json_fence() {
        let text = "```json\n{\"icp_score\": 2}\n```";
        assert_eq!(strip_code_fences(text), "{\"icp_score\": 2}");
    }

    #[test]
    fn test_parses_fenced_payload() {
        let text = "```json\n{\"icp_score\": 3, \"faturamento_score\": 8, \"brecha\": \"CRM\"}\n```";
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.icp_level, IcpLevel::N1);
        assert_eq!(result.faturamento_nivel, FaturamentoNivel::Premium);
        assert_eq!(result.faturamento_estimado, ">500k");
        assert_eq!(result.brecha, "CRM");
    }

    #[test]
    fn test_repairs_trailing_garbage() {
        let text = "Segue a análise: {\"icp_score\": 1, \"faturamento_score\": 4} espero ter ajudado {";
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.icp_level, IcpLevel::N3);
        assert_eq!(result.faturamento_nivel, FaturamentoNivel::Medio);
    }

    #[test]
    fn test_unrecoverable_text_is_error() {
        assert!(parse_analysis("não consegui analisar").is_err());
        assert!(parse_analysis("{\"icp_score\": 2, \"brecha\": \"sem fim").is_err());
    }

    #[test]
    fn test_array_payload_is_error() {
        assert!(parse_analysis("[1, 2, 3]").is_err());
    }
}
