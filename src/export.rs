use crate::models::AnalyzedLead;

/// Column order of the exported sheet.
pub const CSV_COLUMNS: [&str; 18] = [
    "business_name",
    "city",
    "uf",
    "website",
    "phone",
    "address",
    "icp_score",
    "icp_level",
    "faturamento_score",
    "faturamento_estimado",
    "faturamento_nivel",
    "brecha",
    "script_video",
    "texto_direct",
    "justificativa",
    "success",
    "error",
    "from_cache",
];

/// Quotes a field if it contains `"`, `,` or a line break, doubling inner quotes.
pub fn escape_csv(value: &str) -> String {
    if value.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn row(item: &AnalyzedLead) -> Vec<String> {
    let lead = &item.lead;
    let analysis = &item.analysis;
    vec![
        lead.business_name.clone(),
        lead.city.clone(),
        lead.uf.clone(),
        lead.website().unwrap_or_default().to_string(),
        lead.phone().unwrap_or_default().to_string(),
        lead.address.clone(),
        analysis.icp_score.to_string(),
        analysis.icp_level.as_str().to_string(),
        analysis.faturamento_score.to_string(),
        analysis.faturamento_estimado.clone(),
        analysis.faturamento_nivel.as_str().to_string(),
        analysis.brecha.clone(),
        analysis.script_video.clone(),
        analysis.texto_direct.clone(),
        analysis.justificativa.clone(),
        item.success.to_string(),
        item.error.clone().unwrap_or_default(),
        item.from_cache.to_string(),
    ]
}

/// Renders outcomes as CSV with a header line; lines end with `\n`.
pub fn to_csv(results: &[AnalyzedLead]) -> String {
    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');

    for item in results {
        let line: Vec<String> = row(item).iter().map(|v| escape_csv(v)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Lead;

    #[test]
    fn test_escape_rules() {
        assert_eq!(escape_csv(r#"Test "quoted" value"#), r#""Test ""quoted"" value""#);
        assert_eq!(escape_csv("Test, with comma"), "\"Test, with comma\"");
        assert_eq!(escape_csv("Test\nwith newline"), "\"Test\nwith newline\"");
        assert_eq!(escape_csv("Simple value"), "Simple value");
    }

    #[test]
    fn test_header_and_row_shape() {
        let lead = Lead {
            business_name: "Clínica Sorriso, Centro".into(),
            city: "Niterói".into(),
            uf: "RJ".into(),
            ..Default::default()
        };
        let item = AnalyzedLead::failed(lead, "unauthorized", "API key inválida", None);

        let csv = to_csv(&[item]);
        let mut lines = csv.lines();

        assert_eq!(lines.next().unwrap(), CSV_COLUMNS.join(","));
        let data = lines.next().unwrap();
        assert!(data.starts_with("\"Clínica Sorriso, Centro\",Niterói,RJ,,,"));
        assert!(data.ends_with(",false,API key inválida,false"));
        assert!(data.contains(",0,descartar,0,<100k,baixo,"));
    }

    #[test]
    fn test_empty_results_yield_header_only() {
        assert_eq!(to_csv(&[]).lines().count(), 1);
    }
}
