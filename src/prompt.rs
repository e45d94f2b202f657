//! Prompt construction for lead scoring.
//!
//! The prompt is a pure function of the lead, so two identical leads always produce the
//! same request body.

use crate::models::Lead;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;

const NOT_PROVIDED: &str = "não informado";

/// Scoring rubric and output-shape contract sent ahead of every lead.
pub const SYSTEM_PROMPT: &str = r#"Você é um especialista em qualificação de leads B2B para o mercado de clínicas de estética e saúde no Brasil.

Sua tarefa é analisar cada lead e retornar SOMENTE um JSON válido, sem texto adicional, com esta estrutura exata:

{
  "icp_score": 0,
  "icp_level": "descartar",
  "faturamento_score": 0,
  "faturamento_estimado": "<100k",
  "faturamento_nivel": "baixo",
  "brecha": "string",
  "script_video": "string",
  "texto_direct": "string",
  "justificativa": "string"
}

REGRAS ICP SCORE (0-3):
- +1 se tem site profissional
- +1 se é clínica estruturada (não consultório individual)
- +1 se há sinais de marketing/tecnologia

ICP LEVELS:
- 0 = descartar
- 1 = N3
- 2 = N2
- 3 = N1

REGRAS FATURAMENTO SCORE (0-10) - FOCO EM >500k:
- +2 site premium (design moderno, múltiplas páginas)
- +2 estrutura física robusta (múltiplos profissionais, consultórios)
- +2 equipe/secretária (indícios de organização)
- +1 marketing ativo (blog, redes sociais, ads)
- +1 serviços premium (laser, harmonização, bioestimuladores)
- +1 reviews elevadas (muitas avaliações positivas)
- +1 localização premium (bairros nobres)

CLASSIFICAÇÃO FATURAMENTO:
- 8-10 pontos → >500k (premium)
- 6-7 pontos → 300k-500k (alto)
- 3-5 pontos → 100k-300k (médio)
- 0-2 pontos → <100k (baixo)

BRECHA:
Uma única oportunidade concreta relacionada a: eficiência, governança, jornada do paciente, posicionamento, captação ou experiência.

SCRIPT DE VÍDEO:
- Máximo 12 segundos
- Linguagem natural, primeira pessoa
- Tom consultivo, sem pressão
- Gancho leve e personalizado

TEXTO DIRECT:
- Curto e humano
- Zero pressão de venda
- Menciona a brecha identificada
- Convite leve para conversa

JUSTIFICATIVA:
Breve explicação lógica da classificação baseada nos dados analisados.

IMPORTANTE: Retorne APENAS o JSON, sem markdown, sem explicações."#;

/// Per-lead message listing every field the rubric looks at.
pub fn build_user_prompt(lead: &Lead) -> String {
    let phone = lead
        .phone()
        .map(normalize_br_phone)
        .unwrap_or_else(|| NOT_PROVIDED.to_string());

    format!(
        "Analise este lead:\n\n\
         Nome: {}\n\
         Cidade: {} - {}\n\
         Website: {}\n\
         Endereço: {}\n\
         Telefone: {}\n\
         Descrição: {}\n\
         URL Maps: {}",
        lead.business_name.trim(),
        lead.city.trim(),
        lead.uf.trim().to_uppercase(),
        lead.website().unwrap_or(NOT_PROVIDED),
        lead.address.trim(),
        phone,
        lead.raw_description.trim(),
        lead.maps_url.trim(),
    )
}

/// Full prompt text: rubric followed by the lead message.
pub fn build_prompt(lead: &Lead) -> String {
    format!("{}\n\n{}", SYSTEM_PROMPT, build_user_prompt(lead))
}

/// Formats a Brazilian phone as E.164 (`+5511987654321`).
///
/// Numbers that do not parse as valid BR numbers are returned trimmed but otherwise
/// untouched; the model can still read them.
pub fn normalize_br_phone(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() < 8 {
        return raw.to_string();
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) if phonenumber::is_valid(&number) => {
            number.format().mode(Mode::E164).to_string()
        }
        Ok(_) => {
            tracing::debug!("Phone not a valid BR number, passing through: {}", raw);
            raw.to_string()
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone '{}': {:?}", raw, e);
            raw.to_string()
        }
    }
}
