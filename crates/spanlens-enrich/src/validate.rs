use serde::Deserialize;
use spanlens_core::constants::{MAX_SUMMARY_WORDS, MAX_USAGE_SNIPPET_LINES};
use spanlens_state::enrichments::Evidence;
use thiserror::Error;

/// Model output for one span. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentPayload {
    pub summary: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub side_effects: Vec<String>,
    pub pitfalls: Vec<String>,
    #[serde(default)]
    pub usage_snippet: Option<String>,
    pub evidence: Vec<EvidencePayload>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidencePayload {
    pub field: String,
    pub lines: Vec<i64>,
}

/// A payload that passed every check, with evidence in stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEnrichment {
    pub payload: EnrichmentPayload,
    pub evidence: Vec<Evidence>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .errors.join("; "))]
pub struct ValidationErrors {
    pub errors: Vec<String>,
}

/// Drop a surrounding markdown code fence, if the model added one.
fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Check a raw model response against the enrichment contract for a span
/// covering `span_start..=span_end`. All problems are reported together.
pub fn validate(
    response: &str,
    span_start: u32,
    span_end: u32,
) -> Result<ValidatedEnrichment, ValidationErrors> {
    let payload: EnrichmentPayload = serde_json::from_str(strip_code_fence(response))
        .map_err(|e| ValidationErrors {
            errors: vec![format!("response is not a valid enrichment object: {e}")],
        })?;

    let mut errors = Vec::new();

    let words = payload.summary.split_whitespace().count();
    if words == 0 {
        errors.push("summary is empty".to_string());
    } else if words > MAX_SUMMARY_WORDS {
        errors.push(format!(
            "summary has {words} words, limit is {MAX_SUMMARY_WORDS}"
        ));
    }

    if let Some(snippet) = &payload.usage_snippet {
        let lines = snippet.lines().count();
        if lines > MAX_USAGE_SNIPPET_LINES {
            errors.push(format!(
                "usage_snippet has {lines} lines, limit is {MAX_USAGE_SNIPPET_LINES}"
            ));
        }
    }

    let mut evidence = Vec::with_capacity(payload.evidence.len());
    for (idx, entry) in payload.evidence.iter().enumerate() {
        if entry.field.trim().is_empty() {
            errors.push(format!("evidence[{idx}] has an empty field name"));
        }
        let &[start, end] = entry.lines.as_slice() else {
            errors.push(format!(
                "evidence[{idx}].lines must have exactly two entries, got {}",
                entry.lines.len()
            ));
            continue;
        };
        let in_span = |line: i64| line >= span_start as i64 && line <= span_end as i64;
        if start > end {
            errors.push(format!("evidence[{idx}].lines [{start}, {end}] is reversed"));
        } else if !in_span(start) || !in_span(end) {
            errors.push(format!(
                "evidence[{idx}].lines [{start}, {end}] outside span [{span_start}, {span_end}]"
            ));
        } else {
            evidence.push(Evidence {
                field: entry.field.clone(),
                lines: [start as u32, end as u32],
            });
        }
    }

    if errors.is_empty() {
        Ok(ValidatedEnrichment { payload, evidence })
    } else {
        Err(ValidationErrors { errors })
    }
}
