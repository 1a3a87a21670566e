use serde::Serialize;
use spanlens_core::constants::{MAX_SUMMARY_WORDS, MAX_USAGE_SNIPPET_LINES};

pub const REQUIRED_FIELDS: &[&str] = &[
    "summary",
    "inputs",
    "outputs",
    "side_effects",
    "pitfalls",
    "evidence",
];

pub const OPTIONAL_FIELDS: &[&str] = &["usage_snippet", "tags"];

/// Output requirements handed to the model with every plan item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichmentContract {
    pub schema_version: u32,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    pub max_summary_words: usize,
    pub max_usage_snippet_lines: usize,
    pub instructions: String,
}

impl EnrichmentContract {
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            required_fields: REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect(),
            optional_fields: OPTIONAL_FIELDS.iter().map(|f| f.to_string()).collect(),
            max_summary_words: MAX_SUMMARY_WORDS,
            max_usage_snippet_lines: MAX_USAGE_SNIPPET_LINES,
            instructions: format!(
                "Respond with a single JSON object and nothing else. Include exactly the \
                 required fields ({required}) and optionally ({optional}); unknown fields are \
                 rejected. `summary` must be at most {MAX_SUMMARY_WORDS} words. \
                 `usage_snippet` may be null and must be at most {MAX_USAGE_SNIPPET_LINES} \
                 lines. Every claim must be backed by an `evidence` entry of the form \
                 {{\"field\": <field name>, \"lines\": [start, end]}} citing exact line \
                 numbers from the numbered snippet; cited lines must lie inside the span.",
                required = REQUIRED_FIELDS.join(", "),
                optional = OPTIONAL_FIELDS.join(", "),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_lists_fields_and_caps() {
        let contract = EnrichmentContract::new(1);
        assert_eq!(contract.required_fields.len(), REQUIRED_FIELDS.len());
        assert!(contract.instructions.contains("120 words"));
        assert!(contract.instructions.contains("12 lines"));
        assert!(contract.instructions.contains("\"lines\": [start, end]"));
    }
}
