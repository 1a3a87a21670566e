use crate::contract::EnrichmentContract;
use rusqlite::Connection;
use serde::Serialize;
use spanlens_core::error::StateError;
use spanlens_core::types::SpanRecord;
use spanlens_state::enrichments;
use spanlens_state::ignore_rules::IgnoreRules;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// One span packaged for an enrichment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanItem {
    pub span_hash: String,
    pub path: String,
    pub symbol: String,
    pub language: String,
    pub lines: [u32; 2],
    /// Span text with absolute line numbers, for evidence citation.
    pub code_snippet: String,
    pub contract: EnrichmentContract,
}

impl PlanItem {
    pub fn from_record(record: &SpanRecord, contract: &EnrichmentContract) -> Self {
        Self {
            span_hash: record.span.span_hash.clone(),
            path: record.span.file_path.clone(),
            symbol: record.span.symbol.clone(),
            language: record.span.language.clone(),
            lines: [record.span.start_line, record.span.end_line],
            code_snippet: number_lines(&record.text, record.span.start_line),
            contract: contract.clone(),
        }
    }
}

pub fn number_lines(text: &str, first_line: u32) -> String {
    text.lines()
        .enumerate()
        .map(|(offset, line)| format!("{:>5} | {line}", first_line as usize + offset))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Select pending spans (ignore rules and cooldown applied) and package them.
pub fn build_plan(
    conn: &Connection,
    repo_root: &Path,
    ignore: &IgnoreRules,
    limit: usize,
    cooldown: Duration,
    schema_version: u32,
) -> Result<Vec<PlanItem>, StateError> {
    let pending =
        enrichments::get_pending_for_enrichment(conn, repo_root, limit, cooldown, ignore)?;
    let contract = EnrichmentContract::new(schema_version);
    let plan: Vec<PlanItem> = pending
        .iter()
        .map(|record| PlanItem::from_record(record, &contract))
        .collect();
    debug!(items = plan.len(), limit, "enrichment plan built");
    Ok(plan)
}
