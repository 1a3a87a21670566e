use crate::db::with_savepoint;
use crate::ignore_rules::IgnoreRules;
use crate::spans::span_record_from_row;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use spanlens_core::error::StateError;
use spanlens_core::types::SpanRecord;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// A cited line range backing one enrichment field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub field: String,
    pub lines: [u32; 2],
}

/// Validated enrichment metadata for a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub span_hash: String,
    pub summary: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub side_effects: Vec<String>,
    pub pitfalls: Vec<String>,
    pub usage_snippet: Option<String>,
    pub evidence: Vec<Evidence>,
    pub model: String,
    pub schema_version: u32,
    pub tags: Vec<String>,
}

const ENRICHMENT_COLUMNS: &str = "n.span_hash, n.summary, n.inputs, n.outputs, n.side_effects, \
     n.pitfalls, n.usage_snippet, n.evidence, n.model, n.schema_version, n.tags";

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn enrichment_from_row(row: &Row<'_>) -> rusqlite::Result<EnrichmentRecord> {
    Ok(EnrichmentRecord {
        span_hash: row.get(0)?,
        summary: row.get(1)?,
        inputs: json_column(row, 2)?,
        outputs: json_column(row, 3)?,
        side_effects: json_column(row, 4)?,
        pitfalls: json_column(row, 5)?,
        usage_snippet: row.get(6)?,
        evidence: json_column(row, 7)?,
        model: row.get(8)?,
        schema_version: row.get(9)?,
        tags: json_column(row, 10)?,
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StateError> {
    serde_json::to_string(value).map_err(StateError::serialization)
}

/// Store (or replace) the enrichment for a span in one transaction.
///
/// Fails with `SpanNotFound` when the span is no longer indexed, so an
/// enrichment can never outlive or precede its span.
pub fn store_enrichment(conn: &Connection, record: &EnrichmentRecord) -> Result<(), StateError> {
    let inputs = to_json(&record.inputs)?;
    let outputs = to_json(&record.outputs)?;
    let side_effects = to_json(&record.side_effects)?;
    let pitfalls = to_json(&record.pitfalls)?;
    let evidence = to_json(&record.evidence)?;
    let tags = to_json(&record.tags)?;

    with_savepoint(conn, "store_enrichment", |conn| {
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM spans WHERE span_hash = ?1",
                params![record.span_hash],
                |row| row.get(0),
            )
            .map_err(StateError::sqlite)?;
        if !exists {
            return Err(StateError::span_not_found(&record.span_hash));
        }
        conn.execute(
            "INSERT OR REPLACE INTO enrichments
             (span_hash, summary, inputs, outputs, side_effects, pitfalls, usage_snippet,
              evidence, model, schema_version, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.span_hash,
                record.summary,
                inputs,
                outputs,
                side_effects,
                pitfalls,
                record.usage_snippet,
                evidence,
                record.model,
                record.schema_version,
                tags,
                spanlens_core::time::now_iso8601(),
            ],
        )
        .map_err(StateError::sqlite)?;
        Ok(())
    })
}

pub fn get_enrichment(
    conn: &Connection,
    span_hash: &str,
) -> Result<Option<EnrichmentRecord>, StateError> {
    conn.query_row(
        &format!("SELECT {ENRICHMENT_COLUMNS} FROM enrichments n WHERE n.span_hash = ?1"),
        params![span_hash],
        enrichment_from_row,
    )
    .optional()
    .map_err(StateError::sqlite)
}

/// Enrichment for the span starting at `start_line` in `path`.
pub fn enrichment_at_location(
    conn: &Connection,
    path: &str,
    start_line: u32,
) -> Result<Option<EnrichmentRecord>, StateError> {
    conn.query_row(
        &format!(
            "SELECT {ENRICHMENT_COLUMNS} FROM enrichments n
             JOIN spans s ON s.span_hash = n.span_hash
             WHERE s.file_path = ?1 AND s.start_line = ?2
             ORDER BY s.end_line, s.span_hash
             LIMIT 1"
        ),
        params![path, start_line],
        enrichment_from_row,
    )
    .optional()
    .map_err(StateError::sqlite)
}

/// First enrichment (by start line) attached to any span of `path`.
pub fn first_enrichment_for_path(
    conn: &Connection,
    path: &str,
) -> Result<Option<EnrichmentRecord>, StateError> {
    conn.query_row(
        &format!(
            "SELECT {ENRICHMENT_COLUMNS} FROM enrichments n
             JOIN spans s ON s.span_hash = n.span_hash
             WHERE s.file_path = ?1
             ORDER BY s.start_line, s.end_line, s.span_hash
             LIMIT 1"
        ),
        params![path],
        enrichment_from_row,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn count_enrichments(conn: &Connection) -> Result<u64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM enrichments", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n.max(0) as u64)
    .map_err(StateError::sqlite)
}

/// Spans without an enrichment, skipping ignored files and files modified
/// within `cooldown` (still being edited).
pub fn get_pending_for_enrichment(
    conn: &Connection,
    repo_root: &Path,
    limit: usize,
    cooldown: Duration,
    ignore: &IgnoreRules,
) -> Result<Vec<SpanRecord>, StateError> {
    get_pending_for_enrichment_at(conn, repo_root, limit, cooldown, ignore, SystemTime::now())
}

pub fn get_pending_for_enrichment_at(
    conn: &Connection,
    repo_root: &Path,
    limit: usize,
    cooldown: Duration,
    ignore: &IgnoreRules,
    now: SystemTime,
) -> Result<Vec<SpanRecord>, StateError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn
        .prepare(
            "SELECT s.span_hash, s.file_path, s.language, s.symbol, s.kind, s.start_line, s.end_line, s.text
             FROM spans s
             LEFT JOIN enrichments n ON n.span_hash = s.span_hash
             WHERE n.span_hash IS NULL
             ORDER BY s.file_path, s.start_line, s.span_hash",
        )
        .map_err(StateError::sqlite)?;
    let mut rows = stmt.query([]).map_err(StateError::sqlite)?;

    let mut pending = Vec::new();
    let mut cooling: Option<(String, bool)> = None;
    while let Some(row) = rows.next().map_err(StateError::sqlite)? {
        let record = span_record_from_row(row).map_err(StateError::sqlite)?;
        let path = &record.span.file_path;
        if ignore.is_ignored(path) {
            continue;
        }
        let in_cooldown = match &cooling {
            Some((cached, hot)) if cached == path => *hot,
            _ => {
                let hot = recently_modified(repo_root, path, cooldown, now);
                cooling = Some((path.clone(), hot));
                hot
            }
        };
        if in_cooldown {
            continue;
        }
        pending.push(record);
        if pending.len() >= limit {
            break;
        }
    }
    Ok(pending)
}

/// Missing or unreadable files count as hot so they are never enriched
/// from stale rows.
fn recently_modified(repo_root: &Path, rel_path: &str, cooldown: Duration, now: SystemTime) -> bool {
    if cooldown.is_zero() {
        return false;
    }
    let modified = match std::fs::metadata(repo_root.join(rel_path)).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(err) => {
            debug!(path = rel_path, error = %err, "enrichment cooldown: file not readable");
            return true;
        }
    };
    match now.duration_since(modified) {
        Ok(age) => age < cooldown,
        // Modified in the future relative to `now`.
        Err(_) => true,
    }
}
