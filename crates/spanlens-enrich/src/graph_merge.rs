//! Attach stored enrichments to the entities of an externally built code
//! graph.
//!
//! Each entity that can say where it lives in the repo is matched against
//! the enrichment store through a fixed chain of lookups, most precise
//! first. Matching fields are copied into the entity's metadata without
//! overwriting anything the entity already carries.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use spanlens_core::config::Config;
use spanlens_core::error::StateError;
use spanlens_core::span_hash::HashAlgorithm;
use spanlens_state::enrichments::{self, EnrichmentRecord};
use spanlens_state::{db, spans};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Source position of a graph entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location<'a> {
    pub path: &'a str,
    pub start_line: u32,
    pub end_line: u32,
}

/// Entities that can be resolved to a file and line range.
pub trait Locatable {
    fn location(&self) -> Option<Location<'_>>;

    /// Source text of the entity, when the graph captured it.
    fn source_text(&self) -> Option<&str> {
        None
    }
}

/// Entities that carry a free-form metadata map.
pub trait Annotated {
    fn metadata_mut(&mut self) -> &mut Map<String, Value>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Locatable for GraphEntity {
    fn location(&self) -> Option<Location<'_>> {
        Some(Location {
            path: self.path.as_deref()?,
            start_line: self.start_line?,
            end_line: self.end_line?,
        })
    }

    fn source_text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl Annotated for GraphEntity {
    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeGraph {
    #[serde(default)]
    pub entities: Vec<GraphEntity>,
}

/// Which lookup produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    SpanHash,
    SpanHashText,
    Location,
    Path,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpanHash => "span_hash",
            Self::SpanHashText => "span_hash_text",
            Self::Location => "location",
            Self::Path => "path",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// False when the merge was skipped entirely.
    pub performed: bool,
    pub source_db: Option<PathBuf>,
    pub entities: usize,
    pub located: usize,
    pub enriched: usize,
    pub lookup_errors: usize,
    pub by_strategy: BTreeMap<String, usize>,
}

/// Merge enrichments into `graph` using the configured enrichment source.
///
/// A no-op when the graph merge is disabled or the source database does not
/// exist. Lookup failures for individual entities are logged and counted.
pub fn merge(
    graph: &mut CodeGraph,
    repo_root: &Path,
    config: &Config,
) -> Result<MergeReport, StateError> {
    let mut report = MergeReport {
        entities: graph.entities.len(),
        ..MergeReport::default()
    };
    if !config.graph.enabled {
        debug!("graph enrichment merge disabled");
        return Ok(report);
    }
    let source_db = config.graph_source_db(repo_root);
    if !source_db.is_file() {
        info!(source_db = %source_db.display(), "no enrichment source; graph left unchanged");
        return Ok(report);
    }

    let conn = db::open_connection(&source_db)?;
    let merger = GraphMerger {
        conn: &conn,
        repo_root,
        algorithm: config.index.hash_algorithm_typed(),
        source_db: &source_db,
    };
    merger.merge_entities(&mut graph.entities, &mut report);
    report.performed = true;
    report.source_db = Some(source_db.clone());
    info!(
        entities = report.entities,
        enriched = report.enriched,
        lookup_errors = report.lookup_errors,
        "graph enrichment merge finished"
    );
    Ok(report)
}

/// Lookup state for one merge over an open enrichment store.
pub struct GraphMerger<'a> {
    pub conn: &'a Connection,
    pub repo_root: &'a Path,
    pub algorithm: HashAlgorithm,
    pub source_db: &'a Path,
}

impl GraphMerger<'_> {
    pub fn merge_entities<E: Locatable + Annotated>(&self, entities: &mut [E], report: &mut MergeReport) {
        for entity in entities.iter_mut() {
            let Some(location) = entity.location() else {
                continue;
            };
            let Some(rel_path) = normalize_entity_path(self.repo_root, location.path) else {
                debug!(path = location.path, "entity path outside repo; skipped");
                continue;
            };
            if location.start_line == 0 || location.end_line < location.start_line {
                continue;
            }
            report.located += 1;

            let text = entity.source_text().map(str::to_string);
            let found = match self.lookup(&rel_path, location.start_line, location.end_line, text.as_deref()) {
                Ok(found) => found,
                Err(err) => {
                    warn!(path = %rel_path, error = %err, "enrichment lookup failed; entity skipped");
                    report.lookup_errors += 1;
                    continue;
                }
            };
            let Some((strategy, record)) = found else {
                continue;
            };
            apply_enrichment(entity.metadata_mut(), &record, strategy, self.source_db);
            report.enriched += 1;
            *report
                .by_strategy
                .entry(strategy.as_str().to_string())
                .or_default() += 1;
        }
    }

    /// Walk the fallback chain for one location.
    pub fn lookup(
        &self,
        rel_path: &str,
        start_line: u32,
        end_line: u32,
        text: Option<&str>,
    ) -> Result<Option<(MatchStrategy, EnrichmentRecord)>, StateError> {
        if let Some(record) = self.by_span(rel_path, start_line, end_line, None)? {
            return Ok(Some((MatchStrategy::SpanHash, record)));
        }

        let text = match text {
            Some(text) => Some(text.to_string()),
            None => load_span_text(self.repo_root, rel_path, start_line, end_line),
        };
        if let Some(text) = text.as_deref() {
            if let Some(record) = self.by_span(rel_path, start_line, end_line, Some(text))? {
                return Ok(Some((MatchStrategy::SpanHashText, record)));
            }
        }

        if let Some(record) = enrichments::enrichment_at_location(self.conn, rel_path, start_line)? {
            return Ok(Some((MatchStrategy::Location, record)));
        }
        Ok(enrichments::first_enrichment_for_path(self.conn, rel_path)?
            .map(|record| (MatchStrategy::Path, record)))
    }

    fn by_span(
        &self,
        rel_path: &str,
        start_line: u32,
        end_line: u32,
        text: Option<&str>,
    ) -> Result<Option<EnrichmentRecord>, StateError> {
        match spans::find_for_span(self.conn, self.algorithm, rel_path, start_line, end_line, text)? {
            Some(span) => enrichments::get_enrichment(self.conn, &span.span.span_hash),
            None => Ok(None),
        }
    }
}

/// Repo-relative POSIX form of an entity path, or `None` when the path
/// escapes the repo.
pub fn normalize_entity_path(repo_root: &Path, raw: &str) -> Option<String> {
    let posix = raw.replace('\\', "/");
    let path = Path::new(&posix);
    let relative = if path.is_absolute() {
        path.strip_prefix(repo_root).ok()?
    } else {
        path
    };
    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn load_span_text(repo_root: &Path, rel_path: &str, start_line: u32, end_line: u32) -> Option<String> {
    let content = std::fs::read_to_string(repo_root.join(rel_path)).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let start = (start_line.saturating_sub(1) as usize).min(lines.len());
    let end = (end_line as usize).min(lines.len());
    if start >= end {
        return None;
    }
    Some(lines[start..end].join("\n"))
}

fn set_if_absent(metadata: &mut Map<String, Value>, key: &str, value: Value) {
    let absent = metadata.get(key).is_none_or(Value::is_null);
    if absent {
        metadata.insert(key.to_string(), value);
    }
}

fn apply_enrichment(
    metadata: &mut Map<String, Value>,
    record: &EnrichmentRecord,
    strategy: MatchStrategy,
    source_db: &Path,
) {
    set_if_absent(metadata, "summary", json!(record.summary));
    set_if_absent(metadata, "inputs", json!(record.inputs));
    set_if_absent(metadata, "outputs", json!(record.outputs));
    set_if_absent(metadata, "side_effects", json!(record.side_effects));
    set_if_absent(metadata, "pitfalls", json!(record.pitfalls));
    if let Some(snippet) = &record.usage_snippet {
        set_if_absent(metadata, "usage_snippet", json!(snippet));
    }
    set_if_absent(metadata, "evidence", json!(record.evidence));
    if !record.tags.is_empty() {
        set_if_absent(metadata, "tags", json!(record.tags));
    }
    set_if_absent(metadata, "enrichment_model", json!(record.model));
    set_if_absent(metadata, "enrichment_schema_version", json!(record.schema_version));
    set_if_absent(metadata, "enrichment_strategy", json!(strategy.as_str()));
    set_if_absent(metadata, "enrichment_source", json!(source_db.display().to_string()));
    set_if_absent(metadata, "enrichment_span_hash", json!(record.span_hash));
}
