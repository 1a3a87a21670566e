use crate::db::with_savepoint;
use crate::files::{self, FileRecord};
use crate::ignore_rules::IgnoreRules;
use rusqlite::{Connection, OptionalExtension, Row, params};
use spanlens_core::error::StateError;
use spanlens_core::span_hash::{HashAlgorithm, span_hash};
use spanlens_core::types::{Span, SpanRecord};
use std::collections::HashSet;

const SPAN_COLUMNS: &str =
    "s.span_hash, s.file_path, s.language, s.symbol, s.kind, s.start_line, s.end_line, s.text";

/// Outcome of replacing one file's spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub written: usize,
    pub removed: usize,
}

/// A lexical hit with a non-negative cost, 0 for the best match of the query.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub record: SpanRecord,
    pub raw_score: f64,
}

pub(crate) fn span_record_from_row(row: &Row<'_>) -> rusqlite::Result<SpanRecord> {
    Ok(SpanRecord {
        span: Span {
            span_hash: row.get(0)?,
            file_path: row.get(1)?,
            language: row.get(2)?,
            symbol: row.get(3)?,
            kind: row.get(4)?,
            start_line: row.get(5)?,
            end_line: row.get(6)?,
        },
        text: row.get(7)?,
    })
}

/// Insert or update a span. The owning file row must already exist.
pub fn put_span(conn: &Connection, span: &Span, text: &str) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO spans (span_hash, file_path, language, symbol, kind, start_line, end_line, text, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(span_hash) DO UPDATE SET
             file_path = excluded.file_path,
             language = excluded.language,
             symbol = excluded.symbol,
             kind = excluded.kind,
             start_line = excluded.start_line,
             end_line = excluded.end_line,
             text = excluded.text,
             updated_at = excluded.updated_at",
        params![
            span.span_hash,
            span.file_path,
            span.language,
            span.symbol,
            span.kind,
            span.start_line,
            span.end_line,
            text,
            spanlens_core::time::now_iso8601(),
        ],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Replace the span set of a single file in one transaction.
///
/// Spans whose hash survives keep their embeddings and enrichments; spans
/// that disappeared from the file are removed together with their
/// derived rows.
pub fn replace_file_spans(
    conn: &Connection,
    file: &FileRecord,
    records: &[SpanRecord],
) -> Result<ReplaceStats, StateError> {
    with_savepoint(conn, "replace_file_spans", |conn| {
        files::upsert_file(conn, file)?;

        let mut keep = HashSet::with_capacity(records.len());
        for record in records {
            put_span(conn, &record.span, &record.text)?;
            keep.insert(record.span.span_hash.as_str());
        }

        let existing = span_hashes_for_file(conn, &file.path)?;
        let mut removed = 0;
        for hash in existing {
            if !keep.contains(hash.as_str()) {
                removed += conn
                    .execute("DELETE FROM spans WHERE span_hash = ?1", params![hash])
                    .map_err(StateError::sqlite)?;
            }
        }

        Ok(ReplaceStats {
            written: records.len(),
            removed,
        })
    })
}

fn span_hashes_for_file(conn: &Connection, path: &str) -> Result<Vec<String>, StateError> {
    let mut stmt = conn
        .prepare("SELECT span_hash FROM spans WHERE file_path = ?1")
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![path], |row| row.get(0))
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<String>, _>>()
        .map_err(StateError::sqlite)
}

pub fn get_span(conn: &Connection, span_hash: &str) -> Result<Option<SpanRecord>, StateError> {
    conn.query_row(
        &format!("SELECT {SPAN_COLUMNS} FROM spans s WHERE s.span_hash = ?1"),
        params![span_hash],
        span_record_from_row,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn spans_for_file(conn: &Connection, path: &str) -> Result<Vec<SpanRecord>, StateError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans s WHERE s.file_path = ?1 ORDER BY s.start_line, s.end_line"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![path], span_record_from_row)
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(StateError::sqlite)
}

pub fn count_spans(conn: &Connection) -> Result<u64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM spans", [], |row| row.get::<_, i64>(0))
        .map(|n| n.max(0) as u64)
        .map_err(StateError::sqlite)
}

/// Look up the stored span for a location by recomputing its hash.
pub fn find_for_span(
    conn: &Connection,
    algorithm: HashAlgorithm,
    file_path: &str,
    start_line: u32,
    end_line: u32,
    text: Option<&str>,
) -> Result<Option<SpanRecord>, StateError> {
    let hash = span_hash(algorithm, file_path, start_line, end_line, text);
    get_span(conn, &hash)
}

/// Spans with no embedding for `model`, skipping ignored files.
pub fn get_pending_for_embedding(
    conn: &Connection,
    model: &str,
    limit: usize,
    ignore: &IgnoreRules,
) -> Result<Vec<SpanRecord>, StateError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans s
             LEFT JOIN embeddings e ON e.span_hash = s.span_hash AND e.model = ?1
             WHERE e.span_hash IS NULL
             ORDER BY s.file_path, s.start_line, s.span_hash"
        ))
        .map_err(StateError::sqlite)?;
    let mut rows = stmt.query(params![model]).map_err(StateError::sqlite)?;

    let mut pending = Vec::new();
    while let Some(row) = rows.next().map_err(StateError::sqlite)? {
        let record = span_record_from_row(row).map_err(StateError::sqlite)?;
        if ignore.is_ignored(&record.span.file_path) {
            continue;
        }
        pending.push(record);
        if pending.len() >= limit {
            break;
        }
    }
    Ok(pending)
}

/// Lowercased alphanumeric tokens longer than one character.
pub fn query_tokens(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .map(|token| token.to_lowercase())
        .collect()
}

fn fts_match_expression(query: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = query_tokens(query)
        .into_iter()
        .filter(|token| seen.insert(token.clone()))
        .map(|token| format!("\"{token}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Full-text search over span path, symbol and text.
///
/// FTS5 `bm25()` is negative with the best match most negative; scores are
/// shifted so the best hit is 0 and worse hits are larger.
pub fn lexical_search(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<LexicalHit>, StateError> {
    let Some(expression) = fts_match_expression(query) else {
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SPAN_COLUMNS}, bm25(spans_fts) AS score
             FROM spans_fts
             JOIN spans s ON s.span_hash = spans_fts.span_hash
             WHERE spans_fts MATCH ?1
             ORDER BY score, s.span_hash
             LIMIT ?2"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![expression, limit as i64], |row| {
            Ok((span_record_from_row(row)?, row.get::<_, f64>(8)?))
        })
        .map_err(StateError::sqlite)?;
    let scored = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::sqlite)?;

    let best = scored
        .iter()
        .map(|(_, score)| *score)
        .filter(|score| score.is_finite())
        .fold(f64::INFINITY, f64::min);
    Ok(scored
        .into_iter()
        .map(|(record, score)| LexicalHit {
            record,
            raw_score: if score.is_finite() && best.is_finite() {
                (score - best).max(0.0)
            } else {
                f64::MAX
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, schema};
    use tempfile::tempdir;

    fn setup_conn() -> (tempfile::TempDir, Connection) {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("spans.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        (dir, conn)
    }

    fn file(path: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            language: "python".to_string(),
            content_hash: "h".to_string(),
            size_bytes: 10,
            mtime_ns: None,
            indexed_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn record(path: &str, symbol: &str, start: u32, end: u32, text: &str) -> SpanRecord {
        SpanRecord {
            span: Span {
                file_path: path.to_string(),
                language: "python".to_string(),
                symbol: symbol.to_string(),
                kind: "function".to_string(),
                start_line: start,
                end_line: end,
                span_hash: span_hash(HashAlgorithm::Sha1, path, start, end, Some(text)),
            },
            text: text.to_string(),
        }
    }

    #[test]
    fn put_span_requires_owning_file() {
        let (_dir, conn) = setup_conn();
        let rec = record("a.py", "f", 1, 2, "def f(): pass");
        assert!(put_span(&conn, &rec.span, &rec.text).is_err());

        files::upsert_file(&conn, &file("a.py")).unwrap();
        put_span(&conn, &rec.span, &rec.text).unwrap();
        put_span(&conn, &rec.span, &rec.text).unwrap();
        assert_eq!(count_spans(&conn).unwrap(), 1);
    }

    #[test]
    fn replace_file_spans_removes_vanished_spans() {
        let (_dir, conn) = setup_conn();
        let a = record("a.py", "a", 1, 3, "def a(): return 1");
        let b = record("a.py", "b", 5, 7, "def b(): return 2");
        let stats = replace_file_spans(&conn, &file("a.py"), &[a.clone(), b.clone()]).unwrap();
        assert_eq!(stats, ReplaceStats { written: 2, removed: 0 });

        let stats = replace_file_spans(&conn, &file("a.py"), &[a.clone()]).unwrap();
        assert_eq!(stats.removed, 1);
        let remaining = spans_for_file(&conn, "a.py").unwrap();
        assert_eq!(remaining, vec![a]);
        assert!(get_span(&conn, &b.span.span_hash).unwrap().is_none());
    }

    #[test]
    fn delete_file_cascades_to_spans_and_fts() {
        let (_dir, conn) = setup_conn();
        let a = record("a.py", "parse_config", 1, 3, "def parse_config(): pass");
        replace_file_spans(&conn, &file("a.py"), &[a]).unwrap();
        assert_eq!(lexical_search(&conn, "parse_config", 10).unwrap().len(), 1);

        assert_eq!(files::delete_file(&conn, "a.py").unwrap(), 1);
        assert_eq!(count_spans(&conn).unwrap(), 0);
        assert!(lexical_search(&conn, "parse_config", 10).unwrap().is_empty());
    }

    #[test]
    fn find_for_span_recomputes_hash() {
        let (_dir, conn) = setup_conn();
        let a = record("src/A.py", "a", 1, 3, "def a():\n    return 1");
        replace_file_spans(&conn, &file("src/A.py"), &[a.clone()]).unwrap();

        let found = find_for_span(
            &conn,
            HashAlgorithm::Sha1,
            "src/a.py",
            1,
            3,
            Some("def a(): return 1"),
        )
        .unwrap();
        assert_eq!(found, Some(a));
        assert!(
            find_for_span(&conn, HashAlgorithm::Sha1, "src/a.py", 1, 3, None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn pending_for_embedding_skips_ignored_and_respects_limit() {
        let (dir, conn) = setup_conn();
        replace_file_spans(
            &conn,
            &file("src/a.py"),
            &[
                record("src/a.py", "a", 1, 2, "def a(): pass"),
                record("src/a.py", "b", 3, 4, "def b(): pass"),
            ],
        )
        .unwrap();
        replace_file_spans(
            &conn,
            &file("vendor/v.py"),
            &[record("vendor/v.py", "v", 1, 2, "def v(): pass")],
        )
        .unwrap();
        let ignore = IgnoreRules::from_patterns(dir.path(), &["vendor/"]).unwrap();

        let pending = get_pending_for_embedding(&conn, "m", 10, &ignore).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|r| r.span.file_path == "src/a.py"));

        let limited = get_pending_for_embedding(&conn, "m", 1, &ignore).unwrap();
        assert_eq!(limited.len(), 1);
        assert!(get_pending_for_embedding(&conn, "m", 0, &ignore).unwrap().is_empty());
    }

    #[test]
    fn lexical_search_shifts_best_hit_to_zero() {
        let (_dir, conn) = setup_conn();
        replace_file_spans(
            &conn,
            &file("a.py"),
            &[
                record("a.py", "load_config", 1, 2, "def load_config(path): read config file config"),
                record("a.py", "other", 3, 4, "def other(): config"),
                record("a.py", "unrelated", 5, 6, "def unrelated(): pass"),
            ],
        )
        .unwrap();

        let hits = lexical_search(&conn, "config", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].raw_score, 0.0);
        assert!(hits[1].raw_score >= 0.0);
        assert!(lexical_search(&conn, "?!", 10).unwrap().is_empty());
    }

    #[test]
    fn query_tokens_drop_single_chars() {
        assert_eq!(
            query_tokens("Parse a JSON-file, x"),
            vec!["parse".to_string(), "json".to_string(), "file".to_string()]
        );
    }
}
