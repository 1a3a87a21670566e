use rusqlite::Connection;
use spanlens_core::error::StateError;
use spanlens_core::types::SpanRecord;
use spanlens_state::embeddings::{self, StoredVector, decode_vector};
use spanlens_state::spans;
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub span_hash: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub record: SpanRecord,
    pub score: f64,
}

fn norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|v| {
            let value = *v as f64;
            value * value
        })
        .sum::<f64>()
        .sqrt()
}

/// Cosine similarity, or `None` when either side has no usable norm or the
/// dimensions differ.
pub fn cosine(query: &[f32], candidate: &[f32]) -> Option<f64> {
    if query.is_empty() || query.len() != candidate.len() {
        return None;
    }
    let (qn, cn) = (norm(query), norm(candidate));
    if qn == 0.0 || cn == 0.0 || !qn.is_finite() || !cn.is_finite() {
        return None;
    }
    let dot: f64 = query
        .iter()
        .zip(candidate)
        .map(|(a, b)| *a as f64 * *b as f64)
        .sum();
    let score = dot / (qn * cn);
    score.is_finite().then_some(score)
}

/// Rank stored vectors by cosine similarity to `query`.
///
/// Malformed blobs, dimension mismatches and zero-norm vectors are dropped
/// rather than reported; the result never contains a NaN score.
pub fn search(query: &[f32], candidates: &[StoredVector], limit: usize) -> Vec<SearchResult> {
    if limit == 0 {
        return Vec::new();
    }
    let mut scored: Vec<SearchResult> = candidates
        .iter()
        .filter_map(|candidate| {
            let vector = decode_vector(&candidate.blob)?;
            if vector.len() != candidate.dim {
                debug!(span_hash = %candidate.span_hash, "skipping vector with inconsistent dim");
                return None;
            }
            let score = cosine(query, &vector)?;
            Some(SearchResult {
                span_hash: candidate.span_hash.clone(),
                score,
            })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.span_hash.cmp(&b.span_hash))
    });
    scored.truncate(limit);
    scored
}

/// Vector search over every span embedded with `model`.
pub fn search_spans(
    conn: &Connection,
    model: &str,
    query: &[f32],
    limit: usize,
) -> Result<Vec<VectorHit>, StateError> {
    let candidates = embeddings::load_vectors(conn, model)?;
    let ranked = search(query, &candidates, limit);
    let mut hits = Vec::with_capacity(ranked.len());
    for result in ranked {
        // Spans removed between the two reads are skipped.
        if let Some(record) = spans::get_span(conn, &result.span_hash)? {
            hits.push(VectorHit {
                record,
                score: result.score,
            });
        }
    }
    Ok(hits)
}
