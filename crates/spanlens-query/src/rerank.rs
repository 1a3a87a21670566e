use serde::Serialize;
use spanlens_core::constants::RERANK_TEXT_CHARS;
use spanlens_core::languages;
use spanlens_core::types::{RerankWeights, SpanRecord};
use spanlens_state::spans::query_tokens;
use std::cmp::Ordering;
use std::collections::HashSet;

/// A candidate entering the reranker. `raw_bm25` is absent for candidates
/// that only came from vector search.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub record: SpanRecord,
    pub raw_bm25: Option<f64>,
    pub vector_score: Option<f64>,
}

/// Per-candidate signal values, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Signals {
    pub bm25: f64,
    pub uni: f64,
    pub bi: f64,
    pub path: f64,
    pub lit: f64,
    pub ext: f64,
}

impl Signals {
    fn fuse(&self, weights: &RerankWeights) -> f64 {
        self.bm25 * weights.bm25
            + self.uni * weights.uni
            + self.bi * weights.bi
            + self.path * weights.path
            + self.lit * weights.lit
            + self.ext * weights.ext
    }
}

#[derive(Debug, Clone)]
pub struct RankedHit {
    pub record: SpanRecord,
    pub score: f64,
    pub signals: Signals,
    pub vector_score: Option<f64>,
}

/// BM25-style cost mapped into `(0, 1]`; lower raw cost scores higher.
pub fn bm25_signal(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    1.0 / (1.0 + raw.max(0.0))
}

pub fn ext_boost(path: &str) -> f64 {
    let lower = path.to_lowercase();
    if lower.contains("test") || lower.contains("/tests/") {
        0.2
    } else if languages::is_code_path(&lower) {
        1.0
    } else if languages::is_doc_path(&lower) {
        0.3
    } else {
        0.7
    }
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

fn bigrams(tokens: &[String]) -> HashSet<(String, String)> {
    tokens
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn capped(text: &str) -> &str {
    match text.char_indices().nth(RERANK_TEXT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Compute the six signals for one candidate against pre-tokenized query terms.
pub fn compute_signals(query_terms: &[String], candidate: &RerankCandidate) -> Signals {
    let text = capped(&candidate.record.text);
    let text_terms = query_tokens(text);

    let query_set: HashSet<String> = query_terms.iter().cloned().collect();
    let text_set: HashSet<String> = text_terms.iter().cloned().collect();
    let path_set: HashSet<String> = query_tokens(&candidate.record.span.file_path)
        .into_iter()
        .collect();

    // Literal presence looks at the whole span; only token overlap is capped.
    let phrase = query_terms.join(" ");
    let lit = if !phrase.is_empty() && candidate.record.text.to_lowercase().contains(&phrase) {
        1.0
    } else {
        0.0
    };

    Signals {
        bm25: candidate.raw_bm25.map(bm25_signal).unwrap_or(0.0),
        uni: jaccard(&query_set, &text_set),
        bi: jaccard(&bigrams(query_terms), &bigrams(&text_terms)),
        path: jaccard(&query_set, &path_set),
        lit,
        ext: ext_boost(&candidate.record.span.file_path),
    }
}

/// Weights actually applied: supplied weights normalized to sum to 1, or the
/// defaults when none are given or they sum to nothing.
pub fn effective_weights(weights: Option<&RerankWeights>) -> RerankWeights {
    weights.copied().unwrap_or_default().normalized()
}

/// Fuse the signals with the effective weights, sort descending and keep `top_k`.
pub fn rerank(
    query: &str,
    candidates: Vec<RerankCandidate>,
    weights: Option<&RerankWeights>,
    top_k: usize,
) -> Vec<RankedHit> {
    let weights = effective_weights(weights);
    let query_terms = query_tokens(query);

    let mut ranked: Vec<RankedHit> = candidates
        .into_iter()
        .map(|candidate| {
            let signals = compute_signals(&query_terms, &candidate);
            RankedHit {
                score: signals.fuse(&weights),
                signals,
                vector_score: candidate.vector_score,
                record: candidate.record,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.record.span.span_hash.cmp(&b.record.span.span_hash))
    });
    ranked.truncate(top_k);
    ranked
}
