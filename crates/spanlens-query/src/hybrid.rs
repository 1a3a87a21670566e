use crate::rerank::{self, RankedHit, RerankCandidate};
use crate::vector_search;
use rusqlite::Connection;
use spanlens_core::config::{RerankConfig, ResolvedEmbedding};
use spanlens_core::error::StateError;
use spanlens_state::embedding::{self, EmbeddingProvider};
use spanlens_state::spans;
use std::collections::HashMap;
use tracing::debug;

/// Embed a query the way passages were embedded: query prefix, then the
/// same normalization.
pub fn embed_query(
    provider: &mut dyn EmbeddingProvider,
    resolved: &ResolvedEmbedding,
    query: &str,
) -> Result<Vec<f32>, StateError> {
    let input = format!("{}{}", resolved.query_prefix, query);
    let mut vectors = provider.embed_batch(&[input])?;
    let Some(mut vector) = vectors.pop() else {
        return Err(StateError::embedding("provider returned no query vector"));
    };
    if resolved.normalize {
        embedding::l2_normalize(&mut vector);
    }
    Ok(vector)
}

/// Lexical and vector candidates merged by span, then reranked.
pub fn hybrid_search(
    conn: &Connection,
    provider: &mut dyn EmbeddingProvider,
    resolved: &ResolvedEmbedding,
    rerank_config: &RerankConfig,
    query: &str,
) -> Result<Vec<RankedHit>, StateError> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let lexical = spans::lexical_search(conn, query, rerank_config.lexical_limit)?;
    let query_vector = embed_query(provider, resolved, query)?;
    let vector = vector_search::search_spans(
        conn,
        provider.model_id(),
        &query_vector,
        rerank_config.vector_limit,
    )?;
    debug!(
        lexical = lexical.len(),
        vector = vector.len(),
        "hybrid candidates collected"
    );

    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, RerankCandidate> = HashMap::new();
    for hit in lexical {
        let hash = hit.record.span.span_hash.clone();
        order.push(hash.clone());
        merged.insert(
            hash,
            RerankCandidate {
                record: hit.record,
                raw_bm25: Some(hit.raw_score),
                vector_score: None,
            },
        );
    }
    for hit in vector {
        let hash = hit.record.span.span_hash.clone();
        match merged.get_mut(&hash) {
            Some(candidate) => candidate.vector_score = Some(hit.score),
            None => {
                order.push(hash.clone());
                merged.insert(
                    hash,
                    RerankCandidate {
                        record: hit.record,
                        raw_bm25: None,
                        vector_score: Some(hit.score),
                    },
                );
            }
        }
    }
    let candidates: Vec<RerankCandidate> = order
        .into_iter()
        .filter_map(|hash| merged.remove(&hash))
        .collect();

    Ok(rerank::rerank(
        query,
        candidates,
        Some(&rerank_config.weights),
        rerank_config.top_k,
    ))
}
