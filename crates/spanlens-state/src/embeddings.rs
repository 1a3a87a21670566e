use crate::db::with_savepoint;
use rusqlite::{Connection, OptionalExtension, params};
use spanlens_core::error::StateError;

/// One stored vector for a `(span_hash, model)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub span_hash: String,
    pub model: String,
    pub vector: Vec<f32>,
    pub normalized: bool,
}

impl EmbeddingRecord {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// A raw stored vector, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub span_hash: String,
    pub dim: usize,
    pub blob: Vec<u8>,
}

/// Encode as a fixed-width little-endian f32 array.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 blob. Returns `None` for empty blobs or
/// lengths that are not a multiple of four.
pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

pub fn store_embedding(conn: &Connection, record: &EmbeddingRecord) -> Result<(), StateError> {
    if record.vector.is_empty() {
        return Err(StateError::DimensionMismatch {
            expected: 1,
            actual: 0,
        });
    }
    conn.execute(
        "INSERT INTO embeddings (span_hash, model, dim, vector, normalized, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(span_hash, model) DO UPDATE SET
             dim = excluded.dim,
             vector = excluded.vector,
             normalized = excluded.normalized,
             created_at = excluded.created_at",
        params![
            record.span_hash,
            record.model,
            record.dim() as i64,
            encode_vector(&record.vector),
            record.normalized,
            spanlens_core::time::now_iso8601(),
        ],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Store a batch of embeddings atomically.
pub fn store_embeddings(conn: &Connection, records: &[EmbeddingRecord]) -> Result<(), StateError> {
    with_savepoint(conn, "store_embeddings", |conn| {
        for record in records {
            store_embedding(conn, record)?;
        }
        Ok(())
    })
}

pub fn get_embedding(
    conn: &Connection,
    span_hash: &str,
    model: &str,
) -> Result<Option<EmbeddingRecord>, StateError> {
    let row = conn
        .query_row(
            "SELECT vector, normalized FROM embeddings WHERE span_hash = ?1 AND model = ?2",
            params![span_hash, model],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()
        .map_err(StateError::sqlite)?;
    let Some((blob, normalized)) = row else {
        return Ok(None);
    };
    let vector = decode_vector(&blob).ok_or_else(|| {
        StateError::Serialization(format!("malformed vector blob for span {span_hash}"))
    })?;
    Ok(Some(EmbeddingRecord {
        span_hash: span_hash.to_string(),
        model: model.to_string(),
        vector,
        normalized,
    }))
}

/// All raw vectors stored for a model, ordered by span hash.
pub fn load_vectors(conn: &Connection, model: &str) -> Result<Vec<StoredVector>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT span_hash, dim, vector FROM embeddings WHERE model = ?1 ORDER BY span_hash",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![model], |row| {
            Ok(StoredVector {
                span_hash: row.get(0)?,
                dim: row.get::<_, i64>(1)?.max(0) as usize,
                blob: row.get(2)?,
            })
        })
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(StateError::sqlite)
}

pub fn count_embeddings(conn: &Connection, model: &str) -> Result<u64, StateError> {
    conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE model = ?1",
        params![model],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n.max(0) as u64)
    .map_err(StateError::sqlite)
}
