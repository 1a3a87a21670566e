use spanlens_core::config::ResolvedEmbedding;
use spanlens_core::error::StateError;
use tracing::debug;

pub trait EmbeddingProvider {
    fn model_id(&self) -> &str;
    fn model_version(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError>;
}

/// Local provider that hashes tokens into a fixed number of signed buckets.
///
/// Texts sharing vocabulary land close together, which is enough for
/// hybrid ranking without a neural runtime. Inputs without any token fall
/// back to a seeded pseudo-random unit vector.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    model: String,
    version: String,
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model: model.into(),
            version: "hash-v1".to_string(),
            dimensions,
        }
    }

    pub fn embed_one(&self, input: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }
        let mut seen_token = false;
        for token in tokens(input) {
            seen_token = true;
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes(first_eight(bytes)) as usize % self.dimensions;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        if !seen_token {
            return deterministic_embedding(input, self.dimensions);
        }
        vector
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&mut self, inputs: &[String]) -> Result<Vec<Vec<f32>>, StateError> {
        if self.dimensions == 0 {
            return Err(StateError::embedding("embedding dimensions must be positive"));
        }
        Ok(inputs.iter().map(|input| self.embed_one(input)).collect())
    }
}

pub fn build_embedding_provider(
    resolved: &ResolvedEmbedding,
) -> Result<Box<dyn EmbeddingProvider + Send>, StateError> {
    if resolved.dimensions == 0 {
        return Err(StateError::embedding(format!(
            "model {} resolved to zero dimensions",
            resolved.model
        )));
    }
    debug!(
        preset = %resolved.preset,
        model = %resolved.model,
        dimensions = resolved.dimensions,
        device = %resolved.device,
        "embedding provider ready"
    );
    Ok(Box::new(HashEmbeddingProvider::new(
        resolved.model.clone(),
        resolved.dimensions,
    )))
}

fn tokens(input: &str) -> impl Iterator<Item = String> + '_ {
    input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn first_eight(bytes: &[u8; 32]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[0..8]);
    out
}

fn deterministic_embedding(input: &str, dimensions: usize) -> Vec<f32> {
    let seed_hash = blake3::hash(input.as_bytes());
    let mut state = u64::from_le_bytes(first_eight(seed_hash.as_bytes()));
    if state == 0 {
        // xorshift generators must not use an all-zero state.
        state = 0x9e37_79b9_7f4a_7c15;
    }

    let mut vector = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let n = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
        let scaled = (n as f64 / u64::MAX as f64) * 2.0 - 1.0;
        vector.push(scaled as f32);
    }
    vector
}

/// Scale to unit length. Zero vectors come back unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector
        .iter()
        .map(|v| {
            let value = *v as f64;
            value * value
        })
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return;
    }
    for value in vector.iter_mut() {
        *value = (*value as f64 / norm) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanlens_core::config::Config;

    fn cosine(a: &[f32], b: &[f32]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
        let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        dot / (na * nb)
    }

    #[test]
    fn provider_follows_resolved_preset() {
        let resolved = Config::default().embedding.resolved();
        let provider = build_embedding_provider(&resolved).unwrap();
        assert_eq!(provider.model_id(), "intfloat/e5-small-v2");
        assert_eq!(provider.dimensions(), 384);
    }

    #[test]
    fn embeddings_are_deterministic_and_sized() {
        let mut provider = HashEmbeddingProvider::new("m", 64);
        let inputs = vec!["parse config file".to_string(), "!!!".to_string()];
        let first = provider.embed_batch(&inputs).unwrap();
        let second = provider.embed_batch(&inputs).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|v| v.len() == 64));
        assert!(first[1].iter().any(|v| *v != 0.0));
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let provider = HashEmbeddingProvider::new("m", 256);
        let query = provider.embed_one("load config from toml");
        let close = provider.embed_one("fn load_config(path) reads toml config");
        let far = provider.embed_one("render button widget color");
        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut vector = vec![3.0, 4.0];
        l2_normalize(&mut vector);
        assert!((vector[0] - 0.6).abs() < 1e-6);
        assert!((vector[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
