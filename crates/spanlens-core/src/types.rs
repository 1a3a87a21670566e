use serde::{Deserialize, Serialize};

/// A symbol-level slice of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub file_path: String,
    pub language: String,
    pub symbol: String,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub span_hash: String,
}

/// A stored span together with the source text it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    #[serde(flatten)]
    pub span: Span,
    pub text: String,
}

/// Lifecycle state of the on-disk index as recorded after each indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Fresh,
    Stale,
    Rebuilding,
    Error,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Rebuilding => "rebuilding",
            Self::Error => "error",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fresh" => Some(Self::Fresh),
            "stale" => Some(Self::Stale),
            "rebuilding" => Some(Self::Rebuilding),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse trust signal handed to readers before they use retrieval results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreshnessState {
    Fresh,
    Stale,
    Unknown,
}

impl FreshnessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "FRESH",
            Self::Stale => "STALE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for FreshnessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weights for the six reranker signals.
/// Missing keys take their default weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    pub bm25: f64,
    pub uni: f64,
    pub bi: f64,
    pub path: f64,
    pub lit: f64,
    pub ext: f64,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            bm25: 0.55,
            uni: 0.18,
            bi: 0.12,
            path: 0.07,
            lit: 0.02,
            ext: 0.06,
        }
    }
}

impl RerankWeights {
    pub fn sum(&self) -> f64 {
        self.bm25 + self.uni + self.bi + self.path + self.lit + self.ext
    }

    /// Clamp negatives (and non-finite values) to zero and scale so the
    /// weights total 1. A non-positive total falls back to the defaults.
    pub fn normalized(&self) -> Self {
        let clamp = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        let clamped = Self {
            bm25: clamp(self.bm25),
            uni: clamp(self.uni),
            bi: clamp(self.bi),
            path: clamp(self.path),
            lit: clamp(self.lit),
            ext: clamp(self.ext),
        };
        let total = clamped.sum();
        if total <= 0.0 || !total.is_finite() {
            return Self::default().normalized();
        }
        Self {
            bm25: clamped.bm25 / total,
            uni: clamped.uni / total,
            bi: clamped.bi / total,
            path: clamped.path / total,
            lit: clamped.lit / total,
            ext: clamped.ext / total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_state_round_trips_through_str() {
        for state in [
            IndexState::Fresh,
            IndexState::Stale,
            IndexState::Rebuilding,
            IndexState::Error,
        ] {
            assert_eq!(IndexState::parse_state(state.as_str()), Some(state));
        }
        assert_eq!(IndexState::parse_state("Fresh "), Some(IndexState::Fresh));
        assert_eq!(IndexState::parse_state("done"), None);
    }

    #[test]
    fn freshness_state_serializes_upper_case() {
        let json = serde_json::to_string(&FreshnessState::Unknown).unwrap();
        assert_eq!(json, "\"UNKNOWN\"");
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let weights = RerankWeights {
            bm25: 2.0,
            uni: -1.0,
            bi: 1.0,
            path: 0.5,
            lit: 0.0,
            ext: 0.5,
        }
        .normalized();
        assert!((weights.sum() - 1.0).abs() < 1e-9);
        assert_eq!(weights.uni, 0.0);
        assert!((weights.bm25 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn non_positive_weights_fall_back_to_defaults() {
        let weights = RerankWeights {
            bm25: -1.0,
            uni: 0.0,
            bi: -0.5,
            path: 0.0,
            lit: f64::NAN,
            ext: 0.0,
        }
        .normalized();
        assert_eq!(weights, RerankWeights::default().normalized());
        assert!((weights.sum() - 1.0).abs() < 1e-9);
    }
}
