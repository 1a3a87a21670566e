use crate::constants;
use crate::error::ConfigError;
use crate::span_hash::HashAlgorithm;
use crate::types::RerankWeights;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    #[serde(default = "default_true")]
    pub hash_include_text: bool,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

/// Embedding backend settings. Empty `model`, zero `dimensions` and unset
/// prefixes resolve from the named preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_preset")]
    pub preset: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub dimensions: usize,
    #[serde(default)]
    pub passage_prefix: Option<String>,
    #[serde(default)]
    pub query_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub weights: RerankWeights,
    #[serde(default = "default_candidate_limit")]
    pub lexical_limit: usize,
    #[serde(default = "default_candidate_limit")]
    pub vector_limit: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_enrichment_schema_version")]
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_lock_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub source_db: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Fixed model id, dimension and prefixes for a named embedding preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingPreset {
    pub name: &'static str,
    pub model: &'static str,
    pub dimensions: usize,
    pub passage_prefix: &'static str,
    pub query_prefix: &'static str,
}

const EMBEDDING_PRESETS: &[EmbeddingPreset] = &[
    EmbeddingPreset {
        name: "e5-small",
        model: "intfloat/e5-small-v2",
        dimensions: 384,
        passage_prefix: "passage: ",
        query_prefix: "query: ",
    },
    EmbeddingPreset {
        name: "bge-small",
        model: "BAAI/bge-small-en-v1.5",
        dimensions: 384,
        passage_prefix: "",
        query_prefix: "Represent this sentence for searching relevant passages: ",
    },
    EmbeddingPreset {
        name: "minilm",
        model: "sentence-transformers/all-MiniLM-L6-v2",
        dimensions: 384,
        passage_prefix: "",
        query_prefix: "",
    },
    EmbeddingPreset {
        name: "nomic",
        model: "nomic-ai/nomic-embed-text-v1.5",
        dimensions: 768,
        passage_prefix: "search_document: ",
        query_prefix: "search_query: ",
    },
];

pub fn embedding_preset(name: &str) -> Option<EmbeddingPreset> {
    let wanted = name.trim().to_ascii_lowercase();
    EMBEDDING_PRESETS
        .iter()
        .find(|preset| preset.name == wanted)
        .copied()
}

/// Embedding settings after preset resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEmbedding {
    pub preset: String,
    pub model: String,
    pub dimensions: usize,
    pub passage_prefix: String,
    pub query_prefix: String,
    pub normalize: bool,
    pub device: String,
    pub batch_size: usize,
}

fn default_data_dir() -> String {
    constants::DEFAULT_DATA_DIR.to_string()
}
fn default_busy_timeout() -> u32 {
    5000
}
fn default_cache_size() -> i32 {
    -64000
}
fn default_hash_algorithm() -> String {
    HashAlgorithm::default().as_str().to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_file_size() -> u64 {
    constants::MAX_FILE_SIZE
}
fn default_embedding_preset() -> String {
    "e5-small".to_string()
}
fn default_device() -> String {
    "cpu".to_string()
}
fn default_embedding_batch_size() -> usize {
    32
}
fn default_candidate_limit() -> usize {
    50
}
fn default_top_k() -> usize {
    10
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_ledger_file() -> String {
    "enrichment_ledger.jsonl".to_string()
}
fn default_max_error_chars() -> usize {
    500
}
fn default_batch_limit() -> usize {
    20
}
fn default_enrichment_schema_version() -> u32 {
    constants::ENRICHMENT_SCHEMA_VERSION
}
fn default_lock_ttl_secs() -> u64 {
    900
}
fn default_lock_backoff_ms() -> u64 {
    500
}
fn default_lock_dir() -> String {
    "locks".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: default_hash_algorithm(),
            hash_include_text: true,
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            preset: default_embedding_preset(),
            model: String::new(),
            dimensions: 0,
            passage_prefix: None,
            query_prefix: None,
            normalize: true,
            device: default_device(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            weights: RerankWeights::default(),
            lexical_limit: default_candidate_limit(),
            vector_limit: default_candidate_limit(),
            top_k: default_top_k(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            ledger_file: default_ledger_file(),
            max_error_chars: default_max_error_chars(),
            batch_limit: default_batch_limit(),
            schema_version: default_enrichment_schema_version(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            backoff_ms: default_lock_backoff_ms(),
            dir: default_lock_dir(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_db: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl IndexConfig {
    pub fn hash_algorithm_typed(&self) -> HashAlgorithm {
        HashAlgorithm::parse_algorithm(&self.hash_algorithm).unwrap_or_default()
    }
}

impl EmbeddingConfig {
    pub fn resolved(&self) -> ResolvedEmbedding {
        let preset = embedding_preset(&self.preset)
            .or_else(|| embedding_preset(&default_embedding_preset()))
            .unwrap_or(EMBEDDING_PRESETS[0]);
        let model = if self.model.trim().is_empty() {
            preset.model.to_string()
        } else {
            self.model.trim().to_string()
        };
        ResolvedEmbedding {
            preset: preset.name.to_string(),
            model,
            dimensions: if self.dimensions == 0 {
                preset.dimensions
            } else {
                self.dimensions
            },
            passage_prefix: self
                .passage_prefix
                .clone()
                .unwrap_or_else(|| preset.passage_prefix.to_string()),
            query_prefix: self
                .query_prefix
                .clone()
                .unwrap_or_else(|| preset.query_prefix.to_string()),
            normalize: self.normalize,
            device: self.device.clone(),
            batch_size: self.batch_size.max(1),
        }
    }
}

impl Config {
    /// Load configuration with layered precedence:
    /// 1. Environment variables `SPANLENS_<SECTION>_<KEY>` (highest priority)
    /// 2. Explicit config file
    /// 3. Project config: `<repo_root>/.spanlens/config.toml`
    /// 4. Global config: `~/.spanlens/config.toml`
    /// 5. Built-in defaults (lowest priority)
    ///
    /// Only fields explicitly set in a higher-priority file override lower layers.
    pub fn load(repo_root: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_file(repo_root, None)
    }

    pub fn load_with_file(
        repo_root: Option<&Path>,
        config_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        if let Some(home) = dirs::home_dir() {
            let global_path = home.join(constants::DEFAULT_DATA_DIR).join("config.toml");
            if global_path.exists() {
                let raw = load_toml_value(&global_path)?;
                merge_toml_values(&mut merged, &raw);
            }
        }

        if let Some(root) = repo_root {
            let project_path = root.join(constants::PROJECT_CONFIG_FILE);
            if project_path.exists() {
                let raw = load_toml_value(&project_path)?;
                merge_toml_values(&mut merged, &raw);
            }
        }

        if let Some(cf) = config_file {
            if !cf.exists() {
                return Err(ConfigError::NotFound {
                    path: cf.display().to_string(),
                });
            }
            let raw = load_toml_value(cf)?;
            merge_toml_values(&mut merged, &raw);
        }

        let config_str =
            toml::to_string(&merged).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        apply_env_overrides(&mut config);
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if HashAlgorithm::parse_algorithm(&self.index.hash_algorithm).is_none() {
            tracing::warn!(
                field = "index.hash_algorithm",
                value = %self.index.hash_algorithm,
                "unknown hash algorithm; falling back to default"
            );
        }
        self.index.hash_algorithm = self.index.hash_algorithm_typed().as_str().to_string();

        if embedding_preset(&self.embedding.preset).is_none() {
            tracing::warn!(
                field = "embedding.preset",
                value = %self.embedding.preset,
                "unknown embedding preset; falling back to default"
            );
            self.embedding.preset = default_embedding_preset();
        }
        self.embedding.preset = self.embedding.preset.trim().to_ascii_lowercase();
        self.embedding.batch_size = self.embedding.batch_size.max(1);

        let weights = &mut self.rerank.weights;
        weights.bm25 = clamp_weight_with_warning(weights.bm25, "rerank.weights.bm25");
        weights.uni = clamp_weight_with_warning(weights.uni, "rerank.weights.uni");
        weights.bi = clamp_weight_with_warning(weights.bi, "rerank.weights.bi");
        weights.path = clamp_weight_with_warning(weights.path, "rerank.weights.path");
        weights.lit = clamp_weight_with_warning(weights.lit, "rerank.weights.lit");
        weights.ext = clamp_weight_with_warning(weights.ext, "rerank.weights.ext");
        self.rerank.top_k = self.rerank.top_k.max(1);

        self.storage.data_dir = expand_tilde(&self.storage.data_dir);
    }

    /// Data directory for a repo. Relative paths are anchored at the repo root.
    pub fn data_dir(&self, repo_root: &Path) -> PathBuf {
        let dir = PathBuf::from(&self.storage.data_dir);
        if dir.is_absolute() {
            dir
        } else {
            repo_root.join(dir)
        }
    }

    pub fn index_db_path(&self, repo_root: &Path) -> PathBuf {
        self.data_dir(repo_root).join(constants::INDEX_DB_FILE)
    }

    pub fn index_status_path(&self, repo_root: &Path) -> PathBuf {
        self.data_dir(repo_root).join(constants::INDEX_STATUS_FILE)
    }

    pub fn ledger_path(&self, repo_root: &Path) -> PathBuf {
        self.data_dir(repo_root).join(&self.enrichment.ledger_file)
    }

    pub fn lock_dir(&self, repo_root: &Path) -> PathBuf {
        let dir = PathBuf::from(&self.locks.dir);
        if dir.is_absolute() {
            dir
        } else {
            self.data_dir(repo_root).join(dir)
        }
    }

    /// Enrichment database consulted by the graph merge.
    pub fn graph_source_db(&self, repo_root: &Path) -> PathBuf {
        match self.graph.source_db.as_deref() {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => repo_root.join(path),
            None => self.index_db_path(repo_root),
        }
    }
}

/// Load a TOML file as a raw `toml::Value` (preserving only explicitly-set fields).
fn load_toml_value(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    content
        .parse::<toml::Value>()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Deep-merge `overlay` into `base`. Only keys present in `overlay` are written.
fn merge_toml_values(base: &mut toml::Value, overlay: &toml::Value) {
    if let (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) = (base, overlay) {
        for (key, overlay_val) in overlay_map {
            if let Some(base_val) = base_map.get_mut(key) {
                if base_val.is_table() && overlay_val.is_table() {
                    merge_toml_values(base_val, overlay_val);
                } else {
                    *base_val = overlay_val.clone();
                }
            } else {
                base_map.insert(key.clone(), overlay_val.clone());
            }
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_with(config, |key| std::env::var(key).ok());
}

/// Apply `SPANLENS_<SECTION>_<KEY>` overrides read through `lookup`.
fn apply_env_overrides_with<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("SPANLENS_STORAGE_DATA_DIR") {
        config.storage.data_dir = v;
    }
    if let Some(n) = lookup("SPANLENS_STORAGE_BUSY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.storage.busy_timeout_ms = n;
    }
    if let Some(n) = lookup("SPANLENS_STORAGE_CACHE_SIZE").and_then(|v| v.parse().ok()) {
        config.storage.cache_size = n;
    }
    if let Some(v) = lookup("SPANLENS_INDEX_HASH_ALGORITHM") {
        config.index.hash_algorithm = v;
    }
    if let Some(b) = lookup("SPANLENS_INDEX_HASH_INCLUDE_TEXT").and_then(|v| parse_env_bool(&v)) {
        config.index.hash_include_text = b;
    }
    if let Some(n) = lookup("SPANLENS_INDEX_MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
        config.index.max_file_size = n;
    }
    if let Some(v) = lookup("SPANLENS_EMBEDDING_PRESET") {
        config.embedding.preset = v;
    }
    if let Some(v) = lookup("SPANLENS_EMBEDDING_MODEL") {
        config.embedding.model = v;
    }
    if let Some(n) = lookup("SPANLENS_EMBEDDING_DIMENSIONS").and_then(|v| v.parse().ok()) {
        config.embedding.dimensions = n;
    }
    if let Some(v) = lookup("SPANLENS_EMBEDDING_PASSAGE_PREFIX") {
        config.embedding.passage_prefix = Some(v);
    }
    if let Some(v) = lookup("SPANLENS_EMBEDDING_QUERY_PREFIX") {
        config.embedding.query_prefix = Some(v);
    }
    if let Some(b) = lookup("SPANLENS_EMBEDDING_NORMALIZE").and_then(|v| parse_env_bool(&v)) {
        config.embedding.normalize = b;
    }
    if let Some(v) = lookup("SPANLENS_EMBEDDING_DEVICE") {
        config.embedding.device = v;
    }
    if let Some(n) = lookup("SPANLENS_EMBEDDING_BATCH_SIZE").and_then(|v| v.parse().ok()) {
        config.embedding.batch_size = n;
    }
    if let Some(v) = lookup("SPANLENS_RERANK_WEIGHTS") {
        apply_weight_overrides(&mut config.rerank.weights, &v);
    }
    if let Some(n) = lookup("SPANLENS_RERANK_TOP_K").and_then(|v| v.parse().ok()) {
        config.rerank.top_k = n;
    }
    if let Some(n) = lookup("SPANLENS_ENRICHMENT_COOLDOWN_SECS").and_then(|v| v.parse().ok()) {
        config.enrichment.cooldown_secs = n;
    }
    if let Some(v) = lookup("SPANLENS_ENRICHMENT_LEDGER_FILE") {
        config.enrichment.ledger_file = v;
    }
    if let Some(n) = lookup("SPANLENS_LOCKS_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.locks.ttl_secs = n;
    }
    if let Some(n) = lookup("SPANLENS_LOCKS_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        config.locks.backoff_ms = n;
    }
    if let Some(b) = lookup("SPANLENS_GRAPH_ENABLED").and_then(|v| parse_env_bool(&v)) {
        config.graph.enabled = b;
    }
    if let Some(v) = lookup("SPANLENS_GRAPH_SOURCE_DB") {
        config.graph.source_db = Some(v);
    }
    if let Some(v) = lookup("SPANLENS_LOGGING_LEVEL") {
        config.logging.level = v;
    }
}

/// Parse `bm25=0.6,uni=0.2` style overrides onto existing weights.
fn apply_weight_overrides(weights: &mut RerankWeights, raw: &str) {
    for entry in parse_csv_env_list(raw) {
        let Some((key, value)) = entry.split_once('=') else {
            tracing::warn!(entry = %entry, "ignoring malformed rerank weight override");
            continue;
        };
        let Ok(value) = value.trim().parse::<f64>() else {
            tracing::warn!(entry = %entry, "ignoring non-numeric rerank weight override");
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "bm25" => weights.bm25 = value,
            "uni" => weights.uni = value,
            "bi" => weights.bi = value,
            "path" => weights.path = value,
            "lit" => weights.lit = value,
            "ext" => weights.ext = value,
            other => tracing::warn!(key = other, "ignoring unknown rerank weight"),
        }
    }
}

fn parse_csv_env_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn clamp_weight_with_warning(value: f64, field: &str) -> f64 {
    if !value.is_finite() {
        tracing::warn!(field, value, "invalid non-finite weight; clamped to 0.0");
        return 0.0;
    }
    if value < 0.0 {
        tracing::warn!(field, value, "negative weight; clamped to 0.0");
        return 0.0;
    }
    value
}

fn expand_tilde(path: &str) -> String {
    if path.starts_with('~')
        && let Some(home) = dirs::home_dir()
    {
        return path.replacen('~', &home.to_string_lossy(), 1);
    }
    path.to_string()
}
