//! Configuration system for the knowledge-base engine.
//!
//! Config priority: environment variables > config file (TOML) > defaults.
//! The TOML file lives at `$MINDSPACE_CONFIG` or `~/.config/mindspace/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Valid embedding dimensions accepted by the upstream models.
pub const VALID_EMBEDDING_DIMS: &[usize] = &[64, 128, 256, 512, 768, 1024, 1536, 2048];

/// Rough character-per-token estimate used for chunk-count prediction.
pub const CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// Chunking Configuration
// ============================================================================

/// Which chunking engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingEngine {
  /// Fast local token-aware splitter.
  #[default]
  Semchunk,
  /// LLM-driven semantic boundary detection.
  Mindchunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
  /// Which engine splits documents
  pub engine: ChunkingEngine,

  /// Target tokens per chunk (default: 500)
  pub chunk_size: usize,

  /// Overlap tokens between chunks (default: 50)
  pub chunk_overlap: usize,

  /// Upper bound for a configurable chunk size (default: 2000)
  pub max_segmentation_tokens: usize,

  /// Maximum chunks a single tenant may hold (default: 1000)
  pub max_chunks_per_user: usize,
}

impl Default for ChunkingConfig {
  fn default() -> Self {
    Self {
      engine: ChunkingEngine::Semchunk,
      chunk_size: 500,
      chunk_overlap: 50,
      max_segmentation_tokens: 2000,
      max_chunks_per_user: 1000,
    }
  }
}

impl ChunkingConfig {
  /// Chunk size with the out-of-range fallback applied.
  ///
  /// Sizes below 50 or above `max_segmentation_tokens` fall back to 500.
  pub fn validated_chunk_size(&self) -> usize {
    if self.chunk_size < 50 || self.chunk_size > self.max_segmentation_tokens {
      warn!(
        chunk_size = self.chunk_size,
        max = self.max_segmentation_tokens,
        "Chunk size out of range, using default 500"
      );
      500
    } else {
      self.chunk_size
    }
  }
}

// ============================================================================
// Ingestion Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
  /// Maximum documents per knowledge space (default: 5)
  pub max_documents_per_user: usize,

  /// Maximum upload size in bytes (default: 10 MiB)
  pub max_file_size: u64,

  /// Root directory for canonical document bytes and version snapshots
  pub storage_dir: PathBuf,

  /// Number of background job workers (default: 4)
  pub job_workers: usize,
}

impl Default for IngestConfig {
  fn default() -> Self {
    Self {
      max_documents_per_user: 5,
      max_file_size: 10 * 1024 * 1024,
      storage_dir: PathBuf::from("storage"),
      job_workers: 4,
    }
  }
}

// ============================================================================
// Embedding Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Model identifier sent to the vendor (default: text-embedding-v4)
  pub model: String,

  /// Vector dimensions; must be one of [`VALID_EMBEDDING_DIMS`] (default: 768)
  pub dimensions: usize,

  /// Query-embedding cache TTL in seconds (default: 600)
  pub query_cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      model: "text-embedding-v4".to_string(),
      dimensions: 768,
      query_cache_ttl_secs: 600,
    }
  }
}

impl EmbeddingConfig {
  /// Dimensions with the whitelist applied; invalid values fall back to 768.
  pub fn validated_dimensions(&self) -> usize {
    if VALID_EMBEDDING_DIMS.contains(&self.dimensions) {
      self.dimensions
    } else {
      warn!(
        dimensions = self.dimensions,
        "Invalid embedding dimensions, using default 768"
      );
      768
    }
  }
}

// ============================================================================
// Retrieval Configuration
// ============================================================================

/// First-stage retrieval method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
  Semantic,
  Keyword,
  #[default]
  Hybrid,
}

impl RetrievalMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Semantic => "semantic",
      Self::Keyword => "keyword",
      Self::Hybrid => "hybrid",
    }
  }
}

impl std::str::FromStr for RetrievalMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "semantic" => Ok(Self::Semantic),
      "keyword" => Ok(Self::Keyword),
      "hybrid" => Ok(Self::Hybrid),
      other => Err(format!("unknown retrieval method: {other}")),
    }
  }
}

/// Second-stage ranking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
  RerankingModel,
  #[default]
  WeightedScore,
  None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
  /// Default first-stage method when a request omits one
  pub default_method: RetrievalMethod,

  /// Second-stage ranking mode
  pub reranking_mode: RerankMode,

  /// Dense-score weight in weighted_score mode (default: 0.5)
  pub hybrid_vector_weight: f32,

  /// Keyword-score weight in weighted_score mode (default: 0.5)
  pub hybrid_keyword_weight: f32,

  /// Rerank model identifier (default: gte-rerank)
  pub rerank_model: String,

  /// Per-request timeout in seconds, propagated to all suspension points (default: 40)
  pub request_timeout_secs: u64,
}

impl Default for RetrievalConfig {
  fn default() -> Self {
    Self {
      default_method: RetrievalMethod::Hybrid,
      reranking_mode: RerankMode::WeightedScore,
      hybrid_vector_weight: 0.5,
      hybrid_keyword_weight: 0.5,
      rerank_model: "gte-rerank".to_string(),
      request_timeout_secs: 40,
    }
  }
}

// ============================================================================
// Provider / Load Balancing Configuration
// ============================================================================

/// Per-route upstream limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteLimits {
  /// Queries per minute, enforced over a sliding 60 s window
  pub qpm_limit: usize,
  /// Concurrent in-flight requests
  pub concurrent_limit: usize,
}

impl Default for RouteLimits {
  fn default() -> Self {
    Self {
      qpm_limit: 4500,
      concurrent_limit: 500,
    }
  }
}

/// Route-selection strategy for aliases with multiple vendor routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
  #[default]
  RoundRobin,
  Random,
  Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
  /// DashScope (qwen family) API key; also read from DASHSCOPE_API_KEY
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dashscope_api_key: Option<String>,
  pub dashscope_base_url: String,
  pub dashscope_limits: RouteLimits,

  /// Volcengine (doubao / deepseek route) API key; also read from ARK_API_KEY
  #[serde(skip_serializing_if = "Option::is_none")]
  pub volcengine_api_key: Option<String>,
  pub volcengine_base_url: String,
  pub volcengine_limits: RouteLimits,

  /// Moonshot (kimi) API key; also read from MOONSHOT_API_KEY
  #[serde(skip_serializing_if = "Option::is_none")]
  pub moonshot_api_key: Option<String>,
  pub moonshot_base_url: String,
  pub moonshot_limits: RouteLimits,

  /// Tencent (hunyuan) API key; also read from HUNYUAN_API_KEY
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tencent_api_key: Option<String>,
  pub tencent_base_url: String,
  pub tencent_limits: RouteLimits,

  /// Dify application API key; also read from DIFY_API_KEY
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dify_api_key: Option<String>,
  pub dify_base_url: String,
  /// Upstream socket-read timeout for streamed chats in seconds (default: 30)
  pub dify_timeout_secs: u64,

  /// Whether multi-route aliases are balanced across vendors
  pub load_balancing_enabled: bool,
  pub load_balancing_strategy: BalancingStrategy,
  /// Raw weights string, e.g. "dashscope:50,volcengine:50"
  pub load_balancing_weights: String,

  /// Chat model for the vision/OCR path (default: qwen-vl-plus)
  pub ocr_model: String,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      dashscope_api_key: None,
      dashscope_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
      dashscope_limits: RouteLimits {
        qpm_limit: 13500,
        concurrent_limit: 500,
      },
      volcengine_api_key: None,
      volcengine_base_url: "https://ark.cn-beijing.volces.com/api/v3".to_string(),
      volcengine_limits: RouteLimits {
        qpm_limit: 4500,
        concurrent_limit: 500,
      },
      moonshot_api_key: None,
      moonshot_base_url: "https://api.moonshot.cn/v1".to_string(),
      moonshot_limits: RouteLimits::default(),
      tencent_api_key: None,
      tencent_base_url: "https://api.hunyuan.cloud.tencent.com/v1".to_string(),
      tencent_limits: RouteLimits::default(),
      dify_api_key: None,
      dify_base_url: "http://localhost/v1".to_string(),
      dify_timeout_secs: 30,
      load_balancing_enabled: false,
      load_balancing_strategy: BalancingStrategy::RoundRobin,
      load_balancing_weights: "dashscope:50,volcengine:50".to_string(),
      ocr_model: "qwen-vl-plus".to_string(),
    }
  }
}

impl ProviderConfig {
  /// Parse and normalize the load-balancing weights.
  ///
  /// Weights are clamped to [0, 100] and normalized so they sum to exactly
  /// 100 (integer rounding, second weight takes the remainder). A zero total
  /// falls back to 50/50.
  pub fn normalized_weights(&self) -> HashMap<String, u32> {
    let mut weights: HashMap<String, u32> = HashMap::new();
    for pair in self.load_balancing_weights.split(',') {
      if let Some((name, value)) = pair.trim().split_once(':')
        && let Ok(v) = value.trim().parse::<i64>()
      {
        weights.insert(name.trim().to_string(), v.clamp(0, 100) as u32);
      }
    }

    weights.entry("dashscope".to_string()).or_insert(50);
    weights.entry("volcengine".to_string()).or_insert(50);

    let dashscope = weights["dashscope"];
    let volcengine = weights["volcengine"];
    let total = dashscope + volcengine;
    if total == 0 {
      warn!("Load balancing weights sum to 0, using default 50/50");
      weights.insert("dashscope".to_string(), 50);
      weights.insert("volcengine".to_string(), 50);
    } else {
      let normalized = ((dashscope as f64) * 100.0 / (total as f64)).round() as u32;
      weights.insert("dashscope".to_string(), normalized);
      weights.insert("volcengine".to_string(), 100 - normalized);
    }

    weights
  }
}

// ============================================================================
// Tenant Limits Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimitsConfig {
  /// Retrieval requests per tenant per minute (default: 60)
  pub kb_retrieval_rpm: u32,

  /// Embedding API calls per tenant per minute (default: 100)
  pub kb_embedding_rpm: u32,

  /// Document uploads per tenant per hour (default: 10)
  pub kb_upload_per_hour: u32,

  /// Shared counter store URL; also read from REDIS_URL.
  /// When unreachable, counters fall back to process-local state.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub redis_url: Option<String>,
}

impl Default for TenantLimitsConfig {
  fn default() -> Self {
    Self {
      kb_retrieval_rpm: 60,
      kb_embedding_rpm: 100,
      kb_upload_per_hour: 10,
      redis_url: None,
    }
  }
}

// ============================================================================
// Vector Store Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
  /// Collection name prefix; the tenant id is appended (default: "user_")
  pub collection_prefix: String,

  /// Whether scalar quantization is assumed for storage estimates
  pub compression_enabled: bool,

  /// Compression type reported by the metrics endpoint
  pub compression_type: String,
}

impl Default for VectorConfig {
  fn default() -> Self {
    Self {
      collection_prefix: "user_".to_string(),
      compression_enabled: true,
      compression_type: "int8_scalar".to_string(),
    }
  }
}

// ============================================================================
// Auto-Import Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoImportConfig {
  /// Whether the periodic library scan runs (default: true)
  pub enabled: bool,

  /// Minutes between scans (default: 5)
  pub interval_minutes: u64,

  /// Directory scanned for new library files
  pub library_dir: PathBuf,

  /// Tenant that owns auto-imported documents (default: 0, the library tenant)
  pub library_tenant: u64,
}

impl Default for AutoImportConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      interval_minutes: 5,
      library_dir: PathBuf::from("storage/library"),
      library_tenant: 0,
    }
  }
}

// ============================================================================
// Daemon Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Unix socket path for the IPC server
  pub socket_path: PathBuf,

  /// Base directory for the LanceDB database
  pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    Self {
      socket_path: std::env::temp_dir().join("mindspace.sock"),
      data_dir: base.join("mindspace"),
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub chunking: ChunkingConfig,
  pub ingest: IngestConfig,
  pub embedding: EmbeddingConfig,
  pub retrieval: RetrievalConfig,
  pub provider: ProviderConfig,
  pub limits: TenantLimitsConfig,
  pub vector: VectorConfig,
  pub auto_import: AutoImportConfig,
  pub daemon: DaemonConfig,
}

impl Config {
  /// Load configuration: file (if present), then environment overrides.
  pub fn load() -> Self {
    let mut config = Self::from_file().unwrap_or_default();
    config.apply_env();
    config
  }

  fn from_file() -> Option<Self> {
    let path = Self::config_path()?;
    let content = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&content) {
      Ok(config) => Some(config),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Failed to parse config file, using defaults");
        None
      }
    }
  }

  /// Config file location: `$MINDSPACE_CONFIG` or `~/.config/mindspace/config.toml`.
  pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MINDSPACE_CONFIG") {
      return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|p: PathBuf| p.join("mindspace").join("config.toml"))
  }

  /// Apply the documented environment-variable overrides.
  pub fn apply_env(&mut self) {
    fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
      std::env::var(name).ok().and_then(|v| v.parse().ok())
    }

    if let Some(v) = env_parse("CHUNK_SIZE") {
      self.chunking.chunk_size = v;
    }
    if let Some(v) = env_parse("CHUNK_OVERLAP") {
      self.chunking.chunk_overlap = v;
    }
    if let Some(v) = env_parse("MAX_SEGMENTATION_TOKENS") {
      self.chunking.max_segmentation_tokens = v;
    }
    if let Some(v) = env_parse("MAX_CHUNKS_PER_USER") {
      self.chunking.max_chunks_per_user = v;
    }
    if let Ok(v) = std::env::var("CHUNKING_ENGINE") {
      match v.to_lowercase().as_str() {
        "mindchunk" => self.chunking.engine = ChunkingEngine::Mindchunk,
        "semchunk" => self.chunking.engine = ChunkingEngine::Semchunk,
        other => warn!(engine = other, "Unknown CHUNKING_ENGINE, keeping current"),
      }
    }

    if let Some(v) = env_parse("MAX_DOCUMENTS_PER_USER") {
      self.ingest.max_documents_per_user = v;
    }
    if let Some(v) = env_parse("MAX_FILE_SIZE") {
      self.ingest.max_file_size = v;
    }
    if let Ok(v) = std::env::var("STORAGE_DIR") {
      self.ingest.storage_dir = PathBuf::from(v);
    }

    if let Some(v) = env_parse("EMBEDDING_DIMENSIONS") {
      self.embedding.dimensions = v;
    }

    if let Ok(v) = std::env::var("DEFAULT_RETRIEVAL_METHOD")
      && let Ok(method) = v.parse()
    {
      self.retrieval.default_method = method;
    }
    if let Ok(v) = std::env::var("RERANKING_MODE") {
      match v.as_str() {
        "reranking_model" => self.retrieval.reranking_mode = RerankMode::RerankingModel,
        "weighted_score" => self.retrieval.reranking_mode = RerankMode::WeightedScore,
        "none" => self.retrieval.reranking_mode = RerankMode::None,
        other => warn!(mode = other, "Unknown RERANKING_MODE, keeping current"),
      }
    }
    if let Some(v) = env_parse("HYBRID_VECTOR_WEIGHT") {
      self.retrieval.hybrid_vector_weight = v;
    }
    if let Some(v) = env_parse("HYBRID_KEYWORD_WEIGHT") {
      self.retrieval.hybrid_keyword_weight = v;
    }

    if let Ok(v) = std::env::var("DASHSCOPE_API_KEY") {
      self.provider.dashscope_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("ARK_API_KEY") {
      self.provider.volcengine_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("MOONSHOT_API_KEY") {
      self.provider.moonshot_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("HUNYUAN_API_KEY") {
      self.provider.tencent_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("DIFY_API_KEY") {
      self.provider.dify_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("DIFY_API_URL") {
      self.provider.dify_base_url = v;
    }
    if let Some(v) = env_parse("DASHSCOPE_QPM_LIMIT") {
      self.provider.dashscope_limits.qpm_limit = v;
    }
    if let Some(v) = env_parse("DASHSCOPE_CONCURRENT_LIMIT") {
      self.provider.dashscope_limits.concurrent_limit = v;
    }
    if let Some(v) = env_parse("ARK_QPM_LIMIT") {
      self.provider.volcengine_limits.qpm_limit = v;
    }
    if let Some(v) = env_parse("ARK_CONCURRENT_LIMIT") {
      self.provider.volcengine_limits.concurrent_limit = v;
    }
    if let Ok(v) = std::env::var("LOAD_BALANCING_ENABLED") {
      self.provider.load_balancing_enabled = v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = std::env::var("LOAD_BALANCING_STRATEGY") {
      match v.as_str() {
        "round_robin" => self.provider.load_balancing_strategy = BalancingStrategy::RoundRobin,
        "random" => self.provider.load_balancing_strategy = BalancingStrategy::Random,
        "weighted" => self.provider.load_balancing_strategy = BalancingStrategy::Weighted,
        other => warn!(strategy = other, "Unknown LOAD_BALANCING_STRATEGY, keeping current"),
      }
    }
    if let Ok(v) = std::env::var("LOAD_BALANCING_WEIGHTS") {
      self.provider.load_balancing_weights = v;
    }

    if let Some(v) = env_parse("KB_RETRIEVAL_RPM") {
      self.limits.kb_retrieval_rpm = v;
    }
    if let Some(v) = env_parse("KB_EMBEDDING_RPM") {
      self.limits.kb_embedding_rpm = v;
    }
    if let Some(v) = env_parse("KB_UPLOAD_PER_HOUR") {
      self.limits.kb_upload_per_hour = v;
    }
    if let Ok(v) = std::env::var("REDIS_URL") {
      self.limits.redis_url = Some(v);
    }

    if let Ok(v) = std::env::var("LIBRARY_AUTO_IMPORT_ENABLED") {
      self.auto_import.enabled = v.eq_ignore_ascii_case("true");
    }
    if let Some(v) = env_parse("LIBRARY_AUTO_IMPORT_INTERVAL") {
      self.auto_import.interval_minutes = v;
    }
    if let Ok(v) = std::env::var("LIBRARY_DIR") {
      self.auto_import.library_dir = PathBuf::from(v);
    }

    if let Ok(v) = std::env::var("MINDSPACE_SOCKET") {
      self.daemon.socket_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MINDSPACE_DATA_DIR") {
      self.daemon.data_dir = PathBuf::from(v);
    }
  }
}
