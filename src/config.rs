//! Configuration management for the RAG engine
//!
//! Every knob is environment-overridable (`RAG_` prefix, `__` separator,
//! e.g. `RAG_RETRIEVAL__RRF_K=60`) and has a sensible default so a partial
//! config file or environment still produces a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration for the RAG engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    /// Relational store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object store configuration
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Vector store configuration
    #[serde(default)]
    pub vector: VectorConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chat model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Reranker configuration
    #[serde(default)]
    pub rerank: RerankConfig,

    /// OCR (vision model) configuration
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Global chunking defaults (overridable per knowledge base)
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval behaviour
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Conversation behaviour
    #[serde(default)]
    pub chat: ChatConfig,

    /// Upload validation and dedup policy
    #[serde(default)]
    pub upload: UploadConfig,

    /// Per-user rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Read cache behaviour
    #[serde(default)]
    pub cache: CacheConfig,

    /// Async task runner behaviour
    #[serde(default)]
    pub queue: QueueConfig,

    /// MCP tool server configurations
    #[serde(default)]
    pub mcp: McpConfig,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:rag.db".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Root directory for the filesystem-backed store
    pub root: PathBuf,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/objects"),
        }
    }
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Backend kind: "milvus" or "qdrant"
    pub backend: String,

    /// Service base URL
    pub url: String,

    /// Auth token / API key
    #[serde(default)]
    pub api_key: String,

    /// Collection name
    pub collection: String,

    /// Default embedding dimension, used until the provider's native
    /// dimension has been observed
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,
}

fn default_vector_timeout() -> u64 {
    30
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: "milvus".to_string(),
            url: String::new(),
            api_key: String::new(),
            collection: "rag_collection".to_string(),
            dimension: 1536,
            timeout_secs: default_vector_timeout(),
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider base URL
    pub base_url: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Model identifier (text and image inputs share one output space)
    pub model: String,

    /// Maximum inputs per batch request
    pub batch_size: usize,

    /// Oversize inputs are truncated to this many characters
    pub max_input_chars: usize,

    /// Dimension of the zero vector returned for empty inputs; the
    /// provider's observed dimension is authoritative everywhere else
    pub default_dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/api/v1".to_string(),
            api_key: String::new(),
            model: "qwen3-vl-embedding".to_string(),
            batch_size: 20,
            max_input_chars: 8192,
            default_dimension: 1536,
            timeout_secs: 90,
        }
    }
}

/// Chat model configuration (OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider base URL
    pub base_url: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Model identifier for text generation
    pub model: String,

    /// Maximum tokens for generation
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "qwen3-vl-plus".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

/// Reranker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Provider base URL
    pub base_url: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Rerank model identifier
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/api/v1".to_string(),
            api_key: String::new(),
            model: "qwen3-rerank".to_string(),
            timeout_secs: 60,
        }
    }
}

/// OCR (vision model) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// OpenAI-compatible chat endpoint base URL
    pub base_url: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Vision model identifier
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            api_key: String::new(),
            model: "qwen-vl-ocr".to_string(),
            timeout_secs: 90,
        }
    }
}

/// Global chunking defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,

    /// Overlap carried into the next chunk, in characters
    pub chunk_overlap: usize,

    /// A chunk may grow to `chunk_size * max_expand_ratio` to avoid
    /// cutting a sentence
    pub max_expand_ratio: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            max_expand_ratio: 1.3,
        }
    }
}

/// Retrieval behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Below this confidence the chat layer warns the model that the
    /// knowledge base match is weak
    pub confidence_threshold: f64,

    /// Reciprocal Rank Fusion constant
    pub rrf_k: u32,

    /// Score lexical candidates with BM25 (keyword counting otherwise)
    pub use_bm25: bool,

    /// Expand the user query into paraphrases before retrieval
    pub query_expand: bool,

    /// Number of paraphrases to generate (the original query is always
    /// included)
    pub query_expand_count: usize,

    /// Include +-N neighbouring chunks of each selected chunk (0 = off)
    pub context_window_expand: i64,

    /// Default number of chunks selected per retrieval
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            rrf_k: 60,
            use_bm25: true,
            query_expand: true,
            query_expand_count: 2,
            context_window_expand: 1,
            top_k: 10,
        }
    }
}

/// Conversation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Maximum conversations kept per user; the oldest are evicted
    pub history_max_count: i64,

    /// Default page size when listing conversations
    pub history_default_count: i64,

    /// Most recent N messages kept verbatim; the older tail is summarised
    pub context_message_count: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_max_count: 100,
            history_default_count: 50,
            context_message_count: 8,
        }
    }
}

/// Upload validation and dedup policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum file size in bytes
    pub max_file_size: usize,

    /// Comma-separated list of allowed extensions
    pub allowed_types: String,

    /// Comma-separated list of forbidden extensions (executables, scripts)
    pub forbidden_extensions: String,

    /// Maximum filename length
    pub filename_max_length: usize,

    /// Policy for an upload whose content hash already exists:
    /// "use_existing" or "overwrite"
    pub on_duplicate: String,

    /// PDFs whose fast text extraction yields fewer characters than this
    /// are routed through OCR page by page
    pub pdf_ocr_min_chars: usize,

    /// Rendering DPI hint forwarded to the OCR provider for PDF pages
    pub pdf_ocr_dpi: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 104_857_600,
            allowed_types: "pdf,ppt,pptx,txt,xlsx,docx,jpeg,jpg,png,md,html,zip".to_string(),
            forbidden_extensions: "exe,bat,cmd,sh,ps1,scr,vbs,js,jar".to_string(),
            filename_max_length: 200,
            on_duplicate: "use_existing".to_string(),
            pdf_ocr_min_chars: 80,
            pdf_ocr_dpi: 150,
        }
    }
}

impl UploadConfig {
    /// Allowed extensions, lowercased
    pub fn allowed_types_list(&self) -> Vec<String> {
        self.allowed_types
            .split(',')
            .map(|x| x.trim().to_lowercase())
            .filter(|x| !x.is_empty())
            .collect()
    }

    /// Forbidden extensions, lowercased
    pub fn forbidden_extensions_list(&self) -> Vec<String> {
        self.forbidden_extensions
            .split(',')
            .map(|x| x.trim().to_lowercase())
            .filter(|x| !x.is_empty())
            .collect()
    }
}

/// Per-user rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch
    pub enabled: bool,

    /// Daily upload count limit
    pub upload_per_day: i64,

    /// Daily conversation message limit
    pub conversation_per_day: i64,

    /// Search queries per second limit
    pub search_qps: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upload_per_day: 500,
            conversation_per_day: 200,
            search_qps: 10.0,
        }
    }
}

/// Read cache behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch
    pub enabled: bool,

    /// Common prefix for all cache keys
    pub key_prefix: String,

    /// TTL in seconds for dashboard stats and usage snapshots
    pub ttl_stats: i64,

    /// TTL in seconds for list endpoints
    pub ttl_list: i64,

    /// TTL in seconds for conversation detail
    pub ttl_conv: i64,

    /// TTL in seconds for single-entity detail
    pub ttl_detail: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "cache:".to_string(),
            ttl_stats: 60,
            ttl_list: 60,
            ttl_conv: 30,
            ttl_detail: 60,
        }
    }
}

/// Async task runner behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Submit is bounded by this timeout; on expiry the caller executes
    /// the job in-process and flags the outcome `sync = true`
    pub submit_timeout_secs: u64,

    /// Number of worker tasks draining the queue
    pub worker_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            submit_timeout_secs: 10,
            worker_concurrency: 2,
        }
    }
}

/// MCP tool server configurations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Map of server name to server configuration
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,

    /// Default timeout for tool calls in seconds
    pub default_timeout: u64,

    /// Maximum tool-calling rounds per chat turn
    pub max_tool_rounds: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: HashMap::new(),
            default_timeout: 30,
            max_tool_rounds: 5,
        }
    }
}

/// Individual MCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server endpoint URL (HTTP JSON-RPC)
    pub url: String,

    /// Authentication token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Connection timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Enable/disable this server
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RagConfig {
    /// Load configuration from a file (json, toml, yaml)
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Load configuration from the environment (`RAG_` prefix, `__`
    /// separator), on top of defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&RagConfig::default())?;
        let cfg = config::Config::builder()
            .add_source(defaults)
            .add_source(config::Environment::with_prefix("RAG").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(anyhow::anyhow!("chunk_size must be greater than 0"));
        }
        if self.chunking.max_expand_ratio < 1.0 {
            return Err(anyhow::anyhow!("max_expand_ratio must be at least 1.0"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(anyhow::anyhow!("chunk_overlap must be smaller than chunk_size"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.confidence_threshold) {
            return Err(anyhow::anyhow!(
                "confidence_threshold must be between 0.0 and 1.0"
            ));
        }
        if self.retrieval.rrf_k == 0 {
            return Err(anyhow::anyhow!("rrf_k must be greater than 0"));
        }
        if self.vector.backend != "milvus" && self.vector.backend != "qdrant" {
            return Err(anyhow::anyhow!(
                "unknown vector backend: {}",
                self.vector.backend
            ));
        }
        if self.vector.dimension == 0 {
            return Err(anyhow::anyhow!("vector dimension must be greater than 0"));
        }
        if self.embedding.batch_size == 0 {
            return Err(anyhow::anyhow!("embedding batch_size must be greater than 0"));
        }
        let policy = self.upload.on_duplicate.as_str();
        if policy != "use_existing" && policy != "overwrite" {
            return Err(anyhow::anyhow!("unknown duplicate policy: {}", policy));
        }
        if self.chat.context_message_count == 0 {
            return Err(anyhow::anyhow!(
                "context_message_count must be greater than 0"
            ));
        }
        Ok(())
    }
}
