//! Core entities of the RAG engine
//!
//! All cross-entity references are plain ids; nothing here materialises an
//! object graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "uploading" => FileStatus::Uploading,
            "processing" => FileStatus::Processing,
            "failed" => FileStatus::Failed,
            _ => FileStatus::Completed,
        }
    }
}

/// One uploaded file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub original_filename: String,
    pub file_type: String,
    pub file_size: i64,
    /// Content-addressed object store key: `<user_id>/<content_hash>/<name>`
    pub storage_key: String,
    /// sha256 hex of the file bytes; the dedup key
    pub content_hash: String,
    pub status: FileStatus,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// True for the image types that are indexed via OCR + image embedding
    pub fn is_image(&self) -> bool {
        matches!(self.file_type.as_str(), "jpeg" | "jpg" | "png")
    }
}

/// A retrieval scope owned by one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Per-KB chunking overrides; `None` falls back to the global config
    pub chunk_size: Option<i64>,
    pub chunk_overlap: Option<i64>,
    pub chunk_max_expand_ratio: Option<f64>,
    /// Enable lexical (BM25) retrieval alongside dense search
    pub use_hybrid: bool,
    /// Enable cross-encoder reranking
    pub use_rerank: bool,
    pub file_count: i64,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Many-to-many link between a knowledge base and a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbFileLink {
    pub id: i64,
    pub knowledge_base_id: i64,
    pub file_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Which modality produced a chunk's vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Text,
    Image,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingSource::Text => "text",
            EmbeddingSource::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => EmbeddingSource::Image,
            _ => EmbeddingSource::Text,
        }
    }
}

/// An indexed unit of text with a dense position within its file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub file_id: i64,
    pub knowledge_base_id: i64,
    pub content: String,
    pub chunk_index: i64,
    pub embedding_source: EmbeddingSource,
    /// Deterministic function of `id`; stored for reverse lookup but always
    /// recomputable, so deletion never needs a side-table
    pub vector_id: i64,
    pub created_at: DateTime<Utc>,
}

/// A chat session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    pub knowledge_base_id: Option<i64>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of one conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => MessageRole::User,
            "system" => MessageRole::System,
            "tool" => MessageRole::Tool,
            _ => MessageRole::Assistant,
        }
    }
}

/// One turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub tokens: i64,
    pub model: Option<String>,
    /// Retrieval confidence in [0, 1]; `None` when the turn had no real
    /// retrieval result
    pub confidence: Option<f64>,
    /// Stored only for low-confidence turns, for later inspection
    pub retrieved_context: Option<String>,
    /// Text of the single highest-scoring chunk
    pub max_confidence_context: Option<String>,
    /// JSON array of [`Citation`]
    pub sources: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Citation metadata attached to an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub file_id: i64,
    pub original_filename: String,
    pub chunk_index: i64,
    /// Leading snippet of the cited chunk, at most 200 characters
    pub snippet: String,
}

impl Citation {
    pub fn from_chunk(chunk: &Chunk, original_filename: &str) -> Self {
        Self {
            file_id: chunk.file_id,
            original_filename: original_filename.to_string(),
            chunk_index: chunk.chunk_index,
            snippet: chunk.content.chars().take(200).collect(),
        }
    }
}

/// Derive a conversation title from the first user message
pub fn derive_title(message: &str) -> String {
    message.chars().take(50).collect()
}
