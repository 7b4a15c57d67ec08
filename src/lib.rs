//! The Library
//!
//! A multi-tenant Retrieval-Augmented Generation engine that integrates:
//! - Document ingestion: extraction (PDF/OOXML/HTML/images/zip), sentence-
//!   aware chunking, batched embeddings, and transactional indexing
//! - Hybrid retrieval: multi-query expansion, dense + BM25 search fused
//!   with RRF, cross-encoder reranking, and neighbour-window expansion
//! - Chat orchestration: conversation persistence, history summarisation,
//!   MCP tool calling, and streamed token delivery
//!
//! # Example
//!
//! ```rust,no_run
//! use the_library::config::RagConfig;
//! use the_library::db::Database;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RagConfig::from_env()?;
//!     config.validate()?;
//!     let db = Database::connect(&config.database).await?;
//!     let _vectors = the_library::vector::build_store(&config.vector)?;
//!     // wire FileService / KnowledgeBaseService / ChatService from here
//!     let _ = db;
//!     Ok(())
//! }
//! ```

pub mod bm25;
pub mod cache;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod files;
pub mod knowledge;
pub mod llm;
pub mod mcp;
pub mod models;
pub mod object_store;
pub mod ocr;
pub mod queue;
pub mod rerank;
pub mod retrieval;
pub mod sse;
pub mod vector;

// Re-export main types
pub use cache::{CacheService, UsageSnapshot};
pub use chat::{CancelHandle, ChatEvent, ChatOutcome, ChatService};
pub use chunker::Chunker;
pub use config::RagConfig;
pub use db::Database;
pub use embedding::{Embedder, HttpEmbedder};
pub use error::{RagError, Result};
pub use files::{FileListPage, FileService};
pub use knowledge::{
    ImageSearchHit, IngestEvent, KbParams, KnowledgeBaseService, ReindexSummary, SkippedFile,
};
pub use llm::{HttpLlm, LanguageModel};
pub use mcp::McpClient;
pub use models::{
    Chunk, Citation, Conversation, EmbeddingSource, FileRecord, FileStatus, KnowledgeBase,
    Message, MessageRole,
};
pub use object_store::{FsObjectStore, ObjectStore};
pub use ocr::{HttpOcr, OcrEngine};
pub use queue::{SubmitOutcome, TaskKind, TaskRunner, TaskState, TaskStatus};
pub use rerank::{HttpReranker, Reranker};
pub use retrieval::{RetrievalEngine, RetrievalScope, RetrievedContext};
pub use vector::{vector_id_for_chunk, VectorFilter, VectorPayload, VectorStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
