//! Vector store adapters
//!
//! One trait, two wire implementations (Milvus-compatible and
//! Qdrant-compatible), chosen once at startup. Backend-specific filter
//! syntax never leaks out: callers pass a typed [`VectorFilter`] and each
//! adapter renders it.

pub mod milvus;
pub mod qdrant;

use crate::config::VectorConfig;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Scalar payload stored alongside each vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub chunk_id: i64,
    /// First 1000 characters of the chunk, enough for previews
    pub content: String,
    pub file_id: i64,
    pub knowledge_base_id: i64,
    pub chunk_index: i64,
    pub embedding_source: String,
}

/// Typed search filter; each backend renders its own expression syntax
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub knowledge_base_id: Option<i64>,
    pub file_id: Option<i64>,
}

impl VectorFilter {
    pub fn for_knowledge_base(kb_id: i64) -> Self {
        Self {
            knowledge_base_id: Some(kb_id),
            file_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.knowledge_base_id.is_none() && self.file_id.is_none()
    }
}

/// One search hit. `distance` is cosine-like: smaller is closer, and
/// `confidence = clamp(1 - distance, 0, 1)` downstream.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: i64,
    pub distance: f32,
    pub payload: Option<VectorPayload>,
}

impl VectorHit {
    pub fn confidence(&self) -> f64 {
        (1.0 - self.distance as f64).clamp(0.0, 1.0)
    }
}

/// Vector index behind a common interface
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if missing, with the given dimension and
    /// cosine metric
    async fn ensure_collection(&self, dim: usize) -> Result<()>;

    /// Insert or replace vectors with their scalar payloads
    async fn upsert(
        &self,
        ids: &[i64],
        vectors: &[Vec<f32>],
        payloads: &[VectorPayload],
    ) -> Result<()>;

    /// Similarity search. A missing collection yields an empty result, not
    /// an error; any other transport failure surfaces to the caller.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>>;

    /// Delete by id; unknown ids are ignored
    async fn delete(&self, ids: &[i64]) -> Result<()>;
}

/// Deterministic vector id: the first 8 bytes (big-endian) of
/// `sha256(decimal chunk id)`, reduced mod 2^63.
///
/// Because this is a pure function of the chunk id, deletion can compute
/// the ids to remove without a lookup and re-ingestion is idempotent per
/// chunk id. The mapping must stay stable across versions or the store has
/// to be rebuilt.
pub fn vector_id_for_chunk(chunk_id: i64) -> i64 {
    let digest = Sha256::digest(chunk_id.to_string().as_bytes());
    let prefix: [u8; 8] = digest[..8].try_into().expect("sha256 yields 32 bytes");
    (u64::from_be_bytes(prefix) % (1u64 << 63)) as i64
}

/// Select the process-wide backend from config
pub fn build_store(config: &VectorConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "milvus" => Ok(Arc::new(milvus::MilvusStore::new(config.clone()))),
        "qdrant" => Ok(Arc::new(qdrant::QdrantStore::new(config.clone()))),
        other => Err(RagError::Config(format!("unknown vector backend: {}", other))),
    }
}
