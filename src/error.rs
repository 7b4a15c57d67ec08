//! Error handling for the RAG engine

use thiserror::Error;

/// Result type alias for the RAG engine
pub type Result<T> = std::result::Result<T, RagError>;

/// Main error type for the RAG engine
#[derive(Error, Debug)]
pub enum RagError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("data integrity error: {0}")]
    Integrity(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),

    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("object store error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the chat/vision language model providers
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timeout: generation took too long")]
    Timeout,
}

/// Errors from the embedding provider
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("embedding count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("timeout: embedding request took too long")]
    Timeout,
}

/// Errors from the vector store backends
#[derive(Error, Debug)]
pub enum VectorError {
    #[error("collection not found: {0}")]
    CollectionMissing(String),

    #[error("dimension mismatch: collection has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors from the OCR provider
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("empty result after retries")]
    EmptyResult,
}

/// Errors from document text extraction
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Errors from the async task runner
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("submit timed out")]
    SubmitTimeout,

    #[error("task not found: {0}")]
    TaskNotFound(String),
}

impl RagError {
    /// Check if the error is retryable. Retries must only be applied to
    /// idempotent operations (reads, deterministic-id upserts).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Llm(LlmError::Timeout)
                | RagError::Llm(LlmError::ConnectionFailed(_))
                | RagError::Embedding(EmbeddingError::Timeout)
                | RagError::Vector(VectorError::RequestFailed(_))
                | RagError::Http(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::NotFound(_) => "not_found",
            RagError::RateLimited(_) => "rate_limit",
            RagError::Integrity(_) => "integrity",
            RagError::Llm(_) => "llm",
            RagError::Embedding(_) => "embedding",
            RagError::Vector(_) => "vector",
            RagError::Ocr(_) => "ocr",
            RagError::Extract(_) => "extract",
            RagError::Queue(_) => "queue",
            RagError::Mcp(_) => "mcp",
            RagError::Storage(_) => "storage",
            RagError::Config(_) => "config",
            RagError::Database(_) => "database",
            RagError::Http(_) => "http",
            RagError::Serialization(_) => "serialization",
            RagError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_error = RagError::Llm(LlmError::Timeout);
        assert!(timeout_error.is_retryable());

        let validation_error = RagError::Validation("bad filename".to_string());
        assert!(!validation_error.is_retryable());

        let integrity_error = RagError::Integrity("count mismatch".to_string());
        assert!(!integrity_error.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let llm_error = RagError::Llm(LlmError::Timeout);
        assert_eq!(llm_error.category(), "llm");

        let vector_error = RagError::Vector(VectorError::CollectionMissing("kb".into()));
        assert_eq!(vector_error.category(), "vector");

        let not_found = RagError::NotFound("knowledge base 42".into());
        assert_eq!(not_found.category(), "not_found");
    }
}
