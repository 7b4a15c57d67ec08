//! Embedding client
//!
//! Text and image inputs share one output space, which is what makes
//! image-by-image and text-to-image search work on the same index. The
//! provider's observed dimension is authoritative; callers probe it and
//! pass it to the vector store when (re)creating a collection.

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Produces fixed-dimension vectors for texts and images
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; the result has one vector per input, in order
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed one image given its raw bytes and format ("jpeg", "png")
    async fn embed_image(&self, bytes: &[u8], format: &str) -> Result<Vec<f32>>;

    /// Embed a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.default_dimension()]);
        }
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::RequestFailed("empty embedding batch".into()).into())
    }

    /// Dimension used for zero vectors before the provider has been observed
    fn default_dimension(&self) -> usize;

    /// Observe the provider's native dimension with a probe input.
    /// Falls back to the configured default when the provider is down.
    async fn probe_dimension(&self) -> usize {
        match self.embed_texts(&["test".to_string()]).await {
            Ok(vectors) if !vectors.is_empty() && !vectors[0].is_empty() => vectors[0].len(),
            _ => {
                warn!("dimension probe failed, using configured default");
                self.default_dimension()
            }
        }
    }
}

/// HTTP client for a DashScope-style multimodal embedding endpoint
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: EmbedInput,
}

#[derive(Debug, Serialize)]
struct EmbedInput {
    contents: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    output: EmbedOutput,
}

#[derive(Debug, Deserialize)]
struct EmbedOutput {
    #[serde(default)]
    embeddings: Vec<EmbedEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbedEntry {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/services/embeddings/multimodal-embedding/multimodal-embedding",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn request_batch(&self, contents: Vec<serde_json::Value>) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: self.config.model.clone(),
            input: EmbedInput { contents },
        };
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout
                } else {
                    EmbeddingError::RequestFailed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::RequestFailed(format!("{}: {}", status, body)).into());
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::RequestFailed(e.to_string()))?;
        Ok(parsed
            .output
            .embeddings
            .into_iter()
            .map(|entry| entry.embedding)
            .collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // Blank inputs are sent as a single space so the batch stays aligned
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| {
                let trimmed = t.trim();
                if trimmed.is_empty() {
                    " ".to_string()
                } else {
                    trimmed.chars().take(self.config.max_input_chars).collect()
                }
            })
            .collect();

        let mut all = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.config.batch_size) {
            let contents = batch
                .iter()
                .map(|text| serde_json::json!({ "text": text }))
                .collect();
            let vectors = self.request_batch(contents).await?;
            all.extend(vectors);
        }
        if all.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: all.len(),
            }
            .into());
        }
        debug!("embedded {} texts", all.len());
        Ok(all)
    }

    async fn embed_image(&self, bytes: &[u8], format: &str) -> Result<Vec<f32>> {
        if bytes.is_empty() {
            return Ok(vec![0.0; self.config.default_dimension]);
        }
        let fmt = format.to_lowercase().replace("jpg", "jpeg");
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let data_url = format!("data:image/{};base64,{}", fmt, b64);
        let mut vectors = self
            .request_batch(vec![serde_json::json!({ "image": data_url })])
            .await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::RequestFailed("no image embedding returned".into()).into())
    }

    fn default_dimension(&self) -> usize {
        self.config.default_dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> EmbeddingConfig {
        EmbeddingConfig {
            base_url,
            batch_size: 2,
            default_dimension: 4,
            ..Default::default()
        }
    }

    fn embedding_body(count: usize) -> serde_json::Value {
        let embeddings: Vec<_> = (0..count)
            .map(|i| serde_json::json!({ "embedding": [i as f32, 0.0, 0.0, 1.0] }))
            .collect();
        serde_json::json!({ "output": { "embeddings": embeddings } })
    }

    #[tokio::test]
    async fn test_batching_respects_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/services/embeddings/multimodal-embedding/multimodal-embedding",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(2)))
            .expect(2)
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri()));
        let texts: Vec<String> = (0..4).map(|i| format!("text {}", i)).collect();
        let vectors = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0].len(), 4);
    }

    #[tokio::test]
    async fn test_oversize_text_truncated() {
        let server = MockServer::start().await;
        let mut cfg = config(server.uri());
        cfg.max_input_chars = 10;
        Mock::given(method("POST"))
            .and(body_partial_json(
                serde_json::json!({ "input": { "contents": [ { "text": "aaaaaaaaaa" } ] } }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(1)))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(cfg);
        let vectors = embedder.embed_texts(&["a".repeat(50)]).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_zero_vector() {
        let server = MockServer::start().await;
        let embedder = HttpEmbedder::new(config(server.uri()));
        let vector = embedder.embed_text("   ").await.unwrap();
        assert_eq!(vector, vec![0.0; 4]);
    }

    #[tokio::test]
    async fn test_provider_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri()));
        let err = embedder.embed_texts(&["x".to_string()]).await.unwrap_err();
        assert_eq!(err.category(), "embedding");
    }

    #[tokio::test]
    async fn test_probe_dimension_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri()));
        assert_eq!(embedder.probe_dimension().await, 4);
    }

    #[tokio::test]
    async fn test_image_data_url_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(1)))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri()));
        let vector = embedder.embed_image(&[1, 2, 3], "jpg").await.unwrap();
        assert_eq!(vector.len(), 4);
    }
}
