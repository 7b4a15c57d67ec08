//! Cross-encoder reranking
//!
//! Second-stage scoring of (query, document) pairs. The client is
//! deliberately infallible: on any provider failure it returns the identity
//! order with a neutral score, and the retrieval engine keeps its RRF
//! ordering.

use crate::config::RerankConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One reranked document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
}

/// Scores (query, documents) pairs, best first
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Vec<RerankResult>;
}

fn identity_order(documents: &[String]) -> Vec<RerankResult> {
    documents
        .iter()
        .enumerate()
        .map(|(index, _)| RerankResult {
            index,
            relevance_score: 0.5,
        })
        .collect()
}

/// HTTP client for a DashScope-style text-rerank endpoint
pub struct HttpReranker {
    client: reqwest::Client,
    config: RerankConfig,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    input: RerankInput<'a>,
    parameters: RerankParameters,
}

#[derive(Debug, Serialize)]
struct RerankInput<'a> {
    query: &'a str,
    documents: &'a [String],
}

#[derive(Debug, Serialize)]
struct RerankParameters {
    return_documents: bool,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    output: RerankOutput,
}

#[derive(Debug, Deserialize)]
struct RerankOutput {
    #[serde(default)]
    results: Vec<RerankResult>,
}

impl HttpReranker {
    pub fn new(config: RerankConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/services/rerank/text-rerank/text-rerank",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn request(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> reqwest::Result<Vec<RerankResult>> {
        let request = RerankRequest {
            model: &self.config.model,
            input: RerankInput { query, documents },
            parameters: RerankParameters {
                return_documents: false,
                top_n: top_n.min(documents.len()),
            },
        };
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let parsed: RerankResponse = response.json().await?;
        Ok(parsed.output.results)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Vec<RerankResult> {
        if documents.is_empty() {
            return Vec::new();
        }
        match self.request(query, documents, top_n).await {
            Ok(results) if !results.is_empty() => {
                debug!("reranked {} documents", results.len());
                results
            }
            Ok(_) => {
                warn!("reranker returned no results, keeping original order");
                identity_order(documents)
            }
            Err(e) => {
                warn!("rerank failed: {}, keeping original order", e);
                identity_order(documents)
            }
        }
    }
}
