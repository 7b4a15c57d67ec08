//! Qdrant-compatible adapter over the REST API

use super::{VectorFilter, VectorHit, VectorPayload, VectorStore};
use crate::config::VectorConfig;
use crate::error::{Result, VectorError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct QdrantStore {
    client: reqwest::Client,
    config: VectorConfig,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse {
    #[serde(default)]
    result: Value,
}

impl QdrantStore {
    pub fn new(config: VectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.config.url.trim_end_matches('/'),
            self.config.collection,
            path
        )
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            builder
        } else {
            builder.header("api-key", &self.config.api_key)
        }
    }

    fn render_filter(filter: &VectorFilter) -> Option<Value> {
        let mut must = Vec::new();
        if let Some(kb_id) = filter.knowledge_base_id {
            must.push(json!({ "key": "knowledge_base_id", "match": { "value": kb_id } }));
        }
        if let Some(file_id) = filter.file_id {
            must.push(json!({ "key": "file_id", "match": { "value": file_id } }));
        }
        if must.is_empty() {
            None
        } else {
            Some(json!({ "must": must }))
        }
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, dim: usize) -> Result<()> {
        let exists = self
            .authed(self.client.get(self.endpoint("")))
            .send()
            .await
            .map_err(|e| VectorError::RequestFailed(e.to_string()))?;
        if exists.status().is_success() {
            debug!("collection {} already exists", self.config.collection);
            return Ok(());
        }

        info!(
            "creating collection {} with dimension {}",
            self.config.collection, dim
        );
        let response = self
            .authed(self.client.put(self.endpoint("")))
            .json(&json!({ "vectors": { "size": dim, "distance": "Cosine" } }))
            .send()
            .await
            .map_err(|e| VectorError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(text).into());
        }
        Ok(())
    }

    async fn upsert(
        &self,
        ids: &[i64],
        vectors: &[Vec<f32>],
        payloads: &[VectorPayload],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = ids
            .iter()
            .zip(vectors.iter())
            .zip(payloads.iter())
            .map(|((id, vector), payload)| {
                json!({
                    "id": id,
                    "vector": vector,
                    "payload": payload,
                })
            })
            .collect();
        let response = self
            .authed(self.client.put(self.endpoint("/points")))
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(|e| VectorError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(text).into());
        }
        debug!("upserted {} points", ids.len());
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(rendered) = Self::render_filter(filter) {
            body["filter"] = rendered;
        }
        let response = self
            .authed(self.client.post(self.endpoint("/points/search")))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::RequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("collection missing during search, returning empty result");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(text).into());
        }

        let parsed: QdrantResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;
        let rows = parsed.result.as_array().cloned().unwrap_or_default();
        let hits = rows
            .iter()
            .filter_map(|row| {
                let id = row.get("id")?.as_i64()?;
                // Qdrant returns cosine similarity; convert to distance so
                // confidence math is backend-agnostic
                let score = row.get("score").and_then(Value::as_f64).unwrap_or(-1.0);
                let payload = row
                    .get("payload")
                    .and_then(|p| serde_json::from_value::<VectorPayload>(p.clone()).ok());
                Some(VectorHit {
                    id,
                    distance: (1.0 - score) as f32,
                    payload,
                })
            })
            .collect();
        Ok(hits)
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .authed(self.client.post(self.endpoint("/points/delete")))
            .json(&json!({ "points": ids }))
            .send()
            .await
            .map_err(|e| VectorError::RequestFailed(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(text).into());
        }
        debug!("deleted {} points", ids.len());
        Ok(())
    }
}
