//! Milvus-compatible (Zilliz Cloud) adapter over the v2 REST API

use super::{VectorFilter, VectorHit, VectorPayload, VectorStore};
use crate::config::VectorConfig;
use crate::error::{Result, VectorError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct MilvusStore {
    client: reqwest::Client,
    config: VectorConfig,
}

#[derive(Debug, Deserialize)]
struct MilvusResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

impl MilvusStore {
    pub fn new(config: VectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v2/vectordb/{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<MilvusResponse> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VectorError::RequestFailed(format!("{}: {}", status, text)).into());
        }
        let parsed: MilvusResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;
        Ok(parsed)
    }

    fn render_filter(filter: &VectorFilter) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(kb_id) = filter.knowledge_base_id {
            clauses.push(format!("knowledge_base_id == {}", kb_id));
        }
        if let Some(file_id) = filter.file_id {
            clauses.push(format!("file_id == {}", file_id));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" && "))
        }
    }

    fn missing_collection(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("not found") || lower.contains("not exist") || lower.contains("can't find")
    }
}

#[async_trait]
impl VectorStore for MilvusStore {
    async fn ensure_collection(&self, dim: usize) -> Result<()> {
        let describe = self
            .post(
                "collections/describe",
                json!({ "collectionName": self.config.collection }),
            )
            .await;
        if let Ok(response) = &describe {
            if response.code == 0 && !response.data.is_null() {
                debug!("collection {} already exists", self.config.collection);
                return Ok(());
            }
        }

        info!(
            "creating collection {} with dimension {}",
            self.config.collection, dim
        );
        let response = self
            .post(
                "collections/create",
                json!({
                    "collectionName": self.config.collection,
                    "dimension": dim,
                    "metricType": "COSINE",
                    "idType": "Int64",
                    "autoId": false,
                    "enableDynamicField": true,
                }),
            )
            .await?;
        if response.code != 0 {
            return Err(VectorError::Backend(response.message).into());
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
        let data: Vec<Value> = ids
            .iter()
            .zip(vectors.iter())
            .zip(payloads.iter())
            .map(|((id, vector), payload)| {
                json!({
                    "id": id,
                    "vector": vector,
                    "chunk_id": payload.chunk_id,
                    "content": payload.content,
                    "file_id": payload.file_id,
                    "knowledge_base_id": payload.knowledge_base_id,
                    "chunk_index": payload.chunk_index,
                    "embedding_source": payload.embedding_source,
                })
            })
            .collect();
        let response = self
            .post(
                "entities/upsert",
                json!({ "collectionName": self.config.collection, "data": data }),
            )
            .await?;
        if response.code != 0 {
            return Err(VectorError::Backend(response.message).into());
        }
        debug!("upserted {} vectors", ids.len());
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        let mut body = json!({
            "collectionName": self.config.collection,
            "data": [vector],
            "limit": top_k,
            "outputFields": [
                "chunk_id", "content", "file_id", "knowledge_base_id",
                "chunk_index", "embedding_source"
            ],
        });
        if let Some(expr) = Self::render_filter(filter) {
            body["filter"] = json!(expr);
        }

        let response = self.post("entities/search", body).await?;
        if response.code != 0 {
            if Self::missing_collection(&response.message) {
                warn!("collection missing during search, returning empty result");
                return Ok(Vec::new());
            }
            return Err(VectorError::Backend(response.message).into());
        }

        let rows = response.data.as_array().cloned().unwrap_or_default();
        let hits = rows
            .iter()
            .filter_map(|row| {
                let id = row.get("id")?.as_i64()?;
                let distance = row
                    .get("distance")
                    .and_then(Value::as_f64)
                    .unwrap_or(2.0) as f32;
                let payload = serde_json::from_value::<VectorPayload>(row.clone()).ok();
                Some(VectorHit {
                    id,
                    distance,
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
        let id_list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let response = self
            .post(
                "entities/delete",
                json!({
                    "collectionName": self.config.collection,
                    "filter": format!("id in [{}]", id_list),
                }),
            )
            .await?;
        if response.code != 0 && !Self::missing_collection(&response.message) {
            return Err(VectorError::Backend(response.message).into());
        }
        debug!("deleted {} vectors", ids.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(url: String) -> MilvusStore {
        MilvusStore::new(VectorConfig {
            backend: "milvus".to_string(),
            url,
            collection: "test_collection".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_filter_rendering() {
        assert_eq!(MilvusStore::render_filter(&VectorFilter::default()), None);
        assert_eq!(
            MilvusStore::render_filter(&VectorFilter::for_knowledge_base(42)),
            Some("knowledge_base_id == 42".to_string())
        );
        let both = VectorFilter {
            knowledge_base_id: Some(1),
            file_id: Some(2),
        };
        assert_eq!(
            MilvusStore::render_filter(&both),
            Some("knowledge_base_id == 1 && file_id == 2".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_collection_search_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 100,
                "message": "collection not found[collection=test_collection]"
            })))
            .mount(&server)
            .await;

        let hits = store(server.uri())
            .search(&[0.1, 0.2], 5, &VectorFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_parses_hits_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/search"))
            .and(body_partial_json(
                serde_json::json!({ "filter": "knowledge_base_id == 7" }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": [{
                    "id": 99,
                    "distance": 0.25,
                    "chunk_id": 3,
                    "content": "片段",
                    "file_id": 5,
                    "knowledge_base_id": 7,
                    "chunk_index": 0,
                    "embedding_source": "text"
                }]
            })))
            .mount(&server)
            .await;

        let hits = store(server.uri())
            .search(&[0.1], 5, &VectorFilter::for_knowledge_base(7))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 99);
        assert!((hits[0].confidence() - 0.75).abs() < 1e-6);
        assert_eq!(hits[0].payload.as_ref().unwrap().chunk_id, 3);
    }

    #[tokio::test]
    async fn test_backend_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 65535,
                "message": "quota exceeded"
            })))
            .mount(&server)
            .await;

        let err = store(server.uri())
            .upsert(
                &[1],
                &[vec![0.1]],
                &[VectorPayload {
                    chunk_id: 1,
                    content: "x".into(),
                    file_id: 1,
                    knowledge_base_id: 1,
                    chunk_index: 0,
                    embedding_source: "text".into(),
                }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "vector");
    }
}
