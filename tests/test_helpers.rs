//! Test helpers: in-memory backends for the external collaborators
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use the_library::cache::CacheService;
use the_library::chat::ChatService;
use the_library::config::RagConfig;
use the_library::db::Database;
use the_library::embedding::Embedder;
use the_library::error::Result;
use the_library::files::FileService;
use the_library::knowledge::KnowledgeBaseService;
use the_library::llm::{AssistantTurn, ChatMessage, LanguageModel, TokenStream, ToolDefinition};
use the_library::object_store::FsObjectStore;
use the_library::ocr::OcrEngine;
use the_library::rerank::{Reranker, RerankResult};
use the_library::retrieval::RetrievalEngine;
use the_library::vector::{VectorFilter, VectorHit, VectorPayload, VectorStore};

pub const EMBED_DIM: usize = 16;

/// Deterministic bag-of-words embedding: texts sharing words are close in
/// cosine space, which is all the tests need.
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBED_DIM];
    for token in the_library::bm25::tokenize(text) {
        let mut hash = 5381u64;
        for byte in token.as_bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(*byte as u64);
        }
        vector[(hash % EMBED_DIM as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

pub struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed(t)).collect())
    }

    async fn embed_image(&self, bytes: &[u8], _format: &str) -> Result<Vec<f32>> {
        // Images embed by their bytes so the same bytes land on the same
        // vector, mirroring the shared text/image space
        let pseudo_text = format!("image_{}", bytes.len());
        Ok(embed(&pseudo_text))
    }

    fn default_dimension(&self) -> usize {
        EMBED_DIM
    }
}

/// Cosine-scoring in-memory vector index
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: Mutex<HashMap<i64, (Vec<f32>, VectorPayload)>>,
}

impl InMemoryVectorStore {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn payload(&self, id: i64) -> Option<VectorPayload> {
        self.entries.lock().unwrap().get(&id).map(|(_, p)| p.clone())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, _dim: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(
        &self,
        ids: &[i64],
        vectors: &[Vec<f32>],
        payloads: &[VectorPayload],
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for ((id, vector), payload) in ids.iter().zip(vectors).zip(payloads) {
            entries.insert(*id, (vector.clone(), payload.clone()));
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        let entries = self.entries.lock().unwrap();
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, (_, payload))| {
                filter
                    .knowledge_base_id
                    .map_or(true, |kb| payload.knowledge_base_id == kb)
                    && filter.file_id.map_or(true, |f| payload.file_id == f)
            })
            .map(|(id, (stored, payload))| VectorHit {
                id: *id,
                distance: 1.0 - cosine(vector, stored),
                payload: Some(payload.clone()),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap());
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }
}

pub struct StubOcr {
    pub text: String,
}

#[async_trait]
impl OcrEngine for StubOcr {
    async fn extract_text_from_image(&self, _bytes: &[u8], _format: &str) -> String {
        self.text.clone()
    }
}

/// Scores candidates by query-token overlap, descending, like a real
/// cross-encoder would for these tiny fixtures
pub struct OverlapReranker;

#[async_trait]
impl Reranker for OverlapReranker {
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Vec<RerankResult> {
        let q_tokens = the_library::bm25::tokenize(query);
        let mut scored: Vec<RerankResult> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let d_tokens = the_library::bm25::tokenize(doc);
                let overlap = q_tokens.iter().filter(|t| d_tokens.contains(t)).count();
                let denom = q_tokens.len().max(1);
                RerankResult {
                    index,
                    relevance_score: overlap as f64 / denom as f64,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.relevance_score.partial_cmp(&a.relevance_score).unwrap());
        scored.truncate(top_n);
        scored
    }
}

/// Scripted language model: fixed reply, paced token stream, optional hard
/// failure
pub struct StubLlm {
    pub reply: String,
    pub tokens: Vec<String>,
    pub fail: bool,
    pub token_delay_ms: u64,
}

impl Default for StubLlm {
    fn default() -> Self {
        Self {
            reply: "这是模型的回答。".to_string(),
            tokens: vec!["这是".into(), "模型的".into(), "回答".into(), "。".into()],
            fail: false,
            token_delay_ms: 0,
        }
    }
}

#[async_trait]
impl LanguageModel for StubLlm {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        if self.fail {
            return Err(the_library::error::LlmError::ConnectionFailed("stub down".into()).into());
        }
        Ok(self.reply.clone())
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<AssistantTurn> {
        Ok(AssistantTurn {
            content: Some(self.chat(messages).await?),
            tool_calls: Vec::new(),
        })
    }

    async fn chat_stream(&self, _messages: Vec<ChatMessage>) -> Result<TokenStream> {
        if self.fail {
            return Err(the_library::error::LlmError::ConnectionFailed("stub down".into()).into());
        }
        let tokens = self.tokens.clone();
        let delay = self.token_delay_ms;
        let stream = futures::stream::iter(tokens).then(move |token| async move {
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            Ok(token)
        });
        Ok(stream.boxed())
    }

    fn model_id(&self) -> &str {
        "stub-model"
    }

    async fn query_expand(&self, _question: &str, _count: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Everything wired together over in-memory backends
pub struct TestContext {
    pub db: Database,
    pub files: FileService,
    pub kb: KnowledgeBaseService,
    pub retrieval: RetrievalEngine,
    pub chat: ChatService,
    pub cache: CacheService,
    pub vectors: Arc<InMemoryVectorStore>,
    pub config: RagConfig,
    _objects_dir: tempfile::TempDir,
}

pub async fn build_context() -> TestContext {
    build_context_with(RagConfig::default(), StubLlm::default(), "黑板上写着欢迎。".to_string())
        .await
}

pub async fn build_context_with(
    mut config: RagConfig,
    llm: StubLlm,
    ocr_text: String,
) -> TestContext {
    // Small chunks keep fixtures readable
    config.chunking.chunk_size = 60;
    config.chunking.chunk_overlap = 0;
    config.embedding.default_dimension = EMBED_DIM;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::connect_in_memory().await.unwrap();
    let vectors = Arc::new(InMemoryVectorStore::default());
    let embedder = Arc::new(StubEmbedder);
    let ocr = Arc::new(StubOcr { text: ocr_text });
    let llm: Arc<dyn LanguageModel> = Arc::new(llm);
    let reranker = Arc::new(OverlapReranker);

    let files = FileService::new(
        db.clone(),
        Arc::new(FsObjectStore::new(dir.path())),
        vectors.clone(),
        config.upload.clone(),
    );
    let kb = KnowledgeBaseService::new(
        db.clone(),
        files.clone(),
        vectors.clone(),
        embedder.clone(),
        ocr,
        config.chunking.clone(),
        config.upload.clone(),
    );
    let retrieval = RetrievalEngine::new(
        db.clone(),
        vectors.clone(),
        embedder,
        reranker,
        llm.clone(),
        config.retrieval.clone(),
    );
    let cache = CacheService::new(db.clone(), config.cache.clone(), config.rate_limit.clone());
    let chat = ChatService::new(
        db.clone(),
        retrieval.clone(),
        llm,
        None,
        cache.clone(),
        config.chat.clone(),
    );

    TestContext {
        db,
        files,
        kb,
        retrieval,
        chat,
        cache,
        vectors,
        config,
        _objects_dir: dir,
    }
}
