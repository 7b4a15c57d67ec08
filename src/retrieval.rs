//! Hybrid retrieval engine
//!
//! Composes multi-query expansion, dense vector search, lexical BM25
//! search, Reciprocal Rank Fusion, cross-encoder reranking, and
//! neighbour-chunk window expansion into one ranked context with a numeric
//! confidence. Every stage degrades independently: a vector miss leaves
//! the lexical path, a reranker failure leaves the RRF order, and an empty
//! single-KB result falls back to the KB's leading chunks at low
//! confidence so "no match" is distinguishable from "empty KB".

use crate::bm25;
use crate::config::RetrievalConfig;
use crate::db::{chunk_from_row, kb_from_row, Database};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::llm::LanguageModel;
use crate::models::{Chunk, KnowledgeBase};
use crate::rerank::Reranker;
use crate::vector::{VectorFilter, VectorStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// What to search: one knowledge base, or everything a user owns
#[derive(Debug, Clone)]
pub enum RetrievalScope {
    KnowledgeBase(i64),
    AllKnowledgeBases { user_id: i64 },
}

/// Ranked context produced by one retrieval
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    /// Chunk texts joined with blank lines, truncated to 8000 chars
    pub context: String,
    /// Unit-interval retrieval quality estimate
    pub confidence: f64,
    /// Text of the single highest-scoring chunk
    pub best_single_context: Option<String>,
    /// Selected chunks (window-expanded), in concatenation order
    pub chunks: Vec<Chunk>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.context.trim().is_empty()
    }
}

const CONTEXT_CHAR_LIMIT: usize = 8000;
const LEXICAL_KEYWORD_LIMIT: usize = 8;
const FALLBACK_CHUNK_COUNT: i64 = 20;
const FALLBACK_CONFIDENCE: f64 = 0.5;

#[derive(Clone)]
pub struct RetrievalEngine {
    db: Database,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    llm: Arc<dyn LanguageModel>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        db: Database,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        llm: Arc<dyn LanguageModel>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            vectors,
            embedder,
            reranker,
            llm,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve a ranked context for `query` within `scope`
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
        top_k: usize,
    ) -> Result<RetrievedContext> {
        let top_k = top_k.max(1);

        // Per-KB toggles apply to a single-KB scope; the all-KBs path has
        // no single KB to consult and runs the full hybrid pipeline.
        let (kb_ids, use_hybrid, use_rerank) = match scope {
            RetrievalScope::KnowledgeBase(kb_id) => {
                let Some(kb) = self.load_kb(*kb_id).await? else {
                    return Ok(RetrievedContext::default());
                };
                (vec![kb.id], kb.use_hybrid, kb.use_rerank)
            }
            RetrievalScope::AllKnowledgeBases { user_id } => {
                let ids: Vec<i64> =
                    sqlx::query_scalar("SELECT id FROM knowledge_bases WHERE user_id = ?1")
                        .bind(user_id)
                        .fetch_all(self.db.pool())
                        .await?;
                if ids.is_empty() {
                    return Ok(RetrievedContext::default());
                }
                (ids, true, true)
            }
        };

        // 1. Multi-query expansion: the original query always leads
        let mut queries = vec![query.to_string()];
        if self.config.query_expand {
            queries.extend(
                self.llm
                    .query_expand(query, self.config.query_expand_count)
                    .await,
            );
        }

        // 2 + 3. Dense and lexical ranked lists, one pair per query
        let mut ranked_lists: Vec<Vec<i64>> = Vec::new();
        let mut chunk_map: HashMap<i64, Chunk> = HashMap::new();
        for q in &queries {
            match self.dense_ranked(q, scope, &kb_ids, top_k).await {
                Ok(list) => {
                    if !list.is_empty() {
                        for chunk in &list {
                            chunk_map.entry(chunk.id).or_insert_with(|| chunk.clone());
                        }
                        ranked_lists.push(list.iter().map(|c| c.id).collect());
                    }
                }
                Err(e) => warn!("dense retrieval failed: {}", e),
            }
            if use_hybrid {
                match self.lexical_ranked(q, &kb_ids, top_k).await {
                    Ok(list) => {
                        if !list.is_empty() {
                            for chunk in &list {
                                chunk_map.entry(chunk.id).or_insert_with(|| chunk.clone());
                            }
                            ranked_lists.push(list.iter().map(|c| c.id).collect());
                        }
                    }
                    Err(e) => warn!("lexical retrieval failed: {}", e),
                }
            }
        }

        if ranked_lists.is_empty() {
            return self.fallback(scope, top_k).await;
        }

        // 4. Reciprocal Rank Fusion; ties broken by ascending chunk id
        let rrf_k = self.config.rrf_k as f64;
        let mut rrf: HashMap<i64, f64> = HashMap::new();
        for list in &ranked_lists {
            for (rank0, chunk_id) in list.iter().enumerate() {
                *rrf.entry(*chunk_id).or_insert(0.0) += 1.0 / (rrf_k + (rank0 + 1) as f64);
            }
        }
        let mut fused: Vec<(i64, f64)> = rrf.into_iter().collect();
        fused.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        fused.truncate(top_k * 2);

        // 5. Rerank (or keep the RRF order)
        let mut selected: Vec<(Chunk, f64, f64)> = Vec::new(); // (chunk, rerank, rrf)
        if use_rerank {
            let documents: Vec<String> = fused
                .iter()
                .filter_map(|(id, _)| chunk_map.get(id).map(|c| c.content.clone()))
                .collect();
            let results = self.reranker.rerank(query, &documents, top_k).await;
            for result in results {
                if let Some((chunk_id, rrf_score)) = fused.get(result.index) {
                    if let Some(chunk) = chunk_map.get(chunk_id) {
                        selected.push((chunk.clone(), result.relevance_score, *rrf_score));
                    }
                }
            }
        }
        if selected.is_empty() {
            for (chunk_id, rrf_score) in fused.iter().take(top_k) {
                if let Some(chunk) = chunk_map.get(chunk_id) {
                    selected.push((chunk.clone(), 0.0, *rrf_score));
                }
            }
        }
        selected.truncate(top_k);
        if selected.is_empty() {
            return self.fallback(scope, top_k).await;
        }

        // 7. Confidence: best rerank score, or derived from RRF
        let max_rel = selected.iter().map(|(_, rel, _)| *rel).fold(0.0, f64::max);
        let confidence = if max_rel > 0.0 {
            max_rel
        } else {
            let max_rrf = selected.iter().map(|(_, _, s)| *s).fold(0.0, f64::max);
            (max_rrf * rrf_k).min(1.0)
        };
        let best_single_context = selected
            .iter()
            .max_by(|a, b| {
                (a.1, a.2)
                    .partial_cmp(&(b.1, b.2))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(chunk, _, _)| chunk.content.clone());

        // 6. Window expansion, then assembly in (file_id, chunk_index) order
        let ordered = self
            .expand_windows(selected.iter().map(|(c, _, _)| c.clone()).collect())
            .await?;
        let context = join_and_truncate(&ordered);

        debug!(
            "retrieved {} chunks (confidence {:.2})",
            ordered.len(),
            confidence
        );
        Ok(RetrievedContext {
            context,
            confidence,
            best_single_context,
            chunks: ordered,
        })
    }

    async fn load_kb(&self, kb_id: i64) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?1")
            .bind(kb_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|row| kb_from_row(&row)))
    }

    /// Dense search: embed the query, search the vector store (KB-filtered
    /// for a single-KB scope), and resolve hits back to chunk rows in hit
    /// order. Keeps `top_k * 3` hits.
    async fn dense_ranked(
        &self,
        query: &str,
        scope: &RetrievalScope,
        kb_ids: &[i64],
        top_k: usize,
    ) -> Result<Vec<Chunk>> {
        let vector = self.embedder.embed_text(query).await?;
        let filter = match scope {
            RetrievalScope::KnowledgeBase(kb_id) => VectorFilter::for_knowledge_base(*kb_id),
            RetrievalScope::AllKnowledgeBases { .. } => VectorFilter::default(),
        };
        let hits = self.vectors.search(&vector, top_k * 3, &filter).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let vector_ids: Vec<i64> = hits.iter().map(|hit| hit.id).collect();
        let id_list = join_ids(&vector_ids);
        let kb_list = join_ids(kb_ids);
        let rows = sqlx::query(&format!(
            "SELECT * FROM chunks WHERE vector_id IN ({}) AND knowledge_base_id IN ({})",
            id_list, kb_list
        ))
        .fetch_all(self.db.pool())
        .await?;
        let by_vector: HashMap<i64, Chunk> = rows
            .iter()
            .map(chunk_from_row)
            .map(|chunk| (chunk.vector_id, chunk))
            .collect();

        // Hit order is the rank order; hits without a surviving row drop out
        Ok(vector_ids
            .iter()
            .filter_map(|vid| by_vector.get(vid).cloned())
            .collect())
    }

    /// Lexical search: tokenised keywords drive a LIKE candidate pool which
    /// BM25 (or plain keyword counting) ranks. Keeps `top_k * 3`.
    async fn lexical_ranked(&self, query: &str, kb_ids: &[i64], top_k: usize) -> Result<Vec<Chunk>> {
        let mut keywords = bm25::tokenize(query);
        keywords.truncate(LEXICAL_KEYWORD_LIMIT);
        if keywords.is_empty() {
            keywords.push(query.trim().to_string());
        }

        let kb_list = join_ids(kb_ids);
        let conditions: Vec<String> = (0..keywords.len())
            .map(|i| format!("content LIKE ?{} ESCAPE '\\'", i + 1))
            .collect();
        let sql = format!(
            "SELECT * FROM chunks WHERE knowledge_base_id IN ({}) AND content != '' AND ({}) LIMIT {}",
            kb_list,
            conditions.join(" OR "),
            top_k * 10
        );
        let mut query_builder = sqlx::query(&sql);
        for keyword in &keywords {
            query_builder = query_builder.bind(format!("%{}%", escape_like(keyword)));
        }
        let rows = query_builder.fetch_all(self.db.pool()).await?;
        let candidates: Vec<(Chunk, String)> = rows
            .iter()
            .map(chunk_from_row)
            .map(|chunk| {
                let content = chunk.content.clone();
                (chunk, content)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ranked = if self.config.use_bm25 {
            bm25::rank(query, candidates)
        } else {
            // Keyword-count fallback scoring
            let mut scored: Vec<(Chunk, f64)> = candidates
                .into_iter()
                .map(|(chunk, content)| {
                    let lower = content.to_lowercase();
                    let score = keywords
                        .iter()
                        .filter(|k| lower.contains(&k.to_lowercase()))
                        .count() as f64;
                    (chunk, score)
                })
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored
        };

        Ok(ranked
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .take(top_k * 3)
            .map(|(chunk, _)| chunk)
            .collect())
    }

    /// Include the ±N neighbours of each selected chunk within its file,
    /// deduplicated, in (file_id, chunk_index) order.
    async fn expand_windows(&self, selected: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let n = self.config.context_window_expand;
        let mut all: Vec<Chunk> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();

        if n > 0 {
            for chunk in &selected {
                let rows = sqlx::query(
                    r#"
                    SELECT * FROM chunks
                    WHERE file_id = ?1 AND knowledge_base_id = ?2
                      AND chunk_index BETWEEN ?3 AND ?4
                    ORDER BY chunk_index
                    "#,
                )
                .bind(chunk.file_id)
                .bind(chunk.knowledge_base_id)
                .bind(chunk.chunk_index - n)
                .bind(chunk.chunk_index + n)
                .fetch_all(self.db.pool())
                .await?;
                for neighbour in rows.iter().map(chunk_from_row) {
                    if seen.insert(neighbour.id) {
                        all.push(neighbour);
                    }
                }
            }
        } else {
            for chunk in selected {
                if seen.insert(chunk.id) {
                    all.push(chunk);
                }
            }
        }

        all.sort_by_key(|chunk| (chunk.file_id, chunk.chunk_index));
        Ok(all)
    }

    /// Empty-result fallback for a single-KB query: the KB's first chunks
    /// at a deliberately low confidence. An empty KB yields an empty
    /// result, which callers report differently.
    async fn fallback(&self, scope: &RetrievalScope, _top_k: usize) -> Result<RetrievedContext> {
        let RetrievalScope::KnowledgeBase(kb_id) = scope else {
            return Ok(RetrievedContext::default());
        };
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE knowledge_base_id = ?1 AND content != '' ORDER BY id LIMIT ?2",
        )
        .bind(kb_id)
        .bind(FALLBACK_CHUNK_COUNT)
        .fetch_all(self.db.pool())
        .await?;
        let chunks: Vec<Chunk> = rows.iter().map(chunk_from_row).collect();
        if chunks.is_empty() {
            return Ok(RetrievedContext::default());
        }
        let context = join_and_truncate(&chunks);
        let best = chunks.first().map(|chunk| chunk.content.clone());
        Ok(RetrievedContext {
            context,
            confidence: FALLBACK_CONFIDENCE,
            best_single_context: best,
            chunks,
        })
    }
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape_like(keyword: &str) -> String {
    keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn join_and_truncate(chunks: &[Chunk]) -> String {
    let joined = chunks
        .iter()
        .map(|chunk| chunk.content.as_str())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if joined.chars().count() > CONTEXT_CHAR_LIMIT {
        joined.chars().take(CONTEXT_CHAR_LIMIT).collect()
    } else {
        joined
    }
}
