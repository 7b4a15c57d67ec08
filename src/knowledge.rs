//! Knowledge bases and the ingestion pipeline
//!
//! Upload → extract → chunk → embed → persist, with one relational
//! transaction per file and deterministic vector ids so a failed file
//! leaves nothing behind that retrieval could surface. Per-file problems
//! become skip entries; the enclosing batch keeps going.

use crate::chunker::Chunker;
use crate::config::{ChunkingConfig, UploadConfig};
use crate::db::{chunk_from_row, kb_file_from_row, kb_from_row, now_str, Database};
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::extract;
use crate::files::FileService;
use crate::models::{Chunk, EmbeddingSource, FileRecord, KbFileLink, KnowledgeBase};
use crate::ocr::OcrEngine;
use crate::vector::{vector_id_for_chunk, VectorFilter, VectorPayload, VectorStore};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Parameters for creating or updating a knowledge base
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbParams {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<i64>,
    #[serde(default)]
    pub chunk_overlap: Option<i64>,
    #[serde(default)]
    pub chunk_max_expand_ratio: Option<f64>,
    #[serde(default = "default_toggle")]
    pub use_hybrid: bool,
    #[serde(default = "default_toggle")]
    pub use_rerank: bool,
}

fn default_toggle() -> bool {
    true
}

impl KbParams {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            chunk_size: None,
            chunk_overlap: None,
            chunk_max_expand_ratio: None,
            use_hybrid: true,
            use_rerank: true,
        }
    }
}

/// A file the batch could not ingest, with a user-facing reason
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedFile {
    pub file_id: i64,
    pub original_filename: String,
    pub reason: String,
}

/// Progress events for streamed ingestion
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    FileStart {
        file_id: i64,
        filename: String,
    },
    FileDone {
        file_id: i64,
        filename: String,
        chunk_count: usize,
    },
    FileSkip {
        file_id: i64,
        filename: String,
        reason: String,
    },
    Done {
        knowledge_base: KnowledgeBase,
        skipped: Vec<SkippedFile>,
    },
    Error {
        message: String,
    },
}

/// One page of knowledge bases
#[derive(Debug, Clone)]
pub struct KbListPage {
    pub knowledge_bases: Vec<KnowledgeBase>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// A file inside a knowledge base, with its in-KB chunk count
#[derive(Debug, Clone, Serialize)]
pub struct KbFileItem {
    pub file_id: i64,
    pub original_filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub chunk_count_in_kb: i64,
    pub added_at: chrono::DateTime<chrono::Utc>,
}

/// One page of a knowledge base's files
#[derive(Debug, Clone)]
pub struct KbFileListPage {
    pub files: Vec<KbFileItem>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// One image search result
#[derive(Debug, Clone, Serialize)]
pub struct ImageSearchHit {
    pub file_id: i64,
    pub original_filename: String,
    pub file_type: String,
    pub snippet: String,
}

/// Outcome of a full-KB reindex
#[derive(Debug, Clone, Serialize)]
pub struct ReindexSummary {
    pub kb_id: i64,
    pub file_count: i64,
    pub chunk_count: i64,
    pub reindexed_files: usize,
    pub total_files: usize,
}

enum FileOutcome {
    Added { filename: String, chunk_count: usize },
    Skipped { filename: String, reason: String },
}

const IMAGE_CHUNK_CHAR_LIMIT: usize = 2000;

#[derive(Clone)]
pub struct KnowledgeBaseService {
    db: Database,
    files: FileService,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    ocr: Arc<dyn OcrEngine>,
    chunking: ChunkingConfig,
    upload: UploadConfig,
    /// Observed embedding dimension, probed once per process
    dimension: Arc<OnceCell<usize>>,
}

impl KnowledgeBaseService {
    pub fn new(
        db: Database,
        files: FileService,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        ocr: Arc<dyn OcrEngine>,
        chunking: ChunkingConfig,
        upload: UploadConfig,
    ) -> Self {
        Self {
            db,
            files,
            vectors,
            embedder,
            ocr,
            chunking,
            upload,
            dimension: Arc::new(OnceCell::new()),
        }
    }

    // ---- knowledge base CRUD ---- //

    pub async fn create(&self, user_id: i64, params: KbParams) -> Result<KnowledgeBase> {
        if params.name.trim().is_empty() {
            return Err(RagError::Validation("知识库名称不能为空".into()));
        }
        let now = now_str();
        let row = sqlx::query(
            r#"
            INSERT INTO knowledge_bases
                (user_id, name, description, chunk_size, chunk_overlap, chunk_max_expand_ratio,
                 use_hybrid, use_rerank, file_count, chunk_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9, ?9)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(params.name.trim())
        .bind(&params.description)
        .bind(params.chunk_size)
        .bind(params.chunk_overlap)
        .bind(params.chunk_max_expand_ratio)
        .bind(params.use_hybrid)
        .bind(params.use_rerank)
        .bind(&now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(kb_from_row(&row))
    }

    pub async fn get(&self, kb_id: i64, user_id: i64) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?1 AND user_id = ?2")
            .bind(kb_id)
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|row| kb_from_row(&row)))
    }

    async fn require(&self, kb_id: i64, user_id: i64) -> Result<KnowledgeBase> {
        self.get(kb_id, user_id)
            .await?
            .ok_or_else(|| RagError::NotFound("知识库不存在".into()))
    }

    pub async fn list(&self, user_id: i64, page: i64, page_size: i64) -> Result<KbListPage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_bases WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(self.db.pool())
                .await?;
        let rows = sqlx::query(
            "SELECT * FROM knowledge_bases WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(self.db.pool())
        .await?;
        Ok(KbListPage {
            knowledge_bases: rows.iter().map(kb_from_row).collect(),
            total,
            page,
            page_size,
        })
    }

    pub async fn update(
        &self,
        kb_id: i64,
        user_id: i64,
        params: KbParams,
    ) -> Result<KnowledgeBase> {
        self.require(kb_id, user_id).await?;
        let row = sqlx::query(
            r#"
            UPDATE knowledge_bases
            SET name = ?2, description = ?3, chunk_size = ?4, chunk_overlap = ?5,
                chunk_max_expand_ratio = ?6, use_hybrid = ?7, use_rerank = ?8, updated_at = ?9
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(kb_id)
        .bind(params.name.trim())
        .bind(&params.description)
        .bind(params.chunk_size)
        .bind(params.chunk_overlap)
        .bind(params.chunk_max_expand_ratio)
        .bind(params.use_hybrid)
        .bind(params.use_rerank)
        .bind(now_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(kb_from_row(&row))
    }

    /// Delete a knowledge base and everything derived from it: chunks,
    /// links, and vectors (ids recomputed from chunk ids).
    pub async fn delete(&self, kb_id: i64, user_id: i64) -> Result<()> {
        self.require(kb_id, user_id).await?;
        let chunk_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE knowledge_base_id = ?1")
                .bind(kb_id)
                .fetch_all(self.db.pool())
                .await?;

        if !chunk_ids.is_empty() {
            let vector_ids: Vec<i64> =
                chunk_ids.iter().map(|id| vector_id_for_chunk(*id)).collect();
            if let Err(e) = self.vectors.delete(&vector_ids).await {
                warn!("vector cleanup for KB {} failed: {}, continuing", kb_id, e);
            }
        }

        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM chunks WHERE knowledge_base_id = ?1")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_base_files WHERE knowledge_base_id = ?1")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_bases WHERE id = ?1")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("deleted KB {} with {} chunks", kb_id, chunk_ids.len());
        Ok(())
    }

    // ---- ingestion ---- //

    /// Probe the provider's dimension once and make sure the collection
    /// exists with it, so the first insert cannot hit a dimension mismatch.
    async fn ensure_collection(&self) -> Result<usize> {
        let embedder = self.embedder.clone();
        let dim = *self
            .dimension
            .get_or_init(|| async move { embedder.probe_dimension().await })
            .await;
        self.vectors.ensure_collection(dim).await?;
        Ok(dim)
    }

    /// Add files to a knowledge base: extract, chunk, embed, and persist
    /// each one transactionally. Returns the refreshed KB and the files
    /// that were skipped.
    pub async fn add_files(
        &self,
        kb_id: i64,
        file_ids: &[i64],
        user_id: i64,
    ) -> Result<(KnowledgeBase, Vec<SkippedFile>)> {
        let kb = self.require(kb_id, user_id).await?;
        self.ensure_collection().await?;

        let mut skipped = Vec::new();
        for &file_id in file_ids {
            match self.ingest_one(&kb, file_id, user_id).await? {
                FileOutcome::Added { chunk_count, .. } => {
                    debug!("file {} ingested with {} chunks", file_id, chunk_count);
                }
                FileOutcome::Skipped { filename, reason } => {
                    warn!("file {} skipped: {}", file_id, reason);
                    skipped.push(SkippedFile {
                        file_id,
                        original_filename: filename,
                        reason,
                    });
                }
            }
        }

        let kb = self.refresh_file_count(kb_id).await?;
        info!(
            "processed {} files into KB {} ({} skipped)",
            file_ids.len(),
            kb_id,
            skipped.len()
        );
        Ok((kb, skipped))
    }

    /// Streaming variant: yields `file_start` / `file_done` / `file_skip`
    /// per file, then one `done` (or `error`).
    pub fn add_files_stream(
        &self,
        kb_id: i64,
        file_ids: Vec<i64>,
        user_id: i64,
    ) -> BoxStream<'static, IngestEvent> {
        let service = self.clone();
        let (tx, rx) = flume::unbounded();

        tokio::spawn(async move {
            let kb = match service.require(kb_id, user_id).await {
                Ok(kb) => kb,
                Err(e) => {
                    let _ = tx.send_async(IngestEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                    return;
                }
            };
            if let Err(e) = service.ensure_collection().await {
                let _ = tx.send_async(IngestEvent::Error {
                    message: e.to_string(),
                })
                .await;
                return;
            }

            let mut skipped = Vec::new();
            for file_id in file_ids {
                let filename = service
                    .files
                    .get(file_id, user_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|f| f.original_filename)
                    .unwrap_or_else(|| format!("文件 {}", file_id));
                let _ = tx.send_async(IngestEvent::FileStart {
                    file_id,
                    filename: filename.clone(),
                })
                .await;

                match service.ingest_one(&kb, file_id, user_id).await {
                    Ok(FileOutcome::Added { chunk_count, .. }) => {
                        let _ = tx.send_async(IngestEvent::FileDone {
                            file_id,
                            filename,
                            chunk_count,
                        })
                        .await;
                    }
                    Ok(FileOutcome::Skipped { reason, .. }) => {
                        skipped.push(SkippedFile {
                            file_id,
                            original_filename: filename.clone(),
                            reason: reason.clone(),
                        });
                        let _ = tx.send_async(IngestEvent::FileSkip {
                            file_id,
                            filename,
                            reason,
                        })
                        .await;
                    }
                    Err(e) => {
                        let _ = tx.send_async(IngestEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                        return;
                    }
                }
            }

            match service.refresh_file_count(kb_id).await {
                Ok(kb) => {
                    let _ = tx.send_async(IngestEvent::Done {
                        knowledge_base: kb,
                        skipped,
                    })
                    .await;
                }
                Err(e) => {
                    let _ = tx.send_async(IngestEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                }
            }
        });

        rx.into_stream().boxed()
    }

    async fn refresh_file_count(&self, kb_id: i64) -> Result<KnowledgeBase> {
        sqlx::query(
            r#"
            UPDATE knowledge_bases
            SET file_count = (SELECT COUNT(*) FROM knowledge_base_files WHERE knowledge_base_id = ?1),
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(kb_id)
        .bind(now_str())
        .execute(self.db.pool())
        .await?;
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?1")
            .bind(kb_id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(kb_from_row(&row))
    }

    fn skip_reason(e: &RagError) -> String {
        match e {
            RagError::NotFound(m) | RagError::Storage(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Extract text for one file. Images go through OCR; a PDF whose fast
    /// extraction is too short gets its page images OCR'd as well.
    async fn extract_for_file(&self, file: &FileRecord, bytes: &[u8]) -> (String, Option<String>) {
        if file.is_image() {
            let description = self.ocr.extract_text_from_image(bytes, &file.file_type).await;
            return (description.clone(), Some(description));
        }

        let mut text = extract::extract_text(bytes, &file.file_type);
        if file.file_type == "pdf" && text.chars().count() < self.upload.pdf_ocr_min_chars {
            info!(
                "PDF text too short ({} chars), running OCR fallback",
                text.chars().count()
            );
            let mut ocr_parts = Vec::new();
            for page in extract::pdf::page_images(bytes) {
                let page_text = self
                    .ocr
                    .extract_text_from_image(&page.data, &page.format)
                    .await;
                if !page_text.is_empty() {
                    ocr_parts.push(page_text);
                }
            }
            if !ocr_parts.is_empty() {
                if !text.is_empty() {
                    ocr_parts.insert(0, text);
                }
                text = ocr_parts.join("\n\n");
            }
        }
        (text, None)
    }

    /// Ingest one file inside its own transaction. Per-file problems are
    /// reported as a skip; only infrastructure errors bubble up as `Err`.
    async fn ingest_one(
        &self,
        kb: &KnowledgeBase,
        file_id: i64,
        user_id: i64,
    ) -> Result<FileOutcome> {
        let fallback_name = format!("文件 {}", file_id);
        let Some(file) = self.files.get(file_id, user_id).await? else {
            return Ok(FileOutcome::Skipped {
                filename: fallback_name,
                reason: "文件不存在或无权访问".into(),
            });
        };
        let filename = file.original_filename.clone();

        let existing = sqlx::query(
            "SELECT id FROM knowledge_base_files WHERE knowledge_base_id = ?1 AND file_id = ?2",
        )
        .bind(kb.id)
        .bind(file_id)
        .fetch_optional(self.db.pool())
        .await?;
        if existing.is_some() {
            return Ok(FileOutcome::Skipped {
                filename,
                reason: "已在知识库中".into(),
            });
        }

        let bytes = match self.files.content(file_id, user_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(FileOutcome::Skipped {
                    filename,
                    reason: Self::skip_reason(&e),
                })
            }
        };

        let (text, image_description) = self.extract_for_file(&file, &bytes).await;
        if text.trim().is_empty() {
            return Ok(FileOutcome::Skipped {
                filename,
                reason: "提取文本为空（可能为扫描版 PDF 或格式不支持）".into(),
            });
        }

        let chunker = Chunker::for_knowledge_base(kb, &self.chunking);
        let chunk_texts = chunker.chunk(&text);
        if chunk_texts.is_empty() {
            return Ok(FileOutcome::Skipped {
                filename,
                reason: "切分后无文本块".into(),
            });
        }

        // Embed before opening the transaction; vectors depend only on the
        // texts, not on the row ids.
        let embeddings = match self.embedder.embed_texts(&chunk_texts).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                return Ok(FileOutcome::Skipped {
                    filename,
                    reason: format!("向量化失败: {}", e),
                })
            }
        };
        if embeddings.len() != chunk_texts.len() {
            return Ok(FileOutcome::Skipped {
                filename,
                reason: format!(
                    "向量数量 {} 与文本块数量 {} 不匹配",
                    embeddings.len(),
                    chunk_texts.len()
                ),
            });
        }
        let image_embedding = if image_description.is_some() {
            match self.embedder.embed_image(&bytes, &file.file_type).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    return Ok(FileOutcome::Skipped {
                        filename,
                        reason: format!("图片向量化失败: {}", e),
                    })
                }
            }
        } else {
            None
        };

        let mut tx = self.db.pool().begin().await?;
        let now = now_str();
        let link = sqlx::query(
            "INSERT INTO knowledge_base_files (knowledge_base_id, file_id, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(kb.id)
        .bind(file_id)
        .bind(&now)
        .execute(&mut *tx)
        .await;
        if link.is_err() {
            // Unique constraint: a concurrent ingestion linked it first
            return Ok(FileOutcome::Skipped {
                filename,
                reason: "已在知识库中".into(),
            });
        }

        // Text chunks, then for images one extra image-source chunk whose
        // vector is the image embedding, so the file is findable by image
        // as well as by its description text
        let mut rows: Vec<(String, EmbeddingSource, Vec<f32>)> = chunk_texts
            .iter()
            .cloned()
            .zip(embeddings)
            .map(|(content, embedding)| (content, EmbeddingSource::Text, embedding))
            .collect();
        if let (Some(description), Some(vector)) = (&image_description, image_embedding) {
            let content: String = description.chars().take(IMAGE_CHUNK_CHAR_LIMIT).collect();
            rows.push((content, EmbeddingSource::Image, vector));
        }

        let mut chunk_ids = Vec::with_capacity(rows.len());
        let mut all_vectors = Vec::with_capacity(rows.len());
        let mut payloads = Vec::with_capacity(rows.len());
        for (index, (content, source, embedding)) in rows.into_iter().enumerate() {
            let chunk_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO chunks
                    (file_id, knowledge_base_id, content, chunk_index, embedding_source, vector_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                RETURNING id
                "#,
            )
            .bind(file_id)
            .bind(kb.id)
            .bind(&content)
            .bind(index as i64)
            .bind(source.as_str())
            .bind(&now)
            .fetch_one(&mut *tx)
            .await?;
            sqlx::query("UPDATE chunks SET vector_id = ?2 WHERE id = ?1")
                .bind(chunk_id)
                .bind(vector_id_for_chunk(chunk_id))
                .execute(&mut *tx)
                .await?;
            chunk_ids.push(chunk_id);
            all_vectors.push(embedding);
            payloads.push(VectorPayload {
                chunk_id,
                content: content.chars().take(1000).collect(),
                file_id,
                knowledge_base_id: kb.id,
                chunk_index: index as i64,
                embedding_source: source.as_str().to_string(),
            });
        }
        let vector_ids: Vec<i64> = chunk_ids.iter().map(|id| vector_id_for_chunk(*id)).collect();

        if let Err(e) = self.vectors.upsert(&vector_ids, &all_vectors, &payloads).await {
            // The transaction rolls back on drop; orphan vectors cannot be
            // surfaced because their chunk rows never commit
            warn!(
                "vector upsert failed for file {}: {}; deterministic ids pending cleanup: {:?}",
                file_id, e, vector_ids
            );
            return Ok(FileOutcome::Skipped {
                filename,
                reason: format!("向量化失败: {}", e),
            });
        }

        let total = chunk_ids.len() as i64;
        sqlx::query("UPDATE files SET chunk_count = chunk_count + ?2, updated_at = ?3 WHERE id = ?1")
            .bind(file_id)
            .bind(total)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE knowledge_bases SET chunk_count = chunk_count + ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(kb.id)
        .bind(total)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(FileOutcome::Added {
            filename,
            chunk_count: chunk_ids.len(),
        })
    }

    /// Remove a file from a knowledge base: its in-KB chunks, their
    /// vectors, the link, and the counter deltas.
    pub async fn remove_file(&self, kb_id: i64, file_id: i64, user_id: i64) -> Result<()> {
        self.require(kb_id, user_id).await?;
        let link: Option<KbFileLink> = sqlx::query(
            "SELECT * FROM knowledge_base_files WHERE knowledge_base_id = ?1 AND file_id = ?2",
        )
        .bind(kb_id)
        .bind(file_id)
        .fetch_optional(self.db.pool())
        .await?
        .map(|row| kb_file_from_row(&row));
        if link.is_none() {
            return Err(RagError::NotFound("该文件不在本知识库中".into()));
        }
        if self.files.get(file_id, user_id).await?.is_none() {
            return Err(RagError::NotFound("文件不存在或无权操作".into()));
        }

        let chunk_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE knowledge_base_id = ?1 AND file_id = ?2",
        )
        .bind(kb_id)
        .bind(file_id)
        .fetch_all(self.db.pool())
        .await?;

        if !chunk_ids.is_empty() {
            let vector_ids: Vec<i64> =
                chunk_ids.iter().map(|id| vector_id_for_chunk(*id)).collect();
            if let Err(e) = self.vectors.delete(&vector_ids).await {
                warn!("vector delete failed: {}, continuing with rows", e);
            }
        }

        let delta = chunk_ids.len() as i64;
        let now = now_str();
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM chunks WHERE knowledge_base_id = ?1 AND file_id = ?2")
            .bind(kb_id)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM knowledge_base_files WHERE knowledge_base_id = ?1 AND file_id = ?2",
        )
        .bind(kb_id)
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE files SET chunk_count = MAX(0, chunk_count - ?2), updated_at = ?3 WHERE id = ?1",
        )
        .bind(file_id)
        .bind(delta)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE knowledge_bases
            SET file_count = MAX(0, file_count - 1),
                chunk_count = MAX(0, chunk_count - ?2),
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(kb_id)
        .bind(delta)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("removed file {} from KB {} ({} chunks)", file_id, kb_id, delta);
        Ok(())
    }

    /// Reindex one file: remove it from the KB, then add it back
    pub async fn reindex_file(
        &self,
        kb_id: i64,
        file_id: i64,
        user_id: i64,
    ) -> Result<KnowledgeBase> {
        self.remove_file(kb_id, file_id, user_id).await?;
        let (kb, _skipped) = self.add_files(kb_id, &[file_id], user_id).await?;
        Ok(kb)
    }

    /// Reindex every file in a knowledge base, isolating per-file failures
    pub async fn reindex_all(&self, kb_id: i64, user_id: i64) -> Result<ReindexSummary> {
        self.require(kb_id, user_id).await?;
        let file_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT file_id FROM knowledge_base_files WHERE knowledge_base_id = ?1",
        )
        .bind(kb_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut reindexed = 0;
        for &file_id in &file_ids {
            match self.reindex_file(kb_id, file_id, user_id).await {
                Ok(_) => reindexed += 1,
                Err(e) => warn!("reindex of file {} in KB {} failed: {}", file_id, kb_id, e),
            }
        }

        let kb = self.require(kb_id, user_id).await?;
        Ok(ReindexSummary {
            kb_id,
            file_count: kb.file_count,
            chunk_count: kb.chunk_count,
            reindexed_files: reindexed,
            total_files: file_ids.len(),
        })
    }

    // ---- listings ---- //

    pub async fn list_files(
        &self,
        kb_id: i64,
        user_id: i64,
        page: i64,
        page_size: i64,
    ) -> Result<KbFileListPage> {
        self.require(kb_id, user_id).await?;
        let page = page.max(1);
        let page_size = page_size.max(1);
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM knowledge_base_files l
            JOIN files f ON l.file_id = f.id
            WHERE l.knowledge_base_id = ?1 AND f.user_id = ?2
            "#,
        )
        .bind(kb_id)
        .bind(user_id)
        .fetch_one(self.db.pool())
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT f.id AS file_id, f.original_filename, f.file_type, f.file_size,
                   l.created_at AS added_at,
                   (SELECT COUNT(*) FROM chunks c
                    WHERE c.knowledge_base_id = l.knowledge_base_id AND c.file_id = f.id)
                       AS chunk_count_in_kb
            FROM knowledge_base_files l
            JOIN files f ON l.file_id = f.id
            WHERE l.knowledge_base_id = ?1 AND f.user_id = ?2
            ORDER BY l.created_at DESC, l.id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(kb_id)
        .bind(user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(self.db.pool())
        .await?;

        use sqlx::Row;
        let files = rows
            .iter()
            .map(|row| {
                let added_at: String = row.get("added_at");
                KbFileItem {
                    file_id: row.get("file_id"),
                    original_filename: row.get("original_filename"),
                    file_type: row.get("file_type"),
                    file_size: row.get("file_size"),
                    chunk_count_in_kb: row.get("chunk_count_in_kb"),
                    added_at: chrono::DateTime::parse_from_rfc3339(&added_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now()),
                }
            })
            .collect();
        Ok(KbFileListPage {
            files,
            total,
            page,
            page_size,
        })
    }

    /// Chunks of one file within a knowledge base, in index order
    pub async fn list_chunks(&self, kb_id: i64, file_id: i64, user_id: i64) -> Result<Vec<Chunk>> {
        self.require(kb_id, user_id).await?;
        let link = sqlx::query(
            "SELECT id FROM knowledge_base_files WHERE knowledge_base_id = ?1 AND file_id = ?2",
        )
        .bind(kb_id)
        .bind(file_id)
        .fetch_optional(self.db.pool())
        .await?;
        if link.is_none() {
            return Err(RagError::NotFound("该文件不在本知识库中".into()));
        }
        if self.files.get(file_id, user_id).await?.is_none() {
            return Err(RagError::NotFound("文件不存在或无权操作".into()));
        }
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE knowledge_base_id = ?1 AND file_id = ?2 ORDER BY chunk_index",
        )
        .bind(kb_id)
        .bind(file_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    // ---- image search ---- //

    /// Text-to-image search: dense search with the query text, keeping only
    /// image files, best hit per file first.
    pub async fn search_images_by_text(
        &self,
        query: &str,
        user_id: i64,
        knowledge_base_id: Option<i64>,
        top_k: usize,
    ) -> Result<Vec<ImageSearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = match self.embedder.embed_text(query.trim()).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("image search embedding failed: {}", e);
                return Ok(Vec::new());
            }
        };
        self.search_images_by_vector(&vector, user_id, knowledge_base_id, top_k, false)
            .await
    }

    /// Image-by-image search: dense search with the image's own embedding.
    /// Image-source chunks are preferred when the same file matches twice.
    pub async fn search_images_by_image(
        &self,
        bytes: &[u8],
        format: &str,
        user_id: i64,
        knowledge_base_id: Option<i64>,
        top_k: usize,
    ) -> Result<Vec<ImageSearchHit>> {
        let vector = match self.embedder.embed_image(bytes, format).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("image search embedding failed: {}", e);
                return Ok(Vec::new());
            }
        };
        self.search_images_by_vector(&vector, user_id, knowledge_base_id, top_k, true)
            .await
    }

    async fn search_images_by_vector(
        &self,
        vector: &[f32],
        user_id: i64,
        knowledge_base_id: Option<i64>,
        top_k: usize,
        prefer_image_source: bool,
    ) -> Result<Vec<ImageSearchHit>> {
        let filter = VectorFilter {
            knowledge_base_id,
            file_id: None,
        };
        let hits = match self
            .vectors
            .search(vector, (top_k * 4).min(80).max(top_k), &filter)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("image search failed: {}", e);
                return Ok(Vec::new());
            }
        };
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let id_list = hits
            .iter()
            .map(|hit| hit.id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            r#"
            SELECT c.*, f.original_filename, f.file_type AS f_type
            FROM chunks c JOIN files f ON c.file_id = f.id
            WHERE c.vector_id IN ({}) AND f.user_id = ?1
              AND f.file_type IN ('jpeg', 'jpg', 'png')
            "#,
            id_list
        );
        if knowledge_base_id.is_some() {
            sql.push_str(" AND c.knowledge_base_id = ?2");
        }
        let mut query_builder = sqlx::query(&sql).bind(user_id);
        if let Some(kb_id) = knowledge_base_id {
            query_builder = query_builder.bind(kb_id);
        }
        let rows = query_builder.fetch_all(self.db.pool()).await?;

        use sqlx::Row;
        let rank_of: std::collections::HashMap<i64, usize> = hits
            .iter()
            .enumerate()
            .map(|(rank, hit)| (hit.id, rank))
            .collect();
        struct Candidate {
            rank: usize,
            image_source: bool,
            hit: ImageSearchHit,
        }
        let mut best: std::collections::HashMap<i64, Candidate> = std::collections::HashMap::new();
        for row in &rows {
            let chunk = chunk_from_row(row);
            let rank = *rank_of.get(&chunk.vector_id).unwrap_or(&usize::MAX);
            let image_source = chunk.embedding_source == EmbeddingSource::Image;
            let candidate = Candidate {
                rank,
                image_source,
                hit: ImageSearchHit {
                    file_id: chunk.file_id,
                    original_filename: row.get("original_filename"),
                    file_type: row.get("f_type"),
                    snippet: chunk.content.chars().take(200).collect(),
                },
            };
            let better = match best.get(&chunk.file_id) {
                None => true,
                Some(current) => {
                    if prefer_image_source && candidate.image_source != current.image_source {
                        candidate.image_source
                    } else {
                        candidate.rank < current.rank
                    }
                }
            };
            if better {
                best.insert(chunk.file_id, candidate);
            }
        }

        let mut ordered: Vec<Candidate> = best.into_values().collect();
        ordered.sort_by_key(|candidate| candidate.rank);
        Ok(ordered
            .into_iter()
            .take(top_k)
            .map(|candidate| candidate.hit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kb_params_defaults() {
        let params = KbParams::named("研究资料");
        assert!(params.use_hybrid);
        assert!(params.use_rerank);
        assert!(params.chunk_size.is_none());
    }

    #[test]
    fn test_ingest_event_wire_shape() {
        let event = IngestEvent::FileSkip {
            file_id: 3,
            filename: "a.pdf".into(),
            reason: "已在知识库中".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_skip");
        assert_eq!(json["file_id"], 3);
        assert_eq!(json["reason"], "已在知识库中");
    }

    #[test]
    fn test_skip_reason_unwraps_user_facing_kinds() {
        let not_found = RagError::NotFound("文件不存在".into());
        assert_eq!(KnowledgeBaseService::skip_reason(&not_found), "文件不存在");
        let other = RagError::Validation("bad".into());
        assert!(KnowledgeBaseService::skip_reason(&other).contains("bad"));
    }
}
