//! File upload, dedup, and lifecycle
//!
//! Uploads are validated (size, filename, forbidden extensions, magic
//! numbers), stored content-addressed, and deduplicated per user by sha256.
//! Deleting a file cascades to its chunks, knowledge-base links, and
//! vectors; the deterministic vector-id mapping means no lookup table is
//! needed to find what to remove.

use crate::config::UploadConfig;
use crate::db::{file_from_row, kb_file_from_row, now_str, Database};
use crate::error::{RagError, Result};
use crate::models::{FileRecord, FileStatus};
use crate::object_store::{object_key, ObjectStore};
use crate::vector::{vector_id_for_chunk, VectorStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// One page of a user's files
#[derive(Debug, Clone)]
pub struct FileListPage {
    pub files: Vec<FileRecord>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Clone)]
pub struct FileService {
    db: Database,
    objects: Arc<dyn ObjectStore>,
    vectors: Arc<dyn VectorStore>,
    config: UploadConfig,
}

impl FileService {
    pub fn new(
        db: Database,
        objects: Arc<dyn ObjectStore>,
        vectors: Arc<dyn VectorStore>,
        config: UploadConfig,
    ) -> Self {
        Self {
            db,
            objects,
            vectors,
            config,
        }
    }

    fn content_hash(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn file_type_of(filename: &str) -> String {
        filename.rsplit('.').next().unwrap_or("").to_lowercase()
    }

    fn validate_filename(&self, filename: &str) -> Result<()> {
        if filename.trim().is_empty() {
            return Err(RagError::Validation("文件名不能为空".into()));
        }
        if filename.chars().count() > self.config.filename_max_length {
            return Err(RagError::Validation(format!(
                "文件名过长（最多 {} 字符）",
                self.config.filename_max_length
            )));
        }
        if filename.contains(['/', '\\']) || filename.chars().any(char::is_control) {
            return Err(RagError::Validation("文件名包含非法字符".into()));
        }
        let ext = Self::file_type_of(filename);
        if self.config.forbidden_extensions_list().contains(&ext) {
            return Err(RagError::Validation(format!("禁止上传该类型文件: {}", ext)));
        }
        Ok(())
    }

    /// Magic-number check for the binary formats: the declared extension
    /// must agree with the leading bytes.
    fn validate_magic(bytes: &[u8], file_type: &str) -> Result<()> {
        let ok = match file_type {
            "pdf" => bytes.starts_with(b"%PDF"),
            "png" => bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]),
            "jpeg" | "jpg" => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
            "zip" | "docx" | "xlsx" | "pptx" => bytes.starts_with(b"PK\x03\x04"),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(RagError::Validation(format!(
                "文件内容与扩展名 {} 不符",
                file_type
            )))
        }
    }

    /// Upload one file. `on_duplicate` overrides the configured policy:
    /// `use_existing` returns the already-stored file with the same content
    /// hash; `overwrite` replaces its bytes and clears its chunks.
    pub async fn upload(
        &self,
        user_id: i64,
        filename: &str,
        bytes: &[u8],
        on_duplicate: Option<&str>,
    ) -> Result<FileRecord> {
        if bytes.len() > self.config.max_file_size {
            return Err(RagError::Validation(format!(
                "文件大小超过限制（{} 字节）",
                self.config.max_file_size
            )));
        }
        self.validate_filename(filename)?;
        let file_type = Self::file_type_of(filename);
        let allowed = self.config.allowed_types_list();
        if !allowed.contains(&file_type) {
            return Err(RagError::Validation(format!(
                "不支持的文件类型: {}。当前允许: {}",
                file_type,
                allowed.join(", ")
            )));
        }
        Self::validate_magic(bytes, &file_type)?;

        let hash = Self::content_hash(bytes);
        let policy = on_duplicate
            .map(str::to_string)
            .unwrap_or_else(|| self.config.on_duplicate.clone());
        let policy = if policy == "overwrite" { "overwrite" } else { "use_existing" };

        let existing = sqlx::query("SELECT * FROM files WHERE user_id = ?1 AND content_hash = ?2")
            .bind(user_id)
            .bind(&hash)
            .fetch_optional(self.db.pool())
            .await?
            .map(|row| file_from_row(&row));
        if let Some(existing) = existing {
            return if policy == "overwrite" {
                self.overwrite(existing, filename, &file_type, bytes).await
            } else {
                Ok(existing)
            };
        }

        let storage_key = object_key(user_id, &hash, filename);
        self.objects
            .put(&storage_key, bytes)
            .await
            .map_err(|e| RagError::Storage(format!("文件上传失败: {}", e)))?;

        let now = now_str();
        let row = sqlx::query(
            r#"
            INSERT INTO files (user_id, filename, original_filename, file_type, file_size,
                               storage_key, content_hash, status, chunk_count, created_at, updated_at)
            VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(filename)
        .bind(&file_type)
        .bind(bytes.len() as i64)
        .bind(&storage_key)
        .bind(&hash)
        .bind(FileStatus::Completed.as_str())
        .bind(&now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(file_from_row(&row))
    }

    /// Replace an existing file's bytes and clear every chunk, link, and
    /// vector derived from the old content.
    async fn overwrite(
        &self,
        existing: FileRecord,
        filename: &str,
        file_type: &str,
        bytes: &[u8],
    ) -> Result<FileRecord> {
        let chunk_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM chunks WHERE file_id = ?1")
            .bind(existing.id)
            .fetch_all(self.db.pool())
            .await?;
        let links: Vec<_> =
            sqlx::query("SELECT * FROM knowledge_base_files WHERE file_id = ?1")
                .bind(existing.id)
                .fetch_all(self.db.pool())
                .await?
                .iter()
                .map(kb_file_from_row)
                .collect();

        let mut tx = self.db.pool().begin().await?;
        for link in &links {
            let in_kb: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM chunks WHERE file_id = ?1 AND knowledge_base_id = ?2",
            )
            .bind(existing.id)
            .bind(link.knowledge_base_id)
            .fetch_one(&mut *tx)
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
            .bind(link.knowledge_base_id)
            .bind(in_kb)
            .bind(now_str())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(existing.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_base_files WHERE file_id = ?1")
            .bind(existing.id)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            r#"
            UPDATE files
            SET filename = ?2, original_filename = ?2, file_type = ?3, file_size = ?4,
                chunk_count = 0, status = ?5, updated_at = ?6
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(existing.id)
        .bind(filename)
        .bind(file_type)
        .bind(bytes.len() as i64)
        .bind(FileStatus::Completed.as_str())
        .bind(now_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        if !chunk_ids.is_empty() {
            let vector_ids: Vec<i64> = chunk_ids.iter().map(|id| vector_id_for_chunk(*id)).collect();
            if let Err(e) = self.vectors.delete(&vector_ids).await {
                warn!("vector cleanup after overwrite failed: {}", e);
            }
        }
        if let Err(e) = self.objects.put(&existing.storage_key, bytes).await {
            warn!("object overwrite failed: {}", e);
        }
        info!(
            "overwrote file {} and cleared {} chunks",
            existing.id,
            chunk_ids.len()
        );
        Ok(file_from_row(&row))
    }

    pub async fn get(&self, file_id: i64, user_id: i64) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?1 AND user_id = ?2")
            .bind(file_id)
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|row| file_from_row(&row)))
    }

    pub async fn list(&self, user_id: i64, page: i64, page_size: i64) -> Result<FileListPage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(self.db.pool())
            .await?;
        let rows = sqlx::query(
            "SELECT * FROM files WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(self.db.pool())
        .await?;
        Ok(FileListPage {
            files: rows.iter().map(file_from_row).collect(),
            total,
            page,
            page_size,
        })
    }

    /// Delete a file: its chunks in every knowledge base, the KB links and
    /// counter deltas, the vectors (ids recomputed from chunk ids), the
    /// stored object, and finally the row.
    pub async fn delete(&self, file_id: i64, user_id: i64) -> Result<()> {
        let Some(file) = self.get(file_id, user_id).await? else {
            return Err(RagError::NotFound("文件不存在".into()));
        };
        let chunk_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .fetch_all(self.db.pool())
            .await?;
        let links: Vec<_> =
            sqlx::query("SELECT * FROM knowledge_base_files WHERE file_id = ?1")
                .bind(file_id)
                .fetch_all(self.db.pool())
                .await?
                .iter()
                .map(kb_file_from_row)
                .collect();

        let mut tx = self.db.pool().begin().await?;
        for link in &links {
            let in_kb: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM chunks WHERE file_id = ?1 AND knowledge_base_id = ?2",
            )
            .bind(file_id)
            .bind(link.knowledge_base_id)
            .fetch_one(&mut *tx)
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
            .bind(link.knowledge_base_id)
            .bind(in_kb)
            .bind(now_str())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_base_files WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if !chunk_ids.is_empty() {
            let vector_ids: Vec<i64> = chunk_ids.iter().map(|id| vector_id_for_chunk(*id)).collect();
            if let Err(e) = self.vectors.delete(&vector_ids).await {
                warn!("vector cleanup after file delete failed: {}", e);
            }
        }
        if let Err(e) = self.objects.delete(&file.storage_key).await {
            warn!("object delete failed: {}", e);
        }
        info!("deleted file {} with {} chunks", file_id, chunk_ids.len());
        Ok(())
    }

    /// Raw bytes of a stored file, with a user-facing reason on failure
    pub async fn content(&self, file_id: i64, user_id: i64) -> Result<Vec<u8>> {
        let Some(file) = self.get(file_id, user_id).await? else {
            return Err(RagError::NotFound("文件不存在或无权访问".into()));
        };
        self.objects.get(&file.storage_key).await.map_err(|e| {
            warn!("file {} unreadable: {}", file_id, e);
            RagError::Storage("对象存储中不存在该文件，请重新上传后再添加到知识库".into())
        })
    }
}
