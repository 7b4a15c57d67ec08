//! SQLite-backed relational store
//!
//! A thin wrapper over a pooled connection: schema bootstrap plus the row
//! mapping helpers the services share. Queries live next to the logic that
//! issues them; each request acquires one connection (or one transaction)
//! for its lifetime.

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::{
    Chunk, Conversation, EmbeddingSource, FileRecord, FileStatus, KbFileLink, KnowledgeBase,
    Message, MessageRole,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

/// Shared handle to the relational store
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and bootstrap the schema
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!("relational store ready at {}", config.url);
        Ok(db)
    }

    /// In-memory store for tests
    pub async fn connect_in_memory() -> Result<Self> {
        // A single connection keeps the in-memory database alive and visible
        // across acquires.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                file_type TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                storage_key TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'uploading',
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_user_hash ON files(user_id, content_hash)",
            "CREATE INDEX IF NOT EXISTS idx_files_user ON files(user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_bases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                chunk_size INTEGER,
                chunk_overlap INTEGER,
                chunk_max_expand_ratio REAL,
                use_hybrid INTEGER NOT NULL DEFAULT 1,
                use_rerank INTEGER NOT NULL DEFAULT 1,
                file_count INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_kb_user ON knowledge_bases(user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_base_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                knowledge_base_id INTEGER NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                UNIQUE(knowledge_base_id, file_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                knowledge_base_id INTEGER NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                embedding_source TEXT NOT NULL DEFAULT 'text',
                vector_id INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chunks_kb ON chunks(knowledge_base_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_vector ON chunks(vector_id)",
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                knowledge_base_id INTEGER,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_conv_user ON conversations(user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                confidence REAL,
                retrieved_context TEXT,
                max_confidence_context TEXT,
                sources TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conversation_id)",
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                traceback TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS kv_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rate_counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL
            )
            "#,
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// RFC 3339 timestamp for persisting `now`
pub fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub fn file_from_row(row: &SqliteRow) -> FileRecord {
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    FileRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        filename: row.get("filename"),
        original_filename: row.get("original_filename"),
        file_type: row.get("file_type"),
        file_size: row.get("file_size"),
        storage_key: row.get("storage_key"),
        content_hash: row.get("content_hash"),
        status: FileStatus::parse(&status),
        chunk_count: row.get("chunk_count"),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

pub fn kb_from_row(row: &SqliteRow) -> KnowledgeBase {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let use_hybrid: i64 = row.get("use_hybrid");
    let use_rerank: i64 = row.get("use_rerank");
    KnowledgeBase {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        description: row.get("description"),
        chunk_size: row.get("chunk_size"),
        chunk_overlap: row.get("chunk_overlap"),
        chunk_max_expand_ratio: row.get("chunk_max_expand_ratio"),
        use_hybrid: use_hybrid != 0,
        use_rerank: use_rerank != 0,
        file_count: row.get("file_count"),
        chunk_count: row.get("chunk_count"),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

pub fn kb_file_from_row(row: &SqliteRow) -> KbFileLink {
    let created_at: String = row.get("created_at");
    KbFileLink {
        id: row.get("id"),
        knowledge_base_id: row.get("knowledge_base_id"),
        file_id: row.get("file_id"),
        created_at: parse_ts(&created_at),
    }
}

pub fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let created_at: String = row.get("created_at");
    let source: String = row.get("embedding_source");
    Chunk {
        id: row.get("id"),
        file_id: row.get("file_id"),
        knowledge_base_id: row.get("knowledge_base_id"),
        content: row.get("content"),
        chunk_index: row.get("chunk_index"),
        embedding_source: EmbeddingSource::parse(&source),
        vector_id: row.get("vector_id"),
        created_at: parse_ts(&created_at),
    }
}

pub fn conversation_from_row(row: &SqliteRow) -> Conversation {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Conversation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        knowledge_base_id: row.get("knowledge_base_id"),
        title: row.get("title"),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

pub fn message_from_row(row: &SqliteRow) -> Message {
    let created_at: String = row.get("created_at");
    let role: String = row.get("role");
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: MessageRole::parse(&role),
        content: row.get("content"),
        tokens: row.get("tokens"),
        model: row.get("model"),
        confidence: row.get("confidence"),
        retrieved_context: row.get("retrieved_context"),
        max_confidence_context: row.get("max_confidence_context"),
        sources: row.get("sources"),
        created_at: parse_ts(&created_at),
    }
}
