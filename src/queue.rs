//! Async task runner for long ingestion and reindex jobs
//!
//! Jobs are recorded in a durable `tasks` table and drained by worker
//! tasks. The submit call itself is bounded by a timeout: when the queue
//! cannot accept the job in time, the caller executes it in-process and the
//! outcome is flagged `sync = true`, so a queue outage degrades to slower
//! requests instead of failures.

use crate::db::{now_str, Database};
use crate::error::{QueueError, RagError, Result};
use crate::knowledge::KnowledgeBaseService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A job the runner knows how to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    AddFiles {
        kb_id: i64,
        file_ids: Vec<i64>,
        user_id: i64,
    },
    ReindexFile {
        kb_id: i64,
        file_id: i64,
        user_id: i64,
    },
    ReindexAll {
        kb_id: i64,
        user_id: i64,
    },
}

/// Task lifecycle states, as reported to pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Retry => "RETRY",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "STARTED" => TaskState::Started,
            "SUCCESS" => TaskState::Success,
            "FAILURE" => TaskState::Failure,
            "RETRY" => TaskState::Retry,
            _ => TaskState::Pending,
        }
    }
}

/// Poll result for one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub status: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

/// Outcome of a submit: either an enqueued task id, or (on queue trouble)
/// the result of an in-process synchronous execution
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub task_id: Option<String>,
    pub sync: bool,
    pub result: Option<Value>,
}

const MAX_ATTEMPTS: i64 = 2;

#[derive(Clone)]
pub struct TaskRunner {
    db: Database,
    kb: KnowledgeBaseService,
    tx: flume::Sender<String>,
    submit_timeout: Duration,
}

impl TaskRunner {
    /// Start the runner and its worker tasks
    pub fn start(
        db: Database,
        kb: KnowledgeBaseService,
        submit_timeout_secs: u64,
        worker_concurrency: usize,
    ) -> Self {
        let (tx, rx) = flume::unbounded::<String>();
        for worker_id in 0..worker_concurrency.max(1) {
            let db = db.clone();
            let kb = kb.clone();
            let rx = rx.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                debug!("task worker {} started", worker_id);
                while let Ok(task_id) = rx.recv_async().await {
                    Self::run_task(&db, &kb, &tx, &task_id).await;
                }
                debug!("task worker {} stopped", worker_id);
            });
        }
        Self {
            db,
            kb,
            tx,
            submit_timeout: Duration::from_secs(submit_timeout_secs),
        }
    }

    /// Submit a job. Falls back to synchronous in-process execution when the
    /// queue cannot accept it within the submit timeout.
    pub async fn submit(&self, kind: TaskKind) -> Result<SubmitOutcome> {
        let task_id = Uuid::new_v4().to_string();
        let enqueue = async {
            let kind_json = serde_json::to_string(&kind)?;
            let now = now_str();
            sqlx::query(
                r#"
                INSERT INTO tasks (task_id, kind, status, attempts, created_at, updated_at)
                VALUES (?1, ?2, 'PENDING', 0, ?3, ?3)
                "#,
            )
            .bind(&task_id)
            .bind(&kind_json)
            .bind(&now)
            .execute(self.db.pool())
            .await?;
            self.tx
                .send_async(task_id.clone())
                .await
                .map_err(|_| QueueError::Unavailable("no workers running".into()))?;
            Ok::<(), RagError>(())
        };

        match tokio::time::timeout(self.submit_timeout, enqueue).await {
            Ok(Ok(())) => Ok(SubmitOutcome {
                task_id: Some(task_id),
                sync: false,
                result: None,
            }),
            Ok(Err(e)) => {
                warn!("queue submit failed: {}, executing synchronously", e);
                self.run_sync(&task_id, kind).await
            }
            Err(_) => {
                warn!("queue submit timed out, executing synchronously");
                self.run_sync(&task_id, kind).await
            }
        }
    }

    async fn run_sync(&self, orphan_task_id: &str, kind: TaskKind) -> Result<SubmitOutcome> {
        // The half-submitted row (if any) never runs; drop it
        let _ = sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
            .bind(orphan_task_id)
            .execute(self.db.pool())
            .await;
        let result = Self::execute(&self.kb, kind).await?;
        Ok(SubmitOutcome {
            task_id: None,
            sync: true,
            result: Some(result),
        })
    }

    /// Poll a task's state and result
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
        let status: String = row.get("status");
        let result: Option<String> = row.get("result");
        Ok(TaskStatus {
            task_id: task_id.to_string(),
            status: TaskState::parse(&status),
            result: result.and_then(|raw| serde_json::from_str(&raw).ok()),
            error: row.get("error"),
            traceback: row.get("traceback"),
        })
    }

    async fn run_task(
        db: &Database,
        kb: &KnowledgeBaseService,
        tx: &flume::Sender<String>,
        task_id: &str,
    ) {
        let row = match sqlx::query("SELECT kind, attempts FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(db.pool())
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!("task {} vanished before execution", task_id);
                return;
            }
            Err(e) => {
                warn!("task {} unreadable: {}", task_id, e);
                return;
            }
        };
        let kind_json: String = row.get("kind");
        let attempts: i64 = row.get("attempts");

        let _ = sqlx::query(
            "UPDATE tasks SET status = 'STARTED', attempts = attempts + 1, updated_at = ?2 WHERE task_id = ?1",
        )
        .bind(task_id)
        .bind(now_str())
        .execute(db.pool())
        .await;

        let kind: TaskKind = match serde_json::from_str(&kind_json) {
            Ok(kind) => kind,
            Err(e) => {
                Self::finish(db, task_id, TaskState::Failure, None, Some(e.to_string()), None)
                    .await;
                return;
            }
        };

        match Self::execute(kb, kind).await {
            Ok(result) => {
                info!("task {} succeeded", task_id);
                Self::finish(db, task_id, TaskState::Success, Some(result), None, None).await;
            }
            Err(e) if e.is_retryable() && attempts + 1 < MAX_ATTEMPTS => {
                warn!("task {} failed retryably: {}, re-queueing", task_id, e);
                Self::finish(db, task_id, TaskState::Retry, None, Some(e.to_string()), None).await;
                let _ = tx.send_async(task_id.to_string()).await;
            }
            Err(e) => {
                warn!("task {} failed: {}", task_id, e);
                Self::finish(
                    db,
                    task_id,
                    TaskState::Failure,
                    None,
                    Some(e.to_string()),
                    Some(format!("{:?}", e)),
                )
                .await;
            }
        }
    }

    async fn finish(
        db: &Database,
        task_id: &str,
        state: TaskState,
        result: Option<Value>,
        error: Option<String>,
        traceback: Option<String>,
    ) {
        let result_json = result.map(|value| value.to_string());
        let _ = sqlx::query(
            r#"
            UPDATE tasks SET status = ?2, result = ?3, error = ?4, traceback = ?5, updated_at = ?6
            WHERE task_id = ?1
            "#,
        )
        .bind(task_id)
        .bind(state.as_str())
        .bind(result_json)
        .bind(error)
        .bind(traceback)
        .bind(now_str())
        .execute(db.pool())
        .await;
    }

    async fn execute(kb: &KnowledgeBaseService, kind: TaskKind) -> Result<Value> {
        match kind {
            TaskKind::AddFiles {
                kb_id,
                file_ids,
                user_id,
            } => {
                let (kb_row, skipped) = kb.add_files(kb_id, &file_ids, user_id).await?;
                Ok(serde_json::json!({
                    "kb_id": kb_id,
                    "file_count": kb_row.file_count,
                    "chunk_count": kb_row.chunk_count,
                    "skipped": skipped,
                }))
            }
            TaskKind::ReindexFile {
                kb_id,
                file_id,
                user_id,
            } => {
                let kb_row = kb.reindex_file(kb_id, file_id, user_id).await?;
                Ok(serde_json::json!({
                    "kb_id": kb_id,
                    "file_id": file_id,
                    "file_count": kb_row.file_count,
                    "chunk_count": kb_row.chunk_count,
                }))
            }
            TaskKind::ReindexAll { kb_id, user_id } => {
                let summary = kb.reindex_all(kb_id, user_id).await?;
                Ok(serde_json::to_value(summary)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_roundtrip() {
        for state in [
            TaskState::Pending,
            TaskState::Started,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Retry,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), state);
        }
        assert_eq!(TaskState::parse("garbage"), TaskState::Pending);
    }

    #[test]
    fn test_task_kind_serialization() {
        let kind = TaskKind::ReindexFile {
            kb_id: 1,
            file_id: 2,
            user_id: 3,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "reindex_file");
        let parsed: TaskKind = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, TaskKind::ReindexFile { file_id: 2, .. }));
    }
}
