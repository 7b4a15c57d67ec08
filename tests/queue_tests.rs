//! Async task runner tests

mod test_helpers;

use std::time::Duration;
use test_helpers::build_context;
use the_library::knowledge::KbParams;
use the_library::queue::{TaskKind, TaskRunner, TaskState};

const USER: i64 = 1;

#[tokio::test]
async fn test_submitted_task_runs_to_success() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let file = ctx
        .files
        .upload(USER, "doc.txt", "队列任务的测试内容。".as_bytes(), None)
        .await
        .unwrap();

    let runner = TaskRunner::start(ctx.db.clone(), ctx.kb.clone(), 10, 2);
    let outcome = runner
        .submit(TaskKind::AddFiles {
            kb_id: kb.id,
            file_ids: vec![file.id],
            user_id: USER,
        })
        .await
        .unwrap();
    assert!(!outcome.sync);
    let task_id = outcome.task_id.expect("task id expected");

    // Poll until the worker finishes
    let mut status = runner.status(&task_id).await.unwrap();
    for _ in 0..100 {
        if matches!(status.status, TaskState::Success | TaskState::Failure) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = runner.status(&task_id).await.unwrap();
    }
    assert_eq!(status.status, TaskState::Success);
    let result = status.result.expect("result payload expected");
    assert_eq!(result["kb_id"], kb.id);
    assert_eq!(result["file_count"], 1);
    assert!(result["chunk_count"].as_i64().unwrap() >= 1);

    let kb_after = ctx.kb.get(kb.id, USER).await.unwrap().unwrap();
    assert_eq!(kb_after.file_count, 1);
}

#[tokio::test]
async fn test_queue_outage_falls_back_to_sync_execution() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let file = ctx
        .files
        .upload(USER, "doc.txt", "同步回退的测试内容。".as_bytes(), None)
        .await
        .unwrap();
    ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();

    // Zero submit budget: the enqueue cannot complete in time
    let runner = TaskRunner::start(ctx.db.clone(), ctx.kb.clone(), 0, 1);
    let outcome = runner
        .submit(TaskKind::ReindexFile {
            kb_id: kb.id,
            file_id: file.id,
            user_id: USER,
        })
        .await
        .unwrap();

    assert!(outcome.sync);
    assert!(outcome.task_id.is_none());
    let result = outcome.result.expect("sync execution returns the payload");
    assert_eq!(result["kb_id"], kb.id);
    assert_eq!(result["file_id"], file.id);

    // The reindex really happened
    let kb_after = ctx.kb.get(kb.id, USER).await.unwrap().unwrap();
    assert_eq!(kb_after.file_count, 1);
    assert!(kb_after.chunk_count >= 1);
}

#[tokio::test]
async fn test_unknown_task_id_is_not_found() {
    let ctx = build_context().await;
    let runner = TaskRunner::start(ctx.db.clone(), ctx.kb.clone(), 10, 1);
    let err = runner.status("no-such-task").await.unwrap_err();
    assert_eq!(err.category(), "queue");
}

#[tokio::test]
async fn test_failed_task_reports_error_and_traceback() {
    let ctx = build_context().await;
    let runner = TaskRunner::start(ctx.db.clone(), ctx.kb.clone(), 10, 1);
    // KB 999 does not exist, so the task fails
    let outcome = runner
        .submit(TaskKind::ReindexAll {
            kb_id: 999,
            user_id: USER,
        })
        .await
        .unwrap();
    let task_id = outcome.task_id.unwrap();

    let mut status = runner.status(&task_id).await.unwrap();
    for _ in 0..100 {
        if matches!(status.status, TaskState::Success | TaskState::Failure) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = runner.status(&task_id).await.unwrap();
    }
    assert_eq!(status.status, TaskState::Failure);
    assert!(status.error.is_some());
    assert!(status.traceback.is_some());
}
