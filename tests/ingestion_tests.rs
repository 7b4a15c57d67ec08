//! End-to-end ingestion pipeline tests over in-memory backends

mod test_helpers;

use futures::StreamExt;
use test_helpers::build_context;
use the_library::knowledge::{IngestEvent, KbParams};
use the_library::models::EmbeddingSource;
use the_library::vector::vector_id_for_chunk;

const USER: i64 = 1;

#[tokio::test]
async fn test_add_files_indexes_chunks_and_vectors() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("资料库")).await.unwrap();
    let text = "第一句介绍了项目背景。第二句描述了系统架构。第三句总结了关键结论。";
    let file = ctx.files.upload(USER, "intro.txt", text.as_bytes(), None).await.unwrap();

    let (kb, skipped) = ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    assert!(skipped.is_empty());
    assert_eq!(kb.file_count, 1);
    assert!(kb.chunk_count >= 1);

    // Every chunk row has exactly one vector under its deterministic id,
    // with a matching scalar payload
    let chunks = ctx.kb.list_chunks(kb.id, file.id, USER).await.unwrap();
    assert_eq!(chunks.len() as i64, kb.chunk_count);
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, index as i64);
        assert_eq!(chunk.vector_id, vector_id_for_chunk(chunk.id));
        let payload = ctx.vectors.payload(chunk.vector_id).expect("vector missing");
        assert_eq!(payload.chunk_id, chunk.id);
        assert_eq!(payload.knowledge_base_id, kb.id);
    }

    // File counter matches
    let file = ctx.files.get(file.id, USER).await.unwrap().unwrap();
    assert_eq!(file.chunk_count, kb.chunk_count);
}

#[tokio::test]
async fn test_duplicate_add_is_skipped() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let file = ctx.files.upload(USER, "a.txt", "内容。".as_bytes(), None).await.unwrap();

    ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    let (kb_after, skipped) = ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].reason, "已在知识库中");
    assert_eq!(kb_after.file_count, 1);
}

#[tokio::test]
async fn test_remove_file_restores_counts_and_vectors() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let text = "第一句话说明了问题。第二句话给出了答案。第三句话补充了细节。";
    let file = ctx.files.upload(USER, "doc.txt", text.as_bytes(), None).await.unwrap();

    let (kb_before, _) = ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    assert!(kb_before.chunk_count > 0);
    assert!(ctx.vectors.len() > 0);

    ctx.kb.remove_file(kb.id, file.id, USER).await.unwrap();

    let kb_after = ctx.kb.get(kb.id, USER).await.unwrap().unwrap();
    assert_eq!(kb_after.file_count, 0);
    assert_eq!(kb_after.chunk_count, 0);
    assert_eq!(ctx.vectors.len(), 0);
    let file_after = ctx.files.get(file.id, USER).await.unwrap().unwrap();
    assert_eq!(file_after.chunk_count, 0);
}

#[tokio::test]
async fn test_reindex_preserves_counts() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let text = "这一段内容用于测试重建索引。重建之后数量应当一致。";
    let file = ctx.files.upload(USER, "doc.txt", text.as_bytes(), None).await.unwrap();

    let (kb_fresh, _) = ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    let fresh_chunks = kb_fresh.chunk_count;
    let fresh_files = kb_fresh.file_count;

    let kb_reindexed = ctx.kb.reindex_file(kb.id, file.id, USER).await.unwrap();
    assert_eq!(kb_reindexed.file_count, fresh_files);
    assert_eq!(kb_reindexed.chunk_count, fresh_chunks);
    assert_eq!(ctx.vectors.len() as i64, fresh_chunks);
}

#[tokio::test]
async fn test_image_ingestion_creates_text_and_image_chunks() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("相册")).await.unwrap();
    // Minimal PNG: magic header plus filler
    let png = [&[0x89u8, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A][..], &[0u8; 64][..]].concat();
    let file = ctx.files.upload(USER, "cat.png", &png, None).await.unwrap();

    let (kb, skipped) = ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    assert!(skipped.is_empty());
    assert!(kb.chunk_count >= 2, "expected OCR text chunk plus image chunk");

    let chunks = ctx.kb.list_chunks(kb.id, file.id, USER).await.unwrap();
    let text_chunks = chunks
        .iter()
        .filter(|c| c.embedding_source == EmbeddingSource::Text)
        .count();
    let image_chunks: Vec<_> = chunks
        .iter()
        .filter(|c| c.embedding_source == EmbeddingSource::Image)
        .collect();
    assert!(text_chunks >= 1);
    assert_eq!(image_chunks.len(), 1);

    // Image-by-image search with the same bytes finds this file first
    let hits = ctx
        .kb
        .search_images_by_image(&png, "png", USER, Some(kb.id), 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file_id, file.id);
    assert_eq!(hits[0].original_filename, "cat.png");
}

#[tokio::test]
async fn test_text_to_image_search_finds_described_image() {
    let ctx = test_helpers::build_context_with(
        the_library::config::RagConfig::default(),
        test_helpers::StubLlm::default(),
        "一只橘色的猫咪趴在沙发上。".to_string(),
    )
    .await;
    let kb = ctx.kb.create(USER, KbParams::named("相册")).await.unwrap();
    let png = [&[0x89u8, 0x50, 0x4E, 0x47][..], &[0u8; 32][..]].concat();
    let image = ctx.files.upload(USER, "cat.png", &png, None).await.unwrap();
    let note = ctx
        .files
        .upload(USER, "note.txt", "关于服务器架构的说明。".as_bytes(), None)
        .await
        .unwrap();
    ctx.kb.add_files(kb.id, &[image.id, note.id], USER).await.unwrap();

    let hits = ctx
        .kb
        .search_images_by_text("橘色的猫咪", USER, Some(kb.id), 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1, "only image files may be returned");
    assert_eq!(hits[0].file_id, image.id);
    assert!(hits[0].snippet.contains("猫咪"));
}

#[tokio::test]
async fn test_stream_emits_events_in_order() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let good = ctx.files.upload(USER, "good.txt", "有效内容。".as_bytes(), None).await.unwrap();

    let events: Vec<IngestEvent> = ctx
        .kb
        .add_files_stream(kb.id, vec![good.id, 9999], USER)
        .collect()
        .await;

    assert!(matches!(events[0], IngestEvent::FileStart { file_id, .. } if file_id == good.id));
    assert!(matches!(events[1], IngestEvent::FileDone { file_id, chunk_count, .. }
        if file_id == good.id && chunk_count > 0));
    assert!(matches!(events[2], IngestEvent::FileStart { file_id, .. } if file_id == 9999));
    assert!(matches!(events[3], IngestEvent::FileSkip { .. }));
    match events.last().unwrap() {
        IngestEvent::Done {
            knowledge_base,
            skipped,
        } => {
            assert_eq!(knowledge_base.file_count, 1);
            assert_eq!(skipped.len(), 1);
        }
        other => panic!("expected done event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_kb_delete_cleans_vectors() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let file = ctx.files.upload(USER, "doc.txt", "一些内容。".as_bytes(), None).await.unwrap();
    ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();
    assert!(ctx.vectors.len() > 0);

    ctx.kb.delete(kb.id, USER).await.unwrap();
    assert_eq!(ctx.vectors.len(), 0);
    assert!(ctx.kb.get(kb.id, USER).await.unwrap().is_none());
    // The file itself outlives the KB link
    assert!(ctx.files.get(file.id, USER).await.unwrap().is_some());
}

#[tokio::test]
async fn test_ownership_is_enforced() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let file = ctx.files.upload(USER, "doc.txt", "内容。".as_bytes(), None).await.unwrap();

    // Another user cannot see or mutate them
    assert!(ctx.kb.get(kb.id, 2).await.unwrap().is_none());
    assert!(ctx.kb.add_files(kb.id, &[file.id], 2).await.is_err());
    assert!(ctx.files.delete(file.id, 2).await.is_err());
}
