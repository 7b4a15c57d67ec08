//! Chat orchestrator tests over in-memory backends

mod test_helpers;

use futures::StreamExt;
use test_helpers::{build_context, build_context_with, StubLlm};
use the_library::chat::{CancelHandle, ChatEvent};
use the_library::config::RagConfig;
use the_library::knowledge::KbParams;
use the_library::models::MessageRole;

const USER: i64 = 1;

#[tokio::test]
async fn test_chat_turn_persists_messages_and_sources() {
    let ctx = build_context().await;
    let kb = ctx.kb.create(USER, KbParams::named("kb")).await.unwrap();
    let file = ctx
        .files
        .upload(USER, "facts.txt", b"the capital hosts the annual robotics exhibition.", None)
        .await
        .unwrap();
    ctx.kb.add_files(kb.id, &[file.id], USER).await.unwrap();

    let outcome = ctx
        .chat
        .chat(USER, "where is the robotics exhibition", None, Some(kb.id))
        .await
        .unwrap();
    assert_eq!(outcome.message, "这是模型的回答。");
    assert!(outcome.confidence.is_some());
    assert!(!outcome.sources.is_empty());
    assert_eq!(outcome.sources[0].original_filename, "facts.txt");

    // Conversation was created with the question as title; both turns exist
    let conv = ctx
        .chat
        .get_conversation(outcome.conversation_id, USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.title.as_deref(), Some("where is the robotics exhibition"));
    let messages = ctx
        .chat
        .get_messages(outcome.conversation_id, USER, 100)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].confidence, outcome.confidence);
}

#[tokio::test]
async fn test_chat_without_any_kb_reports_no_confidence() {
    let ctx = build_context().await;
    let outcome = ctx.chat.chat(USER, "随便聊聊", None, None).await.unwrap();
    assert!(outcome.confidence.is_none());
    assert!(outcome.sources.is_empty());
}

#[tokio::test]
async fn test_llm_failure_persists_apology() {
    let failing = StubLlm {
        fail: true,
        ..Default::default()
    };
    let ctx = build_context_with(RagConfig::default(), failing, String::new()).await;
    let outcome = ctx.chat.chat(USER, "你好", None, None).await.unwrap();
    assert!(outcome.message.contains("抱歉"));

    let messages = ctx
        .chat
        .get_messages(outcome.conversation_id, USER, 10)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].content.contains("抱歉"));
}

#[tokio::test]
async fn test_conversation_eviction_bounds_history() {
    let mut config = RagConfig::default();
    config.chat.history_max_count = 3;
    let ctx = build_context_with(config, StubLlm::default(), String::new()).await;

    for i in 0..5 {
        ctx.chat
            .chat(USER, &format!("第 {} 个问题", i), None, None)
            .await
            .unwrap();
    }
    let page = ctx.chat.list_conversations(USER, 1, None).await.unwrap();
    assert!(page.total <= 3, "expected eviction, got {}", page.total);
}

#[tokio::test]
async fn test_stream_yields_tokens_then_done() {
    let ctx = build_context().await;
    let events: Vec<ChatEvent> = ctx
        .chat
        .chat_stream(USER, "问题".to_string(), None, None, CancelHandle::new())
        .collect()
        .await;

    let token_count = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::Token { .. }))
        .count();
    assert_eq!(token_count, 4);
    match events.last().unwrap() {
        ChatEvent::Done {
            conversation_id,
            confidence,
            ..
        } => {
            assert!(*conversation_id > 0);
            assert!(confidence.is_none());
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_cancel_persists_partial_reply() {
    let paced = StubLlm {
        token_delay_ms: 40,
        ..Default::default()
    };
    let ctx = build_context_with(RagConfig::default(), paced, String::new()).await;
    let cancel = CancelHandle::new();
    let mut stream = ctx.chat.chat_stream(
        USER,
        "问题".to_string(),
        None,
        None,
        cancel.clone(),
    );

    let mut received = 0;
    while let Some(event) = stream.next().await {
        match event {
            ChatEvent::Token { .. } => {
                received += 1;
                if received == 3 {
                    cancel.cancel();
                }
            }
            ChatEvent::Done { .. } => panic!("no done event after cancel"),
            ChatEvent::Error { message } => panic!("unexpected error: {}", message),
        }
    }
    assert_eq!(received, 3);

    // The 3-token partial reply was still persisted
    let page = ctx.chat.list_conversations(USER, 1, None).await.unwrap();
    assert_eq!(page.total, 1);
    let conv_id = page.conversations[0].id;
    let messages = ctx.chat.get_messages(conv_id, USER, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "这是模型的回答");
}

#[tokio::test]
async fn test_conversation_rate_limit() {
    let mut config = RagConfig::default();
    config.rate_limit.conversation_per_day = 1;
    let ctx = build_context_with(config, StubLlm::default(), String::new()).await;

    ctx.chat.chat(USER, "第一条", None, None).await.unwrap();
    let err = ctx.chat.chat(USER, "第二条", None, None).await.unwrap_err();
    assert_eq!(err.category(), "rate_limit");
}

#[tokio::test]
async fn test_delete_conversation_cascades_messages() {
    let ctx = build_context().await;
    let outcome = ctx.chat.chat(USER, "你好", None, None).await.unwrap();
    ctx.chat
        .delete_conversation(outcome.conversation_id, USER)
        .await
        .unwrap();
    assert!(ctx
        .chat
        .get_conversation(outcome.conversation_id, USER)
        .await
        .unwrap()
        .is_none());
    let messages = ctx
        .chat
        .get_messages(outcome.conversation_id, USER, 10)
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_continued_conversation_keeps_history() {
    let ctx = build_context().await;
    let first = ctx.chat.chat(USER, "第一个问题", None, None).await.unwrap();
    let second = ctx
        .chat
        .chat(USER, "继续追问", Some(first.conversation_id), None)
        .await
        .unwrap();
    assert_eq!(first.conversation_id, second.conversation_id);
    let messages = ctx
        .chat
        .get_messages(first.conversation_id, USER, 10)
        .await
        .unwrap();
    assert_eq!(messages.len(), 4);
    // Title still derives from the first message
    let conv = ctx
        .chat
        .get_conversation(first.conversation_id, USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.title.as_deref(), Some("第一个问题"));
}
