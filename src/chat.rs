//! Chat orchestration
//!
//! Persists the conversation, grounds the model on retrieved context (with
//! a low-confidence warning below the threshold), folds long histories into
//! an LLM summary, optionally runs a bounded MCP tool loop, and streams
//! tokens with disconnect handling. The model provider failing never fails
//! the request: a fixed apology is generated and persisted instead.

use crate::cache::CacheService;
use crate::config::ChatConfig;
use crate::db::{conversation_from_row, message_from_row, now_str, Database};
use crate::error::{RagError, Result};
use crate::llm::{system_message, tool_message, user_message, ChatMessage, LanguageModel};
use crate::mcp::McpClient;
use crate::models::{derive_title, Chunk, Citation, Conversation, Message, MessageRole};
use crate::retrieval::{RetrievalEngine, RetrievalScope};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const APOLOGY: &str = "抱歉，当前无法生成回答，请检查模型配置或网络。";
const FAILURE_FALLBACK: &str =
    "抱歉，处理您的请求时遇到问题，请稍后重试。若未选择知识库，请确认您已创建知识库并添加了文件。";
const STREAM_FAILURE_TOKEN: &str = "抱歉，生成回答时遇到问题，请稍后重试。";
const NOT_FOUND_NOTICE: &str = "[系统提示：未在所选知识库中检索到与用户问题相关的内容，\
    请明确告知用户「未在知识库中找到相关内容」，并建议用户检查知识库是否已添加文档并完成切分。]";

/// Client-disconnect signal polled between token deliveries
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Events of a streamed chat turn
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Token {
        content: String,
    },
    Done {
        conversation_id: i64,
        confidence: Option<f64>,
        sources: Vec<Citation>,
    },
    Error {
        message: String,
    },
}

/// Result of one chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub conversation_id: i64,
    pub message: String,
    pub tokens: i64,
    pub model: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub confidence: Option<f64>,
    pub retrieved_context: Option<String>,
    pub max_confidence_context: Option<String>,
    pub sources: Vec<Citation>,
}

/// One page of a user's conversations
#[derive(Debug, Clone)]
pub struct ConversationListPage {
    pub conversations: Vec<Conversation>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

struct RagOutcome {
    /// Context as shown to the model (may carry a system warning)
    prompt_context: String,
    /// Context as retrieved, without warnings
    original_context: String,
    confidence: f64,
    max_confidence_context: Option<String>,
    chunks: Vec<Chunk>,
    has_real_retrieval: bool,
    low_confidence: bool,
}

#[derive(Clone)]
pub struct ChatService {
    db: Database,
    retrieval: RetrievalEngine,
    llm: Arc<dyn LanguageModel>,
    mcp: Option<Arc<McpClient>>,
    cache: CacheService,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        db: Database,
        retrieval: RetrievalEngine,
        llm: Arc<dyn LanguageModel>,
        mcp: Option<Arc<McpClient>>,
        cache: CacheService,
        config: ChatConfig,
    ) -> Self {
        Self {
            db,
            retrieval,
            llm,
            mcp,
            cache,
            config,
        }
    }

    /// One synchronous chat turn
    pub async fn chat(
        &self,
        user_id: i64,
        message: &str,
        conversation_id: Option<i64>,
        knowledge_base_id: Option<i64>,
    ) -> Result<ChatOutcome> {
        let (allowed, count, limit) = self.cache.check_and_incr_conversation(user_id).await;
        if !allowed {
            return Err(RagError::RateLimited(format!(
                "今日对话次数已达上限（{}/{}）",
                count, limit
            )));
        }

        let conv = self
            .resolve_conversation(user_id, conversation_id, knowledge_base_id, message)
            .await?;
        self.insert_message(conv.id, MessageRole::User, message, 0, None, None, None, None, None)
            .await?;

        match self
            .answer_turn(user_id, &conv, message, knowledge_base_id)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Keep the turn: persist a fixed apology instead of failing
                warn!("chat turn failed: {}, persisting fallback reply", e);
                let persisted = self
                    .insert_message(
                        conv.id,
                        MessageRole::Assistant,
                        FAILURE_FALLBACK,
                        0,
                        Some(self.llm.model_id()),
                        None,
                        None,
                        None,
                        None,
                    )
                    .await?;
                self.cache.invalidate_conversation(user_id, conv.id).await;
                Ok(ChatOutcome {
                    conversation_id: conv.id,
                    message: FAILURE_FALLBACK.to_string(),
                    tokens: 0,
                    model: self.llm.model_id().to_string(),
                    created_at: persisted.created_at,
                    confidence: None,
                    retrieved_context: None,
                    max_confidence_context: None,
                    sources: Vec::new(),
                })
            }
        }
    }

    async fn answer_turn(
        &self,
        user_id: i64,
        conv: &Conversation,
        message: &str,
        knowledge_base_id: Option<i64>,
    ) -> Result<ChatOutcome> {
        let rag = self.build_rag(user_id, knowledge_base_id, message).await;
        let history = self.build_history_context(conv.id).await?;
        let prompt = compose_system_prompt(&rag.prompt_context, &history, rag.low_confidence);

        let content = match self.generate(&prompt, message).await {
            Ok(content) => content,
            Err(e) => {
                warn!("generation failed: {}", e);
                APOLOGY.to_string()
            }
        };

        let sources = self.build_sources(&rag.chunks).await?;
        let sources_json = if sources.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&sources)?)
        };

        let threshold = self.retrieval.config().confidence_threshold;
        let stored_confidence = rag.has_real_retrieval.then_some(rag.confidence);
        let stored_context = (rag.has_real_retrieval && rag.confidence < threshold)
            .then(|| rag.original_context.clone());

        let tokens = (content.chars().count() / 2) as i64;
        let persisted = self
            .insert_message(
                conv.id,
                MessageRole::Assistant,
                &content,
                tokens,
                Some(self.llm.model_id()),
                stored_confidence,
                stored_context.as_deref(),
                rag.max_confidence_context.as_deref(),
                sources_json.as_deref(),
            )
            .await?;
        self.touch_conversation(conv, message).await?;
        self.cache.invalidate_conversation(user_id, conv.id).await;

        Ok(ChatOutcome {
            conversation_id: conv.id,
            message: content,
            tokens,
            model: self.llm.model_id().to_string(),
            created_at: persisted.created_at,
            confidence: stored_confidence,
            retrieved_context: stored_context,
            max_confidence_context: rag.max_confidence_context,
            sources,
        })
    }

    /// Streamed chat turn: `token` events, then one `done`. When `cancel`
    /// fires, generation stops, no `done` is emitted, and whatever partial
    /// reply exists is persisted.
    pub fn chat_stream(
        &self,
        user_id: i64,
        message: String,
        conversation_id: Option<i64>,
        knowledge_base_id: Option<i64>,
        cancel: CancelHandle,
    ) -> BoxStream<'static, ChatEvent> {
        let service = self.clone();
        let (tx, rx) = flume::unbounded();

        tokio::spawn(async move {
            let (allowed, count, limit) =
                service.cache.check_and_incr_conversation(user_id).await;
            if !allowed {
                let _ = tx.send_async(ChatEvent::Error {
                    message: format!("今日对话次数已达上限（{}/{}）", count, limit),
                })
                .await;
                return;
            }

            let conv = match service
                .resolve_conversation(user_id, conversation_id, knowledge_base_id, &message)
                .await
            {
                Ok(conv) => conv,
                Err(e) => {
                    let _ = tx.send_async(ChatEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                    return;
                }
            };
            if service
                .insert_message(
                    conv.id,
                    MessageRole::User,
                    &message,
                    0,
                    None,
                    None,
                    None,
                    None,
                    None,
                )
                .await
                .is_err()
            {
                let _ = tx.send_async(ChatEvent::Error {
                    message: "消息保存失败".to_string(),
                })
                .await;
                return;
            }

            let rag = service
                .build_rag(user_id, knowledge_base_id, &message)
                .await;
            if cancel.is_cancelled() {
                debug!("client disconnected before generation");
                return;
            }
            let history = service.build_history_context(conv.id).await.unwrap_or_default();
            let prompt = compose_system_prompt(&rag.prompt_context, &history, rag.low_confidence);

            let mut collected = String::new();
            let messages = vec![system_message(prompt), user_message(message.clone())];
            let mut cancelled = false;
            match service.llm.chat_stream(messages).await {
                Ok(mut stream) => {
                    while let Some(delta) = stream.next().await {
                        if cancel.is_cancelled() {
                            cancelled = true;
                            break;
                        }
                        match delta {
                            Ok(token) => {
                                collected.push_str(&token);
                                if tx.send_async(ChatEvent::Token { content: token }).await.is_err()
                                {
                                    cancelled = true;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("stream generation failed: {}", e);
                                collected.push_str(STREAM_FAILURE_TOKEN);
                                let _ = tx.send_async(ChatEvent::Token {
                                    content: STREAM_FAILURE_TOKEN.to_string(),
                                })
                                .await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("stream start failed: {}", e);
                    collected.push_str(STREAM_FAILURE_TOKEN);
                    let _ = tx.send_async(ChatEvent::Token {
                        content: STREAM_FAILURE_TOKEN.to_string(),
                    })
                    .await;
                }
            }

            // The partial reply is persisted even on disconnect
            let sources = service.build_sources(&rag.chunks).await.unwrap_or_default();
            let sources_json = if sources.is_empty() {
                None
            } else {
                serde_json::to_string(&sources).ok()
            };
            let stored_confidence = rag.has_real_retrieval.then_some(rag.confidence);
            let tokens = (collected.chars().count() / 2) as i64;
            if let Err(e) = service
                .insert_message(
                    conv.id,
                    MessageRole::Assistant,
                    &collected,
                    tokens,
                    Some(service.llm.model_id()),
                    stored_confidence,
                    None,
                    rag.max_confidence_context.as_deref(),
                    sources_json.as_deref(),
                )
                .await
            {
                warn!("failed to persist streamed reply: {}", e);
            }
            let _ = service.touch_conversation(&conv, &message).await;
            service.cache.invalidate_conversation(user_id, conv.id).await;

            if !cancelled {
                let _ = tx.send_async(ChatEvent::Done {
                    conversation_id: conv.id,
                    confidence: stored_confidence,
                    sources,
                })
                .await;
            }
        });

        rx.into_stream().boxed()
    }

    // ---- RAG + history assembly ---- //

    async fn build_rag(
        &self,
        user_id: i64,
        knowledge_base_id: Option<i64>,
        message: &str,
    ) -> RagOutcome {
        let top_k = self.retrieval.config().top_k;
        let threshold = self.retrieval.config().confidence_threshold;

        // Never ground on a KB the user does not own; absence and foreign
        // ownership look the same to the caller
        let scope = match knowledge_base_id {
            Some(kb_id) => {
                let owned: Option<i64> = sqlx::query_scalar(
                    "SELECT id FROM knowledge_bases WHERE id = ?1 AND user_id = ?2",
                )
                .bind(kb_id)
                .bind(user_id)
                .fetch_optional(self.db.pool())
                .await
                .ok()
                .flatten();
                if owned.is_none() {
                    return RagOutcome {
                        prompt_context: NOT_FOUND_NOTICE.to_string(),
                        original_context: String::new(),
                        confidence: 0.0,
                        max_confidence_context: None,
                        chunks: Vec::new(),
                        has_real_retrieval: false,
                        low_confidence: false,
                    };
                }
                RetrievalScope::KnowledgeBase(kb_id)
            }
            None => RetrievalScope::AllKnowledgeBases { user_id },
        };

        let retrieved = match self.retrieval.retrieve(message, &scope, top_k).await {
            Ok(retrieved) => retrieved,
            Err(e) => {
                warn!("retrieval failed: {}, continuing without context", e);
                Default::default()
            }
        };

        if retrieved.is_empty() {
            // A single-KB scope reports "nothing found" to the model so the
            // user gets a clear answer; the all-KBs scope just goes without
            let prompt_context = if knowledge_base_id.is_some() {
                NOT_FOUND_NOTICE.to_string()
            } else {
                String::new()
            };
            return RagOutcome {
                prompt_context,
                original_context: String::new(),
                confidence: 0.0,
                max_confidence_context: None,
                chunks: Vec::new(),
                has_real_retrieval: false,
                low_confidence: false,
            };
        }

        let low_confidence = retrieved.confidence < threshold;
        let prompt_context = if low_confidence {
            // Tell the model to say so and fall back to general knowledge
            format!(
                "[系统提示：当前内部知识库检索结果的置信度为 {:.2}，低于阈值 {}。\
                 请明确告知用户「当前内部知识库置信度比较低，将使用AI自身知识解答问题」，\
                 然后结合检索到的上下文（如有）和AI自身知识回答问题。]\n\n{}",
                retrieved.confidence, threshold, retrieved.context
            )
        } else {
            retrieved.context.clone()
        };
        RagOutcome {
            prompt_context,
            original_context: retrieved.context,
            confidence: retrieved.confidence,
            max_confidence_context: retrieved.best_single_context,
            chunks: retrieved.chunks,
            has_real_retrieval: true,
            low_confidence,
        }
    }

    async fn load_history(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )
        .bind(conversation_id)
        .bind((self.config.context_message_count * 2) as i64)
        .fetch_all(self.db.pool())
        .await?;
        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Last N messages verbatim; anything older is folded into a short LLM
    /// summary prepended to the history block.
    async fn build_history_context(&self, conversation_id: i64) -> Result<String> {
        let mut messages = self.load_history(conversation_id).await?;
        if messages.is_empty() {
            return Ok(String::new());
        }
        let keep = self.config.context_message_count;
        let mut lines = Vec::new();
        if messages.len() > keep {
            let older: Vec<Message> = messages.drain(..messages.len() - keep).collect();
            let summary = self.summarize_messages(&older).await;
            if !summary.is_empty() {
                lines.push(format!("[对话历史总结] {}", summary));
            }
        }
        for message in &messages {
            let speaker = match message.role {
                MessageRole::User => "用户",
                _ => "助手",
            };
            lines.push(format!("{}: {}", speaker, message.content));
        }
        Ok(lines.join("\n\n"))
    }

    async fn summarize_messages(&self, messages: &[Message]) -> String {
        let mut prompt = String::from(
            "请简要总结以下对话历史，保留：1）用户主要问题与已得到的结论；\
             2）关键事实或数据；3）未解决或待延续的话题。\n\n",
        );
        for message in messages {
            let speaker = if message.role == MessageRole::User {
                "用户"
            } else {
                "助手"
            };
            let snippet: String = message.content.chars().take(300).collect();
            prompt.push_str(&format!("{}: {}\n", speaker, snippet));
        }
        let request = vec![
            system_message("你是对话总结助手。输出简洁的总结，便于后续回答时保持上下文连贯。"),
            user_message(prompt),
        ];
        match self.llm.chat(&request).await {
            Ok(summary) => summary.trim().chars().take(600).collect(),
            Err(e) => {
                warn!("history summarisation failed: {}", e);
                String::new()
            }
        }
    }

    // ---- generation ---- //

    /// Generate the reply, running the MCP tool loop when servers are up
    async fn generate(&self, system_prompt: &str, message: &str) -> Result<String> {
        let mut messages = vec![system_message(system_prompt), user_message(message)];

        let Some(mcp) = self.mcp.as_ref().filter(|m| m.has_servers()) else {
            return self.llm.chat(&messages).await;
        };

        let (tools, call_map) = mcp.openai_tools();
        if tools.is_empty() {
            return self.llm.chat(&messages).await;
        }

        for round in 0..mcp.max_tool_rounds() {
            let turn = self.llm.chat_with_tools(&messages, &tools).await?;
            if turn.tool_calls.is_empty() {
                return Ok(turn.content.unwrap_or_default());
            }
            debug!("tool round {}: {} calls", round + 1, turn.tool_calls.len());

            messages.push(ChatMessage {
                role: crate::llm::Role::Assistant,
                content: crate::llm::MessageContent::Text(
                    turn.content.clone().unwrap_or_default(),
                ),
                tool_calls: Some(turn.tool_calls.clone()),
                tool_call_id: None,
            });
            for call in &turn.tool_calls {
                let result = match call_map.get(&call.function.name) {
                    Some((server, tool)) => {
                        let arguments = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(serde_json::json!({}));
                        mcp.call_tool(server, tool, arguments).await
                    }
                    None => format!("[MCP 工具错误] 未知工具: {}", call.function.name),
                };
                messages.push(tool_message(call.id.clone(), result));
            }
        }

        // Round budget exhausted: answer from what has been gathered
        self.llm.chat(&messages).await
    }

    // ---- persistence ---- //

    async fn resolve_conversation(
        &self,
        user_id: i64,
        conversation_id: Option<i64>,
        knowledge_base_id: Option<i64>,
        first_message: &str,
    ) -> Result<Conversation> {
        if let Some(conv_id) = conversation_id {
            return self
                .get_conversation(conv_id, user_id)
                .await?
                .ok_or_else(|| RagError::NotFound("对话不存在".into()));
        }
        let now = now_str();
        let row = sqlx::query(
            r#"
            INSERT INTO conversations (user_id, knowledge_base_id, title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(knowledge_base_id)
        .bind(derive_title(first_message))
        .bind(&now)
        .fetch_one(self.db.pool())
        .await?;
        self.evict_old_conversations(user_id).await?;
        Ok(conversation_from_row(&row))
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
        tokens: i64,
        model: Option<&str>,
        confidence: Option<f64>,
        retrieved_context: Option<&str>,
        max_confidence_context: Option<&str>,
        sources: Option<&str>,
    ) -> Result<Message> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages
                (conversation_id, role, content, tokens, model, confidence,
                 retrieved_context, max_confidence_context, sources, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(tokens)
        .bind(model)
        .bind(confidence)
        .bind(retrieved_context)
        .bind(max_confidence_context)
        .bind(sources)
        .bind(now_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(message_from_row(&row))
    }

    async fn touch_conversation(&self, conv: &Conversation, first_message: &str) -> Result<()> {
        let title = match &conv.title {
            Some(title) if !title.trim().is_empty() => title.clone(),
            _ => derive_title(first_message),
        };
        sqlx::query("UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(conv.id)
            .bind(title)
            .bind(now_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn build_sources(&self, chunks: &[Chunk]) -> Result<Vec<Citation>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let file_ids: Vec<i64> = {
            let mut ids: Vec<i64> = chunks.iter().map(|chunk| chunk.file_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let id_list = file_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "SELECT id, original_filename FROM files WHERE id IN ({})",
            id_list
        ))
        .fetch_all(self.db.pool())
        .await?;
        use sqlx::Row;
        let names: HashMap<i64, String> = rows
            .iter()
            .map(|row| (row.get::<i64, _>("id"), row.get::<String, _>("original_filename")))
            .collect();
        Ok(chunks
            .iter()
            .map(|chunk| {
                let name = names
                    .get(&chunk.file_id)
                    .cloned()
                    .unwrap_or_else(|| format!("file_{}", chunk.file_id));
                Citation::from_chunk(chunk, &name)
            })
            .collect())
    }

    // ---- conversation management ---- //

    /// Oldest conversations are evicted once the per-user cap is exceeded
    async fn evict_old_conversations(&self, user_id: i64) -> Result<()> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(self.db.pool())
                .await?;
        let excess = total - self.config.history_max_count;
        if excess <= 0 {
            return Ok(());
        }
        sqlx::query(
            r#"
            DELETE FROM conversations WHERE id IN (
                SELECT id FROM conversations WHERE user_id = ?1
                ORDER BY updated_at ASC, id ASC LIMIT ?2
            )
            "#,
        )
        .bind(user_id)
        .bind(excess)
        .execute(self.db.pool())
        .await?;
        info!("evicted {} old conversations for user {}", excess, user_id);
        Ok(())
    }

    pub async fn list_conversations(
        &self,
        user_id: i64,
        page: i64,
        page_size: Option<i64>,
    ) -> Result<ConversationListPage> {
        self.evict_old_conversations(user_id).await?;
        let page = page.max(1);
        let page_size = page_size
            .unwrap_or(self.config.history_default_count)
            .clamp(1, self.config.history_max_count);
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(self.db.pool())
                .await?;
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(self.db.pool())
        .await?;
        Ok(ConversationListPage {
            conversations: rows.iter().map(conversation_from_row).collect(),
            total,
            page,
            page_size,
        })
    }

    pub async fn get_conversation(
        &self,
        conv_id: i64,
        user_id: i64,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1 AND user_id = ?2")
            .bind(conv_id)
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|row| conversation_from_row(&row)))
    }

    pub async fn get_messages(
        &self,
        conv_id: i64,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        if self.get_conversation(conv_id, user_id).await?.is_none() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
        )
        .bind(conv_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn delete_conversation(&self, conv_id: i64, user_id: i64) -> Result<()> {
        if self.get_conversation(conv_id, user_id).await?.is_none() {
            return Err(RagError::NotFound("对话不存在".into()));
        }
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(conv_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(conv_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.cache.invalidate_conversation(user_id, conv_id).await;
        Ok(())
    }
}

/// Compose the final system prompt: knowledge-base context first, then the
/// conversation history, omitting empty sections.
fn compose_system_prompt(kb_context: &str, history: &str, low_confidence: bool) -> String {
    let mut parts = vec!["你是一个有帮助的AI助手。请根据以下信息回答用户问题：".to_string()];
    if !kb_context.trim().is_empty() {
        if low_confidence {
            parts.push(format!(
                "\n【知识库上下文（置信度较低，请结合AI自身知识）】\n{}",
                kb_context
            ));
        } else {
            parts.push(format!("\n【知识库上下文】\n{}", kb_context));
        }
    }
    if !history.trim().is_empty() {
        parts.push(format!("\n【对话历史】\n{}", history));
    }
    parts.push("\n请基于以上信息回答用户问题，保持对话连贯性。".to_string());
    parts.join("")
}
