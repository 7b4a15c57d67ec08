//! Chat model client (OpenAI-compatible endpoint)
//!
//! Covers the four call shapes the engine needs: one-shot generation,
//! streamed generation (`delta.content` over SSE), generation with tools
//! exposed, and the small utility prompts (query expansion for multi-query
//! retrieval).

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Message role on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain text or multimodal parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One multimodal content part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A chat message in the completions wire shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(&self) -> &str {
        match &self.content {
            MessageContent::Text(text) => text,
            MessageContent::Parts(_) => "",
        }
    }
}

/// Helper to build a system message
pub fn system_message(content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: MessageContent::Text(content.into()),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// Helper to build a user message
pub fn user_message(content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: MessageContent::Text(content.into()),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// Helper to build an assistant message
pub fn assistant_message(content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: MessageContent::Text(content.into()),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// Helper to build a tool-result message
pub fn tool_message(tool_call_id: impl Into<String>, content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::Tool,
        content: MessageContent::Text(content.into()),
        tool_calls: None,
        tool_call_id: Some(tool_call_id.into()),
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the provider sends them
    pub arguments: String,
}

/// A tool definition exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The model's reply in a tool round: text, tool calls, or both
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Stream of generated text deltas
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Chat model operations used across the engine
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One-shot generation; returns the full reply text
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Generation with tools exposed; the model may return tool calls
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantTurn>;

    /// Streamed generation of content deltas
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream>;

    /// Model identifier recorded on persisted messages
    fn model_id(&self) -> &str;

    /// Paraphrase a question into up to `count` retrieval queries. Failure
    /// degrades to no expansion.
    async fn query_expand(&self, question: &str, count: usize) -> Vec<String> {
        if count == 0 {
            return Vec::new();
        }
        let prompt = format!(
            "请针对下面的用户问题，生成 {} 个意思相近的改写问句或子问题（用于文档检索）。\n\
             要求：每行一个问句，不要编号、不要解释，只输出问句。问句要简短，保留关键实体和意图。\n\
             用户问题：{}",
            count.min(3),
            question
        );
        let messages = vec![
            system_message("你只输出检索用的改写问句，每行一个，不要其他内容。"),
            user_message(prompt),
        ];
        match self.chat(&messages).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter(|line| {
                    !line.starts_with(['1', '2', '3', '一', '二', '三', '-', '*'])
                })
                .map(str::to_string)
                .take(count)
                .collect(),
            Err(e) => {
                warn!("query expansion failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint
pub struct HttpLlm {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpLlm {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            tools,
            stream,
        };
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::ConnectionFailed(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::GenerationFailed(format!("{}: {}", status, body)).into());
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for HttpLlm {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        debug!("chat completion with {} messages", messages.len());
        let response = self.send(messages, None, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(content.trim().to_string())
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantTurn> {
        let tools_opt = if tools.is_empty() { None } else { Some(tools) };
        let response = self.send(messages, tools_opt, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("no choices returned".into()))?;
        Ok(AssistantTurn {
            content: message.content.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            tool_calls: message.tool_calls.unwrap_or_default(),
        })
    }

    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        let response = self.send(&messages, None, true).await?;
        let (tx, rx) = flume::unbounded::<Result<String>>();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(item) = bytes.next().await {
                let data = match item {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx
                            .send_async(Err(LlmError::ConnectionFailed(e.to_string()).into()))
                            .await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&data));
                // SSE frames are separated by a blank line
                while let Some(boundary) = buffer.find("\n\n") {
                    let frame = buffer[..boundary].to_string();
                    buffer.drain(..boundary + 2);
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                            continue;
                        };
                        if payload == "[DONE]" {
                            break 'outer;
                        }
                        match serde_json::from_str::<StreamChunk>(payload) {
                            Ok(chunk) => {
                                let delta = chunk
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|c| c.delta.content)
                                    .unwrap_or_default();
                                if !delta.is_empty()
                                    && tx.send_async(Ok(delta)).await.is_err()
                                {
                                    break 'outer;
                                }
                            }
                            Err(e) => debug!("unparseable stream frame: {}", e),
                        }
                    }
                }
            }
        });

        Ok(rx.into_stream().boxed())
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn llm(url: String) -> HttpLlm {
        HttpLlm::new(LlmConfig {
            base_url: url,
            model: "test-model".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_message_serialization() {
        let message = user_message("你好");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "你好");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_multimodal_parts_serialization() {
        let message = ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,AAAA".to_string(),
                    },
                },
                ContentPart::Text {
                    text: "描述这张图".to_string(),
                },
            ]),
            tool_calls: None,
            tool_call_id: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["content"][0]["type"], "image_url");
        assert_eq!(json["content"][1]["text"], "描述这张图");
    }

    #[tokio::test]
    async fn test_chat_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "  回答  " } }]
            })))
            .mount(&server)
            .await;

        let reply = llm(server.uri()).chat(&[user_message("问")]).await.unwrap();
        assert_eq!(reply, "回答");
    }

    #[tokio::test]
    async fn test_chat_with_tools_parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "tools": [{ "type": "function" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "mcp_search_lookup", "arguments": "{\"q\":\"x\"}" }
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let tools = vec![ToolDefinition {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: "mcp_search_lookup".to_string(),
                description: "lookup".to_string(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
        }];
        let turn = llm(server.uri())
            .chat_with_tools(&[user_message("查一下")], &tools)
            .await
            .unwrap();
        assert!(turn.content.is_none());
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].function.name, "mcp_search_lookup");
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"你\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"好\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut stream = llm(server.uri())
            .chat_stream(vec![user_message("hi")])
            .await
            .unwrap();
        let mut collected = String::new();
        while let Some(delta) = stream.next().await {
            collected.push_str(&delta.unwrap());
        }
        assert_eq!(collected, "你好");
    }

    #[tokio::test]
    async fn test_query_expand_filters_numbered_lines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": "什么是向量检索\n1. 编号行应被过滤\n向量检索的原理是什么"
                }}]
            })))
            .mount(&server)
            .await;

        let expanded = llm(server.uri()).query_expand("向量检索", 2).await;
        assert_eq!(expanded, vec!["什么是向量检索", "向量检索的原理是什么"]);
    }

    #[tokio::test]
    async fn test_provider_error_is_generation_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = llm(server.uri()).chat(&[user_message("x")]).await.unwrap_err();
        assert_eq!(err.category(), "llm");
    }
}
