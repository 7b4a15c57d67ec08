//! Model Context Protocol (MCP) client
//!
//! Connects to external tool servers over HTTP JSON-RPC, caches their tool
//! catalogs, and converts MCP tool definitions into the OpenAI function
//! shape the chat orchestrator exposes to the model. Server-side transport
//! internals beyond this JSON-RPC client are out of scope.

use crate::config::{McpConfig, McpServerConfig};
use crate::error::{RagError, Result};
use crate::llm::{FunctionDefinition, ToolDefinition};
use jsonrpc_core::{Id, MethodCall, Output, Params, Response, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tool definition advertised by an MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Maps the OpenAI-visible function name back to `(server, tool)`
pub type ToolCallMap = HashMap<String, (String, String)>;

struct HttpConnection {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpConnection {
    fn new(url: String, auth_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            url,
            auth_token,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = Id::Str(Uuid::new_v4().to_string());
        let request = MethodCall {
            jsonrpc: Some(Version::V2),
            method: method.to_string(),
            params: Params::Map(params.as_object().cloned().unwrap_or_else(Map::new)),
            id: id.clone(),
        };

        let mut http_request = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.auth_token {
            http_request = http_request.bearer_auth(token);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| RagError::Mcp(format!("connection failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(RagError::Mcp(format!(
                "server returned {}",
                response.status()
            )));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|e| RagError::Mcp(format!("protocol error: {}", e)))?;
        match parsed {
            Response::Single(Output::Success(success)) => Ok(success.result),
            Response::Single(Output::Failure(failure)) => Err(RagError::Mcp(format!(
                "server error {:?}: {}",
                failure.error.code, failure.error.message
            ))),
            Response::Batch(_) => Err(RagError::Mcp("unexpected batch response".into())),
        }
    }
}

/// Client over the configured MCP servers
pub struct McpClient {
    connections: HashMap<String, HttpConnection>,
    tools_cache: HashMap<String, Vec<McpTool>>,
    config: McpConfig,
}

impl McpClient {
    pub fn new(config: McpConfig) -> Self {
        Self {
            connections: HashMap::new(),
            tools_cache: HashMap::new(),
            config,
        }
    }

    /// True when at least one enabled server has been connected
    pub fn has_servers(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn max_tool_rounds(&self) -> usize {
        self.config.max_tool_rounds
    }

    /// Connect every enabled configured server and cache its tool catalog.
    /// A server that fails to initialise is skipped with a warning.
    pub async fn connect_all(&mut self) {
        let servers: Vec<(String, McpServerConfig)> = self
            .config
            .servers
            .iter()
            .map(|(name, server)| (name.clone(), server.clone()))
            .collect();
        for (name, server) in servers {
            if !server.enabled {
                debug!("MCP server {} is disabled, skipping", name);
                continue;
            }
            if let Err(e) = self.add_server(&name, &server).await {
                warn!("MCP server {} unavailable: {}", name, e);
            }
        }
    }

    /// Connect one server, run the MCP initialize handshake, and cache its
    /// tools
    pub async fn add_server(&mut self, name: &str, server: &McpServerConfig) -> Result<()> {
        let timeout_secs = server.timeout.unwrap_or(self.config.default_timeout);
        let connection = HttpConnection::new(
            server.url.clone(),
            server.auth_token.clone(),
            Duration::from_secs(timeout_secs),
        );

        connection
            .call(
                "initialize",
                serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "the-library", "version": crate::VERSION },
                }),
            )
            .await?;

        let tools_response = connection
            .call("tools/list", Value::Object(Map::new()))
            .await?;
        let tools: Vec<McpTool> = tools_response
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        info!("MCP server {} provides {} tools", name, tools.len());
        self.tools_cache.insert(name.to_string(), tools);
        self.connections.insert(name.to_string(), connection);
        Ok(())
    }

    /// All cached tools as OpenAI function definitions, plus the reverse
    /// map from the exposed function name to `(server, tool)`.
    pub fn openai_tools(&self) -> (Vec<ToolDefinition>, ToolCallMap) {
        let mut definitions = Vec::new();
        let mut call_map = ToolCallMap::new();
        for (server_name, tools) in &self.tools_cache {
            for tool in tools {
                let exposed = openai_function_name(server_name, &tool.name);
                call_map.insert(exposed.clone(), (server_name.clone(), tool.name.clone()));
                definitions.push(ToolDefinition {
                    kind: "function".to_string(),
                    function: FunctionDefinition {
                        name: exposed,
                        description: if tool.description.is_empty() {
                            format!("MCP 工具: {}", tool.name)
                        } else {
                            tool.description.clone()
                        },
                        parameters: if tool.input_schema.is_object() {
                            tool.input_schema.clone()
                        } else {
                            serde_json::json!({ "type": "object", "properties": {} })
                        },
                    },
                });
            }
        }
        (definitions, call_map)
    }

    /// Execute a tool and flatten the MCP content parts into one text blob
    /// for the model. Failures become an error string rather than an `Err`
    /// so the tool loop can keep going.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> String {
        let Some(connection) = self.connections.get(server) else {
            return format!("[MCP 工具错误] 服务器 {} 不可用", server);
        };
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let deadline = Duration::from_secs(self.config.default_timeout);

        let result = match timeout(deadline, connection.call("tools/call", params)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return format!("[MCP 工具错误] {}", e),
            Err(_) => return format!("[MCP 工具错误] 调用超时: {}", tool),
        };

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = flatten_content(&result);
        if is_error {
            format!("[MCP 工具错误] {}", text)
        } else {
            text
        }
    }
}

/// `mcp_<server-slug>_<tool>`, truncated to the provider's 64-char limit
fn openai_function_name(server: &str, tool: &str) -> String {
    let slug: String = server
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .take(32)
        .collect();
    let name = format!("mcp_{}_{}", slug, tool).replace(' ', "_");
    name.chars().take(64).collect()
}

fn flatten_content(result: &Value) -> String {
    match result.get("content") {
        Some(Value::Array(parts)) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            texts.join("\n")
        }
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }

    #[test]
    fn test_function_name_shape() {
        assert_eq!(
            openai_function_name("web search", "lookup"),
            "mcp_web_search_lookup"
        );
        let long = openai_function_name(&"s".repeat(64), &"t".repeat(64));
        assert!(long.len() <= 64);
    }

    #[test]
    fn test_flatten_content_variants() {
        let parts = serde_json::json!({
            "content": [
                { "type": "text", "text": "第一段" },
                { "type": "image", "data": "...ignored..." },
                { "type": "text", "text": "第二段" }
            ]
        });
        assert_eq!(flatten_content(&parts), "第一段\n第二段");

        let plain = serde_json::json!({ "content": "plain" });
        assert_eq!(flatten_content(&plain), "plain");

        assert_eq!(flatten_content(&serde_json::json!({})), "");
    }

    async fn mock_server_with_tools() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "method": "initialize" })))
            .respond_with(move |req: &wiremock::Request| {
                let body: serde_json::Value = req.body_json().unwrap();
                ResponseTemplate::new(200)
                    .set_body_json(rpc_result(&body["id"], serde_json::json!({})))
            })
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "method": "tools/list" })))
            .respond_with(move |req: &wiremock::Request| {
                let body: serde_json::Value = req.body_json().unwrap();
                ResponseTemplate::new(200).set_body_json(rpc_result(
                    &body["id"],
                    serde_json::json!({ "tools": [{
                        "name": "lookup",
                        "description": "查询资料",
                        "inputSchema": { "type": "object", "properties": { "q": { "type": "string" } } }
                    }]}),
                ))
            })
            .mount(&server)
            .await;
        server
    }

    fn config_for(url: String) -> McpConfig {
        let mut servers = HashMap::new();
        servers.insert(
            "search".to_string(),
            McpServerConfig {
                url,
                auth_token: None,
                timeout: None,
                enabled: true,
            },
        );
        McpConfig {
            servers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_and_catalog() {
        let server = mock_server_with_tools().await;
        let mut client = McpClient::new(config_for(server.uri()));
        client.connect_all().await;
        assert!(client.has_servers());

        let (tools, call_map) = client.openai_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "mcp_search_lookup");
        assert_eq!(
            call_map.get("mcp_search_lookup"),
            Some(&("search".to_string(), "lookup".to_string()))
        );
    }

    #[tokio::test]
    async fn test_call_tool_flattens_text() {
        let server = mock_server_with_tools().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "method": "tools/call" })))
            .respond_with(move |req: &wiremock::Request| {
                let body: serde_json::Value = req.body_json().unwrap();
                ResponseTemplate::new(200).set_body_json(rpc_result(
                    &body["id"],
                    serde_json::json!({ "content": [{ "type": "text", "text": "结果" }] }),
                ))
            })
            .mount(&server)
            .await;

        let mut client = McpClient::new(config_for(server.uri()));
        client.connect_all().await;
        let text = client
            .call_tool("search", "lookup", serde_json::json!({ "q": "rust" }))
            .await;
        assert_eq!(text, "结果");
    }

    #[tokio::test]
    async fn test_unavailable_server_skipped() {
        let mut client = McpClient::new(config_for("http://127.0.0.1:1".to_string()));
        client.connect_all().await;
        assert!(!client.has_servers());

        let text = client
            .call_tool("search", "lookup", serde_json::json!({}))
            .await;
        assert!(text.contains("[MCP 工具错误]"));
    }

    #[tokio::test]
    async fn test_disabled_server_not_connected() {
        let server = mock_server_with_tools().await;
        let mut config = config_for(server.uri());
        config.servers.get_mut("search").unwrap().enabled = false;
        let mut client = McpClient::new(config);
        client.connect_all().await;
        assert!(!client.has_servers());
    }
}
