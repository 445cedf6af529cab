//! MCP tool reached over JSON-RPC 2.0 (`tools/call`)

use super::{McpToolExecutor, McpToolSpec};
use askforge_common::config::McpToolConfig;
use askforge_common::errors::{AppError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct HttpMcpTool {
    spec: McpToolSpec,
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<CallResult>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct CallResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl HttpMcpTool {
    pub fn new(config: &McpToolConfig) -> Result<Self> {
        // The batch service bounds each call, so no client-level timeout here
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create MCP HTTP client: {}", e),
            })?;

        Ok(Self {
            spec: McpToolSpec::from(config),
            endpoint: config.endpoint.clone(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    fn failure(&self, message: impl Into<String>) -> AppError {
        AppError::ToolExecution {
            tool_id: self.spec.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl McpToolExecutor for HttpMcpTool {
    fn spec(&self) -> &McpToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": self.spec.name,
                "arguments": arguments,
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failure(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.failure(format!("HTTP {}: {}", status, text)));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| self.failure(format!("invalid JSON-RPC response: {}", e)))?;

        if let Some(error) = parsed.error {
            return Err(self.failure(format!("rpc error {}: {}", error.code, error.message)));
        }

        let result = parsed
            .result
            .ok_or_else(|| self.failure("response has neither result nor error"))?;

        let text = result
            .content
            .into_iter()
            .filter(|item| item.kind == "text")
            .filter_map(|item| item.text)
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error {
            return Err(self.failure(text));
        }
        Ok(text)
    }
}
