//! MCP tool execution
//!
//! Tools are registered by id. `McpService` runs a batch of calls
//! concurrently, each bounded by the configured call timeout, and reports a
//! response per request in submission order.

mod extractor;
mod http;

pub use extractor::{LlmParameterExtractor, ParameterExtractor};
pub use http::HttpMcpTool;

use askforge_common::config::{McpConfig, McpToolConfig};
use askforge_common::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tool description shared with the parameter extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments
    pub input_schema: Value,
}

impl From<&McpToolConfig> for McpToolSpec {
    fn from(config: &McpToolConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            input_schema: config.input_schema.clone(),
        }
    }
}

#[async_trait]
pub trait McpToolExecutor: Send + Sync {
    fn spec(&self) -> &McpToolSpec;

    /// Run the tool and return its text output
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<String>;
}

/// One tool call in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRequest {
    pub tool_id: String,
    pub arguments: Map<String, Value>,
}

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse {
    pub tool_id: String,
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl McpResponse {
    fn failed(tool_id: &str, error: String, elapsed_ms: u64) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            success: false,
            content: String::new(),
            error: Some(error),
            elapsed_ms,
        }
    }
}

/// Tools available to MCP intents, keyed by id
#[derive(Default)]
pub struct McpToolRegistry {
    tools: HashMap<String, Arc<dyn McpToolExecutor>>,
}

impl McpToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an HTTP tool for every configured entry
    pub fn from_config(config: &McpConfig) -> Result<Self> {
        let mut registry = Self::new();
        for tool in &config.tools {
            registry.register(Arc::new(HttpMcpTool::new(tool)?));
        }
        info!(tools = registry.len(), "MCP tool registry loaded");
        Ok(registry)
    }

    pub fn register(&mut self, executor: Arc<dyn McpToolExecutor>) {
        let id = executor.spec().id.clone();
        if self.tools.insert(id.clone(), executor).is_some() {
            warn!(tool_id = %id, "Duplicate MCP tool id, keeping the last one");
        }
    }

    pub fn get_executor(&self, tool_id: &str) -> Option<Arc<dyn McpToolExecutor>> {
        self.tools.get(tool_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Batch executor over the registry
pub struct McpService {
    registry: Arc<McpToolRegistry>,
    call_timeout: Duration,
}

impl McpService {
    pub fn new(registry: Arc<McpToolRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &McpToolRegistry {
        &self.registry
    }

    /// Execute every request concurrently; failures become unsuccessful
    /// responses rather than errors.
    pub async fn execute_batch(&self, requests: Vec<McpRequest>) -> Vec<McpResponse> {
        let calls = requests.into_iter().map(|request| self.execute_one(request));
        futures::future::join_all(calls).await
    }

    async fn execute_one(&self, request: McpRequest) -> McpResponse {
        let start = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_millis() as u64;

        let Some(executor) = self.registry.get_executor(&request.tool_id) else {
            warn!(tool_id = %request.tool_id, "Unknown MCP tool");
            return McpResponse::failed(&request.tool_id, "unknown tool".to_string(), 0);
        };

        match tokio::time::timeout(self.call_timeout, executor.execute(&request.arguments)).await {
            Ok(Ok(content)) => {
                debug!(tool_id = %request.tool_id, elapsed_ms = elapsed_ms(start), "MCP call succeeded");
                McpResponse {
                    tool_id: request.tool_id,
                    success: true,
                    content,
                    error: None,
                    elapsed_ms: elapsed_ms(start),
                }
            }
            Ok(Err(e)) => {
                warn!(tool_id = %request.tool_id, error = %e, "MCP call failed");
                McpResponse::failed(&request.tool_id, e.to_string(), elapsed_ms(start))
            }
            Err(_) => {
                warn!(
                    tool_id = %request.tool_id,
                    timeout_secs = self.call_timeout.as_secs(),
                    "MCP call timed out"
                );
                McpResponse::failed(&request.tool_id, "timed out".to_string(), elapsed_ms(start))
            }
        }
    }

    /// A batch is usable when at least one call succeeded
    pub fn any_succeeded(responses: &[McpResponse]) -> bool {
        responses.iter().any(|r| r.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askforge_common::AppError;

    struct FakeTool {
        spec: McpToolSpec,
        delay: Duration,
        fail: bool,
    }

    impl FakeTool {
        fn new(id: &str, delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                spec: McpToolSpec {
                    id: id.to_string(),
                    name: id.to_string(),
                    description: String::new(),
                    input_schema: Value::Null,
                },
                delay: Duration::from_millis(delay_ms),
                fail,
            })
        }
    }

    #[async_trait]
    impl McpToolExecutor for FakeTool {
        fn spec(&self) -> &McpToolSpec {
            &self.spec
        }

        async fn execute(&self, arguments: &Map<String, Value>) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AppError::ToolExecution {
                    tool_id: self.spec.id.clone(),
                    message: "boom".to_string(),
                });
            }
            Ok(format!("{} args={}", self.spec.id, arguments.len()))
        }
    }

    fn request(tool_id: &str) -> McpRequest {
        McpRequest {
            tool_id: tool_id.to_string(),
            arguments: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let mut registry = McpToolRegistry::new();
        registry.register(FakeTool::new("ok", 20, false));
        registry.register(FakeTool::new("bad", 0, true));
        registry.register(FakeTool::new("slow", 500, false));
        let service = McpService::new(Arc::new(registry), Duration::from_millis(100));

        let responses = service
            .execute_batch(vec![request("ok"), request("bad"), request("slow"), request("nope")])
            .await;

        let outcome: Vec<_> = responses.iter().map(|r| (r.tool_id.as_str(), r.success)).collect();
        assert_eq!(
            outcome,
            vec![("ok", true), ("bad", false), ("slow", false), ("nope", false)]
        );
        assert_eq!(responses[0].content, "ok args=0");
        assert_eq!(responses[2].error.as_deref(), Some("timed out"));
        assert!(McpService::any_succeeded(&responses));
        assert!(!McpService::any_succeeded(&responses[1..]));
    }
}
