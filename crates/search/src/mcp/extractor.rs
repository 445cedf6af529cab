//! Tool argument extraction from a user question

use super::McpToolSpec;
use askforge_common::errors::Result;
use askforge_llm::json::parse_first_object;
use askforge_llm::{ChatRequest, LlmService};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_EXTRACTION_PROMPT: &str = "You turn a user question into arguments for a tool call. \
Reply with a single JSON object whose keys follow the tool's input schema. \
Leave out any argument the question does not determine. Do not add commentary.";

#[async_trait]
pub trait ParameterExtractor: Send + Sync {
    /// Arguments for `tool` derived from `question`. `custom_prompt`
    /// replaces the default schema-driven instructions.
    async fn extract_parameters(
        &self,
        question: &str,
        tool: &McpToolSpec,
        custom_prompt: Option<&str>,
    ) -> Result<Map<String, Value>>;
}

pub struct LlmParameterExtractor {
    llm: Arc<dyn LlmService>,
}

impl LlmParameterExtractor {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self { llm }
    }

    fn build_request(question: &str, tool: &McpToolSpec, custom_prompt: Option<&str>) -> ChatRequest {
        let system = custom_prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_EXTRACTION_PROMPT);

        let schema = serde_json::to_string_pretty(&tool.input_schema).unwrap_or_default();
        let user = format!(
            "Tool: {}\nDescription: {}\nInput schema:\n{}\n\nQuestion: {}",
            tool.name, tool.description, schema, question
        );
        ChatRequest::instruction(system, user)
    }
}

#[async_trait]
impl ParameterExtractor for LlmParameterExtractor {
    async fn extract_parameters(
        &self,
        question: &str,
        tool: &McpToolSpec,
        custom_prompt: Option<&str>,
    ) -> Result<Map<String, Value>> {
        let request = Self::build_request(question, tool, custom_prompt);
        let reply = self.llm.chat(&request).await?;

        match parse_first_object::<Map<String, Value>>(&reply) {
            Some(arguments) => {
                debug!(tool_id = %tool.id, arguments = arguments.len(), "Extracted tool arguments");
                Ok(arguments)
            }
            None => {
                warn!(tool_id = %tool.id, "No JSON object in extraction reply, calling without arguments");
                Ok(Map::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askforge_common::LlmError;
    use askforge_llm::{EventSink, StreamCancellationHandle};
    use std::sync::Mutex;

    struct CannedLlm {
        reply: std::result::Result<String, LlmError>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LlmService for CannedLlm {
        async fn chat(&self, request: &ChatRequest) -> askforge_llm::LlmResult<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
            _sink: EventSink,
        ) -> askforge_llm::LlmResult<StreamCancellationHandle> {
            Ok(StreamCancellationHandle::noop())
        }
    }

    fn tool() -> McpToolSpec {
        McpToolSpec {
            id: "weather".into(),
            name: "get_weather".into(),
            description: "Current weather".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }
    }

    #[tokio::test]
    async fn test_extracts_object_from_reply() {
        let llm = Arc::new(CannedLlm {
            reply: Ok("```json\n{\"city\": \"Oslo\"}\n```".into()),
            seen: Mutex::new(Vec::new()),
        });
        let extractor = LlmParameterExtractor::new(llm.clone());

        let args = extractor
            .extract_parameters("weather in Oslo?", &tool(), Some("Custom rules"))
            .await
            .unwrap();
        assert_eq!(args["city"], "Oslo");

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].messages[0].content, "Custom rules");
        assert!(seen[0].messages[1].content.contains("\"city\""));
    }

    #[tokio::test]
    async fn test_unparseable_reply_yields_empty_arguments() {
        let llm = Arc::new(CannedLlm {
            reply: Ok("I cannot help".into()),
            seen: Mutex::new(Vec::new()),
        });
        let args = LlmParameterExtractor::new(llm)
            .extract_parameters("q", &tool(), None)
            .await
            .unwrap();
        assert!(args.is_empty());
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let llm = Arc::new(CannedLlm {
            reply: Err(LlmError::Exhausted {
                attempts: 1,
                last: "down".into(),
            }),
            seen: Mutex::new(Vec::new()),
        });
        let result = LlmParameterExtractor::new(llm)
            .extract_parameters("q", &tool(), None)
            .await;
        assert!(result.is_err());
    }
}
