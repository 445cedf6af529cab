//! OpenAI-compatible chat completions (`/chat/completions`, SSE streaming)

use super::{check_status, drive_stream, emit_error, http_client, ChatClient, Frame};
use crate::types::{ChatMessage, ChatRequest, EventSink, ModelTarget};
use crate::LlmResult;
use askforge_common::config::ProviderConfig;
use askforge_common::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct OpenAiChatClient {
    name: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    enable_thinking: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(name: &str, config: &ProviderConfig) -> LlmResult<Self> {
        Ok(Self {
            name: name.to_string(),
            client: http_client(name, config)?,
        })
    }

    fn url(target: &ModelTarget) -> String {
        format!(
            "{}/chat/completions",
            target.provider.base_url.trim_end_matches('/')
        )
    }

    fn body<'a>(request: &'a ChatRequest, target: &'a ModelTarget, stream: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: target.model(),
            messages: &request.messages,
            stream,
            temperature: target.temperature(request),
            max_tokens: target.max_tokens(request),
            enable_thinking: target.wants_thinking(request),
        }
    }

    fn post(&self, target: &ModelTarget) -> reqwest::RequestBuilder {
        let builder = self.client.post(Self::url(target));
        match target.provider.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn open_stream(&self, request: &ChatRequest, target: &ModelTarget) -> LlmResult<reqwest::Response> {
        let response = self
            .post(target)
            .header("Accept", "text/event-stream")
            .json(&Self::body(request, target, true))
            .send()
            .await
            .map_err(|e| LlmError::network(&self.name, e))?;
        check_status(&self.name, response).await
    }
}

/// Decode one SSE line.
///
/// Only `data:` lines carry payload; comments, `event:` and blank lines are
/// skipped.
pub(crate) fn decode_sse_line(provider: &str, line: &str) -> Vec<Frame> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Vec::new();
    }
    if payload == "[DONE]" {
        return vec![Frame::Done];
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            return vec![Frame::Error(LlmError::invalid_response(
                provider,
                format!("malformed stream chunk: {}", e),
            ))]
        }
    };

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return vec![Frame::Error(LlmError::invalid_response(provider, message))];
    }

    let mut frames = Vec::new();
    for choice in chunk.choices {
        if let Some(thinking) = choice.delta.reasoning_content {
            frames.push(Frame::Thinking(thinking));
        }
        if let Some(content) = choice.delta.content {
            frames.push(Frame::Content(content));
        }
    }
    frames
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest, target: &ModelTarget) -> LlmResult<String> {
        let response = self
            .post(target)
            .timeout(Duration::from_secs(target.provider.timeout_secs))
            .json(&Self::body(request, target, false))
            .send()
            .await
            .map_err(|e| LlmError::network(&self.name, e))?;
        let response = check_status(&self.name, response).await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::invalid_response(&self.name, e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::invalid_response(&self.name, "response has no choices"))?;

        if content.trim().is_empty() {
            return Err(LlmError::NoContent {
                model: target.id().to_string(),
            });
        }
        Ok(content)
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        target: ModelTarget,
        sink: EventSink,
        cancel: CancellationToken,
    ) {
        debug!(provider = %self.name, model = %target.model(), "Opening SSE stream");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = self.open_stream(&request, &target) => opened,
        };

        match opened {
            Ok(response) => {
                let provider = self.name.clone();
                drive_stream(&self.name, response, &sink, &cancel, |line| {
                    decode_sse_line(&provider, line)
                })
                .await
            }
            Err(e) => emit_error(&sink, &cancel, e),
        }
    }
}
