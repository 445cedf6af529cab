//! Ollama native chat (`/api/chat`, NDJSON streaming)

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

pub struct OllamaChatClient {
    name: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    think: bool,
    #[serde(skip_serializing_if = "OllamaOptions::is_empty")]
    options: OllamaOptions,
}

#[derive(Serialize, Default)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl OllamaOptions {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_predict.is_none()
    }
}

#[derive(Deserialize, Default)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

impl OllamaChatClient {
    pub fn new(name: &str, config: &ProviderConfig) -> LlmResult<Self> {
        Ok(Self {
            name: name.to_string(),
            client: http_client(name, config)?,
        })
    }

    fn url(target: &ModelTarget) -> String {
        format!("{}/api/chat", target.provider.base_url.trim_end_matches('/'))
    }

    fn body<'a>(request: &'a ChatRequest, target: &'a ModelTarget, stream: bool) -> OllamaRequest<'a> {
        OllamaRequest {
            model: target.model(),
            messages: &request.messages,
            stream,
            think: target.wants_thinking(request),
            options: OllamaOptions {
                temperature: target.temperature(request),
                num_predict: target.max_tokens(request),
            },
        }
    }
}

/// Decode one NDJSON line
pub(crate) fn decode_ndjson_line(provider: &str, line: &str) -> Vec<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    let chunk: OllamaChunk = match serde_json::from_str(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            return vec![Frame::Error(LlmError::invalid_response(
                provider,
                format!("malformed stream line: {}", e),
            ))]
        }
    };

    if let Some(error) = chunk.error {
        return vec![Frame::Error(LlmError::invalid_response(provider, error))];
    }

    let mut frames = Vec::new();
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking {
            frames.push(Frame::Thinking(thinking));
        }
        frames.push(Frame::Content(message.content));
    }
    if chunk.done {
        frames.push(Frame::Done);
    }
    frames
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest, target: &ModelTarget) -> LlmResult<String> {
        let response = self
            .client
            .post(Self::url(target))
            .timeout(Duration::from_secs(target.provider.timeout_secs))
            .json(&Self::body(request, target, false))
            .send()
            .await
            .map_err(|e| LlmError::network(&self.name, e))?;
        let response = check_status(&self.name, response).await?;

        let parsed: OllamaChunk = response
            .json()
            .await
            .map_err(|e| LlmError::invalid_response(&self.name, e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(LlmError::invalid_response(&self.name, error));
        }

        let content = parsed.message.map(|m| m.content).unwrap_or_default();
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
        debug!(provider = %self.name, model = %target.model(), "Opening NDJSON stream");

        let send = self
            .client
            .post(Self::url(&target))
            .json(&Self::body(&request, &target, true))
            .send();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = send => opened,
        };

        let response = match opened {
            Ok(response) => response,
            Err(e) => return emit_error(&sink, &cancel, LlmError::network(&self.name, e)),
        };

        match check_status(&self.name, response).await {
            Ok(response) => {
                let provider = self.name.clone();
                drive_stream(&self.name, response, &sink, &cancel, |line| {
                    decode_ndjson_line(&provider, line)
                })
                .await
            }
            Err(e) => emit_error(&sink, &cancel, e),
        }
    }
}
