use askforge_common::config::{ModelCandidateConfig, ProviderConfig};
use askforge_common::LlmError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message, serialized the same way by both wire formats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Provider-independent chat request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,

    /// Ask thinking-capable models for reasoning output
    pub thinking: bool,

    /// Overrides the candidate's configured temperature
    pub temperature: Option<f32>,

    /// Overrides the candidate's configured output cap
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Single system + user exchange, used by the JSON-returning helpers
    pub fn instruction(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: Some(0.0),
            ..Default::default()
        }
    }
}

/// Streaming output from a model.
///
/// A well-behaved stream is zero or more `Content`/`Thinking` increments
/// followed by exactly one `Complete` or `Error`. A cancelled stream may stop
/// without a terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Content(String),
    Thinking(String),
    Complete,
    Error(LlmError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete | StreamEvent::Error(_))
    }
}

/// Where stream events are delivered
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

/// A candidate model together with its resolved provider settings
#[derive(Debug, Clone)]
pub struct ModelTarget {
    pub candidate: ModelCandidateConfig,
    pub provider: ProviderConfig,
}

impl ModelTarget {
    /// Id used for health tracking
    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    /// Key of the provider client that serves this model
    pub fn provider_name(&self) -> &str {
        &self.candidate.provider
    }

    pub fn model(&self) -> &str {
        &self.candidate.model
    }

    /// Whether reasoning output should be requested for this call
    pub fn wants_thinking(&self, request: &ChatRequest) -> bool {
        request.thinking && self.candidate.supports_thinking
    }

    pub fn temperature(&self, request: &ChatRequest) -> Option<f32> {
        request.temperature.or(self.candidate.temperature)
    }

    pub fn max_tokens(&self, request: &ChatRequest) -> Option<u32> {
        request.max_tokens.or(self.candidate.max_tokens)
    }
}

#[cfg(test)]
pub(crate) fn test_target(id: &str, provider: &str, base_url: &str) -> ModelTarget {
    use askforge_common::config::ProviderKind;

    ModelTarget {
        candidate: ModelCandidateConfig {
            id: id.to_string(),
            provider: provider.to_string(),
            model: format!("{}-model", id),
            supports_thinking: false,
            priority: 100,
            enabled: true,
            temperature: None,
            max_tokens: None,
        },
        provider: ProviderConfig {
            kind: ProviderKind::OpenAi,
            base_url: base_url.to_string(),
            api_key: None,
            connect_timeout_secs: 5,
            timeout_secs: 5,
        },
    }
}
