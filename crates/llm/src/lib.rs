//! AskForge model routing
//!
//! Provides:
//! - Chat request and stream event types
//! - Provider clients (OpenAI-compatible SSE, Ollama NDJSON)
//! - Per-model health tracking and candidate selection
//! - `RoutingLlmService` with synchronous fallback and streaming
//!   first-packet failover
//! - Cancellation handles and the task registry used to stop streams

pub mod cancel;
pub mod client;
pub mod health;
pub mod json;
pub mod router;
pub mod selector;
pub mod task_manager;
mod types;

pub use cancel::StreamCancellationHandle;
pub use client::{ChatClient, OllamaChatClient, OpenAiChatClient};
pub use health::{CircuitState, ModelHealthStore};
pub use router::{LlmService, RoutingLlmService};
pub use selector::{ConfigModelSelector, ModelSelector};
pub use task_manager::StreamTaskManager;
pub use types::{ChatMessage, ChatRequest, EventSink, ModelTarget, Role, StreamEvent};

/// Result type for model calls
pub type LlmResult<T> = std::result::Result<T, askforge_common::LlmError>;
