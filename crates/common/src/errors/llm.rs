//! Model-provider failure taxonomy
//!
//! `LlmError` is `Clone` so it can travel inside stream events and be
//! remembered across failover attempts.

use thiserror::Error;

/// Errors raised while talking to a model provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Provider {provider} rejected credentials: {message}")]
    Unauthorized { provider: String, message: String },

    #[error("Provider {provider} rate limited the request: {message}")]
    RateLimited { provider: String, message: String },

    #[error("Provider {provider} server error {status}: {message}")]
    ServerError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Provider {provider} rejected the request {status}: {message}")]
    ClientError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Network error calling {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("Invalid response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Model {model} sent no first packet within {timeout_ms}ms")]
    Timeout { model: String, timeout_ms: u64 },

    #[error("Model {model} completed without any content")]
    NoContent { model: String },

    #[error("All {attempts} model candidates failed, last error: {last}")]
    Exhausted { attempts: usize, last: String },

    #[error("Model {model} is temporarily unavailable")]
    ModelUnavailable { model: String },

    #[error("No client registered for provider {provider}")]
    ProviderUnavailable { provider: String },

    #[error("Worker pool {pool} is saturated")]
    PoolRejected { pool: String },

    #[error("Stream was cancelled")]
    Cancelled,
}

impl LlmError {
    /// Map a non-success HTTP status from a provider onto the taxonomy
    pub fn from_status(provider: &str, status: u16, body: impl Into<String>) -> Self {
        let provider = provider.to_string();
        let message = body.into();
        match status {
            401 | 403 => LlmError::Unauthorized { provider, message },
            429 => LlmError::RateLimited { provider, message },
            500..=599 => LlmError::ServerError {
                provider,
                status,
                message,
            },
            _ => LlmError::ClientError {
                provider,
                status,
                message,
            },
        }
    }

    /// Transport-level failure from the HTTP client
    pub fn network(provider: &str, err: impl std::fmt::Display) -> Self {
        LlmError::Network {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    /// Payload that did not match the provider's wire format
    pub fn invalid_response(provider: &str, message: impl Into<String>) -> Self {
        LlmError::InvalidResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Unauthorized { .. } => "unauthorized",
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::ServerError { .. } => "server_error",
            LlmError::ClientError { .. } => "client_error",
            LlmError::Network { .. } => "network",
            LlmError::InvalidResponse { .. } => "invalid_response",
            LlmError::Timeout { .. } => "timeout",
            LlmError::NoContent { .. } => "no_content",
            LlmError::Exhausted { .. } => "exhausted",
            LlmError::ModelUnavailable { .. } => "model_unavailable",
            LlmError::ProviderUnavailable { .. } => "provider_unavailable",
            LlmError::PoolRejected { .. } => "pool_rejected",
            LlmError::Cancelled => "cancelled",
        }
    }
}
