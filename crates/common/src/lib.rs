//! AskForge Common Library
//!
//! Shared code for the AskForge crates including:
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability
//! - Bounded worker pools
//! - Redis cache, Postgres pool and embedding clients

pub mod cache;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod executor;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, LlmError, Result};
pub use executor::{Executors, WorkerPool};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed reply when retrieval finds nothing to ground an answer on
pub const NO_EVIDENCE_MESSAGE: &str =
    "Sorry, I couldn't find anything in the knowledge base related to your question.";

/// Fixed reply when every model candidate failed
pub const ALL_MODELS_FAILED_MESSAGE: &str =
    "All models failed to respond, please retry later.";
