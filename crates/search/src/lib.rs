//! AskForge retrieval layer
//!
//! Provides:
//! - Vector search over pgvector collections
//! - Reranking (HTTP rerank endpoint with score-order fallback)
//! - MCP tool registry, batch execution, and LLM parameter extraction

pub mod mcp;
pub mod rerank;
pub mod retrieval;

pub use mcp::{
    HttpMcpTool, LlmParameterExtractor, McpRequest, McpResponse, McpService, McpToolExecutor,
    McpToolRegistry, McpToolSpec, ParameterExtractor,
};
pub use rerank::{create_reranker, HttpReranker, Reranker, ScoreReranker};
pub use retrieval::{RetrievedChunk, Retriever, VectorRetriever};
