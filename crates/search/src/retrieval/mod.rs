//! Knowledge-base retrieval
//!
//! Each KB intent points at one collection; a retriever returns the chunks
//! of that collection closest to the query.

mod vector;

pub use vector::VectorRetriever;

use askforge_common::errors::Result;
use serde::{Deserialize, Serialize};

/// Retrieved chunk with relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Chunk ID within its collection
    pub id: String,

    /// Chunk text
    pub content: String,

    /// Relevance score, higher is better
    pub score: f32,

    /// Source metadata stored alongside the chunk
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RetrievedChunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            score,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Common trait for all retrievers
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve up to `top_k` chunks of `collection` ranked by similarity to `query`
    async fn retrieve(&self, collection: &str, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>>;
}
