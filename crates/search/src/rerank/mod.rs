//! Reranking of retrieved chunks
//!
//! `HttpReranker` calls a Cohere/Jina-style `/rerank` endpoint. When no
//! endpoint is configured, or the call fails, chunks are ordered by their
//! retrieval score instead.

use crate::retrieval::RetrievedChunk;
use askforge_common::config::RerankConfig;
use askforge_common::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Re-order `chunks` against `query`, keeping at most `limit`
    async fn rerank(&self, query: &str, chunks: Vec<RetrievedChunk>, limit: usize) -> Result<Vec<RetrievedChunk>>;
}

/// Orders by retrieval score, highest first
#[derive(Debug, Default, Clone, Copy)]
pub struct ScoreReranker;

impl ScoreReranker {
    fn order(mut chunks: Vec<RetrievedChunk>, limit: usize) -> Vec<RetrievedChunk> {
        chunks.sort_by(|a, b| b.score.total_cmp(&a.score));
        chunks.truncate(limit);
        chunks
    }
}

#[async_trait]
impl Reranker for ScoreReranker {
    async fn rerank(&self, _query: &str, chunks: Vec<RetrievedChunk>, limit: usize) -> Result<Vec<RetrievedChunk>> {
        Ok(Self::order(chunks, limit))
    }
}

/// Cross-encoder rerank service over HTTP
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl HttpReranker {
    pub fn new(base_url: &str, config: &RerankConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create rerank HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url: format!("{}/rerank", base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn call(&self, query: &str, chunks: &[RetrievedChunk], limit: usize) -> Result<Vec<RerankResult>> {
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: chunks.iter().map(|c| c.content.as_str()).collect(),
            top_n: limit,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| AppError::Rerank {
            message: format!("Request failed: {}", e),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Rerank {
                message: format!("API error {}: {}", status, body),
            });
        }

        let parsed: RerankResponse = response.json().await.map_err(|e| AppError::Rerank {
            message: format!("Failed to parse response: {}", e),
        })?;
        Ok(parsed.results)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, chunks: Vec<RetrievedChunk>, limit: usize) -> Result<Vec<RetrievedChunk>> {
        if chunks.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let results = match self.call(query, &chunks, limit).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Rerank failed, falling back to retrieval order");
                return Ok(ScoreReranker::order(chunks, limit));
            }
        };

        let mut slots: Vec<Option<RetrievedChunk>> = chunks.into_iter().map(Some).collect();
        let mut reranked = Vec::with_capacity(limit.min(results.len()));
        for result in results {
            // Unknown or repeated indexes are skipped
            if let Some(mut chunk) = slots.get_mut(result.index).and_then(Option::take) {
                chunk.score = result.relevance_score;
                reranked.push(chunk);
            }
        }
        reranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        reranked.truncate(limit);

        debug!(kept = reranked.len(), "Rerank complete");
        Ok(reranked)
    }
}

/// HTTP reranker when an endpoint is configured, score order otherwise
pub fn create_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>> {
    match config.base_url.as_deref() {
        Some(base_url) if !base_url.is_empty() => Ok(Arc::new(HttpReranker::new(base_url, config)?)),
        _ => {
            debug!("No rerank endpoint configured, using score order");
            Ok(Arc::new(ScoreReranker))
        }
    }
}
