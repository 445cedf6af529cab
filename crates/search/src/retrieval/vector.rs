//! Vector similarity search using pgvector
//!
//! A collection is a table with `id`, `content`, `metadata` (jsonb) and
//! `embedding` (vector) columns. Table names come from configuration, so
//! they are validated before being spliced into SQL.

use super::{RetrievedChunk, Retriever};
use askforge_common::db::DbPool;
use askforge_common::embeddings::Embedder;
use askforge_common::errors::{AppError, Result};
use regex_lite::Regex;
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult, Statement};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

/// Vector retriever using pgvector
pub struct VectorRetriever {
    db: Arc<DbPool>,
    embedder: Arc<dyn Embedder>,
}

/// Query result row
#[derive(Debug, FromQueryResult)]
struct ChunkRow {
    id: String,
    content: String,
    metadata: Option<serde_json::Value>,
    score: f64,
}

impl VectorRetriever {
    /// Create a new vector retriever
    pub fn new(db: Arc<DbPool>, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    /// Build the nearest-neighbour query for one collection
    fn build_query(collection: &str) -> Result<String> {
        validate_collection(collection)?;
        Ok(format!(
            r#"
            SELECT
                id::text AS id,
                content,
                metadata,
                1 - (embedding <=> $1::vector) AS score
            FROM "{table}"
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
            table = collection
        ))
    }
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").ok())
        .as_ref()
}

/// Collection names double as table names
pub(crate) fn validate_collection(collection: &str) -> Result<()> {
    if identifier_pattern().is_some_and(|re| re.is_match(collection)) {
        Ok(())
    } else {
        Err(AppError::Validation {
            message: format!("invalid collection name '{}'", collection),
            field: Some("collection_name".to_string()),
        })
    }
}

/// pgvector text literal, e.g. `[0.1,0.2]`
pub(crate) fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

#[async_trait::async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, collection: &str, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let sql = Self::build_query(collection)?;
        let start = Instant::now();

        let embedding = self.embedder.embed(query).await?;

        let rows = self
            .db
            .read()
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                vec![vector_literal(&embedding).into(), (top_k as i64).into()],
            ))
            .await
            .map_err(|e| AppError::Retrieval {
                collection: collection.to_string(),
                message: format!("vector search failed: {}", e),
            })?;

        let chunks = rows
            .iter()
            .map(|row| {
                ChunkRow::from_query_result(row, "").map(|r| RetrievedChunk {
                    id: r.id,
                    content: r.content,
                    score: r.score as f32,
                    metadata: r.metadata.unwrap_or(serde_json::Value::Null),
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Retrieval {
                collection: collection.to_string(),
                message: format!("unexpected row shape: {}", e),
            })?;

        debug!(
            collection,
            top_k,
            hits = chunks.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Vector search complete"
        );

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_format() {
        assert_eq!(vector_literal(&[0.1, 0.2, 0.3]), "[0.1,0.2,0.3]");
    }

    #[test]
    fn test_collection_validation() {
        assert!(validate_collection("kb_hr_policies").is_ok());
        assert!(validate_collection("_staging2").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("2fast").is_err());
        assert!(validate_collection("kb\"; DROP TABLE x; --").is_err());
        assert!(validate_collection(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_query_quotes_table() {
        let sql = VectorRetriever::build_query("kb_docs").unwrap();
        assert!(sql.contains("FROM \"kb_docs\""));
        assert!(sql.contains("LIMIT $2"));
    }
}
