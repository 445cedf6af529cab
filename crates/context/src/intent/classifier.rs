//! Intent classification against the tree's leaves

use super::{IntentTree, NodeScore};
use askforge_common::errors::Result;
use askforge_llm::json::parse_first_array;
use askforge_llm::{ChatRequest, LlmService};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Ranked matches for `question`, best first. Scores are in [0, 1].
    async fn classify_targets(&self, question: &str) -> Result<Vec<NodeScore>>;
}

const CLASSIFY_PROMPT: &str = "You route user questions to knowledge areas. \
Score how well the question matches each listed intent, from 0 (unrelated) to 1 (certain). \
Reply with a JSON array of objects {\"id\": \"<intent id>\", \"score\": <number>} \
containing only intents scoring above 0.1. Reply with [] when nothing matches.";

#[derive(Deserialize)]
struct ScoredId {
    id: String,
    #[serde(default)]
    score: f32,
}

/// Scores every classifiable leaf in one model call
pub struct LlmIntentClassifier {
    tree: Arc<IntentTree>,
    llm: Arc<dyn LlmService>,
    catalog: String,
}

impl LlmIntentClassifier {
    pub fn new(tree: Arc<IntentTree>, llm: Arc<dyn LlmService>) -> Self {
        let catalog = Self::render_catalog(&tree);
        Self { tree, llm, catalog }
    }

    fn render_catalog(tree: &IntentTree) -> String {
        let mut out = String::new();
        for leaf in tree.leaves() {
            let _ = writeln!(out, "- id: {}", leaf.id);
            let _ = writeln!(out, "  path: {}", tree.display_path(&leaf.id));
            if !leaf.description.is_empty() {
                let _ = writeln!(out, "  description: {}", leaf.description);
            }
            if !leaf.examples.is_empty() {
                let _ = writeln!(out, "  examples: {}", leaf.examples.join(" | "));
            }
        }
        out
    }

    /// Resolve ids, clamp scores and keep the best score per node
    fn rank(&self, scored: Vec<ScoredId>) -> Vec<NodeScore> {
        let mut best: HashMap<String, NodeScore> = HashMap::new();
        for item in scored {
            let Some(node) = self.tree.get(&item.id) else {
                debug!(id = %item.id, "Classifier returned unknown intent id");
                continue;
            };
            if !item.score.is_finite() {
                continue;
            }
            let candidate = NodeScore::new(node.clone(), item.score);
            match best.get(&item.id) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(item.id, candidate);
                }
            }
        }

        let mut ranked: Vec<NodeScore> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        ranked
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify_targets(&self, question: &str) -> Result<Vec<NodeScore>> {
        if self.catalog.is_empty() {
            return Ok(Vec::new());
        }

        let request = ChatRequest::instruction(
            CLASSIFY_PROMPT,
            format!("Intents:\n{}\nQuestion: {}", self.catalog, question),
        );
        let reply = self.llm.chat(&request).await?;

        match parse_first_array::<Vec<ScoredId>>(&reply) {
            Some(scored) => {
                let ranked = self.rank(scored);
                debug!(matches = ranked.len(), "Question classified");
                Ok(ranked)
            }
            None => {
                warn!("Classifier reply had no JSON array, treating as no match");
                Ok(Vec::new())
            }
        }
    }
}
