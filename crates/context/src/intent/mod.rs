//! Intent model
//!
//! Intents form a forest described by parent back-references. Nodes are
//! immutable after load and shared as `Arc<IntentNode>`; `IntentTree` is the
//! id-keyed registry.

mod classifier;
pub(crate) mod tree;

pub use classifier::{IntentClassifier, LlmIntentClassifier};
pub use tree::IntentTree;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Depth of a node in the taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentLevel {
    Domain,
    Category,
    Topic,
    Leaf,
}

/// What answering an intent requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IntentKind {
    /// Structural node with no retrieval target
    System,
    /// Knowledge-base search; nodes without a collection are not searched
    Kb {
        #[serde(default)]
        collection_name: Option<String>,
    },
    /// Tool call
    Mcp { tool_id: String },
}

impl Default for IntentKind {
    fn default() -> Self {
        IntentKind::Kb {
            collection_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentNode {
    pub id: String,

    pub name: String,

    /// None for roots
    #[serde(default)]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub kind: IntentKind,

    pub level: IntentLevel,

    /// Shown to the classifier
    #[serde(default)]
    pub description: String,

    /// Sample questions shown to the classifier
    #[serde(default)]
    pub examples: Vec<String>,

    /// Self-contained answer template used when this is the only intent
    #[serde(default)]
    pub prompt_template: Option<String>,

    /// Rule text merged into the scene template
    #[serde(default)]
    pub prompt_snippet: Option<String>,

    /// Replaces the default MCP argument-extraction prompt
    #[serde(default)]
    pub param_prompt_template: Option<String>,

    /// Overrides the computed KB search depth
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl IntentNode {
    pub fn is_kb(&self) -> bool {
        matches!(self.kind, IntentKind::Kb { .. })
    }

    /// Collection to search, when this is a searchable KB intent
    pub fn collection(&self) -> Option<&str> {
        match &self.kind {
            IntentKind::Kb {
                collection_name: Some(name),
            } if !name.trim().is_empty() => Some(name),
            _ => None,
        }
    }

    pub fn tool_id(&self) -> Option<&str> {
        match &self.kind {
            IntentKind::Mcp { tool_id } => Some(tool_id),
            _ => None,
        }
    }
}

/// A node matched against a question, score in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node: Arc<IntentNode>,
    pub score: f32,
}

impl NodeScore {
    /// Non-finite scores count as no confidence at all
    pub fn new(node: Arc<IntentNode>, score: f32) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { node, score }
    }
}

/// Classification of one sub-question, best match first
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuestionIntent {
    pub sub_question: String,
    pub node_scores: Vec<NodeScore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Arc<IntentNode> {
        Arc::new(IntentNode {
            id: id.into(),
            name: id.into(),
            parent_id: None,
            kind: IntentKind::default(),
            level: IntentLevel::Leaf,
            description: String::new(),
            examples: Vec::new(),
            prompt_template: None,
            prompt_snippet: None,
            param_prompt_template: None,
            top_k: None,
        })
    }

    #[test]
    fn test_node_score_clamps_into_unit_range() {
        assert_eq!(NodeScore::new(node("hr"), 1.7).score, 1.0);
        assert_eq!(NodeScore::new(node("hr"), -0.3).score, 0.0);
        assert_eq!(NodeScore::new(node("hr"), 0.42).score, 0.42);
    }

    #[test]
    fn test_non_finite_node_score_is_zero() {
        for raw in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let scored = NodeScore::new(node("hr"), raw);
            assert_eq!(scored.score, 0.0, "raw score {raw}");
        }
    }
}
