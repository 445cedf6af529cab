//! Guidance: clarification dialogue for ambiguous intent matches
//!
//! When one question matches several same-named intents living in different
//! systems, the engine asks the user to pick instead of retrieving from all
//! of them. A session is `Idle` until ambiguity is detected, then
//! `AwaitingSelection` (state persisted per conversation and user) until the
//! user's replies narrow the candidates down to leaves or they move on.

mod engine;
mod store;

pub use engine::{AmbiguityGroup, GuidanceEngine};
pub use store::{GuidanceStore, InMemoryGuidanceStore, RedisGuidanceStore};

use serde::{Deserialize, Serialize};

/// Owner of a guidance session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuidanceKey {
    pub conversation_id: String,
    pub user_id: String,
}

impl GuidanceKey {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// A session awaiting the user's selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceState {
    /// The question that triggered guidance, answered once resolved
    pub original_question: String,

    /// Display name of the ambiguous intent
    pub topic_name: String,

    /// Deepest common ancestor reached so far; None above a forest
    pub current_node_id: Option<String>,

    /// Leaves still in play
    pub candidate_leaf_ids: Vec<String>,

    /// Menu shown to the user, in display order
    pub option_ids: Vec<String>,
}

/// What the pipeline should do after consulting guidance
#[derive(Debug, Clone, PartialEq)]
pub enum GuidanceDecision {
    /// No session applies; run the normal pipeline
    Proceed,
    /// Send this clarification text instead of an answer
    Prompt { text: String },
    /// Answer `question` from exactly these intents
    Resolved { question: String, leaf_ids: Vec<String> },
}

/// How the user's reply to a menu was understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReply {
    /// 1-based indexes into the current options
    Select(Vec<usize>),
    NewQuestion,
    Repeat,
}

#[derive(Deserialize)]
struct RawSelection {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    selected_indexes: Option<Vec<i64>>,
}

impl SelectionReply {
    /// Read the first JSON object of a model reply; anything unexpected is `Repeat`
    pub fn parse(raw: &str) -> Self {
        let Some(parsed) = askforge_llm::json::parse_first_object::<RawSelection>(raw) else {
            return SelectionReply::Repeat;
        };

        match parsed.action.as_deref().map(str::trim) {
            Some("select") => {
                let indexes: Vec<usize> = parsed
                    .selected_indexes
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|i| *i >= 1)
                    .filter_map(|i| usize::try_from(i).ok())
                    .collect();
                if indexes.is_empty() {
                    SelectionReply::Repeat
                } else {
                    SelectionReply::Select(indexes)
                }
            }
            Some("new_question") => SelectionReply::NewQuestion,
            _ => SelectionReply::Repeat,
        }
    }
}
