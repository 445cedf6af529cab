use super::{GuidanceDecision, GuidanceKey, GuidanceState, GuidanceStore, SelectionReply};
use crate::intent::{IntentLevel, IntentTree, SubQuestionIntent};
use askforge_common::config::GuidanceConfig;
use askforge_common::metrics::record_guidance;
use askforge_llm::{ChatRequest, LlmService};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SELECTION_PROMPT: &str = "The assistant asked the user to choose from a numbered list. \
Classify the user's reply and answer with one JSON object:\n\
- {\"action\": \"select\", \"selected_indexes\": [1]} when they chose one or more options \
(1-based; \"all\" means every option)\n\
- {\"action\": \"new_question\"} when they ignored the list and asked something else\n\
- {\"action\": \"repeat\"} when the reply is unclear";

/// Same-named intents from different systems that a question matched
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguityGroup {
    pub topic_name: String,
    /// Members, best score first
    pub node_ids: Vec<String>,
    pub best_score: f32,
}

/// Outcome of narrowing a session by one selection
#[derive(Debug, PartialEq)]
enum Narrowed {
    Await(GuidanceState),
    Resolved(Vec<String>),
    Repeat,
}

pub struct GuidanceEngine {
    tree: Arc<IntentTree>,
    llm: Arc<dyn LlmService>,
    store: Arc<dyn GuidanceStore>,
    config: GuidanceConfig,
}

/// Lower-cased name with punctuation and whitespace removed
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl GuidanceEngine {
    pub fn new(
        tree: Arc<IntentTree>,
        llm: Arc<dyn LlmService>,
        store: Arc<dyn GuidanceStore>,
        config: GuidanceConfig,
    ) -> Self {
        Self {
            tree,
            llm,
            store,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Find the strongest group of same-named KB matches spanning two or
    /// more systems. Only single-question turns are considered.
    pub fn detect_ambiguity(&self, sub_questions: &[SubQuestionIntent]) -> Option<AmbiguityGroup> {
        let [only] = sub_questions else {
            return None;
        };

        let mut groups: HashMap<String, Vec<(&str, f32)>> = HashMap::new();
        let mut seen = HashSet::new();
        for scored in &only.node_scores {
            if !scored.node.is_kb() || scored.score < self.config.min_score {
                continue;
            }
            if !seen.insert(scored.node.id.as_str()) {
                continue;
            }
            groups
                .entry(normalize_name(&scored.node.name))
                .or_default()
                .push((scored.node.id.as_str(), scored.score));
        }

        let mut best: Option<AmbiguityGroup> = None;
        for (_, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

            let top = members[0].1;
            if top <= 0.0 || members[1].1 / top < self.config.ambiguity_ratio {
                continue;
            }

            let systems: HashSet<&str> = members
                .iter()
                .filter_map(|(id, _)| self.tree.get(id))
                .map(|node| self.tree.system_of(node).id.as_str())
                .collect();
            if systems.len() < 2 {
                continue;
            }

            let better = match &best {
                None => true,
                Some(current) => {
                    top > current.best_score
                        || (top == current.best_score && members[0].0 < current.node_ids[0].as_str())
                }
            };
            if better {
                let topic_name = self
                    .tree
                    .get(members[0].0)
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                best = Some(AmbiguityGroup {
                    topic_name,
                    node_ids: members.iter().map(|(id, _)| id.to_string()).collect(),
                    best_score: top,
                });
            }
        }
        best
    }

    /// Session for an ambiguity group, or None when the candidates do not
    /// branch into two or more options.
    pub fn build_initial_state(&self, question: &str, group: &AmbiguityGroup) -> Option<GuidanceState> {
        let mut paths: Vec<Vec<String>> = Vec::new();
        for id in &group.node_ids {
            let path = self.tree.path_from_root(id);
            if !path.is_empty() && !paths.contains(&path) {
                paths.push(path);
            }
        }
        if paths.len() < 2 {
            return None;
        }

        let current = Self::lowest_common_ancestor(&paths);
        let candidates: Vec<String> = paths.iter().filter_map(|p| p.last().cloned()).collect();
        let options = self.next_options(current.as_deref(), &candidates);
        if options.len() < 2 {
            return None;
        }

        Some(GuidanceState {
            original_question: question.to_string(),
            topic_name: group.topic_name.clone(),
            current_node_id: current,
            candidate_leaf_ids: candidates,
            option_ids: self.limit_options(options),
        })
    }

    /// Deepest node shared by every path; None when they start at different roots
    pub fn lowest_common_ancestor(paths: &[Vec<String>]) -> Option<String> {
        let first = paths.first()?;
        let mut lca = None;
        for (depth, id) in first.iter().enumerate() {
            if paths.iter().all(|p| p.get(depth) == Some(id)) {
                lca = Some(id.clone());
            } else {
                break;
            }
        }
        lca
    }

    /// Distinct children of `current` lying on a candidate's path, in first-seen order
    fn next_options(&self, current: Option<&str>, candidates: &[String]) -> Vec<String> {
        let mut options: Vec<String> = Vec::new();
        for leaf in candidates {
            let path = self.tree.path_from_root(leaf);
            let next = match current {
                None => path.first(),
                Some(current) => path
                    .iter()
                    .position(|id| id == current)
                    .and_then(|at| path.get(at + 1)),
            };
            if let Some(next) = next {
                if !options.contains(next) {
                    options.push(next.clone());
                }
            }
        }
        options
    }

    fn limit_options(&self, mut options: Vec<String>) -> Vec<String> {
        options.sort_by(|a, b| {
            let name = |id: &str| self.tree.get(id).map(|n| n.name.clone()).unwrap_or_default();
            name(a.as_str()).cmp(&name(b.as_str())).then_with(|| a.cmp(b))
        });
        options.truncate(self.config.max_options.max(2));
        options
    }

    /// Narrow to one selected option, skipping through single-option corridors
    fn apply_single_selection(&self, state: &GuidanceState, option_id: &str) -> Narrowed {
        let mut candidates: Vec<String> = state
            .candidate_leaf_ids
            .iter()
            .filter(|leaf| self.tree.is_descendant_or_self(leaf, option_id))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Narrowed::Repeat;
        }

        let mut current = option_id.to_string();
        loop {
            if candidates.len() == 1 {
                return Narrowed::Resolved(candidates);
            }

            let options = self.next_options(Some(current.as_str()), &candidates);
            if options.len() >= 2 {
                return Narrowed::Await(GuidanceState {
                    original_question: state.original_question.clone(),
                    topic_name: state.topic_name.clone(),
                    current_node_id: Some(current),
                    candidate_leaf_ids: candidates,
                    option_ids: self.limit_options(options),
                });
            }

            // A candidate sitting on the current node cannot be narrowed further
            let Some(next) = options.into_iter().next() else {
                return Narrowed::Resolved(candidates);
            };
            if candidates.contains(&current) {
                return Narrowed::Resolved(candidates);
            }
            candidates.retain(|leaf| self.tree.is_descendant_or_self(leaf, &next));
            current = next;
        }
    }

    /// Union of each selection's candidate leaves, in candidate order
    fn apply_multi_selection(&self, state: &GuidanceState, option_ids: &[String]) -> Narrowed {
        let leaves: Vec<String> = state
            .candidate_leaf_ids
            .iter()
            .filter(|leaf| {
                option_ids
                    .iter()
                    .any(|option| self.tree.is_descendant_or_self(leaf, option))
            })
            .cloned()
            .collect();
        if leaves.is_empty() {
            Narrowed::Repeat
        } else {
            Narrowed::Resolved(leaves)
        }
    }

    fn apply_selection(&self, state: &GuidanceState, indexes: &[usize]) -> Narrowed {
        let mut selected: Vec<String> = Vec::new();
        for index in indexes {
            if let Some(id) = index.checked_sub(1).and_then(|i| state.option_ids.get(i)) {
                if !selected.contains(id) {
                    selected.push(id.clone());
                }
            }
        }

        match selected.as_slice() {
            [] => Narrowed::Repeat,
            [single] => self.apply_single_selection(state, single),
            many => self.apply_multi_selection(state, many),
        }
    }

    /// Clarification text for a state's current menu
    pub fn prompt_text(&self, state: &GuidanceState) -> String {
        let current = state.current_node_id.as_deref().and_then(|id| self.tree.get(id));
        let mut text = match current {
            Some(node) if node.level != IntentLevel::Domain => {
                format!("Which {} under {} do you mean?\n", state.topic_name, node.name)
            }
            _ => format!("Which system's {} do you mean?\n", state.topic_name),
        };

        for (i, id) in state.option_ids.iter().enumerate() {
            let name = self.tree.get(id).map_or(id.as_str(), |n| n.name.as_str());
            let _ = writeln!(text, "{}) {}", i + 1, name);
        }
        text.push_str("Reply with a number, several numbers such as \"1,2\", or \"all\".");
        text
    }

    /// Open a session when the classified turn is ambiguous
    pub async fn start_session(
        &self,
        key: &GuidanceKey,
        question: &str,
        sub_questions: &[SubQuestionIntent],
    ) -> GuidanceDecision {
        if !self.config.enabled {
            return GuidanceDecision::Proceed;
        }
        let Some(group) = self.detect_ambiguity(sub_questions) else {
            return GuidanceDecision::Proceed;
        };
        let Some(state) = self.build_initial_state(question, &group) else {
            debug!(topic = %group.topic_name, "Ambiguous group has a single branch, skipping guidance");
            return GuidanceDecision::Proceed;
        };

        if let Err(e) = self.store.save(key, &state).await {
            warn!(error = %e, "Failed to persist guidance state, answering without it");
            return GuidanceDecision::Proceed;
        }

        info!(
            conversation_id = %key.conversation_id,
            topic = %state.topic_name,
            options = state.option_ids.len(),
            "Guidance started"
        );
        record_guidance("started");
        GuidanceDecision::Prompt {
            text: self.prompt_text(&state),
        }
    }

    /// Interpret a reply to a pending session, if there is one
    pub async fn handle_existing_session(&self, key: &GuidanceKey, reply: &str) -> GuidanceDecision {
        if !self.config.enabled {
            return GuidanceDecision::Proceed;
        }
        let state = match self.store.load(key).await {
            Ok(Some(state)) => state,
            Ok(None) => return GuidanceDecision::Proceed,
            Err(e) => {
                warn!(error = %e, "Failed to load guidance state, treating as a new question");
                return GuidanceDecision::Proceed;
            }
        };

        match self.classify_reply(&state, reply).await {
            SelectionReply::NewQuestion => {
                self.clear(key).await;
                record_guidance("abandoned");
                GuidanceDecision::Proceed
            }
            SelectionReply::Repeat => self.reprompt(&state),
            SelectionReply::Select(indexes) => match self.apply_selection(&state, &indexes) {
                Narrowed::Repeat => self.reprompt(&state),
                Narrowed::Resolved(leaf_ids) => {
                    self.clear(key).await;
                    info!(conversation_id = %key.conversation_id, leaves = leaf_ids.len(), "Guidance resolved");
                    record_guidance("resolved");
                    GuidanceDecision::Resolved {
                        question: state.original_question,
                        leaf_ids,
                    }
                }
                Narrowed::Await(next) => {
                    if let Err(e) = self.store.save(key, &next).await {
                        warn!(error = %e, "Failed to persist narrowed guidance state");
                    }
                    record_guidance("narrowed");
                    GuidanceDecision::Prompt {
                        text: self.prompt_text(&next),
                    }
                }
            },
        }
    }

    async fn classify_reply(&self, state: &GuidanceState, reply: &str) -> SelectionReply {
        let mut menu = String::new();
        for (i, id) in state.option_ids.iter().enumerate() {
            let name = self.tree.get(id).map_or(id.as_str(), |n| n.name.as_str());
            let _ = writeln!(menu, "{}) {}", i + 1, name);
        }
        let request = ChatRequest::instruction(
            SELECTION_PROMPT,
            format!("Options:\n{}\nUser reply: {}", menu, reply),
        );

        match self.llm.chat(&request).await {
            Ok(raw) => SelectionReply::parse(&raw),
            Err(e) => {
                warn!(error = %e, "Selection classification failed, asking again");
                SelectionReply::Repeat
            }
        }
    }

    fn reprompt(&self, state: &GuidanceState) -> GuidanceDecision {
        record_guidance("reprompt");
        GuidanceDecision::Prompt {
            text: self.prompt_text(state),
        }
    }

    async fn clear(&self, key: &GuidanceKey) {
        if let Err(e) = self.store.clear(key).await {
            warn!(error = %e, "Failed to clear guidance state");
        }
    }
}
