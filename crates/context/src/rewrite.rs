//! Query rewriting and sub-question splitting

use askforge_common::config::RewriteConfig;
use askforge_common::errors::Result;
use askforge_llm::json::parse_first_object;
use askforge_llm::{ChatMessage, ChatRequest, LlmService, Role};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// A standalone question and the fragments to answer separately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    pub rewritten: String,
    /// Never empty; a question that needs no split is its own only entry
    pub sub_questions: Vec<String>,
}

impl RewriteResult {
    pub fn unchanged(question: &str) -> Self {
        Self {
            rewritten: question.to_string(),
            sub_questions: vec![question.to_string()],
        }
    }
}

#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite_with_split(&self, question: &str, history: &[ChatMessage]) -> Result<RewriteResult>;
}

/// Used when rewriting is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRewriter;

#[async_trait]
impl QueryRewriter for PassthroughRewriter {
    async fn rewrite_with_split(&self, question: &str, _history: &[ChatMessage]) -> Result<RewriteResult> {
        Ok(RewriteResult::unchanged(question))
    }
}

const REWRITE_PROMPT: &str = "Rewrite the user's latest question so it can be understood without the \
conversation, resolving pronouns and references from the history. If it asks several unrelated \
things, also split it into self-contained sub-questions. Reply with a JSON object \
{\"rewritten\": \"...\", \"sub_questions\": [\"...\"]}. Keep the user's language.";

#[derive(Deserialize)]
struct RewriteReply {
    #[serde(default)]
    rewritten: String,
    #[serde(default)]
    sub_questions: Vec<String>,
}

pub struct LlmQueryRewriter {
    llm: Arc<dyn LlmService>,
    config: RewriteConfig,
}

impl LlmQueryRewriter {
    pub fn new(llm: Arc<dyn LlmService>, config: RewriteConfig) -> Self {
        Self { llm, config }
    }

    fn render_history(&self, history: &[ChatMessage]) -> String {
        let skip = history.len().saturating_sub(self.config.history_messages);
        history[skip..]
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                format!("{}: {}", who, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn normalize(&self, question: &str, reply: RewriteReply) -> RewriteResult {
        let rewritten = match reply.rewritten.trim() {
            "" => question.to_string(),
            text => text.to_string(),
        };

        let mut sub_questions: Vec<String> = Vec::new();
        for sub in reply.sub_questions {
            let sub = sub.trim();
            if !sub.is_empty() && !sub_questions.iter().any(|s| s == sub) {
                sub_questions.push(sub.to_string());
            }
        }
        sub_questions.truncate(self.config.max_sub_questions.max(1));
        if sub_questions.is_empty() {
            sub_questions.push(rewritten.clone());
        }

        RewriteResult {
            rewritten,
            sub_questions,
        }
    }
}

#[async_trait]
impl QueryRewriter for LlmQueryRewriter {
    async fn rewrite_with_split(&self, question: &str, history: &[ChatMessage]) -> Result<RewriteResult> {
        let user = if history.is_empty() {
            format!("Question: {}", question)
        } else {
            format!("History:\n{}\n\nQuestion: {}", self.render_history(history), question)
        };

        let reply = match self.llm.chat(&ChatRequest::instruction(REWRITE_PROMPT, user)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Rewrite failed, using the original question");
                return Ok(RewriteResult::unchanged(question));
            }
        };

        match parse_first_object::<RewriteReply>(&reply) {
            Some(parsed) => {
                let result = self.normalize(question, parsed);
                debug!(sub_questions = result.sub_questions.len(), "Question rewritten");
                Ok(result)
            }
            None => {
                warn!("Rewrite reply had no JSON object, using the original question");
                Ok(RewriteResult::unchanged(question))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;

    fn config(max_sub_questions: usize) -> RewriteConfig {
        RewriteConfig {
            enabled: true,
            max_sub_questions,
            history_messages: 2,
        }
    }

    #[tokio::test]
    async fn test_splits_and_caps() {
        let llm = Arc::new(ScriptedLlm::with_replies([
            r#"{"rewritten": "Leave and travel rules", "sub_questions": ["Leave rules?", "Leave rules?", " ", "Travel rules?", "Expense rules?"]}"#,
        ]));
        let rewriter = LlmQueryRewriter::new(llm.clone(), config(2));
        let history = vec![
            ChatMessage::user("old"),
            ChatMessage::assistant("older answer"),
            ChatMessage::user("about HR"),
        ];

        let result = rewriter.rewrite_with_split("and those?", &history).await.unwrap();
        assert_eq!(result.rewritten, "Leave and travel rules");
        assert_eq!(result.sub_questions, vec!["Leave rules?", "Travel rules?"]);

        let prompt = &llm.requests()[0].messages[1].content;
        assert!(prompt.contains("user: about HR"));
        assert!(!prompt.contains("user: old"));
    }

    #[tokio::test]
    async fn test_falls_back_to_original() {
        let llm = Arc::new(ScriptedLlm::with_replies(["not json"]));
        let rewriter = LlmQueryRewriter::new(llm, config(3));
        let result = rewriter.rewrite_with_split("What is leave?", &[]).await.unwrap();
        assert_eq!(result, RewriteResult::unchanged("What is leave?"));

        // No scripted reply left, so the model call itself fails
        let llm = Arc::new(ScriptedLlm::default());
        let rewriter = LlmQueryRewriter::new(llm, config(3));
        let result = rewriter.rewrite_with_split("What is leave?", &[]).await.unwrap();
        assert_eq!(result.sub_questions, vec!["What is leave?"]);
    }

    #[tokio::test]
    async fn test_missing_sub_questions_uses_rewritten() {
        let llm = Arc::new(ScriptedLlm::with_replies([r#"{"rewritten": "Annual leave days"}"#]));
        let rewriter = LlmQueryRewriter::new(llm, config(3));
        let result = rewriter.rewrite_with_split("how many days", &[]).await.unwrap();
        assert_eq!(result.sub_questions, vec!["Annual leave days"]);
    }
}
