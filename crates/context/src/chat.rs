//! The answering pipeline
//!
//! question → guidance continuation → rewrite/split → classification →
//! guidance detection → retrieval → prompt → streamed model reply → memory.

use crate::guidance::{GuidanceDecision, GuidanceEngine, GuidanceKey};
use crate::intent::{IntentClassifier, IntentTree, NodeScore, SubQuestionIntent};
use crate::memory::ConversationMemory;
use crate::prompt::PromptPlanner;
use crate::retrieval::RetrievalOrchestrator;
use crate::rewrite::{QueryRewriter, RewriteResult};
use askforge_common::errors::Result;
use askforge_common::metrics::record_chat_outcome;
use askforge_common::{Executors, NO_EVIDENCE_MESSAGE};
use askforge_llm::{ChatMessage, ChatRequest, EventSink, LlmService, StreamEvent, StreamTaskManager};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One user message to answer
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub question: String,
    pub conversation_id: String,
    pub user_id: String,
    pub deep_thinking: bool,
    /// Id a caller can pass to `stop_task`
    pub task_id: String,
}

/// Collaborators of the pipeline
pub struct ChatDependencies {
    pub tree: Arc<IntentTree>,
    pub memory: Arc<dyn ConversationMemory>,
    pub rewriter: Arc<dyn QueryRewriter>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub guidance: Arc<GuidanceEngine>,
    pub retrieval: RetrievalOrchestrator,
    pub llm: Arc<dyn LlmService>,
    pub tasks: Arc<StreamTaskManager>,
    pub executors: Executors,
}

pub struct ChatService {
    tree: Arc<IntentTree>,
    memory: Arc<dyn ConversationMemory>,
    rewriter: Arc<dyn QueryRewriter>,
    classifier: Arc<dyn IntentClassifier>,
    guidance: Arc<GuidanceEngine>,
    retrieval: RetrievalOrchestrator,
    planner: PromptPlanner,
    llm: Arc<dyn LlmService>,
    tasks: Arc<StreamTaskManager>,
    executors: Executors,
}

impl ChatService {
    pub fn new(deps: ChatDependencies) -> Self {
        Self {
            tree: deps.tree,
            memory: deps.memory,
            rewriter: deps.rewriter,
            classifier: deps.classifier,
            guidance: deps.guidance,
            retrieval: deps.retrieval,
            planner: PromptPlanner,
            llm: deps.llm,
            tasks: deps.tasks,
            executors: deps.executors,
        }
    }

    /// Stop an in-flight answer. Unknown or finished ids are ignored.
    pub fn stop_task(&self, task_id: &str) -> bool {
        self.tasks.cancel(task_id)
    }

    /// Answer a turn, delivering events to `sink` until the reply ends.
    ///
    /// Only an exhausted model chain is returned as an error; it has already
    /// been delivered to `sink` as a single `Error` event.
    pub async fn stream_chat(&self, turn: ChatTurn, sink: EventSink) -> Result<()> {
        let start = Instant::now();
        let history = match self.memory.load(&turn.conversation_id, &turn.user_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, conversation_id = %turn.conversation_id, "Failed to load history");
                Vec::new()
            }
        };
        let key = GuidanceKey::new(&turn.conversation_id, &turn.user_id);

        let (question, sub_questions) = match self.guidance.handle_existing_session(&key, &turn.question).await {
            GuidanceDecision::Prompt { text } => {
                return self.reply_fixed(&turn, &text, "guidance", &sink).await;
            }
            GuidanceDecision::Resolved { question, leaf_ids } => {
                let node_scores = leaf_ids
                    .iter()
                    .filter_map(|id| self.tree.get(id))
                    .map(|node| NodeScore::new(node.clone(), 1.0))
                    .collect();
                let resolved = SubQuestionIntent {
                    sub_question: question.clone(),
                    node_scores,
                };
                (question, vec![resolved])
            }
            GuidanceDecision::Proceed => {
                let rewrite = match self.rewriter.rewrite_with_split(&turn.question, &history).await {
                    Ok(rewrite) => rewrite,
                    Err(e) => {
                        warn!(error = %e, "Rewrite failed, using the original question");
                        RewriteResult::unchanged(&turn.question)
                    }
                };
                let sub_questions = self.classify(rewrite.sub_questions).await;

                if let GuidanceDecision::Prompt { text } = self
                    .guidance
                    .start_session(&key, &rewrite.rewritten, &sub_questions)
                    .await
                {
                    return self.reply_fixed(&turn, &text, "guidance", &sink).await;
                }
                (rewrite.rewritten, sub_questions)
            }
        };

        let context = self.retrieval.retrieve(&sub_questions).await;
        if context.is_empty() {
            info!(conversation_id = %turn.conversation_id, "No evidence found, skipping the model");
            return self.reply_fixed(&turn, NO_EVIDENCE_MESSAGE, "no_evidence", &sink).await;
        }

        let prompt = self.planner.build(&context, &question);
        let mut messages = history;
        messages.push(ChatMessage::user(prompt));
        let request = ChatRequest {
            messages,
            thinking: turn.deep_thinking,
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = match self.llm.stream_chat(request, tx).await {
            Ok(handle) => handle,
            Err(e) => {
                while let Ok(event) = rx.try_recv() {
                    let _ = sink.send(event);
                }
                record_chat_outcome("exhausted");
                return Err(e.into());
            }
        };
        self.tasks.bind(&turn.task_id, handle.clone());

        let mut answer = String::new();
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            match &event {
                StreamEvent::Content(text) => answer.push_str(text),
                StreamEvent::Complete => completed = true,
                StreamEvent::Thinking(_) | StreamEvent::Error(_) => {}
            }
            if sink.send(event).is_err() {
                debug!(task_id = %turn.task_id, "Caller went away, cancelling the stream");
                handle.cancel();
                break;
            }
            if terminal {
                break;
            }
        }
        self.tasks.unregister(&turn.task_id);

        let outcome = if completed {
            self.remember(&turn, &answer).await;
            "answered"
        } else if handle.is_cancelled() {
            "cancelled"
        } else {
            "failed"
        };
        record_chat_outcome(outcome);
        info!(
            conversation_id = %turn.conversation_id,
            task_id = %turn.task_id,
            outcome,
            intents = context.participating.len(),
            answer_chars = answer.chars().count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat turn finished"
        );
        Ok(())
    }

    /// Classify each sub-question on the classification pool
    async fn classify(&self, sub_questions: Vec<String>) -> Vec<SubQuestionIntent> {
        let tasks = sub_questions.iter().cloned().map(|question| {
            let classifier = self.classifier.clone();
            async move { classifier.classify_targets(&question).await }
        });
        let results = self.executors.classify.join_all(tasks).await;

        sub_questions
            .into_iter()
            .zip(results)
            .map(|(sub_question, result)| {
                let node_scores = match result {
                    Ok(Ok(scores)) => scores,
                    Ok(Err(e)) => {
                        warn!(error = %e, sub_question = %sub_question, "Classification failed");
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(error = %e, "Classification task failed");
                        Vec::new()
                    }
                };
                SubQuestionIntent {
                    sub_question,
                    node_scores,
                }
            })
            .collect()
    }

    /// Answer with fixed text, without a model call
    async fn reply_fixed(&self, turn: &ChatTurn, text: &str, outcome: &str, sink: &EventSink) -> Result<()> {
        let _ = sink.send(StreamEvent::Content(text.to_string()));
        let _ = sink.send(StreamEvent::Complete);
        self.remember(turn, text).await;
        record_chat_outcome(outcome);
        Ok(())
    }

    async fn remember(&self, turn: &ChatTurn, answer: &str) {
        let exchange = [ChatMessage::user(&turn.question), ChatMessage::assistant(answer)];
        for message in exchange {
            if let Err(e) = self
                .memory
                .append(&turn.conversation_id, &turn.user_id, message)
                .await
            {
                warn!(error = %e, conversation_id = %turn.conversation_id, "Failed to record history");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::InMemoryGuidanceStore;
    use crate::intent::tree::fixtures::sample_tree;
    use crate::memory::InMemoryConversationMemory;
    use crate::rewrite::PassthroughRewriter;
    use crate::test_support::ScriptedLlm;
    use askforge_common::config::{ExecutorConfig, GuidanceConfig, IntentConfig, RetrievalConfig};
    use askforge_common::LlmError;
    use askforge_search::{McpService, McpToolRegistry, ParameterExtractor, McpToolSpec, RetrievedChunk, Retriever, ScoreReranker};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::time::Duration;

    struct FixedClassifier {
        tree: Arc<IntentTree>,
        scores: Vec<(&'static str, f32)>,
    }

    #[async_trait]
    impl IntentClassifier for FixedClassifier {
        async fn classify_targets(&self, _question: &str) -> Result<Vec<NodeScore>> {
            Ok(self
                .scores
                .iter()
                .filter_map(|(id, s)| self.tree.get(id).map(|n| NodeScore::new(n.clone(), *s)))
                .collect())
        }
    }

    struct CollectionRetriever;

    #[async_trait]
    impl Retriever for CollectionRetriever {
        async fn retrieve(&self, collection: &str, _query: &str, _top_k: usize) -> Result<Vec<RetrievedChunk>> {
            Ok(vec![RetrievedChunk::new("1", format!("{} says 25 days", collection), 0.9)])
        }
    }

    struct NoArguments;

    #[async_trait]
    impl ParameterExtractor for NoArguments {
        async fn extract_parameters(&self, _q: &str, _t: &McpToolSpec, _p: Option<&str>) -> Result<Map<String, Value>> {
            Ok(Map::new())
        }
    }

    struct Harness {
        service: ChatService,
        llm: Arc<ScriptedLlm>,
        memory: Arc<InMemoryConversationMemory>,
    }

    fn harness(scores: Vec<(&'static str, f32)>) -> Harness {
        let tree = Arc::new(sample_tree());
        let llm = Arc::new(ScriptedLlm::default());
        let memory = Arc::new(InMemoryConversationMemory::new(20));
        let executors = Executors::from_config(&ExecutorConfig::default());

        let guidance = GuidanceEngine::new(
            tree.clone(),
            llm.clone(),
            Arc::new(InMemoryGuidanceStore::new(Duration::from_secs(60))),
            GuidanceConfig {
                enabled: true,
                min_score: 0.5,
                ambiguity_ratio: 0.6,
                max_options: 5,
                state_ttl_secs: 60,
            },
        );
        let retrieval = RetrievalOrchestrator::new(
            Arc::new(CollectionRetriever),
            Arc::new(ScoreReranker),
            Arc::new(McpService::new(Arc::new(McpToolRegistry::new()), Duration::from_secs(1))),
            Arc::new(NoArguments),
            executors.clone(),
            IntentConfig {
                min_score: 0.5,
                ..Default::default()
            },
            RetrievalConfig::default(),
        );

        let service = ChatService::new(ChatDependencies {
            tree: tree.clone(),
            memory: memory.clone(),
            rewriter: Arc::new(PassthroughRewriter),
            classifier: Arc::new(FixedClassifier { tree, scores }),
            guidance: Arc::new(guidance),
            retrieval,
            llm: llm.clone(),
            tasks: Arc::new(StreamTaskManager::new()),
            executors,
        });
        Harness { service, llm, memory }
    }

    fn turn(question: &str, deep_thinking: bool) -> ChatTurn {
        ChatTurn {
            question: question.into(),
            conversation_id: "conv".into(),
            user_id: "user".into(),
            deep_thinking,
            task_id: "task".into(),
        }
    }

    async fn run(h: &Harness, turn: ChatTurn) -> (Result<()>, Vec<StreamEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = h.service.stream_chat(turn, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn test_no_evidence_never_calls_the_model() {
        let h = harness(vec![]);
        let (result, events) = run(&h, turn("What is the meaning of life?", false)).await;

        assert!(result.is_ok());
        assert_eq!(
            events,
            vec![StreamEvent::Content(NO_EVIDENCE_MESSAGE.into()), StreamEvent::Complete]
        );
        assert_eq!(h.llm.stream_calls(), 0);
    }

    #[tokio::test]
    async fn test_answer_is_streamed_and_remembered() {
        let h = harness(vec![("hr-travel", 0.9)]);
        h.llm.set_stream(vec![
            StreamEvent::Thinking("checking".into()),
            StreamEvent::Content("You get ".into()),
            StreamEvent::Content("25 days.".into()),
            StreamEvent::Complete,
        ]);

        let (result, events) = run(&h, turn("Travel allowance?", true)).await;
        assert!(result.is_ok());
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], StreamEvent::Complete);

        let request = h.llm.requests().pop().unwrap();
        assert!(request.thinking);
        let prompt = &request.messages.last().unwrap().content;
        assert!(prompt.contains("kb_hr_travel says 25 days"));
        assert!(prompt.contains("Travel allowance?"));

        let history = h.memory.load("conv", "user").await.unwrap();
        assert_eq!(
            history,
            vec![ChatMessage::user("Travel allowance?"), ChatMessage::assistant("You get 25 days.")]
        );
    }

    #[tokio::test]
    async fn test_guidance_prompt_then_resolution() {
        let h = harness(vec![("hr-leave", 0.9), ("it-leave", 0.85)]);
        h.llm.set_stream(vec![StreamEvent::Content("IT staff get 20 days.".into()), StreamEvent::Complete]);

        let (_, events) = run(&h, turn("How many leave days?", false)).await;
        match &events[0] {
            StreamEvent::Content(text) => assert!(text.starts_with("Which system's Leave policy do you mean?")),
            other => panic!("expected a clarification, got {:?}", other),
        }
        assert_eq!(h.llm.stream_calls(), 0);

        h.llm.push_reply(Ok(r#"{"action": "select", "selected_indexes": [2]}"#.into()));
        let (result, events) = run(&h, turn("2", false)).await;
        assert!(result.is_ok());
        assert_eq!(events[0], StreamEvent::Content("IT staff get 20 days.".into()));

        let prompt = h.llm.requests().pop().unwrap().messages.pop().unwrap().content;
        assert!(prompt.contains("kb_it_leave says 25 days"));
        assert!(!prompt.contains("kb_hr_leave"));
        assert!(prompt.contains("How many leave days?"));
    }

    #[tokio::test]
    async fn test_exhausted_models_surface_one_error() {
        let h = harness(vec![("hr-travel", 0.9)]);
        h.llm.fail_stream(LlmError::Exhausted {
            attempts: 3,
            last: "503".into(),
        });

        let (result, events) = run(&h, turn("Travel allowance?", false)).await;
        assert!(result.is_err());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(LlmError::Exhausted { .. })));
        assert!(h.memory.load("conv", "user").await.unwrap().is_empty());
    }

    #[test]
    fn test_stop_unknown_task_is_noop() {
        let h = harness(vec![]);
        assert!(!h.service.stop_task("missing"));
    }
}
