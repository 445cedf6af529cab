//! Retrieval orchestration
//!
//! Every sub-question is built on the context pool. Inside it, each KB intent
//! runs search + rerank on the KB pool and the MCP intents run as one tool
//! batch. Failing units are dropped; the rest are merged under
//! `### Sub-question` and `#### <intent>` headers.

use crate::intent::{IntentNode, NodeScore, SubQuestionIntent};
use askforge_common::config::{IntentConfig, RetrievalConfig};
use askforge_common::errors::Result;
use askforge_common::metrics::record_retrieval;
use askforge_common::Executors;
use askforge_search::{McpRequest, McpService, ParameterExtractor, Reranker, RetrievedChunk, Retriever};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Evidence gathered for one request
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub kb_context: String,
    pub mcp_context: String,
    /// Reranked chunks per KB intent id
    pub intent_chunks: HashMap<String, Vec<RetrievedChunk>>,
    /// Intents that contributed evidence, first contribution first
    pub participating: Vec<Arc<IntentNode>>,
}

impl RetrievalContext {
    /// Nothing to ground an answer on
    pub fn is_empty(&self) -> bool {
        self.kb_context.trim().is_empty() && self.mcp_context.trim().is_empty()
    }
}

/// Bound the total number of intents across sub-questions.
///
/// Each sub-question keeps its best intent; remaining slots go to the other
/// candidates by score. When there are more sub-questions than slots, the
/// best-of-each are ranked and truncated. Per-sub-question order is kept.
pub fn cap_total_intents(sub_questions: Vec<SubQuestionIntent>, cap: usize) -> Vec<SubQuestionIntent> {
    let total: usize = sub_questions.iter().map(|s| s.node_scores.len()).sum();
    if total <= cap {
        return sub_questions;
    }

    // (sub-question, position, score)
    let mut bests = Vec::new();
    let mut rest = Vec::new();
    for (sq, intent) in sub_questions.iter().enumerate() {
        for (pos, scored) in intent.node_scores.iter().enumerate() {
            if pos == 0 {
                bests.push((sq, pos, scored.score));
            } else {
                rest.push((sq, pos, scored.score));
            }
        }
    }

    let by_score = |a: &(usize, usize, f32), b: &(usize, usize, f32)| {
        b.2.total_cmp(&a.2).then_with(|| (a.0, a.1).cmp(&(b.0, b.1)))
    };
    bests.sort_by(by_score);
    rest.sort_by(by_score);

    let keep: HashSet<(usize, usize)> = bests
        .into_iter()
        .chain(rest)
        .take(cap)
        .map(|(sq, pos, _)| (sq, pos))
        .collect();

    sub_questions
        .into_iter()
        .enumerate()
        .map(|(sq, intent)| SubQuestionIntent {
            sub_question: intent.sub_question,
            node_scores: intent
                .node_scores
                .into_iter()
                .enumerate()
                .filter(|(pos, _)| keep.contains(&(sq, *pos)))
                .map(|(_, scored)| scored)
                .collect(),
        })
        .collect()
}

/// Evidence for one sub-question
#[derive(Default)]
struct SubContext {
    kb_block: String,
    mcp_block: String,
    chunks: Vec<(String, Vec<RetrievedChunk>)>,
    participating: Vec<Arc<IntentNode>>,
}

#[derive(Clone)]
pub struct RetrievalOrchestrator {
    retriever: Arc<dyn Retriever>,
    reranker: Arc<dyn Reranker>,
    mcp: Arc<McpService>,
    extractor: Arc<dyn ParameterExtractor>,
    executors: Executors,
    intent_config: IntentConfig,
    retrieval_config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        reranker: Arc<dyn Reranker>,
        mcp: Arc<McpService>,
        extractor: Arc<dyn ParameterExtractor>,
        executors: Executors,
        intent_config: IntentConfig,
        retrieval_config: RetrievalConfig,
    ) -> Self {
        Self {
            retriever,
            reranker,
            mcp,
            extractor,
            executors,
            intent_config,
            retrieval_config,
        }
    }

    fn search_top_k(&self, node: &IntentNode) -> usize {
        node.top_k.unwrap_or_else(|| {
            (self.retrieval_config.final_top_k * self.retrieval_config.search_multiplier)
                .max(self.retrieval_config.min_search_top_k)
        })
    }

    fn rerank_limit(&self) -> usize {
        self.retrieval_config.final_top_k * self.retrieval_config.rerank_multiplier
    }

    /// Split classified intents into searchable KB intents and callable MCP intents
    fn partition(&self, sub_questions: &[SubQuestionIntent]) -> (Vec<SubQuestionIntent>, Vec<Vec<Arc<IntentNode>>>) {
        let min_score = self.intent_config.min_score;
        let mut kb = Vec::with_capacity(sub_questions.len());
        let mut mcp = Vec::with_capacity(sub_questions.len());

        for intent in sub_questions {
            let eligible = intent.node_scores.iter().filter(|s| s.score >= min_score);
            kb.push(SubQuestionIntent {
                sub_question: intent.sub_question.clone(),
                node_scores: eligible
                    .clone()
                    .filter(|s| s.node.collection().is_some())
                    .cloned()
                    .collect(),
            });
            mcp.push(
                eligible
                    .filter_map(|s| s.node.tool_id().map(|tool| (s, tool)))
                    .filter(|(_, tool)| self.mcp.registry().get_executor(tool).is_some())
                    .map(|(s, _)| s.node.clone())
                    .collect(),
            );
        }
        (kb, mcp)
    }

    /// Gather KB and MCP evidence for every sub-question
    pub async fn retrieve(&self, sub_questions: &[SubQuestionIntent]) -> RetrievalContext {
        let start = Instant::now();
        let (kb, mcp) = self.partition(sub_questions);
        let kb = cap_total_intents(kb, self.intent_config.max_intent_count);

        let builds = kb.into_iter().zip(mcp).map(|(kb_intent, mcp_nodes)| {
            let this = self.clone();
            async move { this.build_sub_context(kb_intent, mcp_nodes).await }
        });
        let results = self.executors.context.join_all(builds).await;

        let mut context = RetrievalContext::default();
        let mut seen = HashSet::new();
        for result in results {
            let sub = match result {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(error = %e, "Context build task failed");
                    continue;
                }
            };
            context.kb_context.push_str(&sub.kb_block);
            context.mcp_context.push_str(&sub.mcp_block);
            context.intent_chunks.extend(sub.chunks);
            for node in sub.participating {
                if seen.insert(node.id.clone()) {
                    context.participating.push(node);
                }
            }
        }

        info!(
            sub_questions = sub_questions.len(),
            intents = context.participating.len(),
            empty = context.is_empty(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieval finished"
        );
        context
    }

    async fn build_sub_context(&self, kb_intent: SubQuestionIntent, mcp_nodes: Vec<Arc<IntentNode>>) -> SubContext {
        let question = kb_intent.sub_question.clone();
        let (kb_results, mcp_results) = tokio::join!(
            self.retrieve_kb(&question, kb_intent.node_scores),
            self.call_tools(&question, mcp_nodes)
        );

        let mut sub = SubContext::default();
        let header = format!("### Sub-question: {}\n", question);

        if !kb_results.is_empty() {
            sub.kb_block.push_str(&header);
            for (node, chunks) in kb_results {
                sub.kb_block.push_str(&format!("#### {}\n", node.name));
                for chunk in &chunks {
                    sub.kb_block.push_str(chunk.content.trim());
                    sub.kb_block.push_str("\n\n");
                }
                sub.chunks.push((node.id.clone(), chunks));
                sub.participating.push(node);
            }
        }

        if !mcp_results.is_empty() {
            sub.mcp_block.push_str(&header);
            for (node, content) in mcp_results {
                sub.mcp_block.push_str(&format!("#### {}\n{}\n\n", node.name, content.trim()));
                sub.participating.push(node);
            }
        }
        sub
    }

    /// Search + rerank every KB intent on the KB pool; failed or empty intents are dropped
    async fn retrieve_kb(&self, question: &str, intents: Vec<NodeScore>) -> Vec<(Arc<IntentNode>, Vec<RetrievedChunk>)> {
        let tasks = intents.into_iter().map(|scored| {
            let this = self.clone();
            let question = question.to_string();
            async move {
                let node = scored.node;
                let result = this.search_and_rerank(&question, &node).await;
                (node, result)
            }
        });

        let mut hits = Vec::new();
        for joined in self.executors.kb.join_all(tasks).await {
            match joined {
                Ok((node, Ok(chunks))) if !chunks.is_empty() => hits.push((node, chunks)),
                Ok((node, Ok(_))) => debug!(intent = %node.id, "No chunks retrieved"),
                Ok((node, Err(e))) => warn!(intent = %node.id, error = %e, "KB retrieval failed, dropping intent"),
                Err(e) => warn!(error = %e, "KB retrieval task failed"),
            }
        }
        hits
    }

    async fn search_and_rerank(&self, question: &str, node: &IntentNode) -> Result<Vec<RetrievedChunk>> {
        let Some(collection) = node.collection() else {
            return Ok(Vec::new());
        };
        let start = Instant::now();
        let top_k = self.search_top_k(node);

        let searched = self.retriever.retrieve(collection, question, top_k).await;
        let outcome = match searched {
            Ok(chunks) if chunks.is_empty() => Ok(chunks),
            Ok(chunks) => self.reranker.rerank(question, chunks, self.rerank_limit()).await,
            Err(e) => Err(e),
        };

        let count = outcome.as_ref().map_or(0, Vec::len);
        record_retrieval("kb", start.elapsed().as_secs_f64(), count, outcome.is_ok());
        debug!(intent = %node.id, collection, top_k, count, "KB intent retrieved");
        outcome
    }

    /// Extract arguments and run the tool batch; only successful calls are returned
    async fn call_tools(&self, question: &str, nodes: Vec<Arc<IntentNode>>) -> Vec<(Arc<IntentNode>, String)> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let start = Instant::now();

        let extractions = nodes.iter().map(|node| async move {
            let tool_id = node.tool_id()?;
            let executor = self.mcp.registry().get_executor(tool_id)?;
            match self
                .extractor
                .extract_parameters(question, executor.spec(), node.param_prompt_template.as_deref())
                .await
            {
                Ok(arguments) => Some((
                    node.clone(),
                    McpRequest {
                        tool_id: tool_id.to_string(),
                        arguments,
                    },
                )),
                Err(e) => {
                    warn!(intent = %node.id, error = %e, "Parameter extraction failed, skipping tool");
                    None
                }
            }
        });
        let (called, requests): (Vec<_>, Vec<_>) = futures::future::join_all(extractions)
            .await
            .into_iter()
            .flatten()
            .unzip();
        if requests.is_empty() {
            return Vec::new();
        }

        let responses = self.mcp.execute_batch(requests).await;
        let usable = McpService::any_succeeded(&responses);
        record_retrieval(
            "mcp",
            start.elapsed().as_secs_f64(),
            responses.iter().filter(|r| r.success).count(),
            usable,
        );
        if !usable {
            warn!(tools = responses.len(), "Every MCP call failed");
            return Vec::new();
        }

        called
            .into_iter()
            .zip(responses)
            .filter(|(_, response)| response.success && !response.content.trim().is_empty())
            .map(|(node, response)| (node, response.content))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::tree::fixtures::{kb, node};
    use crate::intent::{IntentKind, IntentLevel};
    use askforge_common::config::ExecutorConfig;
    use askforge_common::AppError;
    use askforge_search::{McpToolExecutor, McpToolRegistry, McpToolSpec, ScoreReranker};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    fn leaf(id: &str, kind: IntentKind) -> Arc<IntentNode> {
        Arc::new(node(id, &format!("Intent {}", id), None, IntentLevel::Leaf, kind))
    }

    fn sq(question: &str, scores: &[(&str, f32)]) -> SubQuestionIntent {
        SubQuestionIntent {
            sub_question: question.into(),
            node_scores: scores
                .iter()
                .map(|(id, s)| NodeScore::new(leaf(id, kb(id)), *s))
                .collect(),
        }
    }

    fn ids(intent: &SubQuestionIntent) -> Vec<&str> {
        intent.node_scores.iter().map(|s| s.node.id.as_str()).collect()
    }

    #[test]
    fn test_cap_keeps_each_best() {
        let input = vec![
            sq("a", &[("a1", 0.9), ("a2", 0.85), ("a3", 0.8)]),
            sq("b", &[("b1", 0.3), ("b2", 0.2)]),
            sq("c", &[("c1", 0.5)]),
        ];
        let capped = cap_total_intents(input, 4);
        assert_eq!(ids(&capped[0]), vec!["a1", "a2"]);
        assert_eq!(ids(&capped[1]), vec!["b1"]);
        assert_eq!(ids(&capped[2]), vec!["c1"]);
    }

    #[test]
    fn test_cap_when_sub_questions_outnumber_slots() {
        let input = vec![
            sq("a", &[("a1", 0.4), ("a2", 0.39)]),
            sq("b", &[("b1", 0.9)]),
            sq("c", &[("c1", 0.7)]),
        ];
        let capped = cap_total_intents(input, 2);
        let total: usize = capped.iter().map(|s| s.node_scores.len()).sum();
        assert_eq!(total, 2);
        assert!(capped[0].node_scores.is_empty());
        assert_eq!(ids(&capped[1]), vec!["b1"]);
        assert_eq!(ids(&capped[2]), vec!["c1"]);
    }

    #[test]
    fn test_cap_is_noop_under_limit() {
        let input = vec![sq("a", &[("a1", 0.9), ("a2", 0.1)])];
        assert_eq!(cap_total_intents(input.clone(), 5), input);
    }

    struct FakeRetriever {
        calls: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl Retriever for FakeRetriever {
        async fn retrieve(&self, collection: &str, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
            self.calls
                .lock()
                .unwrap()
                .push((collection.to_string(), query.to_string(), top_k));
            match collection {
                "broken" => Err(AppError::Retrieval {
                    collection: collection.into(),
                    message: "down".into(),
                }),
                "empty" => Ok(Vec::new()),
                _ => Ok((0..12)
                    .map(|i| RetrievedChunk::new(format!("{}-{}", collection, i), format!("{} fact {}", collection, i), i as f32))
                    .collect()),
            }
        }
    }

    struct EchoTool {
        spec: McpToolSpec,
        fail: bool,
    }

    #[async_trait]
    impl McpToolExecutor for EchoTool {
        fn spec(&self) -> &McpToolSpec {
            &self.spec
        }

        async fn execute(&self, arguments: &Map<String, Value>) -> Result<String> {
            if self.fail {
                return Err(AppError::ToolExecution {
                    tool_id: self.spec.id.clone(),
                    message: "boom".into(),
                });
            }
            Ok(format!("{} says {}", self.spec.id, Value::Object(arguments.clone())))
        }
    }

    struct FixedExtractor;

    #[async_trait]
    impl ParameterExtractor for FixedExtractor {
        async fn extract_parameters(
            &self,
            question: &str,
            _tool: &McpToolSpec,
            custom_prompt: Option<&str>,
        ) -> Result<Map<String, Value>> {
            let mut args = Map::new();
            args.insert("q".into(), Value::String(question.into()));
            if let Some(prompt) = custom_prompt {
                args.insert("prompt".into(), Value::String(prompt.into()));
            }
            Ok(args)
        }
    }

    fn tool(id: &str, fail: bool) -> Arc<EchoTool> {
        Arc::new(EchoTool {
            spec: McpToolSpec {
                id: id.into(),
                name: id.into(),
                description: String::new(),
                input_schema: Value::Null,
            },
            fail,
        })
    }

    fn orchestrator(retriever: Arc<FakeRetriever>) -> RetrievalOrchestrator {
        let mut registry = McpToolRegistry::new();
        registry.register(tool("weather", false));
        registry.register(tool("flaky", true));

        RetrievalOrchestrator::new(
            retriever,
            Arc::new(ScoreReranker),
            Arc::new(McpService::new(Arc::new(registry), Duration::from_secs(1))),
            Arc::new(FixedExtractor),
            Executors::from_config(&ExecutorConfig::default()),
            IntentConfig {
                min_score: 0.5,
                max_intent_count: 3,
                ..Default::default()
            },
            RetrievalConfig {
                final_top_k: 2,
                search_multiplier: 3,
                min_search_top_k: 10,
                rerank_multiplier: 2,
            },
        )
    }

    fn retriever() -> Arc<FakeRetriever> {
        Arc::new(FakeRetriever {
            calls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_merges_kb_and_mcp_per_sub_question() {
        let retriever = retriever();
        let orchestrator = orchestrator(retriever.clone());

        let mut custom = node("tool-w", "Weather", None, IntentLevel::Leaf, IntentKind::Mcp { tool_id: "weather".into() });
        custom.param_prompt_template = Some("city only".into());
        let mut deep = node("kb-deep", "Deep docs", None, IntentLevel::Leaf, kb("deep"));
        deep.top_k = Some(4);

        let input = vec![
            SubQuestionIntent {
                sub_question: "Leave rules?".into(),
                node_scores: vec![
                    NodeScore::new(leaf("hr", kb("hr")), 0.9),
                    NodeScore::new(leaf("broken", kb("broken")), 0.8),
                    NodeScore::new(leaf("low", kb("low")), 0.2),
                ],
            },
            SubQuestionIntent {
                sub_question: "Weather in Oslo?".into(),
                node_scores: vec![
                    NodeScore::new(Arc::new(custom), 0.95),
                    NodeScore::new(leaf("flaky", IntentKind::Mcp { tool_id: "flaky".into() }), 0.9),
                    NodeScore::new(leaf("ghost", IntentKind::Mcp { tool_id: "ghost".into() }), 0.9),
                    NodeScore::new(Arc::new(deep), 0.7),
                ],
            },
        ];

        let context = orchestrator.retrieve(&input).await;

        let calls = retriever.calls.lock().unwrap().clone();
        assert!(calls.contains(&("hr".into(), "Leave rules?".into(), 10)));
        assert!(calls.contains(&("deep".into(), "Weather in Oslo?".into(), 4)));
        assert!(!calls.iter().any(|c| c.0 == "low"));

        assert!(context.kb_context.contains("### Sub-question: Leave rules?\n#### Intent hr\nhr fact 11"));
        assert!(!context.kb_context.contains("Intent broken"));
        assert_eq!(context.intent_chunks["hr"].len(), 4);
        assert_eq!(context.intent_chunks["hr"][0].id, "hr-11");

        assert!(context.mcp_context.contains("### Sub-question: Weather in Oslo?\n#### Weather\n"));
        assert!(context.mcp_context.contains("\"prompt\":\"city only\""));
        assert!(!context.mcp_context.contains("flaky"));

        let participating: Vec<_> = context.participating.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(participating, vec!["hr", "kb-deep", "tool-w"]);
        assert!(!context.is_empty());
    }

    #[tokio::test]
    async fn test_empty_when_nothing_retrieved() {
        let orchestrator = orchestrator(retriever());
        let input = vec![SubQuestionIntent {
            sub_question: "q".into(),
            node_scores: vec![
                NodeScore::new(leaf("empty", kb("empty")), 0.9),
                NodeScore::new(leaf("flaky", IntentKind::Mcp { tool_id: "flaky".into() }), 0.9),
            ],
        }];

        let context = orchestrator.retrieve(&input).await;
        assert!(context.is_empty());
        assert!(context.participating.is_empty());
        assert!(context.intent_chunks.is_empty());
    }
}
