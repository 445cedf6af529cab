//! AskForge context engine
//!
//! Turns a user question into a grounded, streamed answer:
//! - Query rewriting and sub-question splitting
//! - Intent classification against a static intent tree
//! - Guidance: a clarification dialogue for ambiguous matches
//! - Parallel KB and MCP retrieval with reranking
//! - Prompt scene planning and rendering
//! - The chat pipeline tying these to the model router

pub mod chat;
pub mod guidance;
pub mod intent;
pub mod memory;
pub mod prompt;
pub mod retrieval;
pub mod rewrite;

#[cfg(test)]
mod test_support;

pub use chat::{ChatDependencies, ChatService, ChatTurn};
pub use guidance::{
    GuidanceDecision, GuidanceEngine, GuidanceKey, GuidanceState, GuidanceStore, InMemoryGuidanceStore,
    RedisGuidanceStore,
};
pub use intent::{
    IntentClassifier, IntentKind, IntentLevel, IntentNode, IntentTree, LlmIntentClassifier, NodeScore,
    SubQuestionIntent,
};
pub use memory::{ConversationMemory, InMemoryConversationMemory};
pub use prompt::{PromptBuildPlan, PromptPlanner, Scene};
pub use retrieval::{cap_total_intents, RetrievalContext, RetrievalOrchestrator};
pub use rewrite::{LlmQueryRewriter, PassthroughRewriter, QueryRewriter, RewriteResult};
