//! Candidate ordering for chat calls

use crate::health::ModelHealthStore;
use crate::types::ModelTarget;
use askforge_common::config::AiConfig;
use askforge_common::{AppError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides which models a chat call may use, in order
pub trait ModelSelector: Send + Sync {
    /// Candidates for one chat call, best first
    fn select_chat_candidates(&self, deep_thinking: bool) -> Vec<ModelTarget>;

    /// Look up a configured model by id
    fn find(&self, model_id: &str) -> Option<ModelTarget>;
}

/// Selector backed by `ai.chat.candidates`.
///
/// Ordering: enabled candidates by ascending priority (declaration order on
/// ties); under deep thinking only thinking-capable models, unless none
/// are; then models with an open circuit move to the back, keeping their
/// relative order.
pub struct ConfigModelSelector {
    targets: Vec<ModelTarget>,
    health: Arc<ModelHealthStore>,
}

impl ConfigModelSelector {
    pub fn new(ai: &AiConfig, health: Arc<ModelHealthStore>) -> Result<Self> {
        let mut targets = Vec::new();
        for candidate in ai.chat.candidates.iter().filter(|c| c.enabled) {
            let provider = ai.providers.get(&candidate.provider).ok_or_else(|| {
                AppError::Configuration {
                    message: format!(
                        "chat candidate '{}' references unknown provider '{}'",
                        candidate.id, candidate.provider
                    ),
                }
            })?;
            targets.push(ModelTarget {
                candidate: candidate.clone(),
                provider: provider.clone(),
            });
        }

        // Stable sort keeps declaration order on equal priority
        targets.sort_by_key(|t| t.candidate.priority);

        if targets.is_empty() {
            warn!("No enabled chat candidates configured");
        }

        Ok(Self { targets, health })
    }

    pub fn from_targets(targets: Vec<ModelTarget>, health: Arc<ModelHealthStore>) -> Self {
        Self { targets, health }
    }
}

impl ModelSelector for ConfigModelSelector {
    fn select_chat_candidates(&self, deep_thinking: bool) -> Vec<ModelTarget> {
        let mut pool: Vec<&ModelTarget> = self.targets.iter().collect();

        if deep_thinking {
            let thinking: Vec<&ModelTarget> = pool
                .iter()
                .copied()
                .filter(|t| t.candidate.supports_thinking)
                .collect();
            if thinking.is_empty() {
                warn!("Deep thinking requested but no thinking-capable model is configured");
            } else {
                pool = thinking;
            }
        }

        let (healthy, open): (Vec<&ModelTarget>, Vec<&ModelTarget>) =
            pool.into_iter().partition(|t| !self.health.is_open(t.id()));

        if !open.is_empty() {
            debug!(
                demoted = ?open.iter().map(|t| t.id()).collect::<Vec<_>>(),
                "Open circuits moved to the back"
            );
        }

        healthy.into_iter().chain(open).cloned().collect()
    }

    fn find(&self, model_id: &str) -> Option<ModelTarget> {
        self.targets.iter().find(|t| t.id() == model_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_target;
    use std::time::Duration;

    fn target(id: &str, priority: i32, thinking: bool) -> ModelTarget {
        let mut t = test_target(id, "p", "http://localhost");
        t.candidate.priority = priority;
        t.candidate.supports_thinking = thinking;
        t
    }

    fn ids(targets: &[ModelTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.id()).collect()
    }

    #[test]
    fn test_priority_then_declaration_order() {
        let health = Arc::new(ModelHealthStore::default());
        let mut targets = vec![target("a", 2, false), target("b", 1, false), target("c", 2, false)];
        targets.sort_by_key(|t| t.candidate.priority);
        let selector = ConfigModelSelector::from_targets(targets, health);

        assert_eq!(ids(&selector.select_chat_candidates(false)), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_deep_thinking_filters_capable_models() {
        let health = Arc::new(ModelHealthStore::default());
        let selector = ConfigModelSelector::from_targets(
            vec![target("fast", 1, false), target("deep", 2, true)],
            health,
        );
        assert_eq!(ids(&selector.select_chat_candidates(true)), vec!["deep"]);
        assert_eq!(ids(&selector.select_chat_candidates(false)), vec!["fast", "deep"]);
    }

    #[test]
    fn test_deep_thinking_falls_back_to_all() {
        let health = Arc::new(ModelHealthStore::default());
        let selector =
            ConfigModelSelector::from_targets(vec![target("fast", 1, false)], health);
        assert_eq!(ids(&selector.select_chat_candidates(true)), vec!["fast"]);
    }

    #[test]
    fn test_open_circuit_moves_to_back() {
        let health = Arc::new(ModelHealthStore::new(1, Duration::from_secs(60)));
        health.mark_failure("a");
        let selector = ConfigModelSelector::from_targets(
            vec![target("a", 1, false), target("b", 2, false), target("c", 3, false)],
            health,
        );
        assert_eq!(ids(&selector.select_chat_candidates(false)), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let mut ai = AiConfig::default();
        ai.chat.candidates.push(target("a", 1, false).candidate);
        let result = ConfigModelSelector::new(&ai, Arc::new(ModelHealthStore::default()));
        assert!(matches!(result, Err(AppError::Configuration { .. })));
    }
}
