//! Conversation history

use askforge_common::errors::Result;
use askforge_llm::ChatMessage;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// History of a conversation, oldest first
    async fn load(&self, conversation_id: &str, user_id: &str) -> Result<Vec<ChatMessage>>;

    async fn append(&self, conversation_id: &str, user_id: &str, message: ChatMessage) -> Result<()>;
}

/// Keeps the most recent `max_messages` per conversation in process memory
pub struct InMemoryConversationMemory {
    max_messages: usize,
    conversations: Mutex<HashMap<(String, String), VecDeque<ChatMessage>>>,
}

impl InMemoryConversationMemory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            conversations: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn load(&self, conversation_id: &str, user_id: &str) -> Result<Vec<ChatMessage>> {
        let conversations = self.conversations.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(conversations
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn append(&self, conversation_id: &str, user_id: &str, message: ChatMessage) -> Result<()> {
        let mut conversations = self.conversations.lock().unwrap_or_else(PoisonError::into_inner);
        let history = conversations
            .entry((conversation_id.to_string(), user_id.to_string()))
            .or_default();
        history.push_back(message);
        while history.len() > self.max_messages {
            history.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_keeps_latest() {
        let memory = InMemoryConversationMemory::new(2);
        memory.append("c", "u", ChatMessage::user("one")).await.unwrap();
        memory.append("c", "u", ChatMessage::assistant("two")).await.unwrap();
        memory.append("c", "u", ChatMessage::user("three")).await.unwrap();

        let history = memory.load("c", "u").await.unwrap();
        assert_eq!(history, vec![ChatMessage::assistant("two"), ChatMessage::user("three")]);
        assert!(memory.load("c", "other").await.unwrap().is_empty());
    }
}
