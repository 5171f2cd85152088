//! Per-conversation message memory with a sliding window.

use crate::types::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Messages remembered per conversation id.
///
/// Only the last `window` messages of each conversation are kept.
#[derive(Debug)]
pub struct ConversationMemory {
    window: usize,
    conversations: Mutex<HashMap<String, VecDeque<Message>>>,
}

impl ConversationMemory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Remembered messages, oldest first.
    pub fn history(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn append(&self, conversation_id: &str, messages: impl IntoIterator<Item = Message>) {
        let mut conversations = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = conversations.entry(conversation_id.to_string()).or_default();
        entry.extend(messages);
        while entry.len() > self.window {
            entry.pop_front();
        }
    }

    pub fn clear(&self, conversation_id: &str) {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id);
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversations_are_isolated() {
        let memory = ConversationMemory::default();
        memory.append("a", [Message::user("My name is Inigo Montoya")]);
        memory.append("b", [Message::user("Hello")]);
        assert_eq!(memory.history("a").len(), 1);
        assert_eq!(memory.history("b").len(), 1);
        assert!(memory.history("c").is_empty());
        assert_eq!(memory.conversation_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_window_drops_oldest() {
        let memory = ConversationMemory::new(3);
        for i in 0..5 {
            memory.append("a", [Message::user(format!("m{i}"))]);
        }
        let texts: Vec<String> = memory
            .history("a")
            .iter()
            .map(|m| m.content.joined_text())
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_clear() {
        let memory = ConversationMemory::default();
        memory.append("a", [Message::user("x")]);
        memory.clear("a");
        assert!(memory.history("a").is_empty());
    }
}
