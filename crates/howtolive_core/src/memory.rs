//! Per-handler conversational memory.

use parking_lot::RwLock;

use crate::message::Message;

/// Ordered in-memory message history owned by one handler instance.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    messages: RwLock<Vec<Message>>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all messages in insertion order.
    pub fn get(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn clear(&self) {
        self.messages.write().clear();
    }

    pub fn add(&self, message: Message) {
        self.messages.write().push(message);
    }

    pub fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        self.messages.write().extend(messages);
    }

    /// Replace the whole history.
    pub fn replace(&self, messages: Vec<Message>) {
        *self.messages.write() = messages;
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_add_get_clear() {
        let memory = ConversationMemory::new();
        assert!(memory.is_empty());

        memory.add(Message::user("Hello"));
        memory.add(Message::assistant("general", "Hi there!"));

        let messages = memory.get();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "Hello");
        assert_eq!(messages[1].name, "general");

        memory.clear();
        assert_eq!(memory.len(), 0);
    }
}
