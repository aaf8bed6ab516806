//! Message model shared by handlers, memory and persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One block of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Plain text
    Text { text: String },
    /// Structured payload (tool results, routing metadata, ...)
    Structured { data: serde_json::Value },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn structured(data: serde_json::Value) -> Self {
        Self::Structured { data }
    }
}

/// A single message emitted or consumed by a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique message ID (UUID)
    pub id: String,
    /// Speaker name (`user` or the handler name)
    pub name: String,
    /// Role of the message sender
    pub role: Role,
    /// Ordered content blocks
    pub content: Vec<ContentBlock>,
    /// Optional structured metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// When the message was created
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a text message
    pub fn new(name: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentBlock::Text { text }]
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            role,
            content,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Create a new user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", Role::User, text)
    }

    /// Create a new assistant message
    pub fn assistant(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, Role::Assistant, text)
    }

    /// Create a new system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new("system", Role::System, text)
    }

    /// Append a content block
    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Text of the message: all text blocks joined by a newline.
    ///
    /// Structured blocks contribute nothing.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Structured { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the message carries any structured block
    pub fn has_structured(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::Structured { .. }))
    }
}
