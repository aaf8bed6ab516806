//! Session identity, metadata and timeline types.

use chrono::{DateTime, Utc};
use howtolive_core::{Message, Role, RoutingDecision};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Unique identifier for a chat session
pub type SessionId = String;

/// Reject empty components and anything that could escape the store root.
fn validate_component(kind: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidKey(format!("{} must not be empty", kind)));
    }
    if value.contains(['/', '\\', '\0']) || value == "." || value.contains("..") {
        return Err(StoreError::InvalidKey(format!(
            "{} '{}' contains path characters",
            kind, value
        )));
    }
    Ok(())
}

/// Stable user identity: account id plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserKey {
    pub account_id: String,
    pub display_name: String,
}

impl UserKey {
    pub fn new(account_id: impl Into<String>, display_name: impl Into<String>) -> StoreResult<Self> {
        let account_id = account_id.into();
        let display_name = display_name.into();
        validate_component("account id", &account_id)?;
        validate_component("display name", &display_name)?;
        Ok(Self {
            account_id,
            display_name,
        })
    }

    /// `{account_id}_{display_name}`, the directory name for new users.
    pub fn canonical(&self) -> String {
        format!("{}_{}", self.account_id, self.display_name)
    }

    /// Directory names to probe, in priority order.
    pub fn dir_candidates(&self) -> [String; 3] {
        [
            self.canonical(),
            self.account_id.clone(),
            self.display_name.clone(),
        ]
    }
}

impl std::fmt::Display for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Address of every artifact of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user: UserKey,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(user: UserKey, session_id: impl Into<String>) -> StoreResult<Self> {
        let session_id = session_id.into();
        validate_component("session id", &session_id)?;
        Ok(Self { user, session_id })
    }

    /// Re-check every component; fields are public and may have been edited.
    pub fn validate(&self) -> StoreResult<()> {
        validate_component("account id", &self.user.account_id)?;
        validate_component("display name", &self.user.display_name)?;
        validate_component("session id", &self.session_id)
    }

    /// Key for a fresh session with a generated id.
    pub fn generate(user: UserKey) -> Self {
        Self {
            user,
            session_id: new_session_id(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user.canonical(), self.session_id)
    }
}

/// New opaque session id (32 hex chars).
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, title: Option<String>) -> Self {
        let now = Utc::now();
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_title(now));
        Self {
            session_id: session_id.into(),
            title,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// `Session YYYY-MM-DD HH:MM`
pub fn default_title(at: DateTime<Utc>) -> String {
    format!("Session {}", at.format("%Y-%m-%d %H:%M"))
}

/// One row of a session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Metadata plus the full timeline of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub meta: SessionMeta,
    pub timeline: Vec<TimelineEvent>,
}

/// Kind of timeline event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Message,
    Route,
    Error,
}

/// One entry of `timeline.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub agent: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// ISO-8601; filled at append time when missing
    #[serde(default, alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    /// Assigned at append time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl TimelineEvent {
    fn build(event_type: EventType, agent: impl Into<String>, role: Role) -> Self {
        Self {
            event_type,
            agent: agent.into(),
            role,
            text: None,
            structured: None,
            ts: None,
            seq: None,
        }
    }

    /// A message event with text.
    pub fn message(agent: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        let mut event = Self::build(EventType::Message, agent, role);
        event.text = Some(text.into());
        event
    }

    /// Event for a message, keeping its text and metadata.
    pub fn from_message(message: &Message) -> Self {
        let mut event = Self::message(&message.name, message.role, message.text());
        event.structured = message.metadata.clone();
        event
    }

    /// The routing decision of a turn.
    pub fn route(router: impl Into<String>, decision: &RoutingDecision) -> Self {
        let mut event = Self::build(EventType::Route, router, Role::Assistant);
        event.structured = Some(decision.to_value());
        event
    }

    /// A failed reply.
    pub fn error(agent: impl Into<String>, text: impl Into<String>) -> Self {
        let mut event = Self::build(EventType::Error, agent, Role::Assistant);
        event.text = Some(text.into());
        event
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = Some(ts.to_rfc3339());
        self
    }
}
