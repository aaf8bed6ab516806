//! Handler memory snapshots.
//!
//! Two formats are written:
//!
//! - **Full**: the handler's own `state_dict()` (`{"memory": [Message, ...]}`)
//! - **Compact**: `{"messages": [{role, name, text}, ...]}`, user and assistant
//!   turns with non-empty text only, trimmed to the most recent N
//!
//! Compact snapshots drop structured content blocks, metadata and message ids.
//! Restoring detects the format from the payload, so either can be read back
//! regardless of the current setting.

use howtolive_core::{CoreResult, Message, Role, Stateful};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::SessionsConfig;

/// Serialization format for handler memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Full,
    /// Keep at most `max_messages` entries; `0` keeps everything.
    Compact { max_messages: usize },
}

/// What to persist and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub mode: SnapshotMode,
    pub include_router: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::from(&SessionsConfig::default())
    }
}

impl From<&SessionsConfig> for SnapshotPolicy {
    fn from(config: &SessionsConfig) -> Self {
        let mode = if config.compact {
            SnapshotMode::Compact {
                max_messages: config.max_messages_per_agent,
            }
        } else {
            SnapshotMode::Full
        };
        Self {
            mode,
            include_router: config.include_router,
        }
    }
}

/// One entry of a compact snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactEntry {
    pub role: Role,
    pub name: String,
    pub text: String,
}

/// Serialize a handler's memory.
pub fn capture(handler: &dyn Stateful, mode: SnapshotMode) -> CoreResult<Value> {
    match mode {
        SnapshotMode::Full => handler.state_dict(),
        SnapshotMode::Compact { max_messages } => {
            let entries: Vec<CompactEntry> = handler
                .memory()
                .get()
                .into_iter()
                .filter(|m| matches!(m.role, Role::User | Role::Assistant))
                .filter_map(|m| {
                    let text = m.text();
                    (!text.trim().is_empty()).then(|| CompactEntry {
                        role: m.role,
                        name: m.name,
                        text,
                    })
                })
                .collect();

            let skip = if max_messages == 0 {
                0
            } else {
                entries.len().saturating_sub(max_messages)
            };
            let kept = &entries[skip..];
            Ok(json!({ "messages": kept }))
        }
    }
}

/// Load a snapshot into a handler's memory, replacing its contents.
pub fn restore(handler: &dyn Stateful, snapshot: &Value) -> CoreResult<()> {
    if let Some(messages) = snapshot.get("messages") {
        let entries: Vec<CompactEntry> = serde_json::from_value(messages.clone())?;
        let memory = handler.memory();
        memory.clear();
        memory.extend(
            entries
                .into_iter()
                .map(|e| Message::new(e.name, e.role, e.text)),
        );
        return Ok(());
    }

    if let Err(e) = handler.load_state_dict(snapshot, true) {
        debug!(handler = handler.name(), error = %e, "Strict state load failed, retrying lenient");
        handler.load_state_dict(snapshot, false)?;
    }
    Ok(())
}
