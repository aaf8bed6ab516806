//! Session persistence layer.
//!
//! Sessions are stored under the configured root, one directory per user and
//! one per session (see [`crate::layout`]). Every write replaces its file
//! atomically (see [`crate::atomic`]); the timeline is append-only at the
//! record level and rewritten as a whole file on each append.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use howtolive_core::Stateful;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::atomic::write_json_atomic;
use crate::error::{StoreError, StoreResult};
use crate::layout::{SessionLayout, META_FILE, TIMELINE_FILE};
use crate::snapshot::{self, SnapshotPolicy};
use crate::types::{
    default_title, SessionDetail, SessionKey, SessionMeta, SessionSummary,
    TimelineEvent, UserKey,
};

/// Current timeline file version.
pub const TIMELINE_VERSION: &str = "1.0";

/// Contents of `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agents: Map<String, Value>,
}

/// Contents of `timeline.json`. Entries stay raw so unknown fields survive
/// rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineFile {
    pub user_id: String,
    pub session_id: String,
    pub version: String,
    pub timeline: Vec<Value>,
    pub stats: TimelineStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineStats {
    pub num_events: usize,
}

/// Persistence manager for chat sessions
#[derive(Debug, Clone)]
pub struct SessionStore {
    layout: SessionLayout,
    policy: SnapshotPolicy,
}

impl SessionStore {
    /// Create a store rooted at `root` with the default snapshot policy.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_policy(root, SnapshotPolicy::default())
    }

    pub fn with_policy(root: impl AsRef<Path>, policy: SnapshotPolicy) -> Self {
        Self {
            layout: SessionLayout::new(root),
            policy,
        }
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    // =========================================================================
    // Session metadata
    // =========================================================================

    /// Create a new session with a generated id.
    pub fn create_session(&self, user: &UserKey, title: Option<String>) -> StoreResult<SessionMeta> {
        let key = SessionKey::generate(user.clone());
        let meta = SessionMeta::new(&key.session_id, title);
        self.write_meta(&key, &meta)?;
        info!(session = %key, title = %meta.title, "Session created");
        Ok(meta)
    }

    /// Create the metadata if absent and bump `updated_at`.
    pub fn touch(&self, key: &SessionKey) -> StoreResult<SessionMeta> {
        let mut meta = self
            .load_meta(key)?
            .unwrap_or_else(|| SessionMeta::new(&key.session_id, None));
        meta.touch();
        self.write_meta(key, &meta)?;
        Ok(meta)
    }

    /// Read `meta.json`, if present.
    pub fn load_meta(&self, key: &SessionKey) -> StoreResult<Option<SessionMeta>> {
        key.validate()?;
        read_json(&self.layout.meta_path(key))
    }

    fn write_meta(&self, key: &SessionKey, meta: &SessionMeta) -> StoreResult<()> {
        key.validate()?;
        write_json_atomic(&self.layout.meta_path(key), meta)
    }

    /// All sessions of a user, most recently updated first.
    ///
    /// Directories without metadata but with a timeline are listed with a
    /// derived title and file times.
    pub fn list_sessions(&self, user: &UserKey) -> StoreResult<Vec<SessionSummary>> {
        let user_dir = self.layout.user_dir(user);
        if !user_dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&user_dir).map_err(|e| StoreError::io(&user_dir, e))?;
        let mut sessions = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&user_dir, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(session_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if session_id.starts_with('.') {
                continue;
            }

            let meta_path = path.join(META_FILE);
            let timeline_path = path.join(TIMELINE_FILE);
            let message_count = count_events(&timeline_path);

            let meta = match read_json::<SessionMeta>(&meta_path) {
                Ok(Some(meta)) => meta,
                Ok(None) if timeline_path.is_file() => derived_meta(session_id, &timeline_path),
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %meta_path.display(), error = %e, "Skipping unreadable session metadata");
                    continue;
                }
            };

            sessions.push(SessionSummary {
                session_id: session_id.to_string(),
                title: meta.title,
                created_at: meta.created_at,
                updated_at: meta.updated_at,
                message_count,
            });
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Metadata and timeline of one session.
    pub fn session_detail(&self, key: &SessionKey) -> StoreResult<SessionDetail> {
        key.validate()?;
        let session_dir = self.layout.session_dir(key);
        if !session_dir.is_dir() {
            return Err(StoreError::SessionNotFound(key.to_string()));
        }

        let meta = match self.load_meta(key)? {
            Some(meta) => meta,
            None => derived_meta(&key.session_id, &self.layout.timeline_path(key)),
        };
        let timeline = self.load_timeline(key)?;
        Ok(SessionDetail { meta, timeline })
    }

    /// Delete a session directory and any legacy flat state files.
    ///
    /// Returns whether anything was removed.
    pub fn delete_session(&self, key: &SessionKey) -> StoreResult<bool> {
        key.validate()?;
        let mut removed = false;

        let session_dir = self.layout.session_dir(key);
        if session_dir.is_dir() {
            fs::remove_dir_all(&session_dir).map_err(|e| StoreError::io(&session_dir, e))?;
            removed = true;
        }
        for legacy in self.layout.legacy_state_paths(key) {
            if legacy.is_file() {
                fs::remove_file(&legacy).map_err(|e| StoreError::io(&legacy, e))?;
                removed = true;
            }
        }

        if removed {
            info!(session = %key, "Session deleted");
        }
        Ok(removed)
    }

    // =========================================================================
    // State snapshots
    // =========================================================================

    /// Overwrite `state.json` with snapshots of `handlers`.
    ///
    /// Which handlers to include is the caller's decision; see
    /// [`SnapshotPolicy::include_router`].
    pub fn save_state(&self, key: &SessionKey, handlers: &[&dyn Stateful]) -> StoreResult<()> {
        key.validate()?;

        let mut agents = Map::new();
        for handler in handlers {
            let state = snapshot::capture(*handler, self.policy.mode)?;
            agents.insert(handler.name().to_string(), state);
        }

        let file = StateFile {
            user_id: Some(key.user.canonical()),
            session_id: Some(key.session_id.clone()),
            agents,
        };
        write_json_atomic(&self.layout.state_path(key), &file)?;
        debug!(session = %key, handlers = handlers.len(), "State saved");
        Ok(())
    }

    /// Restore every handler that has an entry in the stored state.
    ///
    /// Returns `false` when no state file exists. A handler whose entry cannot
    /// be restored starts empty.
    pub fn load_state(&self, key: &SessionKey, handlers: &[&dyn Stateful]) -> StoreResult<bool> {
        key.validate()?;
        let Some(path) = self.layout.existing_state_path(key) else {
            return Ok(false);
        };
        let Some(file) = read_json::<StateFile>(&path)? else {
            return Ok(false);
        };

        for handler in handlers {
            let Some(state) = file.agents.get(handler.name()) else {
                continue;
            };
            if let Err(e) = snapshot::restore(*handler, state) {
                warn!(
                    session = %key,
                    handler = handler.name(),
                    error = %e,
                    "Discarding unreadable handler state"
                );
                handler.memory().clear();
            }
        }

        debug!(session = %key, path = %path.display(), "State restored");
        Ok(true)
    }

    // =========================================================================
    // Timeline
    // =========================================================================

    /// Parsed timeline events. A missing or corrupt file reads as empty.
    pub fn load_timeline(&self, key: &SessionKey) -> StoreResult<Vec<TimelineEvent>> {
        key.validate()?;
        let path = self.layout.timeline_path(key);
        let entries = match read_raw_timeline(&path)? {
            RawTimeline::Missing => return Ok(Vec::new()),
            RawTimeline::Corrupt => {
                warn!(path = %path.display(), "Timeline unreadable, treating as empty");
                return Ok(Vec::new());
            }
            RawTimeline::Entries { entries, .. } => entries,
        };

        Ok(entries
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<TimelineEvent>(raw) {
                Ok(event) => Some(event),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed timeline entry");
                    None
                }
            })
            .collect())
    }

    /// Append events, assigning `seq` and filling missing `ts`.
    ///
    /// Sequence numbers continue from the highest stored one. A corrupt file is
    /// rebuilt from scratch and numbering restarts at 1.
    pub fn append_events(
        &self,
        key: &SessionKey,
        events: Vec<TimelineEvent>,
    ) -> StoreResult<Vec<TimelineEvent>> {
        key.validate()?;
        let path = self.layout.timeline_path(key);

        let (mut timeline, version) = match read_raw_timeline(&path)? {
            RawTimeline::Missing => (Vec::new(), None),
            RawTimeline::Corrupt => {
                warn!(session = %key, path = %path.display(), "Timeline corrupt, rebuilding");
                (Vec::new(), None)
            }
            RawTimeline::Entries { entries, version } => (entries, version),
        };

        let mut next_seq = timeline
            .iter()
            .filter_map(|e| e.get("seq").and_then(Value::as_u64))
            .max()
            .map_or(1, |max| max + 1);

        let now = Utc::now().to_rfc3339();
        let mut appended = Vec::with_capacity(events.len());
        for mut event in events {
            if event.ts.is_none() {
                event.ts = Some(now.clone());
            }
            event.seq = Some(next_seq);
            next_seq += 1;
            let raw = serde_json::to_value(&event).map_err(|e| StoreError::serialization(&path, e))?;
            timeline.push(raw);
            appended.push(event);
        }

        let file = TimelineFile {
            user_id: key.user.canonical(),
            session_id: key.session_id.clone(),
            version: version.unwrap_or_else(|| TIMELINE_VERSION.to_string()),
            stats: TimelineStats {
                num_events: timeline.len(),
            },
            timeline,
        };
        write_json_atomic(&path, &file)?;
        debug!(session = %key, appended = appended.len(), total = file.stats.num_events, "Timeline appended");
        Ok(appended)
    }
}

enum RawTimeline {
    Missing,
    Corrupt,
    Entries {
        entries: Vec<Value>,
        version: Option<String>,
    },
}

/// Read a timeline in the current (`{timeline: [...]}`) or legacy (bare
/// array) form.
fn read_raw_timeline(path: &Path) -> StoreResult<RawTimeline> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RawTimeline::Missing),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let value: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(_) => return Ok(RawTimeline::Corrupt),
    };

    Ok(match value {
        Value::Array(entries) => RawTimeline::Entries {
            entries,
            version: None,
        },
        Value::Object(mut object) => match object.remove("timeline") {
            Some(Value::Array(entries)) => RawTimeline::Entries {
                entries,
                version: object
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            None => RawTimeline::Entries {
                entries: Vec::new(),
                version: None,
            },
            Some(_) => RawTimeline::Corrupt,
        },
        _ => RawTimeline::Corrupt,
    })
}

fn count_events(path: &Path) -> usize {
    match read_raw_timeline(path) {
        Ok(RawTimeline::Entries { entries, .. }) => entries.len(),
        _ => 0,
    }
}

/// Metadata for a session that predates `meta.json`.
fn derived_meta(session_id: &str, timeline_path: &Path) -> SessionMeta {
    let short: String = session_id.chars().take(8).collect();
    let file_time = |pick: fn(&fs::Metadata) -> std::io::Result<std::time::SystemTime>| {
        fs::metadata(timeline_path)
            .and_then(|m| pick(&m))
            .map(DateTime::<Utc>::from)
            .ok()
    };
    let updated_at = file_time(fs::Metadata::modified).unwrap_or_else(Utc::now);
    let created_at = file_time(fs::Metadata::created).unwrap_or(updated_at);

    SessionMeta {
        session_id: session_id.to_string(),
        title: if short.is_empty() {
            default_title(created_at)
        } else {
            format!("Session {}", short)
        },
        created_at,
        updated_at,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::serialization(path, e))
}
