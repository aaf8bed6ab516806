//! On-disk layout of the session store.
//!
//! ```text
//! <root>/<user_dir>/
//! ├── <session_id>/
//! │   ├── meta.json
//! │   ├── state.json
//! │   └── timeline.json
//! ├── <session_id>.state.json   # legacy flat state
//! └── <session_id>.json         # older legacy flat state
//! ```
//!
//! `<user_dir>` is the first existing of `{id}_{name}`, `{id}`, `{name}`,
//! else `{id}_{name}`.

use std::path::{Path, PathBuf};

use crate::types::{SessionKey, UserKey};

pub const META_FILE: &str = "meta.json";
pub const STATE_FILE: &str = "state.json";
pub const TIMELINE_FILE: &str = "timeline.json";

/// Path resolution for one store root.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all sessions of `user`.
    pub fn user_dir(&self, user: &UserKey) -> PathBuf {
        user.dir_candidates()
            .iter()
            .map(|name| self.root.join(name))
            .find(|dir| dir.is_dir())
            .unwrap_or_else(|| self.root.join(user.canonical()))
    }

    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.user_dir(&key.user).join(&key.session_id)
    }

    pub fn meta_path(&self, key: &SessionKey) -> PathBuf {
        self.session_dir(key).join(META_FILE)
    }

    pub fn state_path(&self, key: &SessionKey) -> PathBuf {
        self.session_dir(key).join(STATE_FILE)
    }

    pub fn timeline_path(&self, key: &SessionKey) -> PathBuf {
        self.session_dir(key).join(TIMELINE_FILE)
    }

    /// Flat state files of older layouts, in lookup order.
    pub fn legacy_state_paths(&self, key: &SessionKey) -> [PathBuf; 2] {
        let user_dir = self.user_dir(&key.user);
        [
            user_dir.join(format!("{}.state.json", key.session_id)),
            user_dir.join(format!("{}.json", key.session_id)),
        ]
    }

    /// First state file that exists: the primary, then the legacy ones.
    pub fn existing_state_path(&self, key: &SessionKey) -> Option<PathBuf> {
        std::iter::once(self.state_path(key))
            .chain(self.legacy_state_paths(key))
            .find(|p| p.is_file())
    }
}
