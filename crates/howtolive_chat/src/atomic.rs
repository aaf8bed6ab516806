//! Crash-safe file replacement.
//!
//! Every write goes to a temporary file in the target's directory, is flushed
//! and fsynced, then renamed over the target. Readers see either the old file
//! or the new one, never a partial write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{StoreError, StoreResult};

/// A fully written temp file waiting to replace its target.
pub struct StagedWrite {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically rename the temp file over the target.
    pub fn commit(self) -> StoreResult<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| StoreError::io(&target, e.error))?;
        sync_parent(&target);
        Ok(())
    }

    /// Leave the temp file on disk without touching the target, as an
    /// interrupted write would. Returns the leftover path.
    pub fn abandon(self) -> StoreResult<PathBuf> {
        let path = self.temp.path().to_path_buf();
        self.temp
            .into_temp_path()
            .keep()
            .map_err(|e| StoreError::io(&path, e.error))
    }
}

/// Write `bytes` to a temp file next to `target` and fsync it.
pub fn stage(target: &Path, bytes: &[u8]) -> StoreResult<StagedWrite> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;

    if let Err(e) = write_and_sync(&mut temp, bytes) {
        return Err(StoreError::io(temp.path(), e));
    }

    Ok(StagedWrite {
        temp,
        target: target.to_path_buf(),
    })
}

fn write_and_sync(temp: &mut NamedTempFile, bytes: &[u8]) -> std::io::Result<()> {
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()
}

/// Atomically replace `target` with `bytes`.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> StoreResult<()> {
    stage(target, bytes)?.commit()
}

/// Atomically replace `target` with pretty-printed JSON.
pub fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> StoreResult<()> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::serialization(target, e))?;
    write_atomic(target, &content)
}

#[cfg(unix)]
fn sync_parent(target: &Path) {
    // Best effort: persist the rename itself.
    if let Some(dir) = target.parent() {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[test]
    fn test_write_json_atomic_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &json!({"agents": {}})).unwrap();
        write_json_atomic(&path, &json!({"agents": {"howtocook": {}}})).unwrap();

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value["agents"]["howtocook"].is_object());

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_interrupted_write_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"version": 1})).unwrap();

        let staged = stage(&path, b"{\"version\": 2, \"trunc").unwrap();
        assert_eq!(staged.temp_path().parent(), path.parent());
        let leftover = staged.abandon().unwrap();
        assert!(leftover.exists());

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value, json!({"version": 1}));
    }
}
