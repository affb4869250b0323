use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    /// Oldest message id emitted so far, keyed by resolved chat id.
    #[serde(default)]
    pub before_ids: BTreeMap<String, i64>,
    pub updated_at: Option<i64>,
}

/// Remembers where `history --resume` should continue for each chat.
#[derive(Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<CursorState, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CursorState::default()),
            Err(err) => return Err(StateError::Io(err)),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, state: &CursorState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let payload = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, payload)?;
        set_file_permissions(&self.path, 0o600)?;
        Ok(())
    }

    pub fn before_id(&self, chat: i64) -> Result<Option<i64>, StateError> {
        Ok(self.load()?.before_ids.get(&chat.to_string()).copied())
    }

    /// Only ever moves a chat's cursor towards older messages.
    pub fn advance(&self, chat: i64, before_id: i64) -> Result<(), StateError> {
        let mut state = self.load()?;
        let entry = state.before_ids.entry(chat.to_string()).or_insert(before_id);
        if before_id < *entry {
            *entry = before_id;
        }
        state.updated_at = Some(chrono::Utc::now().timestamp());
        self.save(&state)
    }
}

/// Creates `path` with owner-only permissions. Directories that already
/// exist are left as they are.
fn ensure_dir(path: &Path) -> Result<(), io::Error> {
    if path.as_os_str().is_empty() || path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    set_dir_permissions(path, 0o700)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}
