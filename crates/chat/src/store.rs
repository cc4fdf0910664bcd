use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::atomic::write_atomically;
use crate::error::{
    ParseSnapshotSnafu, ReadSnapshotSnafu, SaveSnapshotSnafu, SerializeSnapshotSnafu,
    StoreResult,
};
use crate::session::Session;

pub const SESSIONS_FILE_NAME: &str = "sessions.json";

/// Full session set as handed to an external store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub current_session_index: usize,
}

pub trait SessionStore: Send + Sync {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> StoreResult<Option<SessionSnapshot>>;
    fn save(&self, snapshot: &SessionSnapshot) -> StoreResult<()>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(crate::settings::SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
            .join(SESSIONS_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self) -> StoreResult<Option<SessionSnapshot>> {
        if !self.path.exists() {
            tracing::info!(path = ?self.path, "no session snapshot yet");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path).context(ReadSnapshotSnafu {
            stage: "read-session-snapshot",
            path: self.path.clone(),
        })?;
        let snapshot = serde_json::from_str::<SessionSnapshot>(&content).context(
            ParseSnapshotSnafu {
                stage: "parse-session-snapshot",
                path: self.path.clone(),
            },
        )?;

        tracing::info!(
            path = ?self.path,
            sessions = snapshot.sessions.len(),
            "loaded session snapshot"
        );
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &SessionSnapshot) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(snapshot).context(SerializeSnapshotSnafu {
            stage: "serialize-session-snapshot",
        })?;
        write_atomically(&self.path, &content).context(SaveSnapshotSnafu {
            stage: "save-session-snapshot",
        })?;

        tracing::info!(
            path = ?self.path,
            sessions = snapshot.sessions.len(),
            "saved session snapshot"
        );
        Ok(())
    }
}
