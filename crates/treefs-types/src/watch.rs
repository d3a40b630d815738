//! Change events delivered to watch subscribers.

use serde::{Deserialize, Serialize};

use crate::path::FsPath;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// One logically changed path.
///
/// All contexts produced by the same commit share a `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchContext {
    pub kind: WatchEventKind,
    pub path: FsPath,
    /// Source of a rename; `None` otherwise.
    pub old_path: Option<FsPath>,
    pub session_id: String,
    /// Author of the originating commit.
    pub user: String,
    pub message: String,
}

impl WatchContext {
    pub fn path(&self) -> &FsPath {
        &self.path
    }

    pub fn old_path(&self) -> Option<&FsPath> {
        self.old_path.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}
