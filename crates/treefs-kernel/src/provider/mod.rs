//! Filesystem providers.
//!
//! A provider realizes the file API for one mounted filesystem. The facade
//! resolves a path's filesystem id through the registry and dispatches to
//! the provider registered under it.
//!
//! - **ObjectStoreProvider**: versioned trees in an object store, one commit per mutation
//! - **HostProvider**: direct delegation to the host filesystem

mod host;
mod object_store;

pub use host::HostProvider;
pub use object_store::{BatchOp, ObjectStoreProvider};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use treefs_types::{
    AttrValue, BasicAttributes, FileSystemKind, FsError, FsPath, FsResult, OptionKind, OptionSet,
    VersionAttributes, VersionRecord,
};

use crate::watch::WatchHub;

/// Kind of directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Entry metadata returned by `stat` and `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Name of the entry (not full path); empty for the root.
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl EntryInfo {
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
        }
    }

    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Backend interface for one mounted filesystem.
///
/// Paths passed in always belong to this filesystem; the facade checks the
/// filesystem id before dispatch. Absence is reported by `stat` as `None`;
/// operations that need an entry fail with `NotFound`.
#[async_trait]
pub trait FilesystemProvider: Send + Sync + fmt::Debug {
    /// Filesystem id (cluster id).
    fn id(&self) -> &str;

    fn kind(&self) -> FileSystemKind;

    fn read_only(&self) -> bool;

    /// Option kinds this backend implements. Anything else is `UnsupportedOperation`.
    fn supported_options(&self) -> &'static [OptionKind];

    fn is_open(&self) -> bool;

    /// Mark closed and release watch subscriptions.
    async fn close(&self);

    /// Segment ids; empty for backends without segments.
    fn segments(&self) -> FsResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// Create a segment forked from `from`, or empty.
    async fn create_segment(&self, name: &str, from: Option<&str>) -> FsResult<()> {
        let _ = (name, from);
        Err(FsError::unsupported("this filesystem has no segments"))
    }

    /// Entry at `path`, or `None` if absent.
    async fn stat(&self, path: &FsPath) -> FsResult<Option<EntryInfo>>;

    /// Full contents of the file at `path`.
    async fn read(&self, path: &FsPath) -> FsResult<Arc<[u8]>>;

    /// Create or replace the file at `path` with `data`.
    async fn write(&self, path: &FsPath, data: Vec<u8>, options: &OptionSet) -> FsResult<()>;

    /// Entries of the directory at `path`, in backend order.
    async fn list(&self, path: &FsPath) -> FsResult<Vec<EntryInfo>>;

    async fn create_directory(&self, path: &FsPath, options: &OptionSet) -> FsResult<()>;

    async fn delete(&self, path: &FsPath, options: &OptionSet) -> FsResult<()>;

    /// Copy within this filesystem.
    ///
    /// Directory depth is backend specific. Object stores share the whole
    /// subtree in one commit. The host creates only the directory. Copies
    /// between filesystems always create only the directory.
    async fn copy(&self, from: &FsPath, to: &FsPath, options: &OptionSet) -> FsResult<()>;

    /// Move within this filesystem.
    async fn rename(&self, from: &FsPath, to: &FsPath, options: &OptionSet) -> FsResult<()>;

    async fn basic_attributes(&self, path: &FsPath) -> FsResult<BasicAttributes>;

    async fn version_attributes(&self, path: &FsPath) -> FsResult<VersionAttributes> {
        let _ = path;
        Err(FsError::unsupported("this filesystem has no version history"))
    }

    /// Set a named attribute. Most backends have no mutable attributes.
    async fn set_attribute(&self, path: &FsPath, name: &str, value: &AttrValue) -> FsResult<()> {
        let _ = (path, value);
        Err(FsError::unsupported(format!("attribute '{name}' cannot be set on this filesystem")))
    }

    /// Set the modification time. Versioned backends derive times from
    /// history and refuse.
    async fn set_last_modified_time(&self, path: &FsPath, time: DateTime<FixedOffset>) -> FsResult<()> {
        let _ = time;
        Err(FsError::unsupported("modification times are derived from history").with_path(path))
    }

    /// Apply several operations to one segment as a single commit.
    async fn commit_batch(&self, segment: &str, ops: Vec<BatchOp>, options: &OptionSet) -> FsResult<String> {
        let _ = (segment, ops, options);
        Err(FsError::unsupported("this filesystem does not support batches"))
    }

    /// Commits of a segment, newest first.
    fn commit_log(&self, segment: &str) -> FsResult<Vec<VersionRecord>> {
        let _ = segment;
        Err(FsError::unsupported("this filesystem has no version history"))
    }

    /// Watch hub for change events, if this backend emits any.
    fn watch_hub(&self) -> Option<&WatchHub> {
        None
    }

    /// Real host path, for backends backed by the host filesystem.
    fn real_path(&self, path: &FsPath) -> Option<PathBuf> {
        let _ = path;
        None
    }
}

/// Shared pointer to a provider.
pub type ProviderRef = Arc<dyn FilesystemProvider>;
