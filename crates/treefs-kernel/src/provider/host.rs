//! Host filesystem passthrough.
//!
//! Keys map onto paths under `root` and every call delegates to `tokio::fs`.
//! There are no commits, segments or change events, and atomic moves are
//! only as atomic as the host's `rename`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use treefs_types::{
    BasicAttributes, ErrorKind, FileSystemKind, FsError, FsPath, FsResult, HOST_FS_ID, OptionKind, OptionSet,
};

use super::{EntryInfo, FilesystemProvider};

const SUPPORTED_OPTIONS: &[OptionKind] = &[
    OptionKind::CreateNew,
    OptionKind::TruncateExisting,
    OptionKind::Append,
    OptionKind::CreateParents,
    OptionKind::ReplaceExisting,
    OptionKind::AtomicMove,
    OptionKind::Recursive,
];

/// Host filesystem backend rooted at a directory.
#[derive(Debug)]
pub struct HostProvider {
    root: PathBuf,
    read_only: bool,
    open: AtomicBool,
}

impl HostProvider {
    /// Host filesystem rooted at `root` (usually `/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
            open: AtomicBool::new(true),
        }
    }

    /// Read-only host filesystem.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the host, refusing anything that escapes the root.
    fn resolve(&self, path: &FsPath) -> FsResult<PathBuf> {
        if !self.is_open() {
            return Err(FsError::new(ErrorKind::NotFound, "filesystem is closed").with_path(path));
        }
        if path.kind() != FileSystemKind::Host {
            return Err(FsError::invalid_argument("not a host path").with_path(path));
        }
        let relative = path.key().trim_start_matches('/');
        let full = self.root.join(relative);

        // Symlinks may still point outside, so compare canonical forms of
        // the nearest existing ancestor.
        let mut existing = full.as_path();
        let mut missing = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut canonical = existing.canonicalize().map_err(|e| host_error(e, path))?;
        for name in missing.iter().rev() {
            canonical.push(name);
        }
        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        if !canonical.starts_with(&canonical_root) {
            return Err(FsError::security_denied(format!(
                "path escapes root {}",
                canonical_root.display()
            ))
            .with_path(path));
        }
        Ok(canonical)
    }

    fn check_writable(&self, path: &FsPath) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::security_denied("filesystem is read-only").with_path(path));
        }
        Ok(())
    }

    async fn ensure_parent(full: &Path, create: bool, path: &FsPath) -> FsResult<()> {
        let Some(parent) = full.parent() else {
            return Ok(());
        };
        if create {
            fs::create_dir_all(parent).await.map_err(|e| host_error(e, path))?;
        } else if !parent.is_dir() {
            return Err(FsError::not_found(path.parent().unwrap_or_else(|| path.root())));
        }
        Ok(())
    }

    /// Refuse or clear an existing target according to replace-existing.
    async fn clear_target(full: &Path, replace: bool, path: &FsPath) -> FsResult<()> {
        let meta = match fs::symlink_metadata(full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(host_error(e, path)),
        };
        if !replace {
            return Err(FsError::already_exists(path));
        }
        let removed = if meta.is_dir() {
            fs::remove_dir(full).await
        } else {
            fs::remove_file(full).await
        };
        removed.map_err(|e| host_error(e, path))
    }
}

fn host_error(err: io::Error, path: &FsPath) -> FsError {
    FsError::from(err).with_path(path)
}

fn to_time(time: io::Result<SystemTime>) -> Option<DateTime<FixedOffset>> {
    time.ok().map(|t| DateTime::<Utc>::from(t).into())
}

#[cfg(unix)]
fn crosses_devices(err: &io::Error) -> bool {
    // EXDEV
    err.raw_os_error() == Some(18)
}

#[cfg(not(unix))]
fn crosses_devices(_err: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn file_key(meta: &std::fs::Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("(dev={:x},ino={})", meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_key(_meta: &std::fs::Metadata) -> Option<String> {
    None
}

#[async_trait]
impl FilesystemProvider for HostProvider {
    fn id(&self) -> &str {
        HOST_FS_ID
    }

    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Host
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn supported_options(&self) -> &'static [OptionKind] {
        SUPPORTED_OPTIONS
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!(root = %self.root.display(), "closed host filesystem");
        }
    }

    async fn stat(&self, path: &FsPath) -> FsResult<Option<EntryInfo>> {
        let full = self.resolve(path)?;
        let meta = match fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(host_error(e, path)),
        };
        let name = path.file_name().unwrap_or("");
        Ok(Some(if meta.is_dir() {
            EntryInfo::directory(name)
        } else {
            EntryInfo::file(name, meta.len())
        }))
    }

    async fn read(&self, path: &FsPath) -> FsResult<Arc<[u8]>> {
        let full = self.resolve(path)?;
        let data = fs::read(&full).await.map_err(|e| host_error(e, path))?;
        Ok(data.into())
    }

    async fn write(&self, path: &FsPath, data: Vec<u8>, options: &OptionSet) -> FsResult<()> {
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only(
            "write",
            &[
                OptionKind::CreateNew,
                OptionKind::TruncateExisting,
                OptionKind::Append,
                OptionKind::CreateParents,
            ],
        )?;
        self.check_writable(path)?;
        let full = self.resolve(path)?;
        Self::ensure_parent(&full, options.has(OptionKind::CreateParents), path).await?;

        let mut open = fs::OpenOptions::new();
        open.write(true);
        if options.has(OptionKind::CreateNew) {
            open.create_new(true);
        } else if options.has(OptionKind::Append) {
            open.create(true).append(true);
        } else {
            open.create(true).truncate(true);
        }
        let mut file = open.open(&full).await.map_err(|e| host_error(e, path))?;
        file.write_all(&data).await.map_err(|e| host_error(e, path))?;
        file.flush().await.map_err(|e| host_error(e, path))?;
        debug!(path = %full.display(), bytes = data.len(), "wrote host file");
        Ok(())
    }

    async fn list(&self, path: &FsPath) -> FsResult<Vec<EntryInfo>> {
        let full = self.resolve(path)?;
        let mut dir = fs::read_dir(&full).await.map_err(|e| host_error(e, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| host_error(e, path))? {
            let meta = entry.metadata().await.map_err(|e| host_error(e, path))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(if meta.is_dir() {
                EntryInfo::directory(name)
            } else {
                EntryInfo::file(name, meta.len())
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_directory(&self, path: &FsPath, options: &OptionSet) -> FsResult<()> {
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only("create directory", &[OptionKind::CreateParents])?;
        self.check_writable(path)?;
        let full = self.resolve(path)?;
        if full.exists() {
            return Err(FsError::already_exists(path));
        }
        let created = if options.has(OptionKind::CreateParents) {
            fs::create_dir_all(&full).await
        } else {
            fs::create_dir(&full).await
        };
        created.map_err(|e| host_error(e, path))
    }

    async fn delete(&self, path: &FsPath, options: &OptionSet) -> FsResult<()> {
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only("delete", &[OptionKind::Recursive])?;
        self.check_writable(path)?;
        if path.is_root() {
            return Err(FsError::invalid_argument("cannot delete the root directory").with_path(path));
        }
        let full = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full).await.map_err(|e| host_error(e, path))?;
        let removed = if !meta.is_dir() {
            fs::remove_file(&full).await
        } else if options.has(OptionKind::Recursive) {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_dir(&full).await
        };
        removed.map_err(|e| host_error(e, path))
    }

    async fn copy(&self, from: &FsPath, to: &FsPath, options: &OptionSet) -> FsResult<()> {
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only("copy", &[OptionKind::ReplaceExisting, OptionKind::CreateParents])?;
        self.check_writable(to)?;
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if source == target {
            return Ok(());
        }
        let meta = fs::metadata(&source).await.map_err(|e| host_error(e, from))?;
        Self::ensure_parent(&target, options.has(OptionKind::CreateParents), to).await?;
        Self::clear_target(&target, options.has(OptionKind::ReplaceExisting), to).await?;
        if meta.is_dir() {
            // Directories copy shallowly, like the host's own copy.
            fs::create_dir(&target).await.map_err(|e| host_error(e, to))
        } else {
            fs::copy(&source, &target).await.map(drop).map_err(|e| host_error(e, to))
        }
    }

    async fn rename(&self, from: &FsPath, to: &FsPath, options: &OptionSet) -> FsResult<()> {
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only(
            "move",
            &[OptionKind::ReplaceExisting, OptionKind::AtomicMove, OptionKind::CreateParents],
        )?;
        self.check_writable(from)?;
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if source == target {
            return Ok(());
        }
        fs::symlink_metadata(&source).await.map_err(|e| host_error(e, from))?;
        Self::ensure_parent(&target, options.has(OptionKind::CreateParents), to).await?;
        Self::clear_target(&target, options.has(OptionKind::ReplaceExisting), to).await?;

        match fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(e) if crosses_devices(&e) => {
                if options.has(OptionKind::AtomicMove) {
                    return Err(FsError::atomic_move_not_supported("source and target are on different devices")
                        .with_path(from));
                }
                if fs::metadata(&source).await.map_err(|e| host_error(e, from))?.is_dir() {
                    return Err(FsError::unsupported("cannot move a directory across devices").with_path(from));
                }
                fs::copy(&source, &target).await.map_err(|e| host_error(e, to))?;
                fs::remove_file(&source).await.map_err(|e| host_error(e, from))
            }
            Err(e) => Err(host_error(e, from)),
        }
    }

    async fn basic_attributes(&self, path: &FsPath) -> FsResult<BasicAttributes> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).await.map_err(|e| host_error(e, path))?;
        let is_symbolic_link = fs::symlink_metadata(&full)
            .await
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        let epoch: DateTime<FixedOffset> = DateTime::<Utc>::from(SystemTime::UNIX_EPOCH).into();
        let last_modified = to_time(meta.modified()).unwrap_or(epoch);
        Ok(BasicAttributes {
            size: meta.len(),
            last_modified,
            last_access: to_time(meta.accessed()).unwrap_or(last_modified),
            created: to_time(meta.created()).unwrap_or(last_modified),
            is_directory: meta.is_dir(),
            is_regular_file: meta.is_file(),
            is_symbolic_link,
            is_other: !meta.is_dir() && !meta.is_file(),
            file_key: file_key(&meta),
        })
    }

    async fn set_last_modified_time(&self, path: &FsPath, time: DateTime<FixedOffset>) -> FsResult<()> {
        self.check_writable(path)?;
        let full = self.resolve(path)?;
        let file = fs::File::open(&full).await.map_err(|e| host_error(e, path))?.into_std().await;
        let time = SystemTime::from(time);
        tokio::task::spawn_blocking(move || file.set_modified(time))
            .await
            .map_err(|e| FsError::io("set modified time task failed").with_source(e))?
            .map_err(|e| host_error(e, path))?;
        debug!(path = %path, "set modification time");
        Ok(())
    }

    fn real_path(&self, path: &FsPath) -> Option<PathBuf> {
        self.resolve(path).ok()
    }
}
