//! The file API facade.
//!
//! [`IoService`] is the one entry point callers use. Every operation parses
//! its options, runs the access policy, resolves the owning filesystem
//! through the registry and dispatches to that filesystem's provider.
//! Operations spanning two filesystems (copy, move) stream content through
//! here instead of relying on backend sharing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use treefs_types::{
    AttrMap, AttrValue, ErrorKind, FileAttribute, FileSystemKind, FsError, FsOption, FsPath, FsResult,
    OptionKind, OptionSet, VersionRecord, WatchContext,
};

use crate::attrs::AttributeView;
use crate::batch::Batch;
use crate::config::{FileSystemConfig, ServiceConfig, StorageConfig};
use crate::identity::{IdentityKey, IdentityObject};
use crate::provider::{HostProvider, ObjectStoreProvider, ProviderRef};
use crate::registry::{FileSystem, FileSystemRegistry};
use crate::security::{AccessAction, AccessPolicy, AllowAll};
use crate::store::{DiskStore, MemoryStore, ObjectStore};
use crate::stream::{ByteChannel, DirectoryStream, InputStream, OutputStream, PathFilter};
use crate::watch::{Subscription, WatchHandler};

/// Attempts at picking an unused temporary name.
const TEMP_NAME_ATTEMPTS: u32 = 16;

const WRITE_OPTIONS: &[OptionKind] = &[
    OptionKind::CreateNew,
    OptionKind::TruncateExisting,
    OptionKind::Append,
    OptionKind::CreateParents,
    OptionKind::Commit,
];

/// Public file API over every mounted filesystem.
#[derive(Debug)]
pub struct IoService {
    config: ServiceConfig,
    registry: FileSystemRegistry,
    policy: Arc<dyn AccessPolicy>,
    temp_counter: AtomicU64,
}

impl IoService {
    /// Create a service; mounts the host filesystem if configured.
    pub fn new(config: ServiceConfig) -> FsResult<Self> {
        let service = Self {
            config,
            registry: FileSystemRegistry::new(),
            policy: Arc::new(AllowAll),
            temp_counter: AtomicU64::new(0),
        };
        if service.config.mount_host {
            service.registry.register(Arc::new(HostProvider::new("/")))?;
        }
        Ok(service)
    }

    /// Replace the access policy.
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &FileSystemRegistry {
        &self.registry
    }

    // --- Filesystems ---

    /// Mount an already constructed provider.
    pub fn mount(&self, provider: ProviderRef) -> FsResult<FileSystem> {
        self.registry.register(provider)
    }

    pub fn file_systems(&self) -> Vec<FileSystem> {
        self.registry.list()
    }

    pub fn file_systems_of_kind(&self, kind: FileSystemKind) -> Vec<FileSystem> {
        self.registry.of_kind(kind)
    }

    /// Filesystem named by a URI such as `git://repo`.
    pub fn file_system(&self, uri: &str) -> FsResult<FileSystem> {
        let path = self.get_uri(uri)?;
        self.registry.get(path.fs_id())
    }

    /// Create and mount an object-store filesystem for `uri` (`git://fs-id`).
    pub fn new_file_system(&self, uri: &str, fs_config: FileSystemConfig) -> FsResult<FileSystem> {
        let path = self.get_uri(uri)?;
        if path.kind() != FileSystemKind::ObjectStore {
            return Err(FsError::unsupported("only object-store filesystems can be created").with_path(&path));
        }
        let id = path.fs_id().to_string();
        if self.registry.contains(&id) {
            return Err(FsError::new(
                ErrorKind::AlreadyExists,
                format!("filesystem '{id}' is already mounted"),
            ));
        }

        let store: Arc<dyn ObjectStore> = match &fs_config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Disk { .. } => {
                let root = fs_config
                    .disk_root(&id)
                    .ok_or_else(|| FsError::invalid_argument("disk storage without a root"))?;
                Arc::new(DiskStore::open(root)?)
            }
        };
        let provider = ObjectStoreProvider::open(id, store, &self.config, &fs_config)?;
        self.registry.register(Arc::new(provider))
    }

    /// Unmount and close a filesystem. Its paths fail with `NotFound` afterwards.
    pub async fn close_file_system(&self, id: &str) -> FsResult<()> {
        let fs = self.registry.remove(id)?;
        fs.provider().close().await;
        info!(fs = id, "unmounted filesystem");
        Ok(())
    }

    /// Fork a new segment from `from`, or start it empty.
    pub async fn create_segment(&self, fs_id: &str, name: &str, from: Option<&str>) -> FsResult<FsPath> {
        let fs = self.registry.get(fs_id)?;
        let root = fs.root(name)?;
        self.policy.check(AccessAction::Write, &root)?;
        fs.provider().create_segment(name, from).await?;
        Ok(root)
    }

    // --- Paths ---

    /// Join `first` and `more` with `/` and parse the result.
    pub fn get(&self, first: &str, more: &[&str]) -> FsResult<FsPath> {
        let mut joined = first.to_string();
        for part in more.iter().filter(|p| !p.is_empty()) {
            if !joined.ends_with('/') {
                joined.push('/');
            }
            joined.push_str(part.trim_start_matches('/'));
        }
        self.get_uri(&joined)
    }

    /// Parse a URI, filling in the configured default segment.
    pub fn get_uri(&self, uri: &str) -> FsResult<FsPath> {
        FsPath::parse_with_default_segment(uri, &self.config.default_segment)
    }

    /// Policy check plus provider lookup.
    fn dispatch(&self, action: AccessAction, path: &FsPath) -> FsResult<ProviderRef> {
        self.policy.check(action, path)?;
        let provider = self.registry.resolve(path)?;
        if action.is_mutation() && provider.read_only() {
            return Err(FsError::security_denied("filesystem is read-only").with_path(path));
        }
        debug!(%action, path = %path, "dispatch");
        Ok(provider)
    }

    // --- Streams ---

    /// Open a snapshot of the file's content for reading.
    pub async fn new_input_stream(&self, path: &FsPath, options: &[FsOption]) -> FsResult<InputStream> {
        let provider = self.dispatch(AccessAction::Read, path)?;
        let options = OptionSet::parse(options)?;
        options.ensure_supported(provider.supported_options())?;
        options.ensure_only("read", &[])?;
        let data = provider.read(path).await?;
        Ok(InputStream::new(path.clone(), data))
    }

    /// Open a buffered writer; the write commits when the stream is finished.
    pub async fn new_output_stream(&self, path: &FsPath, options: &[FsOption]) -> FsResult<OutputStream> {
        let provider = self.dispatch(AccessAction::Write, path)?;
        let options = OptionSet::parse(options)?;
        options.ensure_supported(provider.supported_options())?;
        options.ensure_only("write", WRITE_OPTIONS)?;
        if options.has(OptionKind::CreateNew) && provider.stat(path).await?.is_some() {
            return Err(FsError::already_exists(path));
        }
        Ok(OutputStream::new(provider, path.clone(), options))
    }

    /// Open a seekable read/write view of the file. Changes commit once, when
    /// the channel is finished.
    ///
    /// A missing file needs `CreateNew`. `TruncateExisting` starts from empty
    /// content and `Append` starts positioned at the end.
    pub async fn new_byte_channel(&self, path: &FsPath, options: &[FsOption]) -> FsResult<ByteChannel> {
        let provider = self.dispatch(AccessAction::Write, path)?;
        let options = OptionSet::parse(options)?;
        options.ensure_supported(provider.supported_options())?;
        options.ensure_only("byte channel", WRITE_OPTIONS)?;

        let create = options.has(OptionKind::CreateNew);
        let exists = provider.stat(path).await?.is_some();
        if create && exists {
            return Err(FsError::already_exists(path));
        }
        if !create && !exists {
            return Err(FsError::not_found(path));
        }

        let content = if exists {
            provider.read(path).await?.to_vec()
        } else {
            Vec::new()
        };
        let truncated = options.has(OptionKind::TruncateExisting) && !content.is_empty();
        let content = if truncated { Vec::new() } else { content };

        let mut write = Vec::new();
        if create {
            write.push(FsOption::CreateNew);
        }
        if options.has(OptionKind::CreateParents) {
            write.push(FsOption::CreateParents);
        }
        if options.has(OptionKind::Commit) {
            write.push(FsOption::Commit(options.commit().clone()));
        }
        let write = OptionSet::parse(&write)?;

        let channel = ByteChannel::new(provider, path.clone(), write, content, options.has(OptionKind::Append));
        Ok(if create || truncated { channel.creating() } else { channel })
    }

    /// Entries of `dir`, optionally filtered.
    pub async fn new_directory_stream(&self, dir: &FsPath, filter: Option<PathFilter>) -> FsResult<DirectoryStream> {
        let provider = self.dispatch(AccessAction::List, dir)?;
        match provider.stat(dir).await? {
            None => Err(FsError::not_found(dir)),
            Some(info) if !info.is_dir() => Err(FsError::invalid_argument("not a directory").with_path(dir)),
            Some(_) => Ok(DirectoryStream::new(provider, dir.clone(), filter)),
        }
    }

    // --- Create / delete ---

    /// Create an empty file; fails with `AlreadyExists` if anything is there.
    pub async fn create_file(&self, path: &FsPath, options: &[FsOption]) -> FsResult<FsPath> {
        let mut options = options.to_vec();
        options.push(FsOption::CreateNew);
        self.write(path, Vec::new(), &options).await
    }

    pub async fn create_directory(&self, path: &FsPath, options: &[FsOption]) -> FsResult<FsPath> {
        let provider = self.dispatch(AccessAction::Write, path)?;
        let options = OptionSet::parse(options)?;
        provider.create_directory(path, &options).await?;
        Ok(path.clone())
    }

    /// Create a directory and any missing parents. Existing directories are fine.
    pub async fn create_directories(&self, path: &FsPath, options: &[FsOption]) -> FsResult<FsPath> {
        let provider = self.dispatch(AccessAction::Write, path)?;
        match provider.stat(path).await? {
            Some(info) if info.is_dir() => return Ok(path.clone()),
            Some(_) => return Err(FsError::already_exists(path)),
            None => {}
        }
        let mut options = options.to_vec();
        options.push(FsOption::CreateParents);
        let options = OptionSet::parse(&options)?;
        match provider.create_directory(path, &options).await {
            // Lost a race with another creator of the same directory.
            Err(e) if e.is(ErrorKind::AlreadyExists) => match provider.stat(path).await? {
                Some(info) if info.is_dir() => Ok(path.clone()),
                _ => Err(e),
            },
            other => other.map(|()| path.clone()),
        }
    }

    pub async fn delete(&self, path: &FsPath, options: &[FsOption]) -> FsResult<()> {
        let provider = self.dispatch(AccessAction::Delete, path)?;
        let options = OptionSet::parse(options)?;
        provider.delete(path, &options).await
    }

    /// Delete if present. Returns whether something was deleted.
    pub async fn delete_if_exists(&self, path: &FsPath, options: &[FsOption]) -> FsResult<bool> {
        let provider = self.dispatch(AccessAction::Delete, path)?;
        let options = OptionSet::parse(options)?;
        if provider.stat(path).await?.is_none() {
            return Ok(false);
        }
        match provider.delete(path, &options).await {
            Ok(()) => Ok(true),
            Err(e) if e.is(ErrorKind::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn temp_name(&self, prefix: &str, suffix: &str) -> String {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::from(Utc::now().timestamp_subsec_nanos());
        format!("{prefix}{:x}{suffix}", nanos.wrapping_mul(31).wrapping_add(n))
    }

    /// Create a new empty file with a unique name in `dir`.
    pub async fn create_temp_file(
        &self,
        dir: &FsPath,
        prefix: &str,
        suffix: &str,
        options: &[FsOption],
    ) -> FsResult<FsPath> {
        for _ in 0..TEMP_NAME_ATTEMPTS {
            let path = dir.join(&self.temp_name(prefix, suffix))?;
            match self.create_file(&path, options).await {
                Err(e) if e.is(ErrorKind::AlreadyExists) => continue,
                other => return other,
            }
        }
        Err(FsError::new(ErrorKind::AlreadyExists, "no unused temporary file name").with_path(dir))
    }

    /// Create a new empty directory with a unique name in `dir`.
    pub async fn create_temp_directory(&self, dir: &FsPath, prefix: &str, options: &[FsOption]) -> FsResult<FsPath> {
        for _ in 0..TEMP_NAME_ATTEMPTS {
            let path = dir.join(&self.temp_name(prefix, ""))?;
            match self.create_directory(&path, options).await {
                Err(e) if e.is(ErrorKind::AlreadyExists) => continue,
                other => return other,
            }
        }
        Err(FsError::new(ErrorKind::AlreadyExists, "no unused temporary directory name").with_path(dir))
    }

    /// Directory for temp entries created without one: the configured
    /// `temp_dir`, else the host temp directory.
    async fn default_temp_dir(&self) -> FsResult<FsPath> {
        let Some(uri) = self.config.temp_dir.as_deref() else {
            let host = std::env::temp_dir();
            let key = host
                .to_str()
                .ok_or_else(|| FsError::invalid_argument("host temp directory is not UTF-8"))?;
            return FsPath::host(key);
        };
        let dir = self.get_uri(uri)?;
        self.create_directories(&dir, &[]).await
    }

    /// [`create_temp_file`](Self::create_temp_file) in the default temp directory.
    pub async fn create_default_temp_file(&self, prefix: &str, suffix: &str, options: &[FsOption]) -> FsResult<FsPath> {
        let dir = self.default_temp_dir().await?;
        self.create_temp_file(&dir, prefix, suffix, options).await
    }

    pub async fn create_default_temp_directory(&self, prefix: &str, options: &[FsOption]) -> FsResult<FsPath> {
        let dir = self.default_temp_dir().await?;
        self.create_temp_directory(&dir, prefix, options).await
    }

    // --- Copy / move ---

    /// Copy `from` to `to`. A directory copied within one object store keeps
    /// its whole subtree; any other directory copy creates it empty.
    pub async fn copy(&self, from: &FsPath, to: &FsPath, options: &[FsOption]) -> FsResult<FsPath> {
        let source = self.dispatch(AccessAction::Read, from)?;
        let target = self.dispatch(AccessAction::Write, to)?;
        let options = OptionSet::parse(options)?;
        if Arc::ptr_eq(&source, &target) {
            target.copy(from, to, &options).await?;
        } else {
            options.ensure_only(
                "copy",
                &[OptionKind::ReplaceExisting, OptionKind::CreateParents, OptionKind::Commit],
            )?;
            copy_between(&source, &target, from, to, &options).await?;
        }
        Ok(to.clone())
    }

    /// Move `from` to `to`. Within one filesystem this is a single commit.
    pub async fn move_path(&self, from: &FsPath, to: &FsPath, options: &[FsOption]) -> FsResult<FsPath> {
        self.policy.check(AccessAction::Delete, from)?;
        let source = self.dispatch(AccessAction::Write, from)?;
        let target = self.dispatch(AccessAction::Write, to)?;
        let options = OptionSet::parse(options)?;
        if Arc::ptr_eq(&source, &target) {
            target.rename(from, to, &options).await?;
            return Ok(to.clone());
        }

        if options.has(OptionKind::AtomicMove) {
            return Err(FsError::atomic_move_not_supported("cannot move atomically between filesystems")
                .with_path(from));
        }
        options.ensure_only(
            "move",
            &[OptionKind::ReplaceExisting, OptionKind::CreateParents, OptionKind::Commit],
        )?;
        match source.stat(from).await? {
            None => return Err(FsError::not_found(from)),
            Some(info) if info.is_dir() && !source.list(from).await?.is_empty() => {
                return Err(FsError::directory_not_empty(from));
            }
            Some(_) => {}
        }
        debug!(from = %from, to = %to, "moving between filesystems as copy then delete");
        copy_between(&source, &target, from, to, &options).await?;
        let delete = commit_only(&source, &options)?;
        source.delete(from, &delete).await?;
        Ok(to.clone())
    }

    /// Drain `reader` into `target`. Returns the number of bytes written.
    pub async fn copy_from_reader<R>(&self, reader: &mut R, target: &FsPath, options: &[FsOption]) -> FsResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let provider = self.dispatch(AccessAction::Write, target)?;
        let set = OptionSet::parse(options)?;
        set.ensure_only(
            "copy",
            &[OptionKind::ReplaceExisting, OptionKind::CreateParents, OptionKind::Commit],
        )?;
        if !set.has(OptionKind::ReplaceExisting) && provider.stat(target).await?.is_some() {
            return Err(FsError::already_exists(target));
        }
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        provider.write(target, data, &write_options(&provider, &set)?).await?;
        Ok(len)
    }

    /// Stream the file at `source` into `writer`. Returns the number of bytes copied.
    pub async fn copy_to_writer<W>(&self, source: &FsPath, writer: &mut W) -> FsResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let data = self.read_all_bytes(source).await?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(data.len() as u64)
    }

    // --- Whole-file I/O ---

    pub async fn read_all_bytes(&self, path: &FsPath) -> FsResult<Arc<[u8]>> {
        let provider = self.dispatch(AccessAction::Read, path)?;
        provider.read(path).await
    }

    /// Content as UTF-8; invalid UTF-8 is `InvalidArgument`.
    pub async fn read_all_string(&self, path: &FsPath) -> FsResult<String> {
        let data = self.read_all_bytes(path).await?;
        std::str::from_utf8(&data)
            .map(str::to_owned)
            .map_err(|e| FsError::invalid_argument("content is not valid UTF-8").with_path(path).with_source(e))
    }

    pub async fn read_all_lines(&self, path: &FsPath) -> FsResult<Vec<String>> {
        Ok(self.read_all_string(path).await?.lines().map(str::to_owned).collect())
    }

    /// Create or replace the file at `path` in one commit.
    pub async fn write(&self, path: &FsPath, data: impl Into<Vec<u8>>, options: &[FsOption]) -> FsResult<FsPath> {
        let provider = self.dispatch(AccessAction::Write, path)?;
        let options = OptionSet::parse(options)?;
        provider.write(path, data.into(), &options).await?;
        Ok(path.clone())
    }

    pub async fn write_string(&self, path: &FsPath, text: &str, options: &[FsOption]) -> FsResult<FsPath> {
        self.write(path, text.as_bytes(), options).await
    }

    /// Write each line followed by `\n`.
    pub async fn write_lines<I, S>(&self, path: &FsPath, lines: I, options: &[FsOption]) -> FsResult<FsPath>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut text = String::new();
        for line in lines {
            text.push_str(line.as_ref());
            text.push('\n');
        }
        self.write(path, text.into_bytes(), options).await
    }

    // --- Attributes ---

    /// All basic attributes.
    pub async fn read_attributes(&self, path: &FsPath) -> FsResult<AttrMap> {
        self.read_attributes_named(path, "basic:*").await
    }

    /// Attributes named by a selector such as `size,isDirectory` or `version:*`.
    pub async fn read_attributes_named(&self, path: &FsPath, selector: &str) -> FsResult<AttrMap> {
        self.attribute_view(path)?.read(selector).await
    }

    pub async fn get_attribute(&self, path: &FsPath, name: &str) -> FsResult<AttrValue> {
        self.attribute_view(path)?.get(name).await
    }

    /// Set one attribute. Object stores accept only `commit:*` names, queued
    /// into the next commit on the path's segment.
    pub async fn set_attribute(&self, path: &FsPath, name: &str, value: impl Into<AttrValue>) -> FsResult<()> {
        let provider = self.dispatch(AccessAction::SetAttributes, path)?;
        provider.set_attribute(path, name, &value.into()).await
    }

    pub async fn set_attributes(&self, path: &FsPath, attributes: &[FileAttribute]) -> FsResult<()> {
        let provider = self.dispatch(AccessAction::SetAttributes, path)?;
        for attribute in attributes {
            provider.set_attribute(path, &attribute.name, &attribute.value).await?;
        }
        Ok(())
    }

    /// Lazily evaluated attribute view bound to `path`.
    pub fn attribute_view(&self, path: &FsPath) -> FsResult<AttributeView> {
        let provider = self.dispatch(AccessAction::ReadAttributes, path)?;
        Ok(AttributeView::new(provider, path.clone()))
    }

    pub async fn last_modified_time(&self, path: &FsPath) -> FsResult<DateTime<FixedOffset>> {
        Ok(self.attribute_view(path)?.basic().await?.last_modified)
    }

    /// Object stores derive times from history and refuse with
    /// `UnsupportedOperation`.
    pub async fn set_last_modified_time(&self, path: &FsPath, time: DateTime<FixedOffset>) -> FsResult<()> {
        let provider = self.dispatch(AccessAction::SetAttributes, path)?;
        provider.set_last_modified_time(path, time).await
    }

    pub async fn size(&self, path: &FsPath) -> FsResult<u64> {
        Ok(self.attribute_view(path)?.basic().await?.size)
    }

    /// Commits that touched `path`, newest first.
    pub async fn history(&self, path: &FsPath) -> FsResult<Vec<VersionRecord>> {
        Ok(self.attribute_view(path)?.version().await?.history.clone())
    }

    /// Every commit of a segment, newest first.
    pub fn commit_log(&self, fs_id: &str, segment: &str) -> FsResult<Vec<VersionRecord>> {
        let fs = self.registry.get(fs_id)?;
        let root = fs.root(segment)?;
        let provider = self.dispatch(AccessAction::Read, &root)?;
        provider.commit_log(segment)
    }

    // --- Existence and identity ---

    /// True if an entry is present. Errors read as absent.
    pub async fn exists(&self, path: &FsPath) -> bool {
        match self.stat_checked(path).await {
            Ok(found) => found,
            Err(e) => {
                debug!(path = %path, error = %e, "exists check failed");
                false
            }
        }
    }

    /// True only if the entry is confirmed absent.
    pub async fn not_exists(&self, path: &FsPath) -> bool {
        match self.stat_checked(path).await {
            Ok(found) => !found,
            Err(e) => e.is(ErrorKind::NotFound),
        }
    }

    async fn stat_checked(&self, path: &FsPath) -> FsResult<bool> {
        let provider = self.dispatch(AccessAction::ReadAttributes, path)?;
        Ok(provider.stat(path).await?.is_some())
    }

    /// Whether two paths locate the same entry.
    pub async fn is_same_file(&self, a: &FsPath, b: &FsPath) -> FsResult<bool> {
        if a == b {
            return Ok(true);
        }
        if a.fs_id() != b.fs_id() {
            return Ok(false);
        }
        let provider = self.dispatch(AccessAction::ReadAttributes, a)?;
        for path in [a, b] {
            if provider.stat(path).await?.is_none() {
                return Err(FsError::not_found(path));
            }
        }
        match (provider.real_path(a), provider.real_path(b)) {
            (Some(ra), Some(rb)) => {
                let ra = tokio::fs::canonicalize(ra).await?;
                let rb = tokio::fs::canonicalize(rb).await?;
                Ok(ra == rb)
            }
            _ => Ok(false),
        }
    }

    /// Identity object for the indexer. Never touches a backend.
    pub fn to_identity(&self, path: &FsPath, attributes: Vec<FileAttribute>) -> IdentityObject {
        IdentityObject::new(path, attributes)
    }

    pub fn to_identity_key(&self, path: &FsPath) -> IdentityKey {
        IdentityKey::for_path(path)
    }

    // --- Watch ---

    /// Subscribe to changes at or below `scope`.
    pub fn watch(&self, scope: &FsPath, handler: Arc<dyn WatchHandler>) -> FsResult<Subscription> {
        let provider = self.dispatch(AccessAction::Watch, scope)?;
        let hub = provider
            .watch_hub()
            .ok_or_else(|| FsError::unsupported("this filesystem does not emit change events").with_path(scope))?;
        hub.subscribe(Arc::new(Scoped {
            scope: scope.clone(),
            inner: handler,
        }))
    }

    /// Detach every watch subscription on every filesystem.
    pub async fn dispose(&self) {
        for fs in self.registry.list() {
            if let Some(hub) = fs.provider().watch_hub() {
                hub.dispose_all().await;
            }
        }
        info!("watch service disposed");
    }

    // --- Batches ---

    /// Start a batch against one segment of `fs_id`.
    pub fn batch(&self, fs_id: &str, segment: &str) -> FsResult<Batch<'_>> {
        let fs = self.registry.get(fs_id)?;
        let root = fs.root(segment)?;
        let provider = self.dispatch(AccessAction::Write, &root)?;
        Ok(Batch::new(provider, self.policy.as_ref(), segment))
    }
}

/// Forwards events touching a path at or below `scope`.
struct Scoped {
    scope: FsPath,
    inner: Arc<dyn WatchHandler>,
}

#[async_trait]
impl WatchHandler for Scoped {
    async fn handle(&self, event: WatchContext) {
        let relevant = event.path.starts_with(&self.scope)
            || event.old_path.as_ref().is_some_and(|p| p.starts_with(&self.scope));
        if relevant {
            self.inner.handle(event).await;
        }
    }
}

/// Options for the write half of a cross-filesystem copy.
fn write_options(target: &ProviderRef, options: &OptionSet) -> FsResult<OptionSet> {
    let mut write = Vec::new();
    if options.has(OptionKind::CreateParents) && target.supported_options().contains(&OptionKind::CreateParents) {
        write.push(FsOption::CreateParents);
    }
    if options.has(OptionKind::Commit) {
        if !target.supported_options().contains(&OptionKind::Commit) {
            return Err(FsError::unsupported_option(OptionKind::Commit));
        }
        write.push(FsOption::Commit(options.commit().clone()));
    }
    OptionSet::parse(&write)
}

/// Options for the delete half of a cross-filesystem move.
fn commit_only(source: &ProviderRef, options: &OptionSet) -> FsResult<OptionSet> {
    if options.has(OptionKind::Commit) && source.supported_options().contains(&OptionKind::Commit) {
        return OptionSet::parse(&[FsOption::Commit(options.commit().clone())]);
    }
    Ok(OptionSet::default())
}

/// Copy one entry between providers through this process.
///
/// Files are read whole and written in one call; directories are copied
/// without their contents.
async fn copy_between(
    source: &ProviderRef,
    target: &ProviderRef,
    from: &FsPath,
    to: &FsPath,
    options: &OptionSet,
) -> FsResult<()> {
    let info = source.stat(from).await?.ok_or_else(|| FsError::not_found(from))?;
    let write = write_options(target, options)?;

    if let Some(existing) = target.stat(to).await? {
        if !options.has(OptionKind::ReplaceExisting) {
            return Err(FsError::already_exists(to));
        }
        // A file over a file is a plain overwrite.
        if existing.is_dir() || info.is_dir() {
            target.delete(to, &commit_only(target, options)?).await?;
        }
    }

    if info.is_dir() {
        target.create_directory(to, &write).await
    } else {
        let data = source.read(from).await?;
        target.write(to, data.to_vec(), &write).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treefs_types::CommitOption;

    fn service() -> IoService {
        let service = IoService::new(ServiceConfig::transient()).unwrap();
        service.new_file_system("git://repo", FileSystemConfig::memory()).unwrap();
        service
    }

    #[tokio::test]
    async fn test_get_joins_components() {
        let service = service();
        let path = service.get("git://repo", &["docs", "a.txt"]).unwrap();
        assert_eq!(path.to_uri(), "git://master@repo/docs/a.txt");
        let path = service.get("git://dev@repo/", &["/x"]).unwrap();
        assert_eq!(path.segment(), "dev");
    }

    #[tokio::test]
    async fn test_new_file_system_twice_fails() {
        let service = service();
        let err = service
            .new_file_system("git://repo", FileSystemConfig::memory())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_write_read_and_attributes() {
        let service = service();
        let path = service.get_uri("git://repo/docs/a.txt").unwrap();
        service.write_string(&path, "hello", &[]).await.unwrap();

        assert_eq!(service.read_all_string(&path).await.unwrap(), "hello");
        let attrs = service.read_attributes(&path).await.unwrap();
        assert_eq!(attrs["size"], AttrValue::Int(5));
        assert_eq!(attrs["isDirectory"], AttrValue::Bool(false));
        assert_eq!(service.size(&path).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_create_directories_is_idempotent() {
        let service = service();
        let dir = service.get_uri("git://repo/a/b/c").unwrap();
        service.create_directories(&dir, &[]).await.unwrap();
        let commits = service.commit_log("repo", "master").unwrap().len();
        service.create_directories(&dir, &[]).await.unwrap();
        assert_eq!(service.commit_log("repo", "master").unwrap().len(), commits);
    }

    #[tokio::test]
    async fn test_delete_if_exists() {
        let service = service();
        let path = service.get_uri("git://repo/a").unwrap();
        assert!(!service.delete_if_exists(&path, &[]).await.unwrap());
        service.write(&path, b"x".to_vec(), &[]).await.unwrap();
        assert!(service.delete_if_exists(&path, &[]).await.unwrap());
        assert!(service.not_exists(&path).await);
    }

    #[tokio::test]
    async fn test_temp_files_are_unique() {
        let service = service();
        let dir = service.get_uri("git://repo/tmp").unwrap();
        service.create_directory(&dir, &[]).await.unwrap();
        let a = service.create_temp_file(&dir, "t-", ".txt", &[]).await.unwrap();
        let b = service.create_temp_file(&dir, "t-", ".txt", &[]).await.unwrap();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().starts_with("t-"));
        assert!(b.file_name().unwrap().ends_with(".txt"));
        let d = service.create_temp_directory(&dir, "d-", &[]).await.unwrap();
        assert!(service.attribute_view(&d).unwrap().basic().await.unwrap().is_directory);
    }

    #[tokio::test]
    async fn test_copy_across_filesystems_streams_content() {
        let service = service();
        service.new_file_system("git://other", FileSystemConfig::memory()).unwrap();
        let from = service.get_uri("git://repo/a.txt").unwrap();
        let to = service.get_uri("git://other/b.txt").unwrap();
        service.write_string(&from, "payload", &[]).await.unwrap();

        service.copy(&from, &to, &[]).await.unwrap();
        assert_eq!(service.read_all_string(&to).await.unwrap(), "payload");

        let err = service.copy(&from, &to, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        service.copy(&from, &to, &[FsOption::ReplaceExisting]).await.unwrap();
    }

    #[tokio::test]
    async fn test_atomic_move_across_filesystems_refused() {
        let service = service();
        service.new_file_system("git://other", FileSystemConfig::memory()).unwrap();
        let from = service.get_uri("git://repo/a.txt").unwrap();
        let to = service.get_uri("git://other/a.txt").unwrap();
        service.write_string(&from, "x", &[]).await.unwrap();

        let err = service.move_path(&from, &to, &[FsOption::AtomicMove]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AtomicMoveNotSupported);
        assert!(service.exists(&from).await);

        service.move_path(&from, &to, &[]).await.unwrap();
        assert!(!service.exists(&from).await);
        assert_eq!(service.read_all_string(&to).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_set_attribute_queues_commit_metadata() {
        let service = service();
        let path = service.get_uri("git://repo/a.txt").unwrap();
        service.set_attribute(&path, "commit:author", "amy").await.unwrap();
        service.set_attribute(&path, "commit:message", "queued").await.unwrap();
        service.write_string(&path, "x", &[]).await.unwrap();

        let history = service.history(&path).await.unwrap();
        assert_eq!(history[0].author, "amy");
        assert_eq!(history[0].message, "queued");

        let err = service.set_attribute(&path, "lastModifiedTime", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_batch_is_one_commit() {
        let service = service();
        let a = service.get_uri("git://repo/a").unwrap();
        let b = service.get_uri("git://repo/b").unwrap();
        let c = service.get_uri("git://repo/c").unwrap();
        service.write_string(&a, "a", &[]).await.unwrap();
        let before = service.commit_log("repo", "master").unwrap().len();

        service
            .batch("repo", "master")
            .unwrap()
            .write(b.clone(), b"b".to_vec())
            .move_path(a.clone(), c.clone(), false)
            .with_commit(CommitOption::author("amy"))
            .commit()
            .await
            .unwrap();

        let log = service.commit_log("repo", "master").unwrap();
        assert_eq!(log.len(), before + 1);
        assert_eq!(log[0].author, "amy");
        assert!(service.exists(&b).await);
        assert!(service.exists(&c).await);
        assert!(!service.exists(&a).await);
    }

    #[tokio::test]
    async fn test_closed_file_system_paths_not_found() {
        let service = service();
        let path = service.get_uri("git://repo/a").unwrap();
        service.write_string(&path, "x", &[]).await.unwrap();
        service.close_file_system("repo").await.unwrap();

        let err = service.read_all_bytes(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(service.not_exists(&path).await);
    }
}
