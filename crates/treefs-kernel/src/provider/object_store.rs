//! Object-store backed provider.
//!
//! Every mutation runs the same loop against one segment:
//!
//! 1. read the segment head and its root tree
//! 2. build a new root by structural sharing (see [`crate::graph`])
//! 3. store a commit pointing at the new root with the old head as parent
//! 4. compare-and-swap the head; on mismatch back off and start over
//!
//! Head advance and event publication happen under one lock, so watch
//! subscribers see events in commit order. Validation errors surface from
//! step 2 and are never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use tracing::{debug, info, warn};
use treefs_types::{
    AttrValue, BasicAttributes, CommitOption, ErrorKind, FileSystemKind, FsError, FsOption, FsPath,
    FsResult, OptionKind, OptionSet, VersionAttributes, VersionRecord, WatchContext, WatchEventKind,
};

use super::{EntryInfo, FilesystemProvider};
use crate::config::{CommitConfig, FileSystemConfig, ServiceConfig};
use crate::graph::{self, CommitWalk};
use crate::store::{
    Commit, EntryKind as NodeKind, Object, ObjectId, ObjectStore, ObjectStoreExt, Signature, Tree, TreeEntry,
};
use crate::watch::WatchHub;

const SUPPORTED_OPTIONS: &[OptionKind] = &[
    OptionKind::CreateNew,
    OptionKind::TruncateExisting,
    OptionKind::CreateParents,
    OptionKind::ReplaceExisting,
    OptionKind::AtomicMove,
    OptionKind::Recursive,
    OptionKind::Commit,
];

/// One step of a batch; all steps land in a single commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Write { path: FsPath, data: Vec<u8> },
    CreateDirectory { path: FsPath },
    Delete { path: FsPath, recursive: bool },
    Move { from: FsPath, to: FsPath, replace_existing: bool },
}

impl BatchOp {
    fn paths(&self) -> Vec<&FsPath> {
        match self {
            BatchOp::Write { path, .. }
            | BatchOp::CreateDirectory { path }
            | BatchOp::Delete { path, .. } => vec![path],
            BatchOp::Move { from, to, .. } => vec![from, to],
        }
    }
}

/// Batch step with its blob already stored.
enum Prepared {
    Write { path: FsPath, blob: ObjectId },
    CreateDirectory { path: FsPath },
    Delete { path: FsPath, recursive: bool },
    Move { from: FsPath, to: FsPath, replace_existing: bool },
}

/// A logically changed path within one commit.
#[derive(Debug, Clone)]
struct Change {
    kind: WatchEventKind,
    path: FsPath,
    old_path: Option<FsPath>,
}

impl Change {
    fn new(kind: WatchEventKind, path: &FsPath) -> Self {
        Self {
            kind,
            path: path.clone(),
            old_path: None,
        }
    }
}

/// Versioned filesystem over an [`ObjectStore`].
#[derive(Debug)]
pub struct ObjectStoreProvider {
    id: String,
    store: Arc<dyn ObjectStore>,
    read_only: bool,
    open: AtomicBool,
    identity: CommitOption,
    commit: CommitConfig,
    /// Metadata queued by `set_attribute` for the next commit, per segment.
    pending: Mutex<HashMap<String, CommitOption>>,
    /// Serializes head advance with event publication.
    advance: tokio::sync::Mutex<()>,
    hub: WatchHub,
}

impl ObjectStoreProvider {
    /// Open a filesystem over `store`, creating any missing initial segments.
    pub fn open(
        id: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        config: &ServiceConfig,
        fs_config: &FileSystemConfig,
    ) -> FsResult<Self> {
        let provider = Self {
            id: id.into(),
            store,
            read_only: fs_config.read_only,
            open: AtomicBool::new(true),
            identity: config.identity.as_commit_option(),
            commit: config.commit.clone(),
            pending: Mutex::new(HashMap::new()),
            advance: tokio::sync::Mutex::new(()),
            hub: WatchHub::new(config.watch.dispose_timeout()),
        };
        // Validate the id the same way paths do.
        FsPath::object(provider.id.clone(), &config.default_segment, "/")?;

        for segment in &fs_config.init_segments {
            FsPath::object(provider.id.clone(), segment.as_str(), "/")?;
            if provider.store.head(segment)?.is_none() {
                let init = provider.init_commit()?;
                if provider.store.compare_and_swap_head(segment, None, &init)? {
                    info!(fs = %provider.id, segment = %segment, "created segment");
                }
            }
        }
        Ok(provider)
    }

    fn init_commit(&self) -> FsResult<ObjectId> {
        init_commit_in(self.store.as_ref(), self.init_author())
    }

    fn init_author(&self) -> Signature {
        self.signature(&CommitOption::default(), "init").0
    }

    fn check_path(&self, path: &FsPath) -> FsResult<()> {
        if !self.is_open() {
            return Err(FsError::new(ErrorKind::NotFound, "filesystem is closed").with_path(path));
        }
        if path.kind() != FileSystemKind::ObjectStore || path.fs_id() != self.id {
            return Err(FsError::invalid_argument(format!(
                "path does not belong to filesystem '{}'",
                self.id
            ))
            .with_path(path));
        }
        Ok(())
    }

    fn ensure_writable(&self, path: &FsPath) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::security_denied("filesystem is read-only").with_path(path));
        }
        Ok(())
    }

    fn head_root(&self, segment: &str) -> FsResult<(ObjectId, ObjectId)> {
        head_root_in(self.store.as_ref(), segment)
    }

    /// Run store work on the blocking pool. Disk stores do synchronous file I/O.
    async fn blocking<T, F>(&self, work: F) -> FsResult<T>
    where
        F: FnOnce(&dyn ObjectStore) -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || work(store.as_ref()))
            .await
            .map_err(|e| FsError::io("object store task failed").with_source(e))?
    }

    async fn resolve(&self, path: &FsPath) -> FsResult<(ObjectId, Option<TreeEntry>)> {
        let path = path.clone();
        self.blocking(move |store| resolve_in(store, &path)).await
    }

    /// Author signature and message for the next commit.
    fn signature(&self, explicit: &CommitOption, default_message: &str) -> (Signature, String) {
        let meta = explicit.clone().or(&self.identity);
        let minutes = explicit.timezone_minutes.or(self.identity.timezone_minutes).unwrap_or(0);
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        let when: DateTime<FixedOffset> = match (explicit.when, explicit.timezone_minutes) {
            (Some(when), Some(_)) => when.with_timezone(&offset),
            (Some(when), None) => when,
            (None, _) => Utc::now().with_timezone(&offset),
        };
        let author = Signature {
            name: meta.name.unwrap_or_default(),
            email: meta.email.unwrap_or_default(),
            when,
        };
        (author, meta.message.unwrap_or_else(|| default_message.to_string()))
    }

    fn pending_for(&self, segment: &str) -> CommitOption {
        self.pending
            .lock()
            .ok()
            .and_then(|p| p.get(segment).cloned())
            .unwrap_or_default()
    }

    /// Drop the queued metadata a commit used, unless more was queued since.
    fn consume_pending(&self, segment: &str, used: &CommitOption) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.get(segment) == Some(used) {
                pending.remove(segment);
            }
        }
    }

    /// Run the optimistic commit loop. Returns the new commit id.
    async fn commit_change<F>(
        &self,
        segment: &str,
        options: &OptionSet,
        default_message: &str,
        build: F,
    ) -> FsResult<ObjectId>
    where
        F: Fn(&dyn ObjectStore, &ObjectId) -> FsResult<(ObjectId, Vec<Change>)> + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        let attempts = self.commit.attempts();
        for attempt in 1..=attempts {
            let work = Arc::clone(&build);
            let owned_segment = segment.to_string();
            let (head, new_root, changes) = self
                .blocking(move |store| {
                    let (head, root) = head_root_in(store, &owned_segment)?;
                    let (new_root, changes) = work(store, &root)?;
                    Ok((head, new_root, changes))
                })
                .await?;

            let queued = self.pending_for(segment);
            let explicit = options.commit().clone().or(&queued);
            let (author, message) = self.signature(&explicit, default_message);
            let user = author.name.clone();
            let commit = Object::commit(Commit {
                tree: new_root,
                parent: Some(head.clone()),
                author,
                message: message.clone(),
            });
            let commit_id = self.blocking(move |store| store.put(&commit)).await?;

            let events: Vec<WatchContext> = changes
                .into_iter()
                .map(|c| WatchContext {
                    kind: c.kind,
                    path: c.path,
                    old_path: c.old_path,
                    session_id: commit_id.to_string(),
                    user: user.clone(),
                    message: message.clone(),
                })
                .collect();

            let advanced = {
                let _guard = self.advance.lock().await;
                let (owned_segment, expected, next) = (segment.to_string(), head.clone(), commit_id.clone());
                let advanced = self
                    .blocking(move |store| store.compare_and_swap_head(&owned_segment, Some(&expected), &next))
                    .await?;
                if advanced {
                    self.hub.publish(&events);
                }
                advanced
            };

            if advanced {
                self.consume_pending(segment, &queued);
                debug!(
                    fs = %self.id,
                    segment,
                    commit = commit_id.short(),
                    parent = head.short(),
                    changes = events.len(),
                    "committed"
                );
                return Ok(commit_id);
            }

            warn!(fs = %self.id, segment, attempt, attempts, "segment head moved, retrying commit");
            if attempt < attempts {
                tokio::time::sleep(self.commit.backoff(attempt)).await;
            }
        }
        Err(FsError::concurrent_modification(segment))
    }

    /// Commit ids of a segment, newest first.
    pub fn commit_ids(&self, segment: &str) -> FsResult<Vec<String>> {
        let head = self.head_root(segment)?.0;
        CommitWalk::new(self.store.as_ref(), Some(head))
            .map(|item| item.map(|(id, _)| id.to_string()))
            .collect()
    }
}

fn components(path: &FsPath) -> Vec<&str> {
    path.components().collect()
}

/// Head commit and root tree of a segment.
fn head_root_in(store: &dyn ObjectStore, segment: &str) -> FsResult<(ObjectId, ObjectId)> {
    let head = store
        .head(segment)?
        .ok_or_else(|| FsError::new(ErrorKind::NotFound, format!("no such segment '{segment}'")))?;
    let commit = store.commit(&head)?;
    Ok((head, commit.tree.clone()))
}

/// Empty root tree with an `init` commit on top.
fn init_commit_in(store: &dyn ObjectStore, author: Signature) -> FsResult<ObjectId> {
    let tree = store.put(&Object::tree(Tree::empty()))?;
    store.put(&Object::commit(Commit {
        tree,
        parent: None,
        author,
        message: "init".to_string(),
    }))
}

fn resolve_in(store: &dyn ObjectStore, path: &FsPath) -> FsResult<(ObjectId, Option<TreeEntry>)> {
    let (head, root) = head_root_in(store, path.segment())?;
    let entry = graph::lookup(store, &root, &components(path))?;
    Ok((head, entry))
}

fn version_record(id: &ObjectId, commit: &Commit) -> VersionRecord {
    VersionRecord {
        commit_id: id.to_string(),
        author: commit.author.name.clone(),
        email: commit.author.email.clone(),
        message: commit.message.clone(),
        time: commit.author.when,
    }
}

fn apply_write(
    store: &dyn ObjectStore,
    root: &ObjectId,
    path: &FsPath,
    blob: ObjectId,
    create_new: bool,
) -> FsResult<(ObjectId, Change)> {
    if path.is_root() {
        return Err(FsError::invalid_argument("cannot write to the root directory").with_path(path));
    }
    let comps = components(path);
    let kind = match graph::lookup(store, root, &comps)? {
        Some(entry) if entry.is_tree() => {
            return Err(FsError::invalid_argument("is a directory").with_path(path));
        }
        Some(_) if create_new => return Err(FsError::already_exists(path)),
        Some(_) => WatchEventKind::Modified,
        None => WatchEventKind::Created,
    };
    let root = graph::insert(store, root, &comps, NodeKind::Blob, blob).map_err(|e| e.with_path(path))?;
    Ok((root, Change::new(kind, path)))
}

fn apply_create_directory(
    store: &dyn ObjectStore,
    root: &ObjectId,
    path: &FsPath,
    create_parents: bool,
) -> FsResult<(ObjectId, Change)> {
    let comps = components(path);
    if graph::lookup(store, root, &comps)?.is_some() {
        return Err(FsError::already_exists(path));
    }
    if let Some(parent) = path.parent() {
        match graph::lookup(store, root, &components(&parent))? {
            Some(entry) if !entry.is_tree() => {
                return Err(FsError::invalid_argument("parent is not a directory").with_path(&parent));
            }
            None if !create_parents => return Err(FsError::not_found(&parent)),
            _ => {}
        }
    }
    let empty = store.put(&Object::tree(Tree::empty()))?;
    let root = graph::insert(store, root, &comps, NodeKind::Tree, empty).map_err(|e| e.with_path(path))?;
    Ok((root, Change::new(WatchEventKind::Created, path)))
}

fn apply_delete(
    store: &dyn ObjectStore,
    root: &ObjectId,
    path: &FsPath,
    recursive: bool,
) -> FsResult<(ObjectId, Change)> {
    if path.is_root() {
        return Err(FsError::invalid_argument("cannot delete the root directory").with_path(path));
    }
    let comps = components(path);
    let entry = graph::lookup(store, root, &comps)?.ok_or_else(|| FsError::not_found(path))?;
    if entry.is_tree() && !recursive && !store.tree(&entry.id)?.is_empty() {
        return Err(FsError::directory_not_empty(path));
    }
    let (root, _) = graph::remove(store, root, &comps).map_err(|e| e.with_path(path))?;
    Ok((root, Change::new(WatchEventKind::Deleted, path)))
}

/// Clear the way for `entry` at `to`, honoring replace-existing.
fn prepare_target(
    store: &dyn ObjectStore,
    root: &ObjectId,
    to: &FsPath,
    replace_existing: bool,
) -> FsResult<(ObjectId, bool)> {
    let comps = components(to);
    match graph::lookup(store, root, &comps)? {
        None => Ok((root.clone(), false)),
        Some(_) if !replace_existing => Err(FsError::already_exists(to)),
        Some(target) if target.is_tree() && !store.tree(&target.id)?.is_empty() => {
            Err(FsError::directory_not_empty(to))
        }
        Some(_) if to.is_root() => Err(FsError::invalid_argument("cannot replace the root directory").with_path(to)),
        Some(_) => Ok((graph::remove(store, root, &comps)?.0, true)),
    }
}

fn apply_move(
    store: &dyn ObjectStore,
    root: &ObjectId,
    from: &FsPath,
    to: &FsPath,
    replace_existing: bool,
) -> FsResult<(ObjectId, Change)> {
    if from.is_root() {
        return Err(FsError::invalid_argument("cannot move the root directory").with_path(from));
    }
    if from == to {
        return Err(FsError::invalid_argument("source and target are the same").with_path(from));
    }
    if graph::lookup(store, root, &components(from))?.is_none() {
        return Err(FsError::not_found(from));
    }
    if to.starts_with(from) {
        return Err(FsError::invalid_argument("cannot move a directory into itself").with_path(to));
    }
    let (root, _) = prepare_target(store, root, to, replace_existing)?;
    let (root, moved) = graph::remove(store, &root, &components(from)).map_err(|e| e.with_path(from))?;
    let root = graph::insert(store, &root, &components(to), moved.kind, moved.id).map_err(|e| e.with_path(to))?;
    Ok((
        root,
        Change {
            kind: WatchEventKind::Renamed,
            path: to.clone(),
            old_path: Some(from.clone()),
        },
    ))
}

fn apply_copy(
    store: &dyn ObjectStore,
    root: &ObjectId,
    source: &TreeEntry,
    to: &FsPath,
    replace_existing: bool,
) -> FsResult<(ObjectId, Change)> {
    let (root, replaced) = prepare_target(store, root, to, replace_existing)?;
    let root = graph::insert(store, &root, &components(to), source.kind, source.id.clone())
        .map_err(|e| e.with_path(to))?;
    let kind = if replaced {
        WatchEventKind::Modified
    } else {
        WatchEventKind::Created
    };
    Ok((root, Change::new(kind, to)))
}

/// Size, type and times of the entry at `path`. Times come from the
/// commits that touched it.
fn basic_attributes_in(store: &dyn ObjectStore, path: &FsPath) -> FsResult<BasicAttributes> {
    let (head, entry) = resolve_in(store, path)?;
    let entry = entry.ok_or_else(|| FsError::not_found(path))?;

    let touching = graph::touching_commits(store, &head, &components(path))?;
    let head_time = || -> FsResult<DateTime<FixedOffset>> { Ok(store.commit(&head)?.author.when) };
    let last_modified = match touching.first() {
        Some((_, commit)) => commit.author.when,
        None => head_time()?,
    };
    let created = match touching.last() {
        Some((_, commit)) => commit.author.when,
        None => last_modified,
    };
    let is_directory = entry.is_tree();
    Ok(BasicAttributes {
        size: graph::entry_size(store, &entry)?,
        last_modified,
        last_access: last_modified,
        created,
        is_directory,
        is_regular_file: !is_directory,
        is_symbolic_link: false,
        is_other: false,
        file_key: Some(entry.id.to_string()),
    })
}

fn entry_info(store: &dyn ObjectStore, name: &str, entry: &TreeEntry) -> FsResult<EntryInfo> {
    Ok(match entry.kind {
        NodeKind::Tree => EntryInfo::directory(name),
        NodeKind::Blob => EntryInfo::file(name, graph::entry_size(store, entry)?),
    })
}

#[async_trait]
impl FilesystemProvider for ObjectStoreProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FileSystemKind {
        FileSystemKind::ObjectStore
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
            self.hub.dispose_all().await;
            info!(fs = %self.id, "closed filesystem");
        }
    }

    fn segments(&self) -> FsResult<Vec<String>> {
        self.store.segments()
    }

    async fn create_segment(&self, name: &str, from: Option<&str>) -> FsResult<()> {
        let root = FsPath::object(self.id.clone(), name, "/")?;
        self.check_path(&root)?;
        self.ensure_writable(&root)?;
        let author = self.init_author();
        let (segment, source) = (name.to_string(), from.map(str::to_owned));
        let created = self
            .blocking(move |store| {
                if store.head(&segment)?.is_some() {
                    return Ok(false);
                }
                let start = match source {
                    Some(source) => head_root_in(store, &source)?.0,
                    None => init_commit_in(store, author)?,
                };
                store.compare_and_swap_head(&segment, None, &start)
            })
            .await?;
        if !created {
            return Err(FsError::already_exists(&root));
        }
        info!(fs = %self.id, segment = name, from = from.unwrap_or("<empty>"), "created segment");
        Ok(())
    }

    async fn stat(&self, path: &FsPath) -> FsResult<Option<EntryInfo>> {
        self.check_path(path)?;
        let path = path.clone();
        self.blocking(move |store| {
            resolve_in(store, &path)?
                .1
                .map(|e| entry_info(store, path.file_name().unwrap_or(""), &e))
                .transpose()
        })
        .await
    }

    async fn read(&self, path: &FsPath) -> FsResult<Arc<[u8]>> {
        self.check_path(path)?;
        let path = path.clone();
        // Only blobs have content; a tree at the path reads as missing.
        self.blocking(move |store| match resolve_in(store, &path)?.1 {
            Some(entry) if !entry.is_tree() => store.blob(&entry.id),
            _ => Err(FsError::not_found(&path)),
        })
        .await
    }

    async fn write(&self, path: &FsPath, data: Vec<u8>, options: &OptionSet) -> FsResult<()> {
        self.check_path(path)?;
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only(
            "write",
            &[
                OptionKind::CreateNew,
                OptionKind::TruncateExisting,
                OptionKind::CreateParents,
                OptionKind::Commit,
            ],
        )?;
        self.ensure_writable(path)?;

        let blob = self.blocking(move |store| store.put(&Object::blob(data))).await?;
        let create_new = options.has(OptionKind::CreateNew);
        let message = format!("write {}", path.key());
        let target = path.clone();
        self.commit_change(path.segment(), options, &message, move |store, root| {
            let (root, change) = apply_write(store, root, &target, blob.clone(), create_new)?;
            Ok((root, vec![change]))
        })
        .await
        .map(drop)
    }

    async fn list(&self, path: &FsPath) -> FsResult<Vec<EntryInfo>> {
        self.check_path(path)?;
        let path = path.clone();
        self.blocking(move |store| {
            let entry = resolve_in(store, &path)?.1.ok_or_else(|| FsError::not_found(&path))?;
            if !entry.is_tree() {
                return Err(FsError::invalid_argument("not a directory").with_path(&path));
            }
            store
                .tree(&entry.id)?
                .entries()
                .iter()
                .map(|e| entry_info(store, &e.name, e))
                .collect()
        })
        .await
    }

    async fn create_directory(&self, path: &FsPath, options: &OptionSet) -> FsResult<()> {
        self.check_path(path)?;
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only("create directory", &[OptionKind::CreateParents, OptionKind::Commit])?;
        self.ensure_writable(path)?;

        let create_parents = options.has(OptionKind::CreateParents);
        let message = format!("create directory {}", path.key());
        let target = path.clone();
        self.commit_change(path.segment(), options, &message, move |store, root| {
            let (root, change) = apply_create_directory(store, root, &target, create_parents)?;
            Ok((root, vec![change]))
        })
        .await
        .map(drop)
    }

    async fn delete(&self, path: &FsPath, options: &OptionSet) -> FsResult<()> {
        self.check_path(path)?;
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only("delete", &[OptionKind::Recursive, OptionKind::Commit])?;
        self.ensure_writable(path)?;

        let recursive = options.has(OptionKind::Recursive);
        let message = format!("delete {}", path.key());
        let target = path.clone();
        self.commit_change(path.segment(), options, &message, move |store, root| {
            let (root, change) = apply_delete(store, root, &target, recursive)?;
            Ok((root, vec![change]))
        })
        .await
        .map(drop)
    }

    async fn copy(&self, from: &FsPath, to: &FsPath, options: &OptionSet) -> FsResult<()> {
        self.check_path(from)?;
        self.check_path(to)?;
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only(
            "copy",
            &[OptionKind::ReplaceExisting, OptionKind::CreateParents, OptionKind::Commit],
        )?;
        self.ensure_writable(to)?;
        if from == to {
            return Ok(());
        }

        // Source is read at the head current now, possibly in another segment.
        let source = self.resolve(from).await?.1.ok_or_else(|| FsError::not_found(from))?;
        let replace = options.has(OptionKind::ReplaceExisting);
        let message = format!("copy {} to {}", from.to_uri(), to.key());
        let target = to.clone();
        self.commit_change(to.segment(), options, &message, move |store, root| {
            let (root, change) = apply_copy(store, root, &source, &target, replace)?;
            Ok((root, vec![change]))
        })
        .await
        .map(drop)
    }

    async fn rename(&self, from: &FsPath, to: &FsPath, options: &OptionSet) -> FsResult<()> {
        self.check_path(from)?;
        self.check_path(to)?;
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only(
            "move",
            &[
                OptionKind::ReplaceExisting,
                OptionKind::AtomicMove,
                OptionKind::CreateParents,
                OptionKind::Commit,
            ],
        )?;
        self.ensure_writable(from)?;
        if from == to {
            return Ok(());
        }

        if from.segment() != to.segment() {
            if options.has(OptionKind::AtomicMove) {
                return Err(FsError::atomic_move_not_supported(
                    "cannot move atomically between segments",
                )
                .with_path(from));
            }
            debug!(from = %from, to = %to, "moving across segments as copy then delete");
            self.copy(from, to, options).await?;
            let delete = OptionSet::parse(&[
                FsOption::Recursive,
                FsOption::Commit(options.commit().clone()),
            ])?;
            return self.delete(from, &delete).await;
        }

        let replace = options.has(OptionKind::ReplaceExisting);
        let message = format!("move {} to {}", from.key(), to.key());
        let (source, target) = (from.clone(), to.clone());
        self.commit_change(from.segment(), options, &message, move |store, root| {
            let (root, change) = apply_move(store, root, &source, &target, replace)?;
            Ok((root, vec![change]))
        })
        .await
        .map(drop)
    }

    async fn basic_attributes(&self, path: &FsPath) -> FsResult<BasicAttributes> {
        self.check_path(path)?;
        let path = path.clone();
        self.blocking(move |store| basic_attributes_in(store, &path)).await
    }

    async fn version_attributes(&self, path: &FsPath) -> FsResult<VersionAttributes> {
        self.check_path(path)?;
        let path = path.clone();
        self.blocking(move |store| {
            let (head, entry) = resolve_in(store, &path)?;
            if entry.is_none() {
                return Err(FsError::not_found(&path));
            }
            let history = graph::touching_commits(store, &head, &components(&path))?
                .iter()
                .map(|(id, commit)| version_record(id, commit))
                .collect();
            Ok(VersionAttributes { history })
        })
        .await
    }
    async fn set_attribute(&self, path: &FsPath, name: &str, value: &AttrValue) -> FsResult<()> {
        self.check_path(path)?;
        self.ensure_writable(path)?;
        let mut update = CommitOption::default();
        match (name, value) {
            ("commit:author" | "commit:name", AttrValue::Text(v)) => update.name = Some(v.clone()),
            ("commit:email", AttrValue::Text(v)) => update.email = Some(v.clone()),
            ("commit:message", AttrValue::Text(v)) => update.message = Some(v.clone()),
            ("commit:timezone", AttrValue::Int(minutes)) => {
                let minutes = i32::try_from(*minutes)
                    .map_err(|_| FsError::invalid_argument("timezone offset out of range"))?;
                update.timezone_minutes = Some(minutes);
            }
            ("commit:author" | "commit:name" | "commit:email" | "commit:message" | "commit:timezone", _) => {
                return Err(FsError::invalid_argument(format!(
                    "attribute '{name}' does not accept value {value}"
                )));
            }
            _ => {
                return Err(FsError::unsupported(format!(
                    "attribute '{name}' cannot be set; content and history are immutable"
                ))
                .with_path(path));
            }
        }
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| FsError::io("pending metadata lock poisoned"))?;
        let queued = pending.entry(path.segment().to_string()).or_default();
        *queued = update.or(queued);
        drop(pending);
        debug!(path = %path, attribute = name, "queued commit metadata");
        Ok(())
    }

    async fn commit_batch(&self, segment: &str, ops: Vec<BatchOp>, options: &OptionSet) -> FsResult<String> {
        let root_path = FsPath::object(self.id.clone(), segment, "/")?;
        self.check_path(&root_path)?;
        options.ensure_supported(SUPPORTED_OPTIONS)?;
        options.ensure_only("batch", &[OptionKind::Commit])?;
        self.ensure_writable(&root_path)?;
        if ops.is_empty() {
            return Err(FsError::invalid_argument("empty batch"));
        }

        for path in ops.iter().flat_map(BatchOp::paths) {
            self.check_path(path)?;
            if path.segment() != segment {
                return Err(FsError::invalid_argument(format!(
                    "batch for segment '{segment}' cannot touch another segment"
                ))
                .with_path(path));
            }
        }

        let prepared = self
            .blocking(move |store| {
                ops.into_iter()
                    .map(|op| {
                        Ok(match op {
                            BatchOp::Write { path, data } => Prepared::Write {
                                path,
                                blob: store.put(&Object::blob(data))?,
                            },
                            BatchOp::CreateDirectory { path } => Prepared::CreateDirectory { path },
                            BatchOp::Delete { path, recursive } => Prepared::Delete { path, recursive },
                            BatchOp::Move {
                                from,
                                to,
                                replace_existing,
                            } => Prepared::Move {
                                from,
                                to,
                                replace_existing,
                            },
                        })
                    })
                    .collect::<FsResult<Vec<_>>>()
            })
            .await?;

        let message = format!("batch of {} operations", prepared.len());
        let commit = self
            .commit_change(segment, options, &message, move |store, root| {
                let mut root = root.clone();
                let mut changes = Vec::with_capacity(prepared.len());
                for op in &prepared {
                    let (next, change) = match op {
                        Prepared::Write { path, blob } => apply_write(store, &root, path, blob.clone(), false)?,
                        Prepared::CreateDirectory { path } => apply_create_directory(store, &root, path, true)?,
                        Prepared::Delete { path, recursive } => apply_delete(store, &root, path, *recursive)?,
                        Prepared::Move {
                            from,
                            to,
                            replace_existing,
                        } => apply_move(store, &root, from, to, *replace_existing)?,
                    };
                    root = next;
                    changes.push(change);
                }
                Ok((root, changes))
            })
            .await?;
        Ok(commit.to_string())
    }

    fn watch_hub(&self) -> Option<&WatchHub> {
        Some(&self.hub)
    }

    fn commit_log(&self, segment: &str) -> FsResult<Vec<VersionRecord>> {
        let head = self.head_root(segment)?.0;
        CommitWalk::new(self.store.as_ref(), Some(head))
            .map(|item| item.map(|(id, commit)| version_record(&id, &commit)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn provider() -> ObjectStoreProvider {
        ObjectStoreProvider::open(
            "docs",
            Arc::new(MemoryStore::new()),
            &ServiceConfig::transient(),
            &FileSystemConfig::memory(),
        )
        .unwrap()
    }

    fn path(key: &str) -> FsPath {
        FsPath::object("docs", "master", key).unwrap()
    }

    fn opts(options: &[FsOption]) -> OptionSet {
        OptionSet::parse(options).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let fs = provider();
        fs.write(&path("/a/b.txt"), b"hello".to_vec(), &opts(&[])).await.unwrap();
        assert_eq!(&*fs.read(&path("/a/b.txt")).await.unwrap(), b"hello");
        let info = fs.stat(&path("/a")).await.unwrap().unwrap();
        assert!(info.is_dir());
    }

    #[tokio::test]
    async fn test_create_new_rejects_existing() {
        let fs = provider();
        fs.write(&path("/f"), b"1".to_vec(), &opts(&[])).await.unwrap();
        let err = fs
            .write(&path("/f"), b"2".to_vec(), &opts(&[FsOption::CreateNew]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(&*fs.read(&path("/f")).await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_append_is_unsupported() {
        let fs = provider();
        let err = fs
            .write(&path("/f"), b"1".to_vec(), &opts(&[FsOption::Append]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(err.option(), Some(OptionKind::Append));
    }

    #[tokio::test]
    async fn test_every_mutation_is_one_commit() {
        let fs = provider();
        let before = fs.commit_ids("master").unwrap().len();
        fs.write(&path("/a"), b"x".to_vec(), &opts(&[])).await.unwrap();
        fs.rename(&path("/a"), &path("/b"), &opts(&[])).await.unwrap();
        fs.delete(&path("/b"), &opts(&[])).await.unwrap();
        assert_eq!(fs.commit_ids("master").unwrap().len(), before + 3);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_head() {
        let fs = provider();
        let before = fs.commit_ids("master").unwrap();
        let err = fs.delete(&path("/missing"), &opts(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fs.commit_ids("master").unwrap(), before);
    }

    #[tokio::test]
    async fn test_create_directory_needs_parent() {
        let fs = provider();
        let err = fs.create_directory(&path("/x/y"), &opts(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        fs.create_directory(&path("/x/y"), &opts(&[FsOption::CreateParents]))
            .await
            .unwrap();
        assert!(fs.list(&path("/x/y")).await.unwrap().is_empty());
        let err = fs.create_directory(&path("/x/y"), &opts(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_move_into_itself_rejected() {
        let fs = provider();
        fs.write(&path("/d/f"), b"x".to_vec(), &opts(&[])).await.unwrap();
        let err = fs.rename(&path("/d"), &path("/d/sub"), &opts(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_cross_segment_atomic_move_rejected() {
        let fs = provider();
        fs.create_segment("dev", Some("master")).await.unwrap();
        fs.write(&path("/f"), b"x".to_vec(), &opts(&[])).await.unwrap();
        let target = FsPath::object("docs", "dev", "/f").unwrap();
        let err = fs
            .rename(&path("/f"), &target, &opts(&[FsOption::AtomicMove]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AtomicMoveNotSupported);
        assert!(fs.stat(&path("/f")).await.unwrap().is_some());

        // Without the atomic flag it is a copy then a delete.
        fs.rename(&path("/f"), &target, &opts(&[])).await.unwrap();
        assert!(fs.stat(&path("/f")).await.unwrap().is_none());
        assert_eq!(&*fs.read(&target).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_segments_are_isolated() {
        let fs = provider();
        fs.write(&path("/shared"), b"before".to_vec(), &opts(&[])).await.unwrap();
        fs.create_segment("dev", Some("master")).await.unwrap();
        let dev = FsPath::object("docs", "dev", "/shared").unwrap();
        fs.write(&dev, b"after".to_vec(), &opts(&[])).await.unwrap();

        assert_eq!(&*fs.read(&path("/shared")).await.unwrap(), b"before");
        assert_eq!(&*fs.read(&dev).await.unwrap(), b"after");
        assert_eq!(fs.segments().unwrap(), vec!["dev", "master"]);

        let err = fs.create_segment("dev", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_commit_metadata() {
        let fs = provider();
        let when = DateTime::parse_from_rfc3339("2024-05-01T12:00:00+02:00").unwrap();
        let commit = CommitOption::author("amy")
            .with_email("amy@example.com")
            .with_message("add notes")
            .with_when(when);
        fs.write(&path("/notes"), b"n".to_vec(), &opts(&[FsOption::Commit(commit)]))
            .await
            .unwrap();

        let log = fs.commit_log("master").unwrap();
        assert_eq!(log[0].author, "amy");
        assert_eq!(log[0].email, "amy@example.com");
        assert_eq!(log[0].message, "add notes");
        assert_eq!(log[0].time, when);
        assert_eq!(log.last().unwrap().message, "init");
        assert_eq!(log.last().unwrap().author, "system");
    }

    #[tokio::test]
    async fn test_set_attribute_queues_commit_metadata() {
        let fs = provider();
        fs.set_attribute(&path("/x"), "commit:message", &AttrValue::from("queued"))
            .await
            .unwrap();
        fs.set_attribute(&path("/x"), "commit:author", &AttrValue::from("bob"))
            .await
            .unwrap();
        fs.write(&path("/x"), b"x".to_vec(), &opts(&[])).await.unwrap();
        fs.write(&path("/y"), b"y".to_vec(), &opts(&[])).await.unwrap();

        let log = fs.commit_log("master").unwrap();
        assert_eq!(log[1].message, "queued");
        assert_eq!(log[1].author, "bob");
        // Consumed by the first commit
        assert_eq!(log[0].message, "write /y");
        assert_eq!(log[0].author, "system");

        let err = fs
            .set_attribute(&path("/x"), "basic:size", &AttrValue::from(3i64))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_metadata_queued_after_snapshot_survives_commit() {
        let fs = provider();
        fs.set_attribute(&path("/x"), "commit:author", &AttrValue::from("bob"))
            .await
            .unwrap();
        let used = fs.pending_for("master");
        // Queued while a commit holding `used` is in flight.
        fs.set_attribute(&path("/x"), "commit:message", &AttrValue::from("later"))
            .await
            .unwrap();

        fs.consume_pending("master", &used);
        let left = fs.pending_for("master");
        assert_eq!(left.name.as_deref(), Some("bob"));
        assert_eq!(left.message.as_deref(), Some("later"));

        fs.consume_pending("master", &left);
        assert!(fs.pending_for("master").is_empty());
    }

    #[tokio::test]
    async fn test_rejected_attribute_queues_nothing() {
        let fs = provider();
        let err = fs
            .set_attribute(&path("/x"), "commit:timezone", &AttrValue::from("utc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(fs.pending.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disk_store_commits_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::store::DiskStore::open(dir.path()).unwrap());
        let fs = Arc::new(
            ObjectStoreProvider::open("docs", store, &ServiceConfig::transient(), &FileSystemConfig::memory())
                .unwrap(),
        );
        let mut tasks = Vec::new();
        for i in 0..4 {
            let fs = Arc::clone(&fs);
            tasks.push(tokio::spawn(async move {
                fs.write(&path(&format!("/d/{i}")), vec![i as u8], &opts(&[])).await
            }));
        }
        let mut written = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                written += 1;
            }
        }
        assert!(written > 0);
        assert_eq!(fs.list(&path("/d")).await.unwrap().len(), written);
        assert_eq!(fs.commit_log("master").unwrap().len(), 1 + written);
    }

    #[tokio::test]
    async fn test_read_only_denies_before_graph_work() {
        let fs = ObjectStoreProvider::open(
            "docs",
            Arc::new(MemoryStore::new()),
            &ServiceConfig::transient(),
            &FileSystemConfig::memory().read_only(),
        )
        .unwrap();
        let before = fs.commit_ids("master").unwrap();
        let err = fs.write(&path("/f"), b"x".to_vec(), &opts(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityDenied);
        assert_eq!(fs.commit_ids("master").unwrap(), before);
    }

    #[tokio::test]
    async fn test_batch_is_one_commit() {
        let fs = provider();
        let before = fs.commit_ids("master").unwrap().len();
        fs.commit_batch(
            "master",
            vec![
                BatchOp::Write {
                    path: path("/a"),
                    data: b"a".to_vec(),
                },
                BatchOp::CreateDirectory { path: path("/d") },
                BatchOp::Move {
                    from: path("/a"),
                    to: path("/d/a"),
                    replace_existing: false,
                },
            ],
            &opts(&[]),
        )
        .await
        .unwrap();
        assert_eq!(fs.commit_ids("master").unwrap().len(), before + 1);
        assert_eq!(&*fs.read(&path("/d/a")).await.unwrap(), b"a");
        assert!(fs.stat(&path("/a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_failure_commits_nothing() {
        let fs = provider();
        let before = fs.commit_ids("master").unwrap();
        let err = fs
            .commit_batch(
                "master",
                vec![
                    BatchOp::Write {
                        path: path("/a"),
                        data: b"a".to_vec(),
                    },
                    BatchOp::Delete {
                        path: path("/missing"),
                        recursive: false,
                    },
                ],
                &opts(&[]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fs.commit_ids("master").unwrap(), before);
        assert!(fs.stat(&path("/a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_times_come_from_history() {
        let fs = provider();
        let t1 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap();
        let t2 = DateTime::parse_from_rfc3339("2024-02-01T00:00:00+00:00").unwrap();
        let t3 = DateTime::parse_from_rfc3339("2024-03-01T00:00:00+00:00").unwrap();
        let at = |t| opts(&[FsOption::Commit(CommitOption::new().with_when(t))]);

        fs.write(&path("/f"), b"1".to_vec(), &at(t1)).await.unwrap();
        fs.write(&path("/f"), b"22".to_vec(), &at(t2)).await.unwrap();
        fs.write(&path("/other"), b"o".to_vec(), &at(t3)).await.unwrap();

        let attrs = fs.basic_attributes(&path("/f")).await.unwrap();
        assert_eq!(attrs.created, t1);
        assert_eq!(attrs.last_modified, t2);
        assert_eq!(attrs.size, 2);
        assert!(attrs.is_regular_file);

        let versions = fs.version_attributes(&path("/f")).await.unwrap();
        assert_eq!(versions.history.len(), 2);
    }
}
