//! Registry of mounted filesystems.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::info;
use treefs_types::{ErrorKind, FileSystemKind, FsError, FsPath, FsResult, OptionKind};

use crate::provider::ProviderRef;

/// Handle to one mounted filesystem.
#[derive(Clone)]
pub struct FileSystem {
    provider: ProviderRef,
}

impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for FileSystem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.provider, &other.provider)
    }
}

impl FileSystem {
    pub fn new(provider: ProviderRef) -> Self {
        Self { provider }
    }

    /// Cluster id.
    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn kind(&self) -> FileSystemKind {
        self.provider.kind()
    }

    pub fn is_open(&self) -> bool {
        self.provider.is_open()
    }

    pub fn is_read_only(&self) -> bool {
        self.provider.read_only()
    }

    pub fn supported_options(&self) -> &'static [OptionKind] {
        self.provider.supported_options()
    }

    pub fn segments(&self) -> FsResult<Vec<String>> {
        self.provider.segments()
    }

    /// Root of `segment` (ignored for host filesystems).
    pub fn root(&self, segment: &str) -> FsResult<FsPath> {
        match self.kind() {
            FileSystemKind::ObjectStore => FsPath::object(self.id(), segment, "/"),
            FileSystemKind::Host => FsPath::host("/"),
        }
    }

    /// One root per segment; a single root for host filesystems.
    pub fn root_directories(&self) -> FsResult<Vec<FsPath>> {
        match self.kind() {
            FileSystemKind::ObjectStore => self.segments()?.iter().map(|s| self.root(s)).collect(),
            FileSystemKind::Host => Ok(vec![FsPath::host("/")?]),
        }
    }

    pub fn provider(&self) -> &ProviderRef {
        &self.provider
    }
}

/// Mounted filesystems by id.
#[derive(Default)]
pub struct FileSystemRegistry {
    providers: RwLock<HashMap<String, ProviderRef>>,
}

impl fmt::Debug for FileSystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

fn poisoned() -> FsError {
    FsError::io("filesystem registry lock poisoned")
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a provider. Fails with `AlreadyExists` if the id is taken.
    pub fn register(&self, provider: ProviderRef) -> FsResult<FileSystem> {
        let id = provider.id().to_string();
        let mut providers = self.providers.write().map_err(|_| poisoned())?;
        if providers.contains_key(&id) {
            return Err(FsError::new(
                ErrorKind::AlreadyExists,
                format!("filesystem '{id}' is already mounted"),
            ));
        }
        providers.insert(id.clone(), provider.clone());
        info!(fs = %id, kind = %provider.kind(), "mounted filesystem");
        Ok(FileSystem::new(provider))
    }

    /// Look up a filesystem by id.
    pub fn get(&self, id: &str) -> FsResult<FileSystem> {
        let providers = self.providers.read().map_err(|_| poisoned())?;
        providers
            .get(id)
            .cloned()
            .map(FileSystem::new)
            .ok_or_else(|| FsError::new(ErrorKind::NotFound, format!("no filesystem '{id}'")))
    }

    /// Provider owning `path`, checking the backend kind matches.
    pub fn resolve(&self, path: &FsPath) -> FsResult<ProviderRef> {
        let fs = self.get(path.fs_id()).map_err(|e| e.with_path(path))?;
        if fs.kind() != path.kind() {
            return Err(FsError::invalid_argument(format!(
                "filesystem '{}' is a {} filesystem",
                fs.id(),
                fs.kind()
            ))
            .with_path(path));
        }
        if !fs.is_open() {
            return Err(FsError::new(ErrorKind::NotFound, "filesystem is closed").with_path(path));
        }
        Ok(fs.provider)
    }

    /// Unmount and return a filesystem.
    pub fn remove(&self, id: &str) -> FsResult<FileSystem> {
        let mut providers = self.providers.write().map_err(|_| poisoned())?;
        providers
            .remove(id)
            .map(FileSystem::new)
            .ok_or_else(|| FsError::new(ErrorKind::NotFound, format!("no filesystem '{id}'")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.read().map(|p| p.contains_key(id)).unwrap_or(false)
    }

    /// All filesystems, sorted by id.
    pub fn list(&self) -> Vec<FileSystem> {
        let Ok(providers) = self.providers.read() else {
            return Vec::new();
        };
        let mut all: Vec<_> = providers.values().cloned().map(FileSystem::new).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn of_kind(&self, kind: FileSystemKind) -> Vec<FileSystem> {
        self.list().into_iter().filter(|fs| fs.kind() == kind).collect()
    }

    /// Mounted ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.list().iter().map(|fs| fs.id().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileSystemConfig, ServiceConfig};
    use crate::provider::{HostProvider, ObjectStoreProvider};
    use crate::store::MemoryStore;

    fn object_fs(id: &str) -> ProviderRef {
        Arc::new(
            ObjectStoreProvider::open(
                id,
                Arc::new(MemoryStore::new()),
                &ServiceConfig::transient(),
                &FileSystemConfig::memory(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_register_and_get() {
        let registry = FileSystemRegistry::new();
        registry.register(object_fs("docs")).unwrap();
        assert!(registry.contains("docs"));
        assert_eq!(registry.get("docs").unwrap().id(), "docs");

        let err = registry.register(object_fs("docs")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let err = registry.get("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_list_sorted_and_by_kind() {
        let registry = FileSystemRegistry::new();
        registry.register(object_fs("zeta")).unwrap();
        registry.register(object_fs("alpha")).unwrap();
        registry.register(Arc::new(HostProvider::new("/"))).unwrap();

        assert_eq!(registry.ids(), vec!["alpha", "host", "zeta"]);
        assert_eq!(registry.of_kind(FileSystemKind::ObjectStore).len(), 2);
        assert_eq!(registry.of_kind(FileSystemKind::Host).len(), 1);
    }

    #[test]
    fn test_resolve_checks_kind() {
        let registry = FileSystemRegistry::new();
        registry.register(object_fs("docs")).unwrap();
        let ok = FsPath::parse("git://docs/a").unwrap();
        assert!(registry.resolve(&ok).is_ok());

        let missing = FsPath::parse("git://other/a").unwrap();
        assert_eq!(registry.resolve(&missing).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_root_directories() {
        let registry = FileSystemRegistry::new();
        let fs = registry.register(object_fs("docs")).unwrap();
        let roots = fs.root_directories().unwrap();
        assert_eq!(roots, vec![FsPath::parse("git://master@docs/").unwrap()]);
    }
}
