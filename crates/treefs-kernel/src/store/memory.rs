//! In-memory object store.
//!
//! Used for transient filesystems and testing. All data is lost when dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use treefs_types::{FsError, FsResult};

use super::{Object, ObjectId, ObjectStore};

/// In-memory object store.
///
/// Thread-safe via internal `RwLock`s; the head map lock makes
/// compare-and-swap atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, Object>>,
    heads: RwLock<BTreeMap<String, ObjectId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }
}

fn poisoned() -> FsError {
    FsError::io("memory store lock poisoned")
}

impl ObjectStore for MemoryStore {
    fn put(&self, object: &Object) -> FsResult<ObjectId> {
        let id = object.id()?;
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.entry(id.clone()).or_insert_with(|| object.clone());
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> FsResult<Option<Object>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(id).cloned())
    }

    fn head(&self, segment: &str) -> FsResult<Option<ObjectId>> {
        let heads = self.heads.read().map_err(|_| poisoned())?;
        Ok(heads.get(segment).cloned())
    }

    fn compare_and_swap_head(
        &self,
        segment: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> FsResult<bool> {
        let mut heads = self.heads.write().map_err(|_| poisoned())?;
        if heads.get(segment) != expected {
            return Ok(false);
        }
        heads.insert(segment.to_string(), new.clone());
        Ok(true)
    }

    fn segments(&self) -> FsResult<Vec<String>> {
        let heads = self.heads.read().map_err(|_| poisoned())?;
        Ok(heads.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStoreExt;

    #[test]
    fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.put(&Object::blob(&b"data"[..])).unwrap();
        let b = store.put(&Object::blob(&b"data"[..])).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.object_count(), 1);
        assert_eq!(&*store.blob(&a).unwrap(), b"data");
    }

    #[test]
    fn test_cas_head() {
        let store = MemoryStore::new();
        let one = store.put(&Object::blob(&b"1"[..])).unwrap();
        let two = store.put(&Object::blob(&b"2"[..])).unwrap();

        assert!(store.compare_and_swap_head("master", None, &one).unwrap());
        // Creating again must fail, the segment exists
        assert!(!store.compare_and_swap_head("master", None, &two).unwrap());
        // Stale expectation
        assert!(!store.compare_and_swap_head("master", Some(&two), &two).unwrap());
        assert!(store.compare_and_swap_head("master", Some(&one), &two).unwrap());
        assert_eq!(store.head("master").unwrap(), Some(two));
        assert_eq!(store.segments().unwrap(), vec!["master".to_string()]);
    }

    #[test]
    fn test_missing_object() {
        let store = MemoryStore::new();
        let id = Object::blob(&b"nope"[..]).id().unwrap();
        assert!(store.get(&id).unwrap().is_none());
        let err = store.blob(&id).unwrap_err();
        assert_eq!(err.kind(), treefs_types::ErrorKind::IoFailure);
    }
}
