//! Persistent tree edits and history queries.
//!
//! Edits never mutate a stored tree. Inserting or removing an entry rebuilds
//! only the trees on the path from the root to the edit; every sibling
//! subtree keeps its id and is shared with the previous version.

use std::sync::Arc;

use treefs_types::{FsError, FsResult};

use crate::store::{Commit, EntryKind, Object, ObjectId, ObjectStore, ObjectStoreExt, Tree, TreeEntry};

/// Find the entry at `components` below `root`.
///
/// The empty path resolves to the root tree itself (with an empty name).
/// Walking through a blob yields `None`.
pub fn lookup(store: &dyn ObjectStore, root: &ObjectId, components: &[&str]) -> FsResult<Option<TreeEntry>> {
    let mut current = TreeEntry::new("", EntryKind::Tree, root.clone());
    for name in components {
        if !current.is_tree() {
            return Ok(None);
        }
        let tree = store.tree(&current.id)?;
        match tree.get(name) {
            Some(entry) => current = entry.clone(),
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Set the entry at `components` to (`kind`, `id`), returning the new root.
///
/// Missing intermediate directories are created. An intermediate blob is an
/// `InvalidArgument`. Callers check create/replace policy beforehand.
pub fn insert(
    store: &dyn ObjectStore,
    root: &ObjectId,
    components: &[&str],
    kind: EntryKind,
    id: ObjectId,
) -> FsResult<ObjectId> {
    if components.is_empty() {
        return Err(FsError::invalid_argument("cannot replace the root directory"));
    }
    insert_at(store, Some(root), components, kind, id)
}

fn insert_at(
    store: &dyn ObjectStore,
    tree_id: Option<&ObjectId>,
    components: &[&str],
    kind: EntryKind,
    id: ObjectId,
) -> FsResult<ObjectId> {
    let tree = match tree_id {
        Some(tree_id) => store.tree(tree_id)?,
        None => Arc::new(Tree::empty()),
    };
    let Some((first, rest)) = components.split_first() else {
        return Err(FsError::invalid_argument("empty path"));
    };

    let updated = if rest.is_empty() {
        tree.with_entry(TreeEntry::new(*first, kind, id))
    } else {
        let child = match tree.get(first) {
            Some(entry) if entry.is_tree() => Some(entry.id.clone()),
            Some(_) => {
                return Err(FsError::invalid_argument(format!("'{first}' is not a directory")));
            }
            None => None,
        };
        let child_id = insert_at(store, child.as_ref(), rest, kind, id)?;
        tree.with_entry(TreeEntry::new(*first, EntryKind::Tree, child_id))
    };
    store.put(&Object::tree(updated))
}

/// Remove the entry at `components`, returning the new root and the removed entry.
pub fn remove(
    store: &dyn ObjectStore,
    root: &ObjectId,
    components: &[&str],
) -> FsResult<(ObjectId, TreeEntry)> {
    if components.is_empty() {
        return Err(FsError::invalid_argument("cannot remove the root directory"));
    }
    remove_at(store, root, components)
}

fn remove_at(
    store: &dyn ObjectStore,
    tree_id: &ObjectId,
    components: &[&str],
) -> FsResult<(ObjectId, TreeEntry)> {
    let tree = store.tree(tree_id)?;
    let Some((first, rest)) = components.split_first() else {
        return Err(FsError::invalid_argument("empty path"));
    };
    let missing = || FsError::not_found(format!("/{}", components.join("/")));

    if rest.is_empty() {
        let (updated, removed) = tree.without(first);
        let removed = removed.ok_or_else(missing)?;
        return Ok((store.put(&Object::tree(updated))?, removed));
    }

    let child = tree.get(first).filter(|e| e.is_tree()).ok_or_else(missing)?;
    let (child_id, removed) = remove_at(store, &child.id, rest)?;
    let updated = tree.with_entry(TreeEntry::new(*first, EntryKind::Tree, child_id));
    Ok((store.put(&Object::tree(updated))?, removed))
}

/// Size in bytes of an entry; directories report zero.
pub fn entry_size(store: &dyn ObjectStore, entry: &TreeEntry) -> FsResult<u64> {
    match entry.kind {
        EntryKind::Blob => Ok(store.blob(&entry.id)?.len() as u64),
        EntryKind::Tree => Ok(0),
    }
}

/// Iterate commits from `head` following first parents.
pub struct CommitWalk<'a> {
    store: &'a dyn ObjectStore,
    next: Option<ObjectId>,
}

impl<'a> CommitWalk<'a> {
    pub fn new(store: &'a dyn ObjectStore, head: Option<ObjectId>) -> Self {
        Self { store, next: head }
    }
}

impl Iterator for CommitWalk<'_> {
    type Item = FsResult<(ObjectId, Arc<Commit>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.store.commit(&id) {
            Ok(commit) => {
                self.next = commit.parent.clone();
                Some(Ok((id, commit)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Commits that changed the entry at `components`, newest first.
///
/// A commit touches a path when the entry id there differs from its
/// parent's, including appearance and removal.
pub fn touching_commits(
    store: &dyn ObjectStore,
    head: &ObjectId,
    components: &[&str],
) -> FsResult<Vec<(ObjectId, Arc<Commit>)>> {
    let mut touching = Vec::new();
    let mut pending: Option<(ObjectId, Arc<Commit>, Option<ObjectId>)> = None;

    for item in CommitWalk::new(store, Some(head.clone())) {
        let (id, commit) = item?;
        let here = lookup(store, &commit.tree, components)?.map(|e| e.id);
        if let Some((child_id, child, child_entry)) = pending.take() {
            if child_entry != here {
                touching.push((child_id, child));
            }
        }
        pending = Some((id, commit, here));
    }

    // The root commit touches whatever it contains.
    if let Some((id, commit, Some(_))) = pending {
        touching.push((id, commit));
    }
    Ok(touching)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn empty_root(store: &MemoryStore) -> ObjectId {
        store.put(&Object::tree(Tree::empty())).unwrap()
    }

    fn blob(store: &MemoryStore, data: &[u8]) -> ObjectId {
        store.put(&Object::blob(data)).unwrap()
    }

    #[test]
    fn test_insert_creates_parents() {
        let store = MemoryStore::new();
        let root = empty_root(&store);
        let data = blob(&store, b"hi");
        let root = insert(&store, &root, &["a", "b", "c.txt"], EntryKind::Blob, data.clone()).unwrap();

        let entry = lookup(&store, &root, &["a", "b", "c.txt"]).unwrap().unwrap();
        assert_eq!(entry.id, data);
        assert!(lookup(&store, &root, &["a", "b"]).unwrap().unwrap().is_tree());
        assert!(lookup(&store, &root, &["a", "x"]).unwrap().is_none());
    }

    #[test]
    fn test_sibling_subtrees_are_shared() {
        let store = MemoryStore::new();
        let root = empty_root(&store);
        let one = blob(&store, b"1");
        let root = insert(&store, &root, &["left", "f"], EntryKind::Blob, one.clone()).unwrap();
        let root = insert(&store, &root, &["right", "f"], EntryKind::Blob, one).unwrap();
        let left_before = lookup(&store, &root, &["left"]).unwrap().unwrap().id;

        let two = blob(&store, b"2");
        let root = insert(&store, &root, &["right", "f"], EntryKind::Blob, two).unwrap();
        let left_after = lookup(&store, &root, &["left"]).unwrap().unwrap().id;
        assert_eq!(left_before, left_after);
    }

    #[test]
    fn test_insert_through_blob_fails() {
        let store = MemoryStore::new();
        let root = empty_root(&store);
        let one = blob(&store, b"1");
        let root = insert(&store, &root, &["f"], EntryKind::Blob, one.clone()).unwrap();
        let err = insert(&store, &root, &["f", "g"], EntryKind::Blob, one).unwrap_err();
        assert_eq!(err.kind(), treefs_types::ErrorKind::InvalidArgument);
        assert!(lookup(&store, &root, &["f", "g"]).unwrap().is_none());
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        let root = empty_root(&store);
        let one = blob(&store, b"1");
        let root = insert(&store, &root, &["d", "f"], EntryKind::Blob, one).unwrap();
        let (root, removed) = remove(&store, &root, &["d", "f"]).unwrap();
        assert_eq!(removed.name, "f");
        assert!(lookup(&store, &root, &["d", "f"]).unwrap().is_none());
        assert!(lookup(&store, &root, &["d"]).unwrap().is_some());

        let err = remove(&store, &root, &["d", "f"]).unwrap_err();
        assert_eq!(err.kind(), treefs_types::ErrorKind::NotFound);
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let store = MemoryStore::new();
        let root = empty_root(&store);
        assert!(remove(&store, &root, &[]).is_err());
    }
}
