//! Content-addressed object store.
//!
//! Three kinds of immutable objects live in a store:
//!
//! ```text
//! commit ──tree──▶ tree ──entry──▶ tree ──entry──▶ blob
//!   │                  └─entry──▶ blob
//!   └─parent──▶ commit ──tree──▶ ...
//! ```
//!
//! Objects are keyed by the SHA-1 of their type-tagged encoding, so equal
//! content always lands on the same id and unchanged subtrees are shared by
//! reference between tree versions. The only mutable state is the head
//! reference of each segment, advanced with compare-and-swap.
//!
//! - **MemoryStore**: in-process maps
//! - **DiskStore**: loose object files plus ref files under a directory

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use treefs_types::{FsError, FsResult};

/// Hex SHA-1 of an object's encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse a 40-character lowercase hex id.
    pub fn parse(hex: &str) -> FsResult<Self> {
        let valid = hex.len() == 40 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(FsError::invalid_argument(format!("malformed object id: {hex}")));
        }
        Ok(Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First seven characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
}

/// A named child of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            kind,
            id,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind == EntryKind::Tree
    }
}

/// Directory-equivalent node. Entries keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copy with `entry` set; replaces in place when the name exists.
    pub fn with_entry(&self, entry: TreeEntry) -> Tree {
        let mut entries = self.entries.clone();
        match entries.iter_mut().find(|e| e.name == entry.name) {
            Some(slot) => *slot = entry,
            None => entries.push(entry),
        }
        Tree { entries }
    }

    /// Copy without `name`, plus the removed entry if there was one.
    pub fn without(&self, name: &str) -> (Tree, Option<TreeEntry>) {
        let mut entries = self.entries.clone();
        let removed = entries
            .iter()
            .position(|e| e.name == name)
            .map(|idx| entries.remove(idx));
        (Tree { entries }, removed)
    }
}

/// Who made a commit, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<FixedOffset>,
}

/// Append-only history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
    pub author: Signature,
    pub message: String,
}

/// Any stored object. Payloads are shared, never copied on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Arc<[u8]>),
    Tree(Arc<Tree>),
    Commit(Arc<Commit>),
}

impl Object {
    pub fn blob(data: impl Into<Arc<[u8]>>) -> Self {
        Object::Blob(data.into())
    }

    pub fn tree(tree: Tree) -> Self {
        Object::Tree(Arc::new(tree))
    }

    pub fn commit(commit: Commit) -> Self {
        Object::Commit(Arc::new(commit))
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Object::Blob(_) => "blob",
            Object::Tree(_) => "tree",
            Object::Commit(_) => "commit",
        }
    }

    /// Canonical body bytes: raw content for blobs, JSON for trees and commits.
    pub fn encode(&self) -> FsResult<Vec<u8>> {
        match self {
            Object::Blob(data) => Ok(data.to_vec()),
            Object::Tree(tree) => serde_json::to_vec(tree.as_ref()).map_err(encode_error),
            Object::Commit(commit) => serde_json::to_vec(commit.as_ref()).map_err(encode_error),
        }
    }

    pub fn decode(type_tag: &str, body: &[u8]) -> FsResult<Object> {
        match type_tag {
            "blob" => Ok(Object::blob(body)),
            "tree" => serde_json::from_slice(body).map(Object::tree).map_err(decode_error),
            "commit" => serde_json::from_slice(body).map(Object::commit).map_err(decode_error),
            other => Err(FsError::io(format!("unknown object type '{other}'"))),
        }
    }

    /// Content address of this object.
    pub fn id(&self) -> FsResult<ObjectId> {
        Ok(hash_object(self.type_tag(), &self.encode()?))
    }
}

/// SHA-1 over `"<tag> <len>\0<body>"`.
pub fn hash_object(type_tag: &str, body: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(format!("{type_tag} {}\0", body.len()).as_bytes());
    hasher.update(body);
    ObjectId(format!("{:x}", hasher.finalize()))
}

fn encode_error(err: serde_json::Error) -> FsError {
    FsError::io("failed to encode object").with_source(err)
}

fn decode_error(err: serde_json::Error) -> FsError {
    FsError::io("failed to decode object").with_source(err)
}

/// Storage for immutable objects and the mutable segment heads.
///
/// Implementations must make `compare_and_swap_head` atomic: the head moves
/// only if it still equals `expected`.
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Store an object; idempotent for equal content.
    fn put(&self, object: &Object) -> FsResult<ObjectId>;

    /// Fetch an object by id.
    fn get(&self, id: &ObjectId) -> FsResult<Option<Object>>;

    /// Current head commit of a segment, `None` if the segment does not exist.
    fn head(&self, segment: &str) -> FsResult<Option<ObjectId>>;

    /// Advance a segment head if it still equals `expected`.
    ///
    /// `expected = None` creates the segment. Returns `false` on mismatch.
    fn compare_and_swap_head(
        &self,
        segment: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> FsResult<bool>;

    /// All segment names, sorted.
    fn segments(&self) -> FsResult<Vec<String>>;
}

/// Typed accessors. A missing object reachable from a head is a broken
/// store, reported as `IoFailure`.
pub trait ObjectStoreExt {
    fn blob(&self, id: &ObjectId) -> FsResult<Arc<[u8]>>;
    fn tree(&self, id: &ObjectId) -> FsResult<Arc<Tree>>;
    fn commit(&self, id: &ObjectId) -> FsResult<Arc<Commit>>;
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {
    fn blob(&self, id: &ObjectId) -> FsResult<Arc<[u8]>> {
        match self.get(id)? {
            Some(Object::Blob(data)) => Ok(data),
            Some(other) => Err(wrong_type(id, "blob", other.type_tag())),
            None => Err(dangling(id)),
        }
    }

    fn tree(&self, id: &ObjectId) -> FsResult<Arc<Tree>> {
        match self.get(id)? {
            Some(Object::Tree(tree)) => Ok(tree),
            Some(other) => Err(wrong_type(id, "tree", other.type_tag())),
            None => Err(dangling(id)),
        }
    }

    fn commit(&self, id: &ObjectId) -> FsResult<Arc<Commit>> {
        match self.get(id)? {
            Some(Object::Commit(commit)) => Ok(commit),
            Some(other) => Err(wrong_type(id, "commit", other.type_tag())),
            None => Err(dangling(id)),
        }
    }
}

fn dangling(id: &ObjectId) -> FsError {
    FsError::io(format!("dangling object reference {id}"))
}

fn wrong_type(id: &ObjectId, expected: &str, found: &str) -> FsError {
    FsError::io(format!("object {id} is a {found}, expected a {expected}"))
}
