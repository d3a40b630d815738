//! On-disk object store.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/ab/cdef0123...   "<type>\n" followed by the object body
//! refs/<segment>           hex id of the head commit
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so
//! readers never observe a partial object or head. Head updates are
//! serialized by an in-process lock.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};
use treefs_types::{FsError, FsResult};

use super::{Object, ObjectId, ObjectStore};

/// Loose-object store rooted at a directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    ref_lock: Mutex<()>,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Open (creating if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> FsResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects")).map_err(|e| io_error("create objects dir", &root, e))?;
        fs::create_dir_all(root.join("refs")).map_err(|e| io_error("create refs dir", &root, e))?;
        debug!(root = %root.display(), "opened disk store");
        Ok(Self {
            root,
            ref_lock: Mutex::new(()),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.as_str();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, segment: &str) -> PathBuf {
        self.root.join("refs").join(segment)
    }

    /// Write `contents` to `target` via a temporary file and rename.
    fn write_atomic(&self, target: &Path, contents: &[u8]) -> io::Result<()> {
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".tmp-{}-{n}", std::process::id()));
        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
            fs::rename(&tmp, target)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

fn io_error(action: &str, path: &Path, err: io::Error) -> FsError {
    FsError::io(format!("failed to {action}"))
        .with_path(path.display())
        .with_source(err)
}

impl ObjectStore for DiskStore {
    fn put(&self, object: &Object) -> FsResult<ObjectId> {
        let body = object.encode()?;
        let id = super::hash_object(object.type_tag(), &body);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        let mut contents = Vec::with_capacity(body.len() + 8);
        contents.extend_from_slice(object.type_tag().as_bytes());
        contents.push(b'\n');
        contents.extend_from_slice(&body);
        self.write_atomic(&path, &contents)
            .map_err(|e| io_error("write object", &path, e))?;
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> FsResult<Option<Object>> {
        let path = self.object_path(id);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read object", &path, e)),
        };
        let Some(split) = contents.iter().position(|b| *b == b'\n') else {
            return Err(FsError::io("object file has no type header").with_path(path.display()));
        };
        let tag = std::str::from_utf8(&contents[..split])
            .map_err(|_| FsError::io("object type header is not UTF-8").with_path(path.display()))?;
        Object::decode(tag, &contents[split + 1..]).map(Some)
    }

    fn head(&self, segment: &str) -> FsResult<Option<ObjectId>> {
        let path = self.ref_path(segment);
        match fs::read_to_string(&path) {
            Ok(text) => ObjectId::parse(text.trim()).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read ref", &path, e)),
        }
    }

    fn compare_and_swap_head(
        &self,
        segment: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> FsResult<bool> {
        let _guard = self
            .ref_lock
            .lock()
            .map_err(|_| FsError::io("disk store ref lock poisoned"))?;
        let current = self.head(segment)?;
        if current.as_ref() != expected {
            return Ok(false);
        }
        let path = self.ref_path(segment);
        self.write_atomic(&path, format!("{new}\n").as_bytes())
            .map_err(|e| io_error("write ref", &path, e))?;
        Ok(true)
    }

    fn segments(&self) -> FsResult<Vec<String>> {
        let dir = self.root.join("refs");
        let entries = fs::read_dir(&dir).map_err(|e| io_error("list refs", &dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("list refs", &dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                continue;
            }
            if !entry.path().is_file() {
                warn!(path = %entry.path().display(), "ignoring non-file entry in refs");
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}
