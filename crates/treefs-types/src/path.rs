//! Filesystem addressing.
//!
//! An [`FsPath`] names one entry: which filesystem, which segment of it, and
//! the normalized key inside that segment's tree.
//!
//! ```text
//! git://master@repo/docs/a.txt
//! └┬┘   └─┬──┘ └┬─┘└────┬────┘
//! kind  segment fs-id   key
//!
//! file:///tmp/a.txt     (host filesystem, no segment)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::{FsError, FsResult};

/// Segment used when a URI does not name one.
pub const DEFAULT_SEGMENT: &str = "master";

/// Filesystem id of the host passthrough filesystem.
pub const HOST_FS_ID: &str = "host";

/// Which kind of backend a filesystem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileSystemKind {
    /// Versioned tree/blob/commit graph with segments.
    ObjectStore,
    /// Direct delegation to the host operating system.
    Host,
}

impl FileSystemKind {
    pub fn scheme(self) -> &'static str {
        match self {
            FileSystemKind::ObjectStore => "git",
            FileSystemKind::Host => "file",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "git" => Some(FileSystemKind::ObjectStore),
            "file" => Some(FileSystemKind::Host),
            _ => None,
        }
    }
}

impl fmt::Display for FileSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSystemKind::ObjectStore => f.write_str("object-store"),
            FileSystemKind::Host => f.write_str("host"),
        }
    }
}

/// A path inside one segment of one filesystem.
///
/// Immutable value. Equality covers kind, filesystem id, segment and the
/// normalized key; nothing about the backing graph is cached here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FsPath {
    kind: FileSystemKind,
    fs_id: String,
    segment: String,
    key: String,
}

impl FsPath {
    /// Build a path from parts, validating identifiers and normalizing the key.
    pub fn new(
        kind: FileSystemKind,
        fs_id: impl Into<String>,
        segment: impl Into<String>,
        key: &str,
    ) -> FsResult<Self> {
        let fs_id = fs_id.into();
        let segment = segment.into();
        validate_identifier("filesystem id", &fs_id)?;
        match kind {
            FileSystemKind::ObjectStore => validate_identifier("segment", &segment)?,
            FileSystemKind::Host if !segment.is_empty() => {
                return Err(FsError::invalid_argument("host paths have no segment"));
            }
            FileSystemKind::Host => {}
        }
        Ok(Self {
            kind,
            fs_id,
            segment,
            key: normalize_key(key)?,
        })
    }

    /// Path in an object-store filesystem.
    pub fn object(fs_id: impl Into<String>, segment: impl Into<String>, key: &str) -> FsResult<Self> {
        Self::new(FileSystemKind::ObjectStore, fs_id, segment, key)
    }

    /// Absolute path on the host filesystem.
    pub fn host(key: &str) -> FsResult<Self> {
        Self::new(FileSystemKind::Host, HOST_FS_ID, "", key)
    }

    /// Parse a URI or absolute host path using [`DEFAULT_SEGMENT`].
    pub fn parse(input: &str) -> FsResult<Self> {
        Self::parse_with_default_segment(input, DEFAULT_SEGMENT)
    }

    /// Parse a URI or absolute host path.
    ///
    /// Accepted forms:
    /// - `git://segment@fs-id/key` or `git://fs-id/key` (default segment)
    /// - `file:///abs/key`
    /// - `/abs/key` (host)
    pub fn parse_with_default_segment(input: &str, default_segment: &str) -> FsResult<Self> {
        if input.is_empty() {
            return Err(FsError::invalid_argument("empty path"));
        }

        let Some((scheme, rest)) = input.split_once("://") else {
            if input.starts_with('/') {
                return Self::host(input);
            }
            return Err(FsError::invalid_argument(format!(
                "path must be absolute or a URI: {input}"
            )));
        };

        match FileSystemKind::from_scheme(scheme) {
            Some(FileSystemKind::ObjectStore) => {
                let (authority, key) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                let (segment, fs_id) = match authority.split_once('@') {
                    Some((segment, fs_id)) => (segment, fs_id),
                    None => (default_segment, authority),
                };
                Self::object(fs_id, segment, key)
            }
            Some(FileSystemKind::Host) => {
                if !rest.starts_with('/') {
                    return Err(FsError::invalid_argument(format!(
                        "file URI must have an empty authority: {input}"
                    )));
                }
                Self::host(rest)
            }
            None => Err(FsError::invalid_argument(format!(
                "unsupported scheme '{scheme}' in {input}"
            ))),
        }
    }

    pub fn kind(&self) -> FileSystemKind {
        self.kind
    }

    pub fn fs_id(&self) -> &str {
        &self.fs_id
    }

    /// Segment id; empty for host paths.
    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Normalized absolute key, `/` for the root.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_root(&self) -> bool {
        self.key == "/"
    }

    /// Key components, root excluded.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.key.split('/').filter(|c| !c.is_empty())
    }

    /// Last component; `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.components().last()
    }

    /// Parent path; `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        let idx = self.key.rfind('/').unwrap_or(0);
        let parent = if idx == 0 { "/" } else { &self.key[..idx] };
        Some(self.with_normalized_key(parent.to_string()))
    }

    /// Root of the same filesystem and segment.
    pub fn root(&self) -> FsPath {
        self.with_normalized_key("/".to_string())
    }

    /// Resolve `other` against this path. Absolute `other` replaces the key.
    pub fn join(&self, other: &str) -> FsResult<FsPath> {
        let joined = if other.starts_with('/') {
            other.to_string()
        } else {
            format!("{}/{}", self.key, other)
        };
        Ok(self.with_normalized_key(normalize_key(&joined)?))
    }

    /// Resolve `other` against this path's parent.
    pub fn resolve_sibling(&self, other: &str) -> FsResult<FsPath> {
        match self.parent() {
            Some(parent) => parent.join(other),
            None => self.join(other),
        }
    }

    /// Same key in another segment of the same filesystem.
    pub fn with_segment(&self, segment: &str) -> FsResult<FsPath> {
        Self::new(self.kind, self.fs_id.clone(), segment, &self.key)
    }

    /// True if `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &FsPath) -> bool {
        if self.kind != prefix.kind || self.fs_id != prefix.fs_id || self.segment != prefix.segment {
            return false;
        }
        let mut mine = self.components();
        prefix.components().all(|c| mine.next() == Some(c))
    }

    /// Canonical URI form; includes filesystem and segment.
    pub fn to_uri(&self) -> String {
        match self.kind {
            FileSystemKind::ObjectStore => {
                format!("git://{}@{}{}", self.segment, self.fs_id, self.key)
            }
            FileSystemKind::Host => format!("file://{}", self.key),
        }
    }

    fn with_normalized_key(&self, key: String) -> FsPath {
        FsPath {
            kind: self.kind,
            fs_id: self.fs_id.clone(),
            segment: self.segment.clone(),
            key,
        }
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for FsPath {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FsPath::parse(s)
    }
}

impl TryFrom<String> for FsPath {
    type Error = FsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FsPath::parse(&value)
    }
}

impl From<FsPath> for String {
    fn from(path: FsPath) -> Self {
        path.to_uri()
    }
}

/// Normalize a key: NFC, drop empty and `.` components, resolve `..`.
///
/// Relative keys are taken from the root. `..` above the root and NUL
/// bytes are rejected.
pub fn normalize_key(key: &str) -> FsResult<String> {
    if key.contains('\0') {
        return Err(FsError::invalid_argument("path contains NUL character"));
    }
    let mut parts: Vec<String> = Vec::new();
    for component in key.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(FsError::invalid_argument(format!(
                        "path escapes root: {key}"
                    )));
                }
            }
            name => parts.push(name.nfc().collect()),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

fn validate_identifier(what: &str, id: &str) -> FsResult<()> {
    if id.is_empty() {
        return Err(FsError::invalid_argument(format!("{what} cannot be empty")));
    }
    // Ids name directories and ref files in disk stores.
    if id == "." || id == ".." || id.starts_with(".tmp-") {
        return Err(FsError::invalid_argument(format!("{what} '{id}' is reserved")));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(FsError::invalid_argument(format!(
            "{what} '{id}' contains illegal character {bad:?}"
        )));
    }
    Ok(())
}
