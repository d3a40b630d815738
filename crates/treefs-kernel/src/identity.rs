//! Stable identities for paths.
//!
//! An identity is derived purely from a path's URI: the same path always
//! yields the same id regardless of content, and the id changes when the
//! path (including filesystem and segment) changes.

use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use treefs_types::{AttrValue, FileAttribute, FsPath};

/// Identity namespace of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaType(Cow<'static, str>);

impl MetaType {
    /// Meta type of every filesystem path.
    pub const PATH: MetaType = MetaType(Cow::Borrowed("treefs.path"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA-1 of `"<type>|<key>"`.
pub fn identity_id(meta_type: &MetaType, key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(meta_type.name().as_bytes());
    hasher.update(b"|");
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Addressing data for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub id: String,
    pub meta_type: MetaType,
    /// Filesystem id.
    pub cluster_id: String,
    /// Segment id; empty for host paths.
    pub segment_id: String,
    /// Canonical URI of the path.
    pub key: String,
}

impl IdentityKey {
    pub fn for_path(path: &FsPath) -> Self {
        let key = path.to_uri();
        Self {
            id: identity_id(&MetaType::PATH, &key),
            meta_type: MetaType::PATH,
            cluster_id: path.fs_id().to_string(),
            segment_id: path.segment().to_string(),
            key,
        }
    }
}

/// A searchable property of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: AttrValue,
    pub searchable: bool,
}

impl Property {
    fn searchable(name: &str, value: impl Into<AttrValue>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            searchable: true,
        }
    }
}

/// Identity of a path plus its derived properties.
///
/// Properties are built on first access and cached.
#[derive(Debug, Clone)]
pub struct IdentityObject {
    key: IdentityKey,
    /// `None` for a root path.
    file_name: Option<String>,
    attributes: Vec<FileAttribute>,
    properties: OnceLock<Vec<Property>>,
}

impl IdentityObject {
    pub fn new(path: &FsPath, attributes: Vec<FileAttribute>) -> Self {
        Self {
            key: IdentityKey::for_path(path),
            file_name: path.file_name().map(str::to_owned),
            attributes,
            properties: OnceLock::new(),
        }
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Supplied attributes first, then `filename`, `extension` and `basename`.
    pub fn properties(&self) -> &[Property] {
        self.properties.get_or_init(|| {
            let mut props: Vec<Property> = self
                .attributes
                .iter()
                .map(|a| Property::searchable(&a.name, a.value.clone()))
                .collect();
            let name = self.file_name.as_deref();
            props.push(Property::searchable("filename", name.unwrap_or("/")));
            props.push(Property::searchable("extension", name.map(extension).unwrap_or("")));
            props.push(Property::searchable("basename", name.map(base_name).unwrap_or("")));
            props
        })
    }

    pub fn property(&self, name: &str) -> Option<&AttrValue> {
        self.properties().iter().find(|p| p.name == name).map(|p| &p.value)
    }
}

impl PartialEq for IdentityObject {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.attributes == other.attributes
    }
}

/// Text after the last `.`, or empty.
pub fn extension(file_name: &str) -> &str {
    file_name.rfind('.').map(|idx| &file_name[idx + 1..]).unwrap_or("")
}

/// File name with the extension and its dot removed.
pub fn base_name(file_name: &str) -> &str {
    file_name.rfind('.').map(|idx| &file_name[..idx]).unwrap_or(file_name)
}
