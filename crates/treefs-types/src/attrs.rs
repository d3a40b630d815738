//! Attribute values and derived attribute records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Time(DateTime<FixedOffset>),
    Text(String),
    List(Vec<AttrValue>),
    Null,
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            AttrValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(n) => write!(f, "{n}"),
            AttrValue::Text(s) => f.write_str(s),
            AttrValue::Time(t) => write!(f, "{}", t.to_rfc3339()),
            AttrValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            AttrValue::Null => f.write_str("null"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        AttrValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<DateTime<FixedOffset>> for AttrValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        AttrValue::Time(value)
    }
}

/// Attributes keyed by name, as returned by `read_attributes`.
pub type AttrMap = BTreeMap<String, AttrValue>;

/// A named attribute supplied by a caller, e.g. when deriving an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttribute {
    pub name: String,
    pub value: AttrValue,
}

impl FileAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Basic attributes of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAttributes {
    /// Content length in bytes (0 for directories).
    pub size: u64,
    pub last_modified: DateTime<FixedOffset>,
    pub last_access: DateTime<FixedOffset>,
    pub created: DateTime<FixedOffset>,
    pub is_directory: bool,
    pub is_regular_file: bool,
    pub is_symbolic_link: bool,
    pub is_other: bool,
    /// Backend identity of the content (object id or inode-like key).
    pub file_key: Option<String>,
}

/// One commit in the history of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub commit_id: String,
    pub author: String,
    pub email: String,
    pub message: String,
    pub time: DateTime<FixedOffset>,
}

/// History of a path, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAttributes {
    pub history: Vec<VersionRecord>,
}
