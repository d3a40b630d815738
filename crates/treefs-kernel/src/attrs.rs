//! Attribute views: named, string-keyed access to derived attributes.
//!
//! Two views exist. `basic` covers size, times, entry type and file key;
//! `version` exposes the commits that touched a path. Names may be bare
//! (`size`, taken from `basic`) or qualified (`version:count`). A selector
//! is a view plus a comma list or `*`, e.g. `basic:size,isDirectory`.

use tokio::sync::OnceCell;
use treefs_types::{AttrMap, AttrValue, BasicAttributes, FsError, FsPath, FsResult, VersionAttributes};

use crate::provider::ProviderRef;

/// Attribute view names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Basic,
    Version,
}

impl View {
    pub fn parse(name: &str) -> FsResult<Self> {
        match name {
            "basic" => Ok(View::Basic),
            "version" => Ok(View::Version),
            other => Err(FsError::unsupported(format!("attribute view '{other}' is not available"))),
        }
    }

    pub fn names(self) -> &'static [&'static str] {
        match self {
            View::Basic => BASIC_NAMES,
            View::Version => VERSION_NAMES,
        }
    }
}

pub const BASIC_NAMES: &[&str] = &[
    "size",
    "lastModifiedTime",
    "lastAccessTime",
    "creationTime",
    "isRegularFile",
    "isDirectory",
    "isSymbolicLink",
    "isOther",
    "fileKey",
];

pub const VERSION_NAMES: &[&str] = &["history", "count"];

/// Split `view:name` into its view and bare name; bare names are basic.
pub fn split_name(qualified: &str) -> FsResult<(View, &str)> {
    match qualified.split_once(':') {
        Some((view, name)) => Ok((View::parse(view)?, name)),
        None => Ok((View::Basic, qualified)),
    }
}

/// Parse a selector into a view and the names it asks for.
pub fn parse_selector(selector: &str) -> FsResult<(View, Vec<&str>)> {
    let (view, list) = split_name(selector)?;
    if list.trim() == "*" {
        return Ok((view, view.names().to_vec()));
    }
    let names: Vec<&str> = list.split(',').map(str::trim).collect();
    if names.iter().any(|n| n.is_empty()) {
        return Err(FsError::invalid_argument(format!("malformed attribute selector '{selector}'")));
    }
    Ok((view, names))
}

fn unknown(view: View, name: &str) -> FsError {
    let view = match view {
        View::Basic => "basic",
        View::Version => "version",
    };
    FsError::unsupported(format!("unknown attribute '{view}:{name}'"))
}

/// Value of one basic attribute.
pub fn basic_value(attrs: &BasicAttributes, name: &str) -> FsResult<AttrValue> {
    Ok(match name {
        "size" => AttrValue::from(attrs.size),
        "lastModifiedTime" => attrs.last_modified.into(),
        "lastAccessTime" => attrs.last_access.into(),
        "creationTime" => attrs.created.into(),
        "isRegularFile" => attrs.is_regular_file.into(),
        "isDirectory" => attrs.is_directory.into(),
        "isSymbolicLink" => attrs.is_symbolic_link.into(),
        "isOther" => attrs.is_other.into(),
        "fileKey" => attrs.file_key.clone().map(AttrValue::from).unwrap_or(AttrValue::Null),
        other => return Err(unknown(View::Basic, other)),
    })
}

/// Value of one version attribute.
pub fn version_value(attrs: &VersionAttributes, name: &str) -> FsResult<AttrValue> {
    Ok(match name {
        "history" => AttrValue::List(
            attrs
                .history
                .iter()
                .map(|r| AttrValue::from(r.commit_id.as_str()))
                .collect(),
        ),
        "count" => AttrValue::from(attrs.history.len() as u64),
        other => return Err(unknown(View::Version, other)),
    })
}

/// Attributes of one path, fetched on first use and then memoised.
///
/// A view is bound to the head current when each part was first read;
/// create a new view to observe later commits.
#[derive(Debug)]
pub struct AttributeView {
    provider: ProviderRef,
    path: FsPath,
    basic: OnceCell<BasicAttributes>,
    version: OnceCell<VersionAttributes>,
}

impl AttributeView {
    pub fn new(provider: ProviderRef, path: FsPath) -> Self {
        Self {
            provider,
            path,
            basic: OnceCell::new(),
            version: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    pub async fn basic(&self) -> FsResult<&BasicAttributes> {
        self.basic
            .get_or_try_init(|| self.provider.basic_attributes(&self.path))
            .await
    }

    pub async fn version(&self) -> FsResult<&VersionAttributes> {
        self.version
            .get_or_try_init(|| self.provider.version_attributes(&self.path))
            .await
    }

    /// One attribute by (optionally qualified) name.
    pub async fn get(&self, name: &str) -> FsResult<AttrValue> {
        let (view, bare) = split_name(name)?;
        self.value(view, bare).await
    }

    async fn value(&self, view: View, name: &str) -> FsResult<AttrValue> {
        if !view.names().contains(&name) {
            return Err(unknown(view, name));
        }
        match view {
            View::Basic => basic_value(self.basic().await?, name),
            View::Version => version_value(self.version().await?, name),
        }
    }

    /// Attributes named by a selector, keyed by bare name.
    pub async fn read(&self, selector: &str) -> FsResult<AttrMap> {
        let (view, names) = parse_selector(selector)?;
        let mut map = AttrMap::new();
        for name in names {
            map.insert(name.to_string(), self.value(view, name).await?);
        }
        Ok(map)
    }
}
