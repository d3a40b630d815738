//! Service and filesystem configuration.
//!
//! Everything has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! default_segment = "master"
//! mount_host = true
//! # temp_dir = "git://scratch/tmp"
//!
//! [identity]
//! name = "system"
//! email = "system@treefs.local"
//! timezone_minutes = 0
//!
//! [commit]
//! max_attempts = 5
//! backoff_ms = 2
//! max_backoff_ms = 50
//!
//! [watch]
//! dispose_timeout_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use treefs_types::{CommitOption, DEFAULT_SEGMENT};

use crate::paths;

/// Identity used for commits that carry no explicit author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name: String,
    pub email: String,
    /// Offset east of UTC applied to commit timestamps.
    pub timezone_minutes: i32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "system".to_string(),
            email: "system@treefs.local".to_string(),
            timezone_minutes: 0,
        }
    }
}

impl IdentityConfig {
    /// Fallback commit metadata.
    pub fn as_commit_option(&self) -> CommitOption {
        CommitOption::author(self.name.clone())
            .with_email(self.email.clone())
            .with_timezone_minutes(self.timezone_minutes)
    }
}

/// Optimistic commit retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Attempts per mutating call, including the first; at least 1.
    pub max_attempts: u32,
    /// Sleep before the first retry; doubles on each further retry.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 2,
            max_backoff_ms: 50,
        }
    }
}

impl CommitConfig {
    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Watch service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// How long `dispose` waits for an in-flight handler before aborting it.
    pub dispose_timeout_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dispose_timeout_ms: 500,
        }
    }
}

impl WatchConfig {
    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Segment used when a URI names none.
    pub default_segment: String,
    /// Register the host filesystem under the `host` id.
    pub mount_host: bool,
    /// Directory URI for temp files created without a directory. Defaults
    /// to the host's temp directory.
    pub temp_dir: Option<String>,
    pub identity: IdentityConfig,
    pub commit: CommitConfig,
    pub watch: WatchConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_segment: DEFAULT_SEGMENT.to_string(),
            mount_host: true,
            temp_dir: None,
            identity: IdentityConfig::default(),
            commit: CommitConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Config without the host mount and with a short dispose timeout,
    /// for sandboxed and test use.
    pub fn transient() -> Self {
        Self {
            mount_host: false,
            watch: WatchConfig {
                dispose_timeout_ms: 100,
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse service config")
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Load `$XDG_CONFIG_HOME/treefs/config.toml`, or defaults if it is absent.
    pub fn load_default() -> Result<Self> {
        let path = paths::config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}

/// Where a filesystem keeps its objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    /// Loose objects on disk; `root` defaults to `repos_dir()/<fs-id>`.
    Disk { root: Option<PathBuf> },
}

/// Per-filesystem settings passed to `new_file_system`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemConfig {
    pub read_only: bool,
    pub storage: StorageConfig,
    /// Segments created (with an empty initial commit) if missing.
    pub init_segments: Vec<String>,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            storage: StorageConfig::Memory,
            init_segments: vec![DEFAULT_SEGMENT.to_string()],
        }
    }
}

impl FileSystemConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn disk(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::Disk {
                root: Some(root.into()),
            },
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_segments(mut self, segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.init_segments = segments.into_iter().map(Into::into).collect();
        self
    }

    /// Resolved disk root for filesystem `fs_id`, if disk-backed.
    pub fn disk_root(&self, fs_id: &str) -> Option<PathBuf> {
        match &self.storage {
            StorageConfig::Memory => None,
            StorageConfig::Disk { root: Some(root) } => Some(root.clone()),
            StorageConfig::Disk { root: None } => Some(paths::repos_dir().join(fs_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            default_segment = "main"
            temp_dir = "git://scratch/tmp"

            [identity]
            name = "amy"

            [commit]
            max_attempts = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.default_segment, "main");
        assert_eq!(config.temp_dir.as_deref(), Some("git://scratch/tmp"));
        assert_eq!(config.identity.name, "amy");
        assert_eq!(config.identity.email, "system@treefs.local");
        assert_eq!(config.commit.max_attempts, 1);
        assert_eq!(config.commit.backoff_ms, 2);
    }

    #[test]
    fn test_bad_toml_is_error() {
        assert!(ServiceConfig::from_toml_str("commit = 5").is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let commit = CommitConfig::default();
        assert_eq!(commit.backoff(1), Duration::from_millis(2));
        assert_eq!(commit.backoff(2), Duration::from_millis(4));
        assert_eq!(commit.backoff(3), Duration::from_millis(8));
        assert_eq!(commit.backoff(10), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let commit = CommitConfig {
            max_attempts: 0,
            ..CommitConfig::default()
        };
        assert_eq!(commit.attempts(), 1);
    }

    #[test]
    fn test_filesystem_storage_toml() {
        let fs: FileSystemConfig = toml::from_str(
            r#"
            read_only = true
            init_segments = ["master", "dev"]

            [storage]
            type = "disk"
            root = "/var/lib/treefs/docs"
            "#,
        )
        .unwrap();
        assert!(fs.read_only);
        assert_eq!(fs.init_segments, vec!["master", "dev"]);
        assert_eq!(fs.disk_root("docs"), Some(PathBuf::from("/var/lib/treefs/docs")));
    }

    #[test]
    fn test_disk_root_defaults_under_repos() {
        let fs = FileSystemConfig {
            storage: StorageConfig::Disk { root: None },
            ..FileSystemConfig::default()
        };
        let root = fs.disk_root("docs").unwrap();
        assert!(root.starts_with(paths::repos_dir()));
        assert!(root.ends_with("docs"));
        assert_eq!(FileSystemConfig::memory().disk_root("docs"), None);
    }
}
