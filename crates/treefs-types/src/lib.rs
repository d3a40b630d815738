//! treefs-types: pure data types shared by every treefs crate.
//!
//! - **Paths**: [`FsPath`] and the URI grammar that addresses filesystems and segments
//! - **Options**: [`FsOption`], [`OptionSet`] and [`CommitOption`]
//! - **Errors**: the backend-agnostic [`ErrorKind`] taxonomy carried by [`FsError`]
//! - **Attributes**: [`AttrValue`], [`BasicAttributes`], [`VersionAttributes`]
//! - **Watch events**: [`WatchContext`]

pub mod attrs;
pub mod error;
pub mod options;
pub mod path;
pub mod watch;

pub use attrs::{
    AttrMap, AttrValue, BasicAttributes, FileAttribute, VersionAttributes, VersionRecord,
};
pub use error::{ErrorKind, FsError, FsResult};
pub use options::{CommitOption, FsOption, OptionKind, OptionSet};
pub use path::{DEFAULT_SEGMENT, FileSystemKind, FsPath, HOST_FS_ID, normalize_key};
pub use watch::{WatchContext, WatchEventKind};
