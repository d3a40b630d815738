//! treefs-kernel: a POSIX-like file API over versioned object stores.
//!
//! This crate provides:
//!
//! - **Store**: content-addressed blobs, trees and commits with per-segment heads
//! - **Graph**: structural-sharing tree edits and history walks
//! - **Providers**: the object-store filesystem and a host passthrough
//! - **Attributes**: basic and version attribute views derived from history
//! - **Watch**: ordered change events for subscribers
//! - **Identity**: stable hash-keyed identity objects for indexers
//! - **IoService**: the facade that ties the registry, policy and providers together
//!
//! # Example
//!
//! ```ignore
//! let service = IoService::new(ServiceConfig::transient())?;
//! service.new_file_system("git://docs", FileSystemConfig::memory())?;
//!
//! let a = service.get_uri("git://docs/notes/a.txt")?;
//! service.write_string(&a, "hello", &[FsOption::CreateNew]).await?;
//! let b = service.move_path(&a, &a.resolve_sibling("b.txt")?, &[]).await?;
//! assert_eq!(service.size(&b).await?, 5);
//! ```

pub mod attrs;
pub mod batch;
pub mod config;
pub mod graph;
pub mod identity;
pub mod paths;
pub mod provider;
pub mod registry;
pub mod security;
pub mod service;
pub mod store;
pub mod stream;
pub mod watch;

pub use attrs::AttributeView;
pub use batch::Batch;
pub use config::{FileSystemConfig, ServiceConfig, StorageConfig};
pub use identity::{IdentityKey, IdentityObject, MetaType};
pub use provider::{BatchOp, EntryInfo, FilesystemProvider, HostProvider, ObjectStoreProvider, ProviderRef};
pub use registry::{FileSystem, FileSystemRegistry};
pub use security::{AccessAction, AccessPolicy, AllowAll, DenyMutations};
pub use service::IoService;
pub use store::{DiskStore, MemoryStore, ObjectId, ObjectStore};
pub use stream::{ByteChannel, DirectoryStream, InputStream, OutputStream, PathFilter};
pub use watch::{Subscription, SubscriptionState, WatchHandler, WatchHub};

pub use treefs_types as types;
