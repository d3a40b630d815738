//! Access checks applied by the facade before dispatching to a provider.

use std::fmt;

use treefs_types::{FsError, FsPath, FsResult};

/// What a caller is about to do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessAction {
    Read,
    List,
    ReadAttributes,
    Write,
    Delete,
    SetAttributes,
    Watch,
}

impl AccessAction {
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            AccessAction::Write | AccessAction::Delete | AccessAction::SetAttributes
        )
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessAction::Read => "read",
            AccessAction::List => "list",
            AccessAction::ReadAttributes => "read attributes of",
            AccessAction::Write => "write",
            AccessAction::Delete => "delete",
            AccessAction::SetAttributes => "set attributes of",
            AccessAction::Watch => "watch",
        };
        f.write_str(name)
    }
}

/// Pluggable access policy. Denials are `SecurityDenied` errors.
pub trait AccessPolicy: Send + Sync + fmt::Debug {
    fn check(&self, action: AccessAction, path: &FsPath) -> FsResult<()>;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _action: AccessAction, _path: &FsPath) -> FsResult<()> {
        Ok(())
    }
}

/// Denies every mutation, on every filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyMutations;

impl AccessPolicy for DenyMutations {
    fn check(&self, action: AccessAction, path: &FsPath) -> FsResult<()> {
        if action.is_mutation() {
            return Err(FsError::security_denied(format!("not allowed to {action}")).with_path(path));
        }
        Ok(())
    }
}
