//! Open, copy and commit options.
//!
//! Every mutating call takes a slice of [`FsOption`]. Flags select the
//! create/replace/delete policy; a [`FsOption::Commit`] carries the commit
//! metadata for the single commit the call produces.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Commit metadata attached to one mutating call.
///
/// All fields are optional; absent ones fall back to the configured system
/// identity and the current time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOption {
    pub name: Option<String>,
    pub email: Option<String>,
    pub message: Option<String>,
    pub when: Option<DateTime<FixedOffset>>,
    /// Timezone offset in minutes east of UTC.
    pub timezone_minutes: Option<i32>,
}

impl CommitOption {
    pub fn new() -> Self {
        Self::default()
    }

    /// Author-only option.
    pub fn author(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_when(mut self, when: DateTime<FixedOffset>) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_timezone_minutes(mut self, minutes: i32) -> Self {
        self.timezone_minutes = Some(minutes);
        self
    }

    /// Fill unset fields from `fallback`. Fields already set win.
    pub fn or(self, fallback: &CommitOption) -> CommitOption {
        CommitOption {
            name: self.name.or_else(|| fallback.name.clone()),
            email: self.email.or_else(|| fallback.email.clone()),
            message: self.message.or_else(|| fallback.message.clone()),
            when: self.when.or(fallback.when),
            timezone_minutes: self.timezone_minutes.or(fallback.timezone_minutes),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == CommitOption::default()
    }
}

/// An option accepted by open, write, copy, move and delete calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOption {
    /// Fail with `AlreadyExists` if the target exists.
    CreateNew,
    /// Replace existing content (the default write policy).
    TruncateExisting,
    /// Append to existing content.
    Append,
    /// Materialize missing parent directories.
    CreateParents,
    /// Allow a copy/move to overwrite an existing target.
    ReplaceExisting,
    /// Require the move to happen atomically or not at all.
    AtomicMove,
    /// Delete a tree together with its descendants.
    Recursive,
    /// Commit metadata for the resulting commit.
    Commit(CommitOption),
}

impl FsOption {
    pub fn kind(&self) -> OptionKind {
        match self {
            FsOption::CreateNew => OptionKind::CreateNew,
            FsOption::TruncateExisting => OptionKind::TruncateExisting,
            FsOption::Append => OptionKind::Append,
            FsOption::CreateParents => OptionKind::CreateParents,
            FsOption::ReplaceExisting => OptionKind::ReplaceExisting,
            FsOption::AtomicMove => OptionKind::AtomicMove,
            FsOption::Recursive => OptionKind::Recursive,
            FsOption::Commit(_) => OptionKind::Commit,
        }
    }
}

impl From<CommitOption> for FsOption {
    fn from(option: CommitOption) -> Self {
        FsOption::Commit(option)
    }
}

/// Tag of an [`FsOption`], used for capability declarations and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptionKind {
    CreateNew,
    TruncateExisting,
    Append,
    CreateParents,
    ReplaceExisting,
    AtomicMove,
    Recursive,
    Commit,
}

impl OptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionKind::CreateNew => "create-new",
            OptionKind::TruncateExisting => "truncate-existing",
            OptionKind::Append => "append",
            OptionKind::CreateParents => "create-parents",
            OptionKind::ReplaceExisting => "replace-existing",
            OptionKind::AtomicMove => "atomic-move",
            OptionKind::Recursive => "recursive",
            OptionKind::Commit => "commit",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed view over an option slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    kinds: BTreeSet<OptionKind>,
    commit: CommitOption,
}

impl OptionSet {
    /// Parse options, rejecting contradictory combinations.
    ///
    /// Multiple `Commit` options merge, earlier fields win.
    pub fn parse(options: &[FsOption]) -> FsResult<Self> {
        let mut set = OptionSet::default();
        for option in options {
            if let FsOption::Commit(commit) = option {
                set.commit = std::mem::take(&mut set.commit).or(commit);
            }
            set.kinds.insert(option.kind());
        }
        if set.has(OptionKind::CreateNew) && set.has(OptionKind::Append) {
            return Err(FsError::invalid_argument("create-new and append are mutually exclusive")
                .with_option(OptionKind::Append));
        }
        if set.has(OptionKind::TruncateExisting) && set.has(OptionKind::Append) {
            return Err(FsError::invalid_argument("truncate-existing and append are mutually exclusive")
                .with_option(OptionKind::Append));
        }
        Ok(set)
    }

    pub fn has(&self, kind: OptionKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = OptionKind> + '_ {
        self.kinds.iter().copied()
    }

    pub fn commit(&self) -> &CommitOption {
        &self.commit
    }

    /// Fail with `UnsupportedOperation` for the first kind not in `supported`.
    pub fn ensure_supported(&self, supported: &[OptionKind]) -> FsResult<()> {
        match self.kinds.iter().find(|k| !supported.contains(k)) {
            Some(kind) => Err(FsError::unsupported_option(*kind)),
            None => Ok(()),
        }
    }

    /// Fail with `InvalidArgument` for kinds that make no sense for an operation.
    pub fn ensure_only(&self, operation: &str, allowed: &[OptionKind]) -> FsResult<()> {
        match self.kinds.iter().find(|k| !allowed.contains(k)) {
            Some(kind) => Err(FsError::invalid_argument(format!(
                "option {kind} is not applicable to {operation}"
            ))
            .with_option(*kind)),
            None => Ok(()),
        }
    }
}
