//! Multi-operation batches committed as one commit.

use treefs_types::{CommitOption, FsOption, FsPath, FsResult, OptionSet};

use crate::provider::{BatchOp, ProviderRef};
use crate::security::{AccessAction, AccessPolicy};

/// Collects writes, deletes, moves and directory creations against one
/// segment and applies them in a single commit.
///
/// ```ignore
/// let commit = service
///     .batch("repo", "master")?
///     .write(a, b"one".to_vec())
///     .move_path(b, c, false)
///     .with_commit(CommitOption::author("amy").with_message("reshuffle"))
///     .commit()
///     .await?;
/// ```
#[derive(Debug)]
pub struct Batch<'a> {
    provider: ProviderRef,
    policy: &'a dyn AccessPolicy,
    segment: String,
    ops: Vec<BatchOp>,
    commit: Option<CommitOption>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(provider: ProviderRef, policy: &'a dyn AccessPolicy, segment: impl Into<String>) -> Self {
        Self {
            provider,
            policy,
            segment: segment.into(),
            ops: Vec::new(),
            commit: None,
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Create or replace a file; parents are created as needed.
    pub fn write(mut self, path: FsPath, data: impl Into<Vec<u8>>) -> Self {
        self.ops.push(BatchOp::Write {
            path,
            data: data.into(),
        });
        self
    }

    pub fn create_directory(mut self, path: FsPath) -> Self {
        self.ops.push(BatchOp::CreateDirectory { path });
        self
    }

    pub fn delete(mut self, path: FsPath, recursive: bool) -> Self {
        self.ops.push(BatchOp::Delete { path, recursive });
        self
    }

    pub fn move_path(mut self, from: FsPath, to: FsPath, replace_existing: bool) -> Self {
        self.ops.push(BatchOp::Move {
            from,
            to,
            replace_existing,
        });
        self
    }

    /// Metadata for the resulting commit.
    pub fn with_commit(mut self, commit: CommitOption) -> Self {
        self.commit = Some(commit);
        self
    }

    /// Apply every step in one commit and return its id.
    ///
    /// Access checks run for every path before anything is written. If any
    /// step fails the segment is left untouched.
    pub async fn commit(self) -> FsResult<String> {
        for op in &self.ops {
            match op {
                BatchOp::Write { path, .. } | BatchOp::CreateDirectory { path } => {
                    self.policy.check(AccessAction::Write, path)?;
                }
                BatchOp::Delete { path, .. } => self.policy.check(AccessAction::Delete, path)?,
                BatchOp::Move { from, to, .. } => {
                    self.policy.check(AccessAction::Delete, from)?;
                    self.policy.check(AccessAction::Write, to)?;
                }
            }
        }
        let options: Vec<FsOption> = self.commit.into_iter().map(FsOption::Commit).collect();
        let options = OptionSet::parse(&options)?;
        self.provider.commit_batch(&self.segment, self.ops, &options).await
    }
}
