//! Backend-agnostic error taxonomy.
//!
//! Every failure in treefs is an [`FsError`]: a kind tag from [`ErrorKind`]
//! plus whatever context the failing layer knows (the offending path, the
//! offending option, an underlying cause).

use std::fmt;
use std::io;

use thiserror::Error;

use crate::options::OptionKind;

/// What went wrong, independent of which backend reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: bad URI, illegal path component, wrong entry type.
    InvalidArgument,
    /// The path, filesystem or segment does not exist.
    NotFound,
    /// The target already exists and the call did not allow replacing it.
    AlreadyExists,
    /// A tree with children was asked to go away without `Recursive`.
    DirectoryNotEmpty,
    /// The backend does not support the operation or option combination.
    UnsupportedOperation,
    /// An atomic move was required but cannot be guaranteed.
    AtomicMoveNotSupported,
    /// The segment head moved while a mutation was being built.
    ConcurrentModification,
    /// Storage or transport failure.
    IoFailure,
    /// An access check refused the operation.
    SecurityDenied,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::DirectoryNotEmpty => "directory not empty",
            ErrorKind::UnsupportedOperation => "unsupported operation",
            ErrorKind::AtomicMoveNotSupported => "atomic move not supported",
            ErrorKind::ConcurrentModification => "concurrent modification",
            ErrorKind::IoFailure => "i/o failure",
            ErrorKind::SecurityDenied => "security denied",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A treefs failure: kind plus context payload.
#[derive(Debug, Error)]
#[error("{kind}: {message}{}", .path.as_ref().map(|p| format!(" ({p})")).unwrap_or_default())]
pub struct FsError {
    kind: ErrorKind,
    message: String,
    path: Option<String>,
    option: Option<OptionKind>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

/// Convenience result type for treefs operations.
pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            option: None,
            source: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, "no such file").with_path(path)
    }

    pub fn already_exists(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AlreadyExists, "file already exists").with_path(path)
    }

    pub fn directory_not_empty(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::DirectoryNotEmpty, "directory not empty").with_path(path)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedOperation, message)
    }

    /// An option the backend does not implement.
    pub fn unsupported_option(option: OptionKind) -> Self {
        Self::new(
            ErrorKind::UnsupportedOperation,
            format!("option {option} is not supported by this filesystem"),
        )
        .with_option(option)
    }

    pub fn atomic_move_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AtomicMoveNotSupported, message).with_option(OptionKind::AtomicMove)
    }

    pub fn concurrent_modification(segment: &str) -> Self {
        Self::new(
            ErrorKind::ConcurrentModification,
            format!("head of segment '{segment}' moved during update"),
        )
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoFailure, message)
    }

    pub fn security_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityDenied, message)
    }

    pub fn with_path(mut self, path: impl fmt::Display) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_option(mut self, option: OptionKind) -> Self {
        self.option = Some(option);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn option(&self) -> Option<OptionKind> {
        self.option
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::DirectoryNotEmpty => ErrorKind::DirectoryNotEmpty,
            io::ErrorKind::PermissionDenied => ErrorKind::SecurityDenied,
            io::ErrorKind::InvalidInput
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::NotADirectory => ErrorKind::InvalidArgument,
            io::ErrorKind::Unsupported => ErrorKind::UnsupportedOperation,
            _ => ErrorKind::IoFailure,
        };
        FsError::new(kind, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_path() {
        let err = FsError::not_found("git://master@repo/a.txt");
        assert_eq!(err.to_string(), "not found: no such file (git://master@repo/a.txt)");
    }

    #[test]
    fn test_io_error_mapping() {
        let err: FsError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is(ErrorKind::NotFound));

        let err: FsError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(err.is(ErrorKind::SecurityDenied));

        let err: FsError = io::Error::other("disk on fire").into();
        assert!(err.is(ErrorKind::IoFailure));
    }

    #[test]
    fn test_unsupported_option_carries_option() {
        let err = FsError::unsupported_option(OptionKind::Append);
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(err.option(), Some(OptionKind::Append));
    }
}
