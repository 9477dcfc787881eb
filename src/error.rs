//! Error types for sandboxed execution.
//!
//! Request-shape problems, confinement failures and environment failures are
//! typed errors. A non-zero exit or a timeout is not an error: it is reported
//! inside [`ExecutionResult`](crate::executor::ExecutionResult).

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// A path resolved outside its boundary, or a project root that is not a
/// usable directory.
#[derive(Error, Debug)]
#[error("Path '{}' {reason}", path.display())]
pub struct PathViolation {
    /// The offending input, exactly as the caller supplied it.
    pub path: PathBuf,
    /// Why the path was rejected.
    pub reason: String,
}

impl PathViolation {
    pub(crate) fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for the sandbox core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, missing working directory, or a spawn/IO failure
    /// not attributable to the child itself.
    #[error("{0}")]
    Execution(String),

    /// A working directory tried to escape the project root.
    #[error("Security violation: {0}")]
    SecurityViolation(#[source] PathViolation),

    /// The project root itself is invalid.
    #[error(transparent)]
    PathViolation(#[from] PathViolation),

    /// Environment creation, repair or package installation failed.
    #[error("Environment error: {0}")]
    Environment(String),
}

impl Error {
    /// Stable machine-readable kind string.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::SecurityViolation(_) => "SECURITY_ERROR",
            Self::PathViolation(_) => "PATH_VIOLATION",
            Self::Environment(_) => "ENVIRONMENT_ERROR",
        }
    }

    /// The caller sent something malformed.
    pub const fn is_caller_error(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// The request touched a path it is not allowed to.
    pub const fn is_access_denied(&self) -> bool {
        matches!(self, Self::SecurityViolation(_) | Self::PathViolation(_))
    }

    /// Boundary representation for outer layers.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable error shape handed to outer layers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
