//! Error types for assetcat.
//!
//! Library crates use [`CatalogError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Pipeline or configuration error (cyclic graph, unknown attribute key,
    /// unknown plugin, unreadable config file).
    #[error("config error: {message}")]
    Config { message: String },

    /// A processing unit raised while running against one asset.
    #[error("unit error in {unit}: {message}")]
    Unit { unit: String, message: String },

    /// Source enumeration failed mid-stream.
    #[error("scan error: {0}")]
    Scan(String),

    /// Fact store read or append failure.
    #[error("storage error: {0}")]
    Store(String),

    /// Isolated worker process failure (spawn, protocol, crash, timeout).
    #[error("worker error: {0}")]
    Worker(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad identifier, malformed value, closed changeset).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The operation observed a cancellation request.
    #[error("changeset canceled")]
    Canceled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Coarse classification used by the changeset controller to decide how far
/// a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at pipeline-build time.
    Config,
    /// Contained to one asset/unit pair.
    Unit,
    /// Escalates the changeset to `Partial`.
    Scan,
    /// Escalates the changeset to `Failed`.
    Store,
    /// Ends the changeset as `Canceled`.
    Canceled,
}

impl CatalogError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a unit error attributed to the named unit.
    pub fn unit(unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unit {
            unit: unit.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for propagation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Unit { .. } | Self::Worker(_) | Self::Validation { .. } => ErrorKind::Unit,
            Self::Scan(_) => ErrorKind::Scan,
            Self::Canceled => ErrorKind::Canceled,
            Self::Store(_) | Self::Io { .. } => ErrorKind::Store,
        }
    }
}
