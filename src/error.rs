//! Error types shared by the storage and structure layers.

use std::io;

use crate::key::Key;

/// Specialized `Result` whose error defaults to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by pool, node, and snapshot operations.
///
/// Errors propagate to the immediate caller; nothing is retried and nothing
/// is swallowed. A failed put either leaves the pool unchanged or leaves a
/// stale file in the staging directory.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested key is absent from the pool.
    #[error("object {0} not found in pool")]
    NotFound(Key),

    /// A path segment names no child in its parent container.
    #[error("no entry named `{0}`")]
    NoEntry(String),

    /// An envelope, container payload, or pack file failed to parse.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// The caller asked for something the node builder does not recognize.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An underlying filesystem operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns `true` for both not-found flavors, whether a key is missing
    /// from the pool or a name is missing from a container.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::NoEntry(_))
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(e: tempfile::PersistError) -> Self {
        Error::Io(e.error)
    }
}
