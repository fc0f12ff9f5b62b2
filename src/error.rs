//! Error types for image-commit.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can abort an image commit run.
#[derive(Debug, Error)]
pub enum Error {
    /// A required input is missing or ambiguous.
    #[error("configuration error: {0}")]
    Config(String),

    /// An input value is malformed or not one of the recognised values.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An image entry path cannot be placed under the destination root.
    #[error("invalid image path '{0}'")]
    InvalidPath(String),

    /// The external repository store rejected an operation.
    #[error("store {operation} failed: {message}")]
    Commit {
        operation: &'static str,
        message: String,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn commit(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Commit {
            operation,
            message: message.into(),
        }
    }

    /// Whether this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Whether this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Whether this is a store failure.
    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Attach a path to an `std::io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::io(path, source))
    }
}
