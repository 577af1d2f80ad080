//! Error types for the disk image repository.
//!
//! All fallible library operations return a [`Result<T>`], an alias for
//! `Result<T, Error>`.
//!
//! # Error Categories
//!
//! - **Configuration**: [`Configuration`]: a repository entry is missing or malformed
//! - **External toolkit**: [`Toolkit`]: a disk image operation or hash failed
//! - **Index**: [`IndexCorrupt`]: the persisted index could not be parsed
//! - **References**: [`UnresolvedReference`], [`InvalidDigest`]
//! - **System errors**: [`Io`], [`Json`]
//!
//! Some conditions never surface as an `Error`: lookups return `None` for an
//! unresolved name, an unresolvable parent during ingest becomes an
//! [`IngestWarning`](crate::repository::IngestWarning), and a failed artifact
//! during publish is collected into a
//! [`PublishReport`](crate::repository::PublishReport).
//!
//! [`Configuration`]: Error::Configuration
//! [`Toolkit`]: Error::Toolkit
//! [`IndexCorrupt`]: Error::IndexCorrupt
//! [`UnresolvedReference`]: Error::UnresolvedReference
//! [`InvalidDigest`]: Error::InvalidDigest
//! [`Io`]: Error::Io
//! [`Json`]: Error::Json

use std::path::{Path, PathBuf};

use crate::toolkit::ToolkitError;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A repository configuration entry is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The external disk image toolkit (or the content hasher) failed.
    #[error(transparent)]
    Toolkit(#[from] ToolkitError),

    /// The persisted index exists but could not be parsed.
    #[error("index at {} is corrupt: {source}", path.display())]
    IndexCorrupt {
        /// The index file.
        path: PathBuf,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// A name, digest prefix or tag did not resolve to any image.
    #[error("no image matches '{0}'")]
    UnresolvedReference(String),

    /// A digest is not a lowercase hexadecimal SHA-256 string.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    /// I/O error on a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The file or directory being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Attach the offending path to an I/O result.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| Error::io(path, source))
    }
}
