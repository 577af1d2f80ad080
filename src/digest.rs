//! Content digests.
//!
//! Artifacts are addressed by the SHA-256 of their bytes, rendered as 64
//! lowercase hexadecimal characters.  The digest doubles as the artifact's
//! filename stem and as the primary key of the index, so anything that comes
//! from outside (e.g. a caller-supplied digest) must be validated before it
//! is used to build a path.

use std::{fs::File, io, path::Path};

use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    toolkit::{ToolkitError, ToolkitResult},
};

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_LEN: usize = 64;

/// Computes the digest string of a file's contents.
pub trait ContentHasher {
    /// Hash the bytes of the file at `path`.
    fn digest(&self, path: &Path) -> ToolkitResult<String>;
}

/// [`ContentHasher`] computing SHA-256 in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn digest(&self, path: &Path) -> ToolkitResult<String> {
        let mut file = File::open(path).map_err(|e| ToolkitError::new("digest", path, e))?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(|e| ToolkitError::new("digest", path, e))?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Whether `value` is a full digest: exactly 64 characters of `[0-9a-f]`.
pub fn is_digest(value: &str) -> bool {
    value.len() == DIGEST_LEN && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Check that a caller-supplied digest is well formed.
pub fn validate_digest(value: &str) -> Result<&str> {
    if is_digest(value) {
        Ok(value)
    } else {
        Err(Error::InvalidDigest(value.to_string()))
    }
}
