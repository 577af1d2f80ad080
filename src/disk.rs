//! Turning arbitrary disk images into repository artifacts.
//!
//! [`DiskPreparer`] drives an [`ImageToolkit`] to convert a source image into
//! the store format (compressed, optionally incremental on top of a parent)
//! and a [`ContentHasher`] to compute the resulting artifact's digest.
//!
//! Backing references are always recorded relative to the store directory
//! (`<parent digest>.qcow2`), so that a store can be moved or published
//! elsewhere without breaking its chains.  Absolute paths are only ever
//! handed to the toolkit for the duration of a single operation.

use std::{
    fs,
    io::ErrorKind,
    path::{self, Path},
};

use log::{debug, warn};

use crate::{
    digest::{ContentHasher, Sha256Hasher},
    toolkit::{
        ConvertOptions, CreateOptions, ImageToolkit, QemuImg, ToolkitError, ToolkitResult,
    },
};

/// Domain view of [`ImageInfo`](crate::toolkit::ImageInfo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    /// Size of the virtual disk, in bytes.
    pub virtual_size: u64,
    /// Space used on the host filesystem, in bytes.
    pub actual_size: u64,
    /// Backing reference as recorded in the image.
    pub backing_reference: Option<String>,
}

/// Result of [`DiskPreparer::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    /// Size of the virtual disk, in bytes.
    pub virtual_size: u64,
    /// Space used by the artifact, in bytes.
    pub actual_size: u64,
    /// The parent reference as stored in the artifact (storage-relative).
    pub parent_reference: Option<String>,
}

/// Prepares repository-ready artifacts.
#[derive(Debug, Clone, Default)]
pub struct DiskPreparer<T = QemuImg, H = Sha256Hasher> {
    toolkit: T,
    hasher: H,
}

impl<T: ImageToolkit, H: ContentHasher> DiskPreparer<T, H> {
    /// Create a preparer from a toolkit and a hasher.
    pub fn new(toolkit: T, hasher: H) -> Self {
        Self { toolkit, hasher }
    }

    /// The underlying toolkit.
    pub fn toolkit(&self) -> &T {
        &self.toolkit
    }

    /// Convert `source` into a compressed artifact at `destination`.
    ///
    /// If `parent` (the path of a stored artifact) is given, only the data
    /// differing from it is written and the artifact is rebased onto the
    /// parent's storage-relative name.
    ///
    /// On failure `destination` is removed before the error is returned, so a
    /// half-written file can never be mistaken for an artifact.
    pub fn prepare(
        &self,
        source: &Path,
        destination: &Path,
        parent: Option<&Path>,
    ) -> ToolkitResult<ArtifactInfo> {
        let result = self.prepare_inner(source, destination, parent);
        if result.is_err() {
            remove_partial(destination);
        }
        result
    }

    fn prepare_inner(
        &self,
        source: &Path,
        destination: &Path,
        parent: Option<&Path>,
    ) -> ToolkitResult<ArtifactInfo> {
        let backing_file = parent
            .map(|p| path::absolute(p).map_err(|e| ToolkitError::new("convert", p, e)))
            .transpose()?;

        debug!(
            "Preparing {} as {} (parent: {:?})",
            source.display(),
            destination.display(),
            backing_file
        );

        self.toolkit.convert(
            source,
            destination,
            &ConvertOptions {
                compress: true,
                backing_file,
            },
        )?;

        if let Some(parent) = parent {
            let reference = storage_reference(parent)?;
            self.toolkit.rebase(destination, reference)?;
        }

        let info = self.inspect(destination)?;
        Ok(ArtifactInfo {
            virtual_size: info.virtual_size,
            actual_size: info.actual_size,
            parent_reference: info.backing_reference,
        })
    }

    /// Report sizes and the backing reference of the image at `path`.
    pub fn inspect(&self, path: &Path) -> ToolkitResult<DiskInfo> {
        let info = self.toolkit.inspect(path)?;
        Ok(DiskInfo {
            virtual_size: info.virtual_size,
            actual_size: info.actual_size,
            backing_reference: info.backing_file,
        })
    }

    /// Digest of the file at `path`.
    pub fn digest(&self, path: &Path) -> ToolkitResult<String> {
        self.hasher.digest(path)
    }

    /// Create a new copy-on-write image at `destination` on top of `base`.
    ///
    /// The overlay lives outside the store, so it records the absolute path of
    /// `base`.
    pub fn create_overlay(
        &self,
        destination: &Path,
        base: &Path,
        size: Option<u64>,
    ) -> ToolkitResult<()> {
        let base = path::absolute(base).map_err(|e| ToolkitError::new("create", base, e))?;
        self.toolkit.create(
            destination,
            &CreateOptions {
                backing_file: Some(base),
                size,
            },
        )
    }
}

/// The name under which `artifact` is referenced from its children.
fn storage_reference(artifact: &Path) -> ToolkitResult<&str> {
    artifact
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ToolkitError::new("rebase", artifact, "parent artifact has no usable name"))
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed partial artifact {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial artifact {}: {e}", path.display()),
    }
}
