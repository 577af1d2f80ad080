//! The external disk image toolkit.
//!
//! Format conversion, rebasing and inspection of copy-on-write images is
//! delegated to an external program.  The [`ImageToolkit`] trait describes the
//! four logical operations the repository needs; [`QemuImg`] implements them by
//! running `qemu-img`.
//!
//! Every failure is reported as a [`ToolkitError`] carrying the diagnostic
//! text that the external process printed, so that callers can show the user
//! what actually went wrong.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;
use serde::Deserialize;

/// On-disk format of every artifact handled by the toolkit.
pub const IMAGE_FORMAT: &str = "qcow2";

/// A failed toolkit (or hashing) operation.
#[derive(Debug, thiserror::Error)]
#[error("{operation} of {} failed: {diagnostic}", path.display())]
pub struct ToolkitError {
    /// The logical operation: `inspect`, `convert`, `rebase`, `create` or `digest`.
    pub operation: &'static str,
    /// The image the operation was applied to.
    pub path: PathBuf,
    /// Diagnostic output of the external process, or the reason it could not run.
    pub diagnostic: String,
}

impl ToolkitError {
    /// Construct an error for `operation` on `path`.
    pub fn new(operation: &'static str, path: impl AsRef<Path>, diagnostic: impl ToString) -> Self {
        Self {
            operation,
            path: path.as_ref().to_path_buf(),
            diagnostic: diagnostic.to_string(),
        }
    }
}

/// Result type for toolkit operations.
pub type ToolkitResult<T> = std::result::Result<T, ToolkitError>;

/// Size and backing information reported by the toolkit for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    /// Size of the virtual disk, in bytes.
    pub virtual_size: u64,
    /// Space used on the host filesystem, in bytes.
    #[serde(default)]
    pub actual_size: u64,
    /// Backing file reference exactly as recorded in the image header.
    #[serde(default, rename = "backing-filename")]
    pub backing_file: Option<String>,
}

/// Options for [`ImageToolkit::convert`].
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Compress the data clusters of the output.
    pub compress: bool,
    /// Only write clusters differing from this image, and record it as backing file.
    pub backing_file: Option<PathBuf>,
}

/// Options for [`ImageToolkit::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Base image for the new copy-on-write image.
    pub backing_file: Option<PathBuf>,
    /// Virtual size in bytes.  Defaults to the size of the backing file.
    pub size: Option<u64>,
}

/// Logical operations on copy-on-write disk image files.
pub trait ImageToolkit {
    /// Report sizes and the backing reference of the image at `path`.
    fn inspect(&self, path: &Path) -> ToolkitResult<ImageInfo>;

    /// Convert `src` into a new image at `dst` in [`IMAGE_FORMAT`].
    fn convert(&self, src: &Path, dst: &Path, options: &ConvertOptions) -> ToolkitResult<()>;

    /// Rewrite the backing reference recorded in `path` without touching its data.
    fn rebase(&self, path: &Path, backing: &str) -> ToolkitResult<()>;

    /// Create a new, empty image at `path`.
    fn create(&self, path: &Path, options: &CreateOptions) -> ToolkitResult<()>;
}

/// [`ImageToolkit`] backed by the `qemu-img` program.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: PathBuf,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self {
            program: PathBuf::from("qemu-img"),
        }
    }
}

impl QemuImg {
    /// Use `qemu-img` from `$PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `qemu-img` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(
        &self,
        operation: &'static str,
        path: &Path,
        args: Vec<OsString>,
    ) -> ToolkitResult<Vec<u8>> {
        debug!(
            "{} {}",
            self.program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| {
                ToolkitError::new(
                    operation,
                    path,
                    format!("failed to run {}: {e}", self.program.display()),
                )
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = match stderr.trim() {
                "" => format!("{} exited with {}", self.program.display(), output.status),
                text => text.to_string(),
            };
            Err(ToolkitError::new(operation, path, diagnostic))
        }
    }
}

impl ImageToolkit for QemuImg {
    fn inspect(&self, path: &Path) -> ToolkitResult<ImageInfo> {
        let stdout = self.run(
            "inspect",
            path,
            vec!["info".into(), "--output=json".into(), path.into()],
        )?;
        serde_json::from_slice(&stdout).map_err(|e| {
            ToolkitError::new("inspect", path, format!("unparseable info output: {e}"))
        })
    }

    fn convert(&self, src: &Path, dst: &Path, options: &ConvertOptions) -> ToolkitResult<()> {
        let mut args: Vec<OsString> = vec!["convert".into(), "-O".into(), IMAGE_FORMAT.into()];
        if options.compress {
            args.push("-c".into());
        }
        if let Some(backing) = &options.backing_file {
            args.extend(["-B".into(), backing.into(), "-F".into(), IMAGE_FORMAT.into()]);
        }
        args.extend([src.into(), dst.into()]);
        self.run("convert", src, args).map(drop)
    }

    fn rebase(&self, path: &Path, backing: &str) -> ToolkitResult<()> {
        let args: Vec<OsString> = vec![
            "rebase".into(),
            "-u".into(),
            "-F".into(),
            IMAGE_FORMAT.into(),
            "-b".into(),
            backing.into(),
            path.into(),
        ];
        self.run("rebase", path, args).map(drop)
    }

    fn create(&self, path: &Path, options: &CreateOptions) -> ToolkitResult<()> {
        let mut args: Vec<OsString> = vec!["create".into(), "-f".into(), IMAGE_FORMAT.into()];
        if let Some(backing) = &options.backing_file {
            args.extend(["-b".into(), backing.into(), "-F".into(), IMAGE_FORMAT.into()]);
        }
        args.push(path.into());
        if let Some(size) = options.size {
            args.push(size.to_string().into());
        }
        self.run("create", path, args).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_info_with_backing() {
        let info: ImageInfo = serde_json::from_str(
            r#"{
                "virtual-size": 10737418240,
                "filename": "child.qcow2",
                "cluster-size": 65536,
                "format": "qcow2",
                "actual-size": 200704,
                "backing-filename": "0f343b0931126a20f133d67c2b018a3b.qcow2",
                "dirty-flag": false
            }"#,
        )
        .unwrap();
        assert_eq!(
            info,
            ImageInfo {
                virtual_size: 10737418240,
                actual_size: 200704,
                backing_file: Some("0f343b0931126a20f133d67c2b018a3b.qcow2".into()),
            }
        );
    }

    #[test]
    fn test_parse_info_without_optional_fields() {
        let info: ImageInfo =
            serde_json::from_str(r#"{"virtual-size": 1048576, "format": "raw"}"#).unwrap();
        assert_eq!(info.virtual_size, 1048576);
        assert_eq!(info.actual_size, 0);
        assert_eq!(info.backing_file, None);
    }

    #[test]
    fn test_missing_program_is_toolkit_error() {
        let qemu = QemuImg::with_program("/nonexistent/qemu-img");
        let err = qemu.inspect(Path::new("/tmp/disk.qcow2")).unwrap_err();
        assert_eq!(err.operation, "inspect");
        assert_eq!(err.path, PathBuf::from("/tmp/disk.qcow2"));
        assert!(err.diagnostic.contains("failed to run"), "{}", err.diagnostic);
    }
}
