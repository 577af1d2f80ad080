//! Content-addressed repository of disk images.
//!
//! # Repository Layout
//!
//! ```text
//! repository/
//! ├── index.json                # digest → metadata, tag → digest
//! ├── 4e67eaccd9fd....qcow2     # artifacts, named by the SHA-256 of their bytes
//! ├── 9a01b2c3d4e5....qcow2     # a child: its backing file is "4e67eaccd9fd....qcow2"
//! └── tmp/                      # scratch space for artifacts being prepared
//! ```
//!
//! Backing references between artifacts are relative names, so the whole
//! directory can be moved or [published](Repository::publish) elsewhere.
//!
//! # Ingestion
//!
//! [`Repository::put_file`] converts a source image in `tmp/`, hashes it,
//! renames it to `<digest>.qcow2` and only then records it in the index.  A
//! failure before the rename leaves the index untouched; a failure of the
//! rename itself leaves the prepared artifact in `tmp/` for inspection.
//! Ingesting identical content twice produces the same digest and updates a
//! single index entry.
//!
//! # Concurrency
//!
//! A repository assumes it is the only writer of its directory.  There is no
//! locking: callers must serialize operations on the same path.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File, Permissions},
    io::{self, ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rand::{distr::Alphanumeric, Rng};
use tempfile::NamedTempFile;

use crate::{
    digest::{is_digest, validate_digest, ContentHasher, Sha256Hasher},
    disk::DiskPreparer,
    error::{Error, IoResultExt, Result},
    index::{Image, MetadataValue, RepositoryIndex, RESERVED_KEYS},
    toolkit::{ImageToolkit, QemuImg, ToolkitError, IMAGE_FORMAT},
};

/// Name of the index file in the repository root.
pub const INDEX_FILE: &str = "index.json";

/// Name of the scratch directory in the repository root.
pub const SCRATCH_DIR: &str = "tmp";

/// Characters of the source file name kept in scratch file names.
const SCRATCH_NAME_MAX: usize = 64;

/// Suffix appended to artifacts compressed by [`Repository::publish`].
pub const COMPRESSED_SUFFIX: &str = "zst";

/// Where a repository lives, and optionally its index.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Repository root directory.
    pub path: PathBuf,
    /// Use this index instead of reading `index.json`.
    pub index: Option<RepositoryIndex>,
}

impl RepositoryConfig {
    /// A repository at `path` whose index is read from disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: None,
        }
    }
}

/// Caller-supplied metadata for [`Repository::put_file`].
#[derive(Debug, Clone, Default)]
pub struct IngestMetadata {
    /// Tag to assign to the new image.
    pub tag: Option<String>,
    /// Digest, digest prefix or tag of the image to use as backing base.
    pub parent: Option<String>,
    /// The source is already a final artifact with this digest; skip conversion.
    pub digest: Option<String>,
    /// Overrides the virtual size reported by the toolkit.
    pub virtual_size: Option<u64>,
    /// Overrides the actual size reported by the toolkit.
    pub actual_size: Option<u64>,
    /// Free-form metadata stored with the image.
    pub extra: BTreeMap<String, MetadataValue>,
}

/// Something that did not go as requested during an ingest, without failing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestWarning {
    /// The parent reference did not resolve; the image was stored as a root image.
    UnresolvedParent {
        /// The reference as given.
        reference: String,
    },
    /// A metadata key collides with a built-in field and was dropped.
    ReservedKey {
        /// The dropped key.
        key: String,
    },
}

impl fmt::Display for IngestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestWarning::UnresolvedParent { reference } => write!(
                f,
                "parent '{reference}' not found in the repository, stored as a root image"
            ),
            IngestWarning::ReservedKey { key } => {
                write!(f, "metadata key '{key}' is reserved and was ignored")
            }
        }
    }
}

/// Result of [`Repository::put_file`].
#[derive(Debug, Clone)]
pub struct Ingested {
    /// The stored record.
    pub image: Image,
    /// Requests that could not be honored.
    pub warnings: Vec<IngestWarning>,
}

/// One artifact that could not be published.
#[derive(Debug)]
pub struct PublishItemFailure {
    /// Digest of the artifact.
    pub digest: String,
    /// Why it failed.
    pub error: Error,
}

/// Outcome of [`Repository::publish`].
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Artifacts copied verbatim.
    pub copied: Vec<String>,
    /// Artifacts written compressed.
    pub compressed: Vec<String>,
    /// Artifacts already present at the destination.
    pub skipped: Vec<String>,
    /// Artifacts that failed.
    pub failed: Vec<PublishItemFailure>,
}

impl PublishReport {
    /// Whether every artifact made it to the destination.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Consistency problems found by [`Repository::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Indexed digests with no artifact on disk.
    pub missing_artifacts: Vec<String>,
    /// Artifacts on disk that the index does not know about.
    pub unindexed_artifacts: Vec<PathBuf>,
    /// (image, parent) pairs whose parent is not indexed.
    pub dangling_parents: Vec<(String, String)>,
    /// Tags pointing at digests that are not indexed.
    pub dangling_tags: Vec<String>,
}

impl CheckReport {
    /// Whether no problem was found.
    pub fn is_clean(&self) -> bool {
        self.missing_artifacts.is_empty()
            && self.unindexed_artifacts.is_empty()
            && self.dangling_parents.is_empty()
            && self.dangling_tags.is_empty()
    }
}

/// A repository of content-addressed disk images.
#[derive(Debug)]
pub struct Repository<T = QemuImg, H = Sha256Hasher> {
    path: PathBuf,
    index: RepositoryIndex,
    preparer: Arc<DiskPreparer<T, H>>,
}

impl Repository {
    /// Open a repository that uses `qemu-img` and SHA-256.
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        Self::open_with(config, DiskPreparer::default())
    }
}

impl<T: ImageToolkit, H: ContentHasher> Repository<T, H> {
    /// Open a repository with a specific preparer.
    ///
    /// The repository directory and its scratch directory are created if
    /// needed.  Unless the configuration carries an index, it is loaded from
    /// `index.json`, or starts empty if there is none.
    pub fn open_with(config: RepositoryConfig, preparer: DiskPreparer<T, H>) -> Result<Self> {
        Self::from_parts(config, Arc::new(preparer))
    }

    fn from_parts(config: RepositoryConfig, preparer: Arc<DiskPreparer<T, H>>) -> Result<Self> {
        let RepositoryConfig { path, index } = config;

        let scratch = path.join(SCRATCH_DIR);
        fs::create_dir_all(&scratch).at(&scratch)?;

        let index = match index {
            Some(index) => index,
            None => RepositoryIndex::load(&path.join(INDEX_FILE)),
        };

        Ok(Self {
            path,
            index,
            preparer,
        })
    }

    /// The repository root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory index.
    pub fn index(&self) -> &RepositoryIndex {
        &self.index
    }

    /// All images, by digest.
    pub fn images(&self) -> &BTreeMap<String, Image> {
        &self.index.images
    }

    /// All tags, with the digest each points to.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.index.tags
    }

    /// Path of the index file.
    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    /// Path of the artifact for `digest`.
    pub fn image_path(&self, digest: &str) -> PathBuf {
        self.path.join(format!("{digest}.{IMAGE_FORMAT}"))
    }

    /// Path of the compressed artifact for `digest`, as written by [`Repository::publish`].
    pub fn compressed_image_path(&self, digest: &str) -> PathBuf {
        self.path
            .join(format!("{digest}.{IMAGE_FORMAT}.{COMPRESSED_SUFFIX}"))
    }

    fn scratch_path(&self, source: &Path) -> PathBuf {
        let name: String = source
            .file_name()
            .map(|n| n.to_string_lossy().chars().take(SCRATCH_NAME_MAX).collect())
            .unwrap_or_else(|| "image".to_string());
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let random: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        self.path
            .join(SCRATCH_DIR)
            .join(format!("{name}.{seconds}.{random}"))
    }

    /// Digests of all indexed images, in index order.
    pub fn list(&self) -> impl Iterator<Item = &str> {
        self.index.images.keys().map(String::as_str)
    }

    /// Resolve a digest, digest prefix or tag.
    pub fn find_image(&self, name: &str) -> Option<&str> {
        self.index.resolve(name)
    }

    /// The image a digest, digest prefix or tag refers to.
    pub fn get(&self, name: &str) -> Option<&Image> {
        self.find_image(name).and_then(|digest| self.index.get(digest))
    }

    /// Write the index to disk.
    pub fn save(&self) -> Result<()> {
        self.index.save(&self.index_path())
    }

    /// Record `image` in the index and save it.
    pub fn put(&mut self, image: Image) -> Result<()> {
        self.index.put(image);
        self.save()
    }

    /// Ingest the disk image at `source`.
    ///
    /// The source is converted to a compressed artifact (incremental on top of
    /// `metadata.parent`, if that resolves), stored under its digest, and
    /// recorded in the index together with `metadata`.  Caller-supplied values
    /// take precedence over those reported by the toolkit.
    ///
    /// A parent reference that does not resolve is not an error: the image is
    /// stored as a root image and an [`IngestWarning::UnresolvedParent`] is
    /// returned.
    pub fn put_file(&mut self, source: &Path, metadata: IngestMetadata) -> Result<Ingested> {
        let IngestMetadata {
            tag,
            parent,
            digest,
            virtual_size,
            actual_size,
            mut extra,
        } = metadata;
        let mut warnings = Vec::new();

        let parent = match parent {
            Some(reference) => match self.get(&reference) {
                Some(image) => Some((image.digest.clone(), image.tag.clone())),
                None => {
                    warn!(
                        "Parent '{reference}' of {} not found; storing it as a root image",
                        source.display()
                    );
                    warnings.push(IngestWarning::UnresolvedParent { reference });
                    None
                }
            },
            None => None,
        };

        extra.retain(|key, _| {
            if RESERVED_KEYS.contains(&key.as_str()) {
                warn!("Ignoring reserved metadata key '{key}'");
                warnings.push(IngestWarning::ReservedKey { key: key.clone() });
                false
            } else {
                true
            }
        });

        let scratch = self.scratch_path(source);
        let (digest, derived_virtual_size, derived_actual_size) = match digest {
            Some(digest) => {
                let digest = validate_digest(&digest)?.to_string();
                debug!("Using {} as-is with digest {digest}", source.display());
                fs::copy(source, &scratch)
                    .inspect_err(|_| discard_scratch(&scratch))
                    .at(source)?;
                match (virtual_size, actual_size) {
                    (Some(v), Some(a)) => (digest, v, a),
                    _ => {
                        let info = self
                            .preparer
                            .inspect(&scratch)
                            .inspect_err(|_| discard_scratch(&scratch))?;
                        (digest, info.virtual_size, info.actual_size)
                    }
                }
            }
            None => {
                let parent_path = parent.as_ref().map(|(digest, _)| self.image_path(digest));
                let artifact =
                    self.preparer
                        .prepare(source, &scratch, parent_path.as_deref())?;
                let expected = parent
                    .as_ref()
                    .map(|(digest, _)| format!("{digest}.{IMAGE_FORMAT}"));
                if artifact.parent_reference != expected {
                    discard_scratch(&scratch);
                    return Err(ToolkitError::new(
                        "rebase",
                        &scratch,
                        format!(
                            "artifact is backed by {:?}, expected {:?}",
                            artifact.parent_reference, expected
                        ),
                    )
                    .into());
                }
                let digest = self
                    .preparer
                    .digest(&scratch)
                    .inspect_err(|_| discard_scratch(&scratch))?;
                (digest, artifact.virtual_size, artifact.actual_size)
            }
        };

        let destination = self.image_path(&digest);
        if let Err(e) = fs::rename(&scratch, &destination) {
            error!(
                "Failed to move {} to {}; leaving it in place: {e}",
                scratch.display(),
                destination.display()
            );
            return Err(Error::io(&destination, e));
        }

        let previous_tag = self.index.get(&digest).and_then(|image| image.tag.clone());
        let (parent_digest, parent_tag) = parent.unzip();
        let image = Image {
            digest: digest.clone(),
            tag: tag.or(previous_tag),
            parent_digest,
            parent_tag: parent_tag.flatten(),
            virtual_size: virtual_size.unwrap_or(derived_virtual_size),
            actual_size: actual_size.unwrap_or(derived_actual_size),
            created_at: Utc::now(),
            extra,
        };

        self.put(image.clone())?;
        info!("Stored {} as {digest}", source.display());

        Ok(Ingested { image, warnings })
    }

    /// Point `tag` at the image `reference` resolves to.
    ///
    /// Whichever image held the tag before loses it.
    pub fn tag(&mut self, reference: &str, tag: &str) -> Result<Image> {
        let mut image = self
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::UnresolvedReference(reference.to_string()))?;
        image.tag = Some(tag.to_string());
        self.put(image.clone())?;
        Ok(image)
    }

    /// Remove `tag`, returning the digest it pointed to.
    pub fn untag(&mut self, tag: &str) -> Result<Option<String>> {
        let removed = self.index.remove_tag(tag);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Create a new copy-on-write image at `destination` backed by `reference`.
    pub fn create_overlay(
        &self,
        reference: &str,
        destination: &Path,
        size: Option<u64>,
    ) -> Result<()> {
        let digest = self
            .find_image(reference)
            .ok_or_else(|| Error::UnresolvedReference(reference.to_string()))?;
        self.preparer
            .create_overlay(destination, &self.image_path(digest), size)?;
        Ok(())
    }

    /// Export the index and all artifacts to `target`.
    ///
    /// Artifacts already present at the destination are skipped, so an
    /// interrupted publish can simply be run again.  With `compress`, artifacts
    /// are written zstd-compressed as `<digest>.qcow2.zst`.  A failure on one
    /// artifact is recorded in the report and does not stop the others.
    pub fn publish(&self, target: &Path, compress: bool) -> Result<PublishReport> {
        let destination = Self::from_parts(
            RepositoryConfig {
                path: target.to_path_buf(),
                index: Some(self.index.clone()),
            },
            Arc::clone(&self.preparer),
        )?;
        destination.save()?;

        let digests: Vec<&str> = self.list().collect();
        let progress = ProgressBar::new(digests.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}") {
            progress.set_style(style.progress_chars("##-"));
        }

        let mut report = PublishReport::default();
        for digest in digests {
            progress.set_message(digest.chars().take(12).collect::<String>());

            let plain = destination.image_path(digest);
            let compressed = destination.compressed_image_path(digest);
            if plain.exists() || compressed.exists() {
                progress.println(format!("Image {digest} already exists, skipping"));
                report.skipped.push(digest.to_string());
                progress.inc(1);
                continue;
            }

            let origin = self.image_path(digest);
            let result = if compress {
                progress.println(format!("Compressing {digest}"));
                write_atomically(&compressed, |out| {
                    zstd::stream::copy_encode(File::open(&origin)?, out, 0)
                })
                .map(|()| report.compressed.push(digest.to_string()))
            } else {
                progress.println(format!("Copying {digest}"));
                write_atomically(&plain, |out| {
                    io::copy(&mut File::open(&origin)?, out).map(drop)
                })
                .map(|()| report.copied.push(digest.to_string()))
            };

            if let Err(error) = result {
                warn!("Failed to publish {digest}: {error}");
                report.failed.push(PublishItemFailure {
                    digest: digest.to_string(),
                    error,
                });
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        info!(
            "Published to {}: {} copied, {} compressed, {} skipped, {} failed",
            target.display(),
            report.copied.len(),
            report.compressed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Compare the index with the artifacts on disk.
    ///
    /// Nothing is modified; unreferenced artifacts are only reported.
    pub fn check(&self) -> Result<CheckReport> {
        let mut report = CheckReport::default();

        for (digest, image) in &self.index.images {
            if !self.image_path(digest).exists() && !self.compressed_image_path(digest).exists() {
                report.missing_artifacts.push(digest.clone());
            }
            if let Some(parent) = &image.parent_digest {
                if !self.index.images.contains_key(parent) {
                    report
                        .dangling_parents
                        .push((digest.clone(), parent.clone()));
                }
            }
        }

        for (tag, digest) in &self.index.tags {
            if !self.index.images.contains_key(digest) {
                report.dangling_tags.push(tag.clone());
            }
        }

        for entry in fs::read_dir(&self.path).at(&self.path)? {
            let entry = entry.at(&self.path)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let stem = name
                .strip_suffix(&format!(".{IMAGE_FORMAT}.{COMPRESSED_SUFFIX}"))
                .or_else(|| name.strip_suffix(&format!(".{IMAGE_FORMAT}")));
            if let Some(stem) = stem {
                if is_digest(stem) && !self.index.images.contains_key(stem) {
                    report.unindexed_artifacts.push(entry.path());
                }
            }
        }
        report.unindexed_artifacts.sort();

        Ok(report)
    }
}

/// Write `path` through a temporary file in the same directory, renamed into
/// place only once `fill` succeeded.
fn write_atomically(path: &Path, fill: impl FnOnce(&mut File) -> io::Result<()>) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).at(dir)?;
    fill(tmp.as_file_mut()).at(path)?;
    tmp.as_file_mut().flush().at(tmp.path())?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o644))
        .at(tmp.path())?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

fn discard_scratch(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tempdir, FailingHasher, FakeToolkit, TestRepo};

    fn with_tag(tag: &str) -> IngestMetadata {
        IngestMetadata {
            tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    fn with_parent(parent: &str) -> IngestMetadata {
        IngestMetadata {
            parent: Some(parent.to_string()),
            ..Default::default()
        }
    }

    fn scratch_entries(t: &TestRepo) -> usize {
        fs::read_dir(t.repo.path().join(SCRATCH_DIR))
            .unwrap()
            .count()
    }

    #[test]
    fn test_put_file_root() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("base.img", b"base image contents");

        let ingested = t.repo.put_file(&source, IngestMetadata::default())?;
        let image = &ingested.image;

        assert!(ingested.warnings.is_empty());
        assert!(is_digest(&image.digest));
        assert_eq!(image.parent_digest, None);
        assert_eq!(image.virtual_size, 19);
        assert!(t.repo.image_path(&image.digest).exists());
        assert_eq!(t.repo.list().collect::<Vec<_>>(), vec![image.digest.as_str()]);
        assert!(t.repo.tags().is_empty());
        assert_eq!(scratch_entries(&t), 0);
        // the source is left alone
        assert!(source.exists());

        // and it's on disk
        let index = RepositoryIndex::read(&t.repo.index_path())?.unwrap();
        assert_eq!(&index, t.repo.index());
        Ok(())
    }

    #[test]
    fn test_put_file_twice_dedups() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"identical");

        let first = t.repo.put_file(&source, with_tag("v1"))?;
        let second = t.repo.put_file(&source, IngestMetadata::default())?;

        assert_eq!(first.image.digest, second.image.digest);
        assert_eq!(t.repo.images().len(), 1);
        // the tag carries over when the second ingest doesn't give one
        assert_eq!(second.image.tag.as_deref(), Some("v1"));
        let artifacts = fs::read_dir(t.repo.path())?
            .filter(|e| {
                e.as_ref()
                    .is_ok_and(|e| e.path().extension().is_some_and(|x| x == "qcow2"))
            })
            .count();
        assert_eq!(artifacts, 1);
        Ok(())
    }

    #[test]
    fn test_tagging_scenario() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let a = t.source("a.img", b"operating system");
        let b = t.source("b.img", b"operating system + app");

        let digest_a = t.repo.put_file(&a, IngestMetadata::default())?.image.digest;
        assert_eq!(t.repo.images().len(), 1);
        assert!(t.repo.tags().is_empty());

        t.repo.tag(&digest_a, "base")?;
        assert_eq!(
            t.repo.tags(),
            &BTreeMap::from([("base".to_string(), digest_a.clone())])
        );

        let child = t.repo.put_file(&b, with_parent("base"))?;
        let digest_b = child.image.digest.clone();
        assert!(child.warnings.is_empty());
        assert_eq!(child.image.parent_digest.as_deref(), Some(digest_a.as_str()));
        assert_eq!(child.image.parent_tag.as_deref(), Some("base"));

        t.repo.tag(&digest_b, "base")?;
        assert_eq!(
            t.repo.tags(),
            &BTreeMap::from([("base".to_string(), digest_b.clone())])
        );
        assert_eq!(t.repo.get(&digest_a).unwrap().tag, None);
        assert_eq!(t.repo.get("base").unwrap().digest, digest_b);
        Ok(())
    }

    #[test]
    fn test_child_backing_reference_is_relative() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let a = t.source("a.img", b"parent");
        let b = t.source("b.img", b"child");

        let parent = t.repo.put_file(&a, IngestMetadata::default())?.image;
        let child = t.repo.put_file(&b, with_parent(&parent.digest[..8]))?.image;

        let info = DiskPreparer::new(t.toolkit.clone(), Sha256Hasher)
            .inspect(&t.repo.image_path(&child.digest))?;
        assert_eq!(
            info.backing_reference,
            Some(format!("{}.qcow2", parent.digest))
        );
        // the conversion itself was handed the absolute parent path
        assert!(t.toolkit.calls().contains(&format!(
            "convert -c -B {}",
            t.repo.image_path(&parent.digest).display()
        )));
        Ok(())
    }

    #[test]
    fn test_unresolved_parent_degrades_to_root() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("orphan.img", b"orphan");

        let ingested = t.repo.put_file(&source, with_parent("nonexistent"))?;

        assert_eq!(ingested.image.parent_digest, None);
        assert_eq!(ingested.image.parent_tag, None);
        assert_eq!(
            ingested.warnings,
            vec![IngestWarning::UnresolvedParent {
                reference: "nonexistent".into()
            }]
        );
        assert!(!t.toolkit.calls().iter().any(|c| c.starts_with("rebase")));
        Ok(())
    }

    #[test]
    fn test_caller_metadata_takes_precedence() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"0123456789");

        let ingested = t.repo.put_file(
            &source,
            IngestMetadata {
                virtual_size: Some(1 << 30),
                extra: BTreeMap::from([
                    ("os".to_string(), MetadataValue::parse("alpine")),
                    ("release".to_string(), MetadataValue::parse("320")),
                    ("digest".to_string(), MetadataValue::parse("bogus")),
                ]),
                ..Default::default()
            },
        )?;

        let image = &ingested.image;
        assert_eq!(image.virtual_size, 1 << 30);
        assert_eq!(image.extra.len(), 2);
        assert_eq!(image.extra["release"], MetadataValue::Integer(320));
        assert_eq!(
            ingested.warnings,
            vec![IngestWarning::ReservedKey {
                key: "digest".into()
            }]
        );
        Ok(())
    }

    #[test]
    fn test_put_file_with_known_digest() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let digest = "5d41402abc4b2a76b9719d911017c5925d41402abc4b2a76b9719d911017c592";
        let source = t.source("prebuilt.qcow2", b"already converted");

        let ingested = t.repo.put_file(
            &source,
            IngestMetadata {
                digest: Some(digest.to_string()),
                ..Default::default()
            },
        )?;

        assert_eq!(ingested.image.digest, digest);
        assert_eq!(ingested.image.virtual_size, 17);
        assert_eq!(fs::read(t.repo.image_path(digest))?, b"already converted");
        assert!(!t.toolkit.calls().iter().any(|c| c.starts_with("convert")));
        assert!(source.exists());
        Ok(())
    }

    #[test]
    fn test_put_file_rejects_bad_digest() {
        let mut t = TestRepo::new();
        let source = t.source("prebuilt.qcow2", b"data");

        let err = t
            .repo
            .put_file(
                &source,
                IngestMetadata {
                    digest: Some("../escape".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert!(matches!(err, Error::InvalidDigest(_)));
        assert!(t.repo.images().is_empty());
    }

    #[test]
    fn test_toolkit_failure_leaves_index_untouched() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"data");
        t.toolkit.fail_on("convert");

        let err = t
            .repo
            .put_file(&source, IngestMetadata::default())
            .unwrap_err();

        match err {
            Error::Toolkit(e) => {
                assert_eq!(e.operation, "convert");
                assert_eq!(e.diagnostic, "injected failure");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(t.repo.images().is_empty());
        assert!(!t.repo.index_path().exists());
        assert_eq!(scratch_entries(&t), 0);
        Ok(())
    }

    #[test]
    fn test_failed_move_leaves_scratch_artifact() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"data");
        let digest = t.repo.put_file(&source, IngestMetadata::default())?.image.digest;

        // make the final name unusable: a non-empty directory can't be replaced by a file
        let artifact = t.repo.image_path(&digest);
        fs::remove_file(&artifact)?;
        fs::create_dir(&artifact)?;
        fs::write(artifact.join("blocker"), b"")?;
        let before = t.repo.index().clone();

        let err = t
            .repo
            .put_file(&source, with_tag("new"))
            .unwrap_err();

        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(t.repo.index(), &before);
        assert_eq!(scratch_entries(&t), 1);
        Ok(())
    }

    #[test]
    fn test_long_source_name() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source(&format!("{}.img", "d".repeat(236)), b"long name");

        let digest = t.repo.put_file(&source, IngestMetadata::default())?.image.digest;

        assert!(t.repo.image_path(&digest).exists());
        assert_eq!(scratch_entries(&t), 0);
        Ok(())
    }

    #[test]
    fn test_hash_failure_discards_scratch() -> anyhow::Result<()> {
        let tmp = tempdir();
        let toolkit = FakeToolkit::new();
        let mut repo = Repository::open_with(
            RepositoryConfig::new(tmp.path().join("repo")),
            DiskPreparer::new(toolkit.clone(), FailingHasher),
        )?;
        let source = tmp.path().join("disk.img");
        fs::write(&source, b"data")?;

        let err = repo
            .put_file(&source, IngestMetadata::default())
            .unwrap_err();

        match err {
            Error::Toolkit(e) => assert_eq!(e.operation, "digest"),
            other => panic!("unexpected error {other}"),
        }
        // the artifact had been prepared
        assert_eq!(toolkit.calls()[0], "convert -c");
        assert_eq!(fs::read_dir(repo.path().join(SCRATCH_DIR))?.count(), 0);
        assert!(repo.images().is_empty());
        assert!(!repo.index_path().exists());
        assert!(source.exists());
        Ok(())
    }

    #[test]
    fn test_inspect_failure_with_known_digest_discards_scratch() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let existing = t.source("existing.img", b"existing");
        t.repo.put_file(&existing, with_tag("base"))?;
        let before = t.repo.index().clone();
        let source = t.source("prebuilt.qcow2", b"already converted");
        t.toolkit.fail_on("inspect");

        let err = t
            .repo
            .put_file(
                &source,
                IngestMetadata {
                    digest: Some("ab".repeat(32)),
                    ..Default::default()
                },
            )
            .unwrap_err();

        match err {
            Error::Toolkit(e) => assert_eq!(e.operation, "inspect"),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(scratch_entries(&t), 0);
        assert_eq!(t.repo.index(), &before);
        assert_eq!(RepositoryIndex::read(&t.repo.index_path())?.as_ref(), Some(&before));
        assert!(!t.repo.image_path(&"ab".repeat(32)).exists());
        Ok(())
    }

    #[test]
    fn test_unrebased_child_is_rejected() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let a = t.source("a.img", b"parent");
        let b = t.source("b.img", b"child");
        t.repo.put_file(&a, with_tag("base"))?;
        t.toolkit.ignore_rebase();

        let err = t.repo.put_file(&b, with_parent("base")).unwrap_err();

        match err {
            Error::Toolkit(e) => {
                assert_eq!(e.operation, "rebase");
                assert!(e.diagnostic.contains("expected"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(t.repo.images().len(), 1);
        assert_eq!(scratch_entries(&t), 0);
        Ok(())
    }

    #[test]
    fn test_tag_unknown_reference() {
        let mut t = TestRepo::new();
        assert!(matches!(
            t.repo.tag("nope", "base"),
            Err(Error::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_untag() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"data");
        let digest = t.repo.put_file(&source, with_tag("base"))?.image.digest;

        assert_eq!(t.repo.untag("base")?, Some(digest.clone()));
        assert_eq!(t.repo.untag("base")?, None);
        assert_eq!(t.repo.get(&digest).unwrap().tag, None);
        assert!(t.repo.find_image("base").is_none());
        Ok(())
    }

    #[test]
    fn test_get_and_find() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"data");
        let digest = t.repo.put_file(&source, with_tag("base"))?.image.digest;

        assert_eq!(t.repo.find_image(&digest[..1]), Some(digest.as_str()));
        assert_eq!(t.repo.find_image("base"), Some(digest.as_str()));
        assert_eq!(t.repo.get(&digest[..10]).map(|i| &i.digest), Some(&digest));
        assert!(t.repo.get("missing").is_none());
        Ok(())
    }

    #[test]
    fn test_reopen_reads_index() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"data");
        t.repo.put_file(&source, with_tag("base"))?;

        let reopened = Repository::open_with(
            RepositoryConfig::new(t.repo.path()),
            DiskPreparer::new(t.toolkit.clone(), Sha256Hasher),
        )?;
        assert_eq!(reopened.index(), t.repo.index());
        Ok(())
    }

    #[test]
    fn test_open_with_corrupt_index_starts_empty() -> anyhow::Result<()> {
        let t = TestRepo::new();
        let path = t.dir().join("other");
        fs::create_dir(&path)?;
        fs::write(path.join(INDEX_FILE), b"not json")?;

        let repo = Repository::open_with(
            RepositoryConfig::new(&path),
            DiskPreparer::new(t.toolkit.clone(), Sha256Hasher),
        )?;
        assert_eq!(repo.index(), &RepositoryIndex::default());
        Ok(())
    }

    #[test]
    fn test_publish_is_resumable() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let a = t.source("a.img", b"parent");
        let b = t.source("b.img", b"child");
        t.repo.put_file(&a, with_tag("base"))?;
        t.repo.put_file(&b, with_parent("base"))?;
        let target = t.dir().join("published");

        let first = t.repo.publish(&target, false)?;
        assert_eq!(first.copied.len(), 2);
        assert!(first.is_complete());
        assert_eq!(
            RepositoryIndex::read(&target.join(INDEX_FILE))?.as_ref(),
            Some(t.repo.index())
        );
        for digest in t.repo.list() {
            assert_eq!(
                fs::read(target.join(format!("{digest}.qcow2")))?,
                fs::read(t.repo.image_path(digest))?
            );
        }

        let second = t.repo.publish(&target, false)?;
        assert!(second.copied.is_empty());
        assert_eq!(second.skipped.len(), 2);
        Ok(())
    }

    #[test]
    fn test_publish_compressed() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", &[7u8; 4096]);
        let digest = t.repo.put_file(&source, IngestMetadata::default())?.image.digest;
        let target = t.dir().join("published");

        let report = t.repo.publish(&target, true)?;

        assert_eq!(report.compressed, vec![digest.clone()]);
        let compressed = target.join(format!("{digest}.qcow2.zst"));
        let decoded = zstd::stream::decode_all(File::open(&compressed)?)?;
        assert_eq!(decoded, fs::read(t.repo.image_path(&digest))?);
        assert!(!target.join(format!("{digest}.qcow2")).exists());

        // a later uncompressed publish doesn't duplicate it
        let again = t.repo.publish(&target, false)?;
        assert_eq!(again.skipped, vec![digest]);
        Ok(())
    }

    #[test]
    fn test_publish_reports_failures_per_item() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let a = t.source("a.img", b"first");
        let b = t.source("b.img", b"second");
        let lost = t.repo.put_file(&a, IngestMetadata::default())?.image.digest;
        let kept = t.repo.put_file(&b, IngestMetadata::default())?.image.digest;
        fs::remove_file(t.repo.image_path(&lost))?;
        let target = t.dir().join("published");

        let report = t.repo.publish(&target, false)?;

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].digest, lost);
        assert_eq!(report.copied, vec![kept]);
        // nothing half-written for the failed one
        assert!(!target.join(format!("{lost}.qcow2")).exists());
        Ok(())
    }

    #[test]
    fn test_create_overlay() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let source = t.source("disk.img", b"data");
        let digest = t.repo.put_file(&source, with_tag("base"))?.image.digest;
        let overlay = t.dir().join("vm.qcow2");

        t.repo.create_overlay("base", &overlay, None)?;

        let info = DiskPreparer::new(t.toolkit.clone(), Sha256Hasher).inspect(&overlay)?;
        let expected = std::path::absolute(t.repo.image_path(&digest))?;
        assert_eq!(
            info.backing_reference,
            Some(expected.to_string_lossy().into_owned())
        );
        assert!(matches!(
            t.repo.create_overlay("missing", &overlay, None),
            Err(Error::UnresolvedReference(_))
        ));
        Ok(())
    }

    #[test]
    fn test_check() -> anyhow::Result<()> {
        let mut t = TestRepo::new();
        let a = t.source("a.img", b"first");
        let b = t.source("b.img", b"second");
        let first = t.repo.put_file(&a, IngestMetadata::default())?.image.digest;
        let second = t.repo.put_file(&b, IngestMetadata::default())?.image.digest;
        assert!(t.repo.check()?.is_clean());

        fs::remove_file(t.repo.image_path(&first))?;
        let stray = t.repo.image_path(&"e".repeat(64));
        fs::write(&stray, b"stray")?;
        let mut orphan = Image::new("f".repeat(64));
        orphan.parent_digest = Some("d".repeat(64));
        t.repo.put(orphan)?;
        fs::write(t.repo.image_path(&"f".repeat(64)), b"orphan")?;

        let report = t.repo.check()?;
        assert_eq!(report.missing_artifacts, vec![first]);
        assert_eq!(report.unindexed_artifacts, vec![stray]);
        assert_eq!(
            report.dangling_parents,
            vec![("f".repeat(64), "d".repeat(64))]
        );
        assert!(report.dangling_tags.is_empty());
        assert!(t.repo.image_path(&second).exists());
        Ok(())
    }
}
