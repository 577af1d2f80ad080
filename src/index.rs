//! The persistent repository index.
//!
//! The index maps content digests to [`Image`] records and tag names to
//! digests.  It is the sole source of truth for what a repository contains:
//! it is read completely into memory when a repository is opened and rewritten
//! completely after every mutation.
//!
//! # File format
//!
//! ```json
//! {
//!   "version": 0,
//!   "images": {
//!     "4e67eaccd9fd...": {
//!       "digest": "4e67eaccd9fd...",
//!       "tag": "base",
//!       "virtual_size": 10737418240,
//!       "actual_size": 1234567,
//!       "created_at": "2024-05-01T12:00:00Z",
//!       "os": "alpine",
//!       "built": { "timestamp": "2024-04-30T08:00:00Z" }
//!     }
//!   },
//!   "tags": { "base": "4e67eaccd9fd..." }
//! }
//! ```
//!
//! The index is written to a temporary file next to the destination and
//! renamed over it, so an interrupted save leaves either the old or the new
//! index, never a truncated one.

use std::{
    collections::BTreeMap,
    fs::{self, Permissions},
    io::{ErrorKind, Write},
    ops::Bound,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, IoResultExt, Result};

/// Appended to the name of an index that could not be parsed.
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Field names of [`Image`] that caller metadata may not use.
pub const RESERVED_KEYS: &[&str] = &[
    "digest",
    "tag",
    "parent_digest",
    "parent_tag",
    "virtual_size",
    "actual_size",
    "created_at",
];

/// A caller-supplied metadata value.
///
/// Integers and strings are stored as plain JSON values.  Timestamps are
/// stored as `{"timestamp": "<RFC 3339>"}`, so a string that merely looks
/// like a timestamp reads back as a string.  Use [`MetadataValue::parse`] to
/// build values from command-line text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredValue", into = "StoredValue")]
pub enum MetadataValue {
    /// An integer.
    Integer(i64),
    /// A point in time.
    Timestamp(DateTime<Utc>),
    /// Free-form text.
    String(String),
}

/// JSON encoding of [`MetadataValue`].
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Integer(i64),
    Timestamp { timestamp: DateTime<Utc> },
    String(String),
}

impl From<StoredValue> for MetadataValue {
    fn from(value: StoredValue) -> Self {
        match value {
            StoredValue::Integer(value) => MetadataValue::Integer(value),
            StoredValue::Timestamp { timestamp } => MetadataValue::Timestamp(timestamp),
            StoredValue::String(value) => MetadataValue::String(value),
        }
    }
}

impl From<MetadataValue> for StoredValue {
    fn from(value: MetadataValue) -> Self {
        match value {
            MetadataValue::Integer(value) => StoredValue::Integer(value),
            MetadataValue::Timestamp(timestamp) => StoredValue::Timestamp { timestamp },
            MetadataValue::String(value) => StoredValue::String(value),
        }
    }
}

impl MetadataValue {
    /// Interpret `text` as an integer, then a timestamp, then a plain string.
    pub fn parse(text: &str) -> Self {
        if let Ok(value) = text.parse::<i64>() {
            MetadataValue::Integer(value)
        } else if let Ok(value) = DateTime::parse_from_rfc3339(text) {
            MetadataValue::Timestamp(value.with_timezone(&Utc))
        } else {
            MetadataValue::String(text.to_string())
        }
    }
}

/// Metadata for one stored artifact, keyed by its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Content digest of the artifact.
    pub digest: String,
    /// Human-readable label; at most one image holds a given tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Digest of the image this one is backed by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_digest: Option<String>,
    /// Tag the parent held when this image was ingested (display only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tag: Option<String>,
    /// Size of the virtual disk, in bytes.
    #[serde(default)]
    pub virtual_size: u64,
    /// Space used by the artifact, in bytes.
    #[serde(default)]
    pub actual_size: u64,
    /// When the image was ingested.
    pub created_at: DateTime<Utc>,
    /// Caller-supplied metadata.
    #[serde(flatten)]
    pub extra: BTreeMap<String, MetadataValue>,
}

impl Image {
    /// A root image with no tag and no extra metadata, created now.
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            tag: None,
            parent_digest: None,
            parent_tag: None,
            virtual_size: 0,
            actual_size: 0,
            created_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }
}

/// In-memory copy of a repository's index file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    /// Format version.
    #[serde(default)]
    pub version: u32,
    /// Images by digest.
    #[serde(default)]
    pub images: BTreeMap<String, Image>,
    /// Digests by tag.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RepositoryIndex {
    /// Read the index at `path`.
    ///
    /// Returns `Ok(None)` if there is no index yet and
    /// [`Error::IndexCorrupt`] if the file cannot be parsed.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| Error::IndexCorrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Read the index at `path`, falling back to an empty index.
    ///
    /// A missing index means the repository has not been initialized yet.  An
    /// unreadable one is logged and treated the same way; if it cannot be
    /// parsed it is first moved aside to `<path>.corrupt`, so that the next
    /// save does not destroy it.
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(Some(index)) => index,
            Ok(None) => {
                debug!("No index at {}, starting empty", path.display());
                Self::default()
            }
            Err(e @ Error::IndexCorrupt { .. }) => {
                let mut backup = path.as_os_str().to_owned();
                backup.push(CORRUPT_SUFFIX);
                let backup = PathBuf::from(backup);
                match fs::rename(path, &backup) {
                    Ok(()) => warn!("{e}; moved it to {} and starting empty", backup.display()),
                    Err(rename) => warn!(
                        "{e}; starting empty (could not move it to {}: {rename})",
                        backup.display()
                    ),
                }
                Self::default()
            }
            Err(e) => {
                warn!("{e}; starting with an empty index");
                Self::default()
            }
        }
    }

    /// Write the whole index to `path`, atomically replacing any previous one.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');

        let mut tmp = NamedTempFile::new_in(dir).at(dir)?;
        tmp.write_all(&data).at(tmp.path())?;
        tmp.as_file()
            .set_permissions(Permissions::from_mode(0o644))
            .at(tmp.path())?;
        tmp.as_file().sync_all().at(tmp.path())?;
        tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
        Ok(())
    }

    /// Insert or replace `image`.
    ///
    /// If the image carries a tag, any other image holding that tag loses it.
    /// A tag the previous record for this digest held, and which the new
    /// record drops, is removed.
    pub fn put(&mut self, image: Image) {
        let digest = image.digest.clone();

        if let Some(previous) = self.images.get(&digest).and_then(|i| i.tag.clone()) {
            if image.tag.as_deref() != Some(previous.as_str())
                && self.tags.get(&previous) == Some(&digest)
            {
                self.tags.remove(&previous);
            }
        }

        if let Some(tag) = &image.tag {
            for other in self.images.values_mut() {
                if other.digest != digest && other.tag.as_deref() == Some(tag.as_str()) {
                    other.tag = None;
                }
            }
            self.tags.insert(tag.clone(), digest.clone());
        }

        self.images.insert(digest, image);
    }

    /// Remove `tag`, clearing it from the image that held it.
    ///
    /// Returns the digest the tag pointed to.
    pub fn remove_tag(&mut self, tag: &str) -> Option<String> {
        let digest = self.tags.remove(tag)?;
        if let Some(image) = self.images.get_mut(&digest) {
            if image.tag.as_deref() == Some(tag) {
                image.tag = None;
            }
        }
        Some(digest)
    }

    /// Resolve a digest, digest prefix or tag to a digest.
    ///
    /// Digests are tried first: the first digest (in key order) starting with
    /// `name` wins, even if the prefix is ambiguous.  Otherwise `name` is
    /// looked up as a tag.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if !name.is_empty() {
            let first = self
                .images
                .range::<str, _>((Bound::Included(name), Bound::Unbounded))
                .next();
            if let Some((digest, _)) = first {
                if digest.starts_with(name) {
                    return Some(digest.as_str());
                }
            }
        }

        self.tags
            .get(name)
            .map(String::as_str)
            .filter(|digest| self.images.contains_key(*digest))
    }

    /// The image stored under exactly `digest`.
    pub fn get(&self, digest: &str) -> Option<&Image> {
        self.images.get(digest)
    }
}
