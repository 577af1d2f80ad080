//! Configuration file parsing.
//!
//! A configuration file names one or more repositories:
//!
//! ```toml
//! default_repo = "default"
//!
//! [repos.default]
//! type = "local"
//! path = "/var/lib/diskrepo/default"
//!
//! [repos.scratch]
//! path = "/tmp/diskrepo"
//! ```
//!
//! Only local repositories exist; `type` may be omitted.

use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

use serde::Deserialize;

use crate::{
    error::{Error, IoResultExt, Result},
    repository::RepositoryConfig,
};

/// Name of the repository used when neither the caller nor the file picks one.
pub const DEFAULT_REPO: &str = "default";

/// The only supported repository type.
pub const LOCAL_REPO_TYPE: &str = "local";

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Repository used when none is named explicitly.
    #[serde(default)]
    pub default_repo: Option<String>,

    /// Repositories, by name.
    #[serde(default)]
    pub repos: BTreeMap<String, RepoEntry>,
}

/// One `[repos.NAME]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoEntry {
    /// Repository type; only `"local"` is understood.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    /// Repository root directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Read and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).at(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
    }

    /// The repository called `name`, or the default one.
    pub fn repository(&self, name: Option<&str>) -> Result<RepositoryConfig> {
        if self.repos.is_empty() {
            return Err(Error::Configuration("no repositories configured".into()));
        }

        let name = name
            .or(self.default_repo.as_deref())
            .unwrap_or(DEFAULT_REPO);
        let entry = self
            .repos
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("repository '{name}' is not configured")))?;

        if let Some(kind) = entry.kind.as_deref() {
            if kind != LOCAL_REPO_TYPE {
                return Err(Error::Configuration(format!(
                    "repository '{name}' has unsupported type '{kind}'"
                )));
            }
        }

        let path = entry
            .path
            .as_ref()
            .ok_or_else(|| Error::Configuration(format!("repository '{name}' has no path")))?;

        Ok(RepositoryConfig::new(path))
    }
}
