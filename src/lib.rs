//! A content-addressed repository of disk images.
//!
//! Images are converted to compressed qcow2 artifacts, stored under the
//! SHA-256 of their bytes, optionally chained onto a parent image so only the
//! differing clusters are kept, and described in a JSON index that maps
//! digests to metadata and human-readable tags to digests.

pub mod config;
pub mod digest;
pub mod disk;
pub mod error;
pub mod index;
pub mod repository;
pub mod toolkit;


pub use error::{Error, Result};
pub use repository::{Repository, RepositoryConfig};
