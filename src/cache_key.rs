//! Cache key resolution and on-disk cache layout
//!
//! Every resource URL maps to one data file and one completion marker in the
//! cache directory, both named by the SHA-256 of the URL:
//!
//! ```text
//! <cache_dir>/<sha256-hex>.cache            data, appended in offset order
//! <cache_dir>/<sha256-hex>.cache.complete   marker, holds the byte length
//! ```
//!
//! There is no index; membership and completion are discovered by path
//! existence on every call.

use crate::error::Result;
use crate::models::PopulationState;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DATA_SUFFIX: &str = ".cache";
const MARKER_SUFFIX: &str = ".cache.complete";

/// Content hash of a resource URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a resource URL
    pub fn for_url(url: &str) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        CacheKey(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Paths belonging to one cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub key: CacheKey,
    pub data: PathBuf,
    pub marker: PathBuf,
}

impl CachePaths {
    /// Derive the population state from the filesystem
    pub async fn state(&self) -> PopulationState {
        if fs::try_exists(&self.marker).await.unwrap_or(false) {
            PopulationState::Complete
        } else if fs::try_exists(&self.data).await.unwrap_or(false) {
            PopulationState::Populating
        } else {
            PopulationState::Absent
        }
    }

    /// Whether the completion marker exists
    pub async fn is_complete(&self) -> bool {
        self.state().await == PopulationState::Complete
    }

    /// Byte length recorded in the completion marker
    ///
    /// Returns `None` when the marker is missing or holds no length.
    pub async fn recorded_length(&self) -> Option<u64> {
        let content = fs::read_to_string(&self.marker).await.ok()?;
        content.trim().parse::<u64>().ok()
    }

    /// Atomically publish the completion marker
    ///
    /// The marker is written to a sibling temp file and renamed into place so
    /// readers never observe a half-written marker.
    pub async fn write_marker(&self, length: u64) -> Result<()> {
        let tmp = self.marker.with_extension("complete.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(length.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.marker).await?;
        debug!("Wrote completion marker key={} length={}", self.key, length);
        Ok(())
    }
}

/// Deterministic mapping from resource URL to cache paths
#[derive(Debug, Clone)]
pub struct CacheLayout {
    dir: PathBuf,
}

impl CacheLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CacheLayout { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a resource URL into its data and marker paths
    pub fn resolve(&self, url: &str) -> CachePaths {
        let key = CacheKey::for_url(url);
        let data = self.dir.join(format!("{}{}", key, DATA_SUFFIX));
        let marker = self.dir.join(format!("{}{}", key, MARKER_SUFFIX));
        CachePaths { key, data, marker }
    }

    /// Total bytes held by cache data files in the cache directory
    pub async fn usage_bytes(&self) -> Result<u64> {
        let mut total = 0;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_data = name
                .to_str()
                .and_then(|n| n.strip_suffix(DATA_SUFFIX))
                .is_some_and(|stem| stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit()));
            if !is_data {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }

        Ok(total)
    }
}
