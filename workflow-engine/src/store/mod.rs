// Content Store
// Content-addressed blobs plus the cache-key and artifact indexes built on them

pub mod artifact;
pub mod blob;
pub mod cache;

pub use artifact::{ArtifactInfo, ArtifactStore};
pub use blob::{BlobStore, Manifest, Snapshot};
pub use cache::{CacheHit, CacheStore};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use uuid::Uuid;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Errors that can occur in the content store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    #[error("blob {expected} is corrupt (content hashes to {actual})")]
    Corrupt { expected: Digest, actual: Digest },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid manifest path: {0}")]
    InvalidPath(String),

    #[error("artifact '{name}' already exists in run {run_id}")]
    DuplicateArtifact { run_id: Uuid, name: String },

    #[error("artifact '{name}' not found in run {run_id}")]
    ArtifactNotFound { run_id: Uuid, name: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const DIGEST_PREFIX: &str = "sha256:";

/// A SHA-256 content address, written `sha256:<hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Hash a byte slice
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Lowercase hex without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DIGEST_PREFIX, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| StoreError::InvalidDigest(s.to_string()))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// The blob store with its two indexes, shared by every run of an engine.
#[derive(Debug, Clone)]
pub struct ContentStore {
    pub blobs: Arc<BlobStore>,
    pub cache: Arc<CacheStore>,
    pub artifacts: Arc<ArtifactStore>,
}

impl ContentStore {
    /// Open (creating when needed) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let blobs = Arc::new(BlobStore::open(root).await?);
        let cache = Arc::new(CacheStore::open(root).await?);
        let artifacts = Arc::new(ArtifactStore::open(root).await?);
        Ok(Self {
            blobs,
            cache,
            artifacts,
        })
    }
}

/// Write through a sibling temp file and rename so readers never see a
/// partial file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp: PathBuf = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    tokio::fs::write(&temp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}
