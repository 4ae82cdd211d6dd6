// Blob Store
// Immutable, hash-verified blobs and the path manifests that group them

use crate::store::{write_atomic, Digest, StoreError, StoreResult};

use globset::{GlobBuilder, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Blobs stored at `<root>/blobs/sha256/<first two hex>/<hex>`
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

/// A set of files captured from a directory: relative path -> blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<String, Digest>,
}

/// Result of [`BlobStore::snapshot_paths`]
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Digest of the manifest blob
    pub digest: Digest,
    pub file_count: usize,
}

impl BlobStore {
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join("blobs").join("sha256");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.dir.join(&hex[..2]).join(hex)
    }

    /// Store bytes; storing the same content twice is a no-op
    pub async fn put(&self, bytes: &[u8]) -> StoreResult<Digest> {
        let digest = Digest::of(bytes);
        let path = self.path_for(&digest);
        if tokio::fs::try_exists(&path).await? {
            return Ok(digest);
        }
        write_atomic(&path, bytes).await?;
        debug!(%digest, size = bytes.len(), "stored blob");
        Ok(digest)
    }

    /// Read a blob and verify it still hashes to its address
    pub async fn get(&self, digest: &Digest) -> StoreResult<Vec<u8>> {
        let bytes = match tokio::fs::read(self.path_for(digest)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(digest.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = Digest::of(&bytes);
        if actual != *digest {
            return Err(StoreError::Corrupt {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(bytes)
    }

    pub async fn contains(&self, digest: &Digest) -> bool {
        tokio::fs::try_exists(self.path_for(digest))
            .await
            .unwrap_or(false)
    }

    /// Store every file selected by `paths` (relative to `root`) and return
    /// the digest of the resulting manifest.
    ///
    /// A path may name a file, a directory (taken recursively) or a glob.
    /// Paths that select nothing are skipped.
    pub async fn snapshot_paths(&self, root: &Path, paths: &[String]) -> StoreResult<Snapshot> {
        let mut manifest = Manifest::default();

        let walk_root = root.to_path_buf();
        let walk_paths = paths.to_vec();
        let selected = tokio::task::spawn_blocking(move || select_files(&walk_root, &walk_paths))
            .await
            .map_err(io::Error::other)??;

        for relative in selected {
            let bytes = tokio::fs::read(root.join(&relative)).await?;
            let digest = self.put(&bytes).await?;
            manifest.files.insert(relative, digest);
        }

        let file_count = manifest.files.len();
        let digest = self.put(&serde_json::to_vec(&manifest)?).await?;
        debug!(%digest, file_count, "snapshotted paths");
        Ok(Snapshot { digest, file_count })
    }

    pub async fn read_manifest(&self, digest: &Digest) -> StoreResult<Manifest> {
        let bytes = self.get(digest).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the files of a manifest back under `root`; returns the count
    pub async fn restore_manifest(&self, root: &Path, digest: &Digest) -> StoreResult<usize> {
        let manifest = self.read_manifest(digest).await?;

        for (relative, file_digest) in &manifest.files {
            let target = root.join(safe_relative(relative)?);
            let bytes = self.get(file_digest).await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
        }

        Ok(manifest.files.len())
    }
}

/// Reject absolute paths and `..` so manifests stay inside their root
fn safe_relative(path: &str) -> StoreResult<PathBuf> {
    let candidate = Path::new(path);
    let safe = candidate
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || !safe {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(candidate.to_path_buf())
}

fn is_glob(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Root-relative file paths (with `/` separators) selected by `paths`
fn select_files(root: &Path, paths: &[String]) -> StoreResult<Vec<String>> {
    let mut selected = Vec::new();
    let mut globs = GlobSetBuilder::new();
    let mut has_globs = false;

    for raw in paths {
        let path = raw.trim().trim_end_matches('/');
        if path.is_empty() {
            continue;
        }
        if is_glob(path) {
            let glob = GlobBuilder::new(path)
                .literal_separator(true)
                .build()
                .map_err(|e| StoreError::InvalidPath(format!("{}: {}", raw, e)))?;
            globs.add(glob);
            has_globs = true;
            continue;
        }

        let relative = safe_relative(path)?;
        let absolute = root.join(&relative);
        if absolute.is_file() {
            selected.push(to_slash(&relative));
        } else if absolute.is_dir() {
            walk(root, &absolute, &mut selected)?;
        } else {
            warn!(path = raw.as_str(), "path does not exist, skipping");
        }
    }

    if has_globs {
        let set = globs
            .build()
            .map_err(|e| StoreError::InvalidPath(e.to_string()))?;
        let mut all = Vec::new();
        walk(root, root, &mut all)?;
        selected.extend(all.into_iter().filter(|p| set.is_match(p)));
    }

    selected.sort();
    selected.dedup();
    Ok(selected)
}

/// Collect files below `dir`; symlinked directories are not followed
fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            walk(root, &path, out)?;
            continue;
        }
        if file_type.is_symlink() && !path.is_file() {
            debug!(path = %path.display(), "skipping symlink");
            continue;
        }
        if let Ok(relative) = path.strip_prefix(root) {
            out.push(to_slash(relative));
        }
    }
    Ok(())
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (_dir, store) = store().await;
        let first = store.put(b"payload").await.unwrap();
        let second = store.put(b"payload").await.unwrap();
        assert_eq!(first, second);
        assert!(store.contains(&first).await);
        assert_eq!(store.get(&first).await.unwrap(), b"payload");

        let path = store.path_for(&first);
        assert!(path.to_string_lossy().contains(&first.hex()[..2]));
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let (_dir, store) = store().await;
        let digest = Digest::of(b"never stored");
        assert!(!store.contains(&digest).await);
        assert!(matches!(
            store.get(&digest).await,
            Err(StoreError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let (_dir, store) = store().await;
        let digest = store.put(b"original").await.unwrap();
        std::fs::write(store.path_for(&digest), b"tampered").unwrap();

        match store.get(&digest).await {
            Err(StoreError::Corrupt { expected, actual }) => {
                assert_eq!(expected, digest);
                assert_eq!(actual, Digest::of(b"tampered"));
            }
            other => panic!("expected corruption error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_and_restore_directory() {
        let (_dir, store) = store().await;
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("target/debug/deps")).unwrap();
        fs::write(source.path().join("target/debug/app"), b"binary").unwrap();
        fs::write(source.path().join("target/debug/deps/lib.rlib"), b"rlib").unwrap();
        fs::write(source.path().join("Cargo.lock"), b"lock").unwrap();

        let snapshot = store
            .snapshot_paths(
                source.path(),
                &["target".to_string(), "Cargo.lock".to_string(), "missing".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(snapshot.file_count, 3);

        let target = tempfile::tempdir().unwrap();
        let restored = store
            .restore_manifest(target.path(), &snapshot.digest)
            .await
            .unwrap();
        assert_eq!(restored, 3);
        assert_eq!(
            fs::read(target.path().join("target/debug/deps/lib.rlib")).unwrap(),
            b"rlib"
        );
        assert_eq!(fs::read(target.path().join("Cargo.lock")).unwrap(), b"lock");
    }

    #[tokio::test]
    async fn test_snapshot_globs() {
        let (_dir, store) = store().await;
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("dist")).unwrap();
        fs::write(source.path().join("dist/a.tar.gz"), b"a").unwrap();
        fs::write(source.path().join("dist/notes.txt"), b"n").unwrap();

        let snapshot = store
            .snapshot_paths(source.path(), &["dist/*.tar.gz".to_string()])
            .await
            .unwrap();
        let manifest = store.read_manifest(&snapshot.digest).await.unwrap();
        assert_eq!(
            manifest.files.keys().collect::<Vec<_>>(),
            vec!["dist/a.tar.gz"]
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_escaping_paths() {
        let (_dir, store) = store().await;
        let file = store.put(b"evil").await.unwrap();
        let mut manifest = Manifest::default();
        manifest.files.insert("../outside".to_string(), file);
        let digest = store
            .put(&serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();

        let target = tempfile::tempdir().unwrap();
        assert!(matches!(
            store.restore_manifest(target.path(), &digest).await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_skips_symlinked_directories() {
        let (_dir, store) = store().await;
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("src")).unwrap();
        fs::write(source.path().join("src/main.rs"), b"fn main() {}").unwrap();
        std::os::unix::fs::symlink(source.path(), source.path().join("src/loop")).unwrap();
        std::os::unix::fs::symlink("main.rs", source.path().join("src/alias.rs")).unwrap();

        let snapshot = store
            .snapshot_paths(source.path(), &["src".to_string(), "**/*.rs".to_string()])
            .await
            .unwrap();
        let manifest = store.read_manifest(&snapshot.digest).await.unwrap();
        assert_eq!(
            manifest.files.keys().collect::<Vec<_>>(),
            vec!["src/alias.rs", "src/main.rs"]
        );
    }

    #[test]
    fn test_snapshot_rejects_parent_paths() {
        let root = tempfile::tempdir().unwrap();
        assert!(select_files(root.path(), &["../etc".to_string()]).is_err());
    }
}
