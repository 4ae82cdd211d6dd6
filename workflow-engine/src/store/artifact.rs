// Artifact Store
// Per-run named manifests shared between the jobs of a run

use crate::store::{write_atomic, Digest, StoreError, StoreResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub digest: Digest,
    pub uploaded_at: DateTime<Utc>,
}

/// run id -> artifact name -> info
type ArtifactIndex = BTreeMap<String, BTreeMap<String, ArtifactInfo>>;

/// Artifact index stored at `<root>/artifacts/index.json`
#[derive(Debug)]
pub struct ArtifactStore {
    index_path: PathBuf,
    index: RwLock<ArtifactIndex>,
}

impl ArtifactStore {
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let index_path = root.as_ref().join("artifacts").join("index.json");
        let index = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ArtifactIndex::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            index_path,
            index: RwLock::new(index),
        })
    }

    /// Register an artifact for a run; names are unique within a run
    pub async fn upload(&self, run_id: Uuid, name: &str, digest: &Digest) -> StoreResult<()> {
        let mut index = self.index.write().await;
        let run_key = run_id.to_string();

        let exists = index
            .get(&run_key)
            .is_some_and(|artifacts| artifacts.contains_key(name));
        if exists {
            return Err(StoreError::DuplicateArtifact {
                run_id,
                name: name.to_string(),
            });
        }

        index.entry(run_key.clone()).or_default().insert(
            name.to_string(),
            ArtifactInfo {
                name: name.to_string(),
                digest: digest.clone(),
                uploaded_at: Utc::now(),
            },
        );

        let bytes = serde_json::to_vec_pretty(&*index)?;
        if let Err(e) = write_atomic(&self.index_path, &bytes).await {
            if let Some(artifacts) = index.get_mut(&run_key) {
                artifacts.remove(name);
            }
            return Err(e.into());
        }

        info!(%run_id, name, %digest, "uploaded artifact");
        Ok(())
    }

    pub async fn download(&self, run_id: Uuid, name: &str) -> StoreResult<Digest> {
        self.index
            .read()
            .await
            .get(&run_id.to_string())
            .and_then(|artifacts| artifacts.get(name))
            .map(|info| info.digest.clone())
            .ok_or_else(|| StoreError::ArtifactNotFound {
                run_id,
                name: name.to_string(),
            })
    }

    /// Artifacts of a run, sorted by name
    pub async fn list(&self, run_id: Uuid) -> Vec<ArtifactInfo> {
        self.index
            .read()
            .await
            .get(&run_id.to_string())
            .map(|artifacts| artifacts.values().cloned().collect())
            .unwrap_or_default()
    }
}
