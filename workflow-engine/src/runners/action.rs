// Actions
// Reusable `uses:` steps resolved from an in-process registry

use crate::expression::to_display_string;
use crate::store::{ContentStore, StoreError};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("invalid input '{name}': {message}")]
    InvalidInput { name: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// What an action sees when it runs
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run_id: Uuid,
    pub job_id: String,
    pub workspace: PathBuf,
    /// `with:` values after interpolation
    pub inputs: BTreeMap<String, Value>,
    pub env: HashMap<String, String>,
    pub store: ContentStore,
}

impl ActionContext {
    /// Input as text; empty strings count as absent
    pub fn input(&self, name: &str) -> Option<String> {
        self.inputs
            .get(name)
            .map(to_display_string)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn required_input(&self, name: &str) -> Result<String, ActionError> {
        self.input(name)
            .ok_or_else(|| ActionError::MissingInput(name.to_string()))
    }

    /// A list input given either as a YAML sequence or one item per line
    pub fn input_list(&self, name: &str) -> Vec<String> {
        match self.inputs.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .map(to_display_string)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(other) => to_display_string(other)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve a path input inside the workspace
    fn workspace_path(&self, relative: &str) -> PathBuf {
        let relative = relative.trim();
        if relative.is_empty() || relative == "." {
            self.workspace.clone()
        } else {
            self.workspace.join(relative)
        }
    }
}

/// Work an action asks the job to do once all steps succeeded
#[derive(Debug, Clone, PartialEq)]
pub enum PostJob {
    SaveCache { key: String, paths: Vec<String> },
}

impl PostJob {
    pub async fn run(&self, store: &ContentStore, workspace: &Path) -> Result<(), ActionError> {
        match self {
            PostJob::SaveCache { key, paths } => save_cache(store, workspace, key, paths).await,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub outputs: BTreeMap<String, String>,
    pub post: Option<PostJob>,
}

impl ActionOutput {
    fn with_output(mut self, name: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(name.to_string(), value.into());
        self
    }
}

/// A reusable step implementation
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError>;
}

/// Maps `uses:` references to actions
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the cache and artifact actions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("cache", Arc::new(CacheAction));
        registry.register("cache/restore", Arc::new(CacheRestoreAction));
        registry.register("cache/save", Arc::new(CacheSaveAction));
        registry.register("upload-artifact", Arc::new(UploadArtifactAction));
        registry.register("download-artifact", Arc::new(DownloadArtifactAction));
        registry
    }

    pub fn register(&mut self, name: impl AsRef<str>, action: Arc<dyn Action>) {
        self.actions.insert(normalize(name.as_ref()), action);
    }

    /// Look up a reference such as `cache@v4` or `actions/upload-artifact@v4`
    pub fn resolve(&self, reference: &str) -> Option<Arc<dyn Action>> {
        let name = normalize(reference);
        self.actions
            .get(&name)
            .or_else(|| {
                name.strip_prefix("actions/")
                    .and_then(|short| self.actions.get(short))
            })
            .cloned()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.resolve(reference).is_some()
    }
}

/// Drop the `@version` suffix and compare case-insensitively
fn normalize(reference: &str) -> String {
    let name = reference.split('@').next().unwrap_or(reference);
    name.trim().to_ascii_lowercase()
}

async fn restore_cache(
    ctx: &ActionContext,
    key: &str,
) -> Result<(ActionOutput, bool), ActionError> {
    let restore_keys = ctx.input_list("restore-keys");
    let mut output = ActionOutput::default().with_output("cache-primary-key", key);

    match ctx.store.cache.restore(key, &restore_keys).await {
        Some(hit) => {
            let files = ctx
                .store
                .blobs
                .restore_manifest(&ctx.workspace, &hit.digest)
                .await?;
            info!(key, matched = hit.key.as_str(), files, "restored cache");
            output = output
                .with_output("cache-hit", hit.exact.to_string())
                .with_output("cache-matched-key", hit.key);
            Ok((output, hit.exact))
        }
        None => {
            info!(key, "cache miss");
            Ok((output.with_output("cache-hit", "false"), false))
        }
    }
}

async fn save_cache(
    store: &ContentStore,
    workspace: &Path,
    key: &str,
    paths: &[String],
) -> Result<(), ActionError> {
    if store.cache.contains(key).await {
        info!(key, "cache entry already exists");
        return Ok(());
    }
    let snapshot = store.blobs.snapshot_paths(workspace, paths).await?;
    if snapshot.file_count == 0 {
        warn!(key, "no files matched the cache paths, nothing saved");
        return Ok(());
    }
    store.cache.save(key, &snapshot.digest).await?;
    Ok(())
}

fn required_paths(ctx: &ActionContext) -> Result<Vec<String>, ActionError> {
    let paths = ctx.input_list("path");
    if paths.is_empty() {
        return Err(ActionError::MissingInput("path".to_string()));
    }
    Ok(paths)
}

/// `cache`: restore now, save after the job when the key missed
pub struct CacheAction;

#[async_trait::async_trait]
impl Action for CacheAction {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError> {
        let key = ctx.required_input("key")?;
        let paths = required_paths(ctx)?;
        let (mut output, exact) = restore_cache(ctx, &key).await?;
        if !exact {
            output.post = Some(PostJob::SaveCache { key, paths });
        }
        Ok(output)
    }
}

/// `cache/restore`: restore only
pub struct CacheRestoreAction;

#[async_trait::async_trait]
impl Action for CacheRestoreAction {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError> {
        let key = ctx.required_input("key")?;
        required_paths(ctx)?;
        let (output, _) = restore_cache(ctx, &key).await?;
        Ok(output)
    }
}

/// `cache/save`: save immediately
pub struct CacheSaveAction;

#[async_trait::async_trait]
impl Action for CacheSaveAction {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError> {
        let key = ctx.required_input("key")?;
        let paths = required_paths(ctx)?;
        save_cache(&ctx.store, &ctx.workspace, &key, &paths).await?;
        Ok(ActionOutput::default())
    }
}

/// `upload-artifact`: snapshot paths under a run-scoped name
pub struct UploadArtifactAction;

#[async_trait::async_trait]
impl Action for UploadArtifactAction {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError> {
        let name = ctx.input("name").unwrap_or_else(|| "artifact".to_string());
        let paths = required_paths(ctx)?;
        let if_no_files = ctx
            .input("if-no-files-found")
            .unwrap_or_else(|| "warn".to_string());

        let snapshot = ctx
            .store
            .blobs
            .snapshot_paths(&ctx.workspace, &paths)
            .await?;

        if snapshot.file_count == 0 {
            match if_no_files.as_str() {
                "error" => {
                    return Err(ActionError::Failed(format!(
                        "no files found for artifact '{}'",
                        name
                    )))
                }
                "ignore" => {}
                "warn" => warn!(artifact = name.as_str(), "no files found, uploading empty artifact"),
                other => {
                    return Err(ActionError::InvalidInput {
                        name: "if-no-files-found".to_string(),
                        message: format!("expected warn, error or ignore, got '{}'", other),
                    })
                }
            }
        }

        ctx.store
            .artifacts
            .upload(ctx.run_id, &name, &snapshot.digest)
            .await?;

        Ok(ActionOutput::default()
            .with_output("artifact-digest", snapshot.digest.to_string())
            .with_output("file-count", snapshot.file_count.to_string()))
    }
}

/// `download-artifact`: restore a named artifact of the current run
pub struct DownloadArtifactAction;

#[async_trait::async_trait]
impl Action for DownloadArtifactAction {
    async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError> {
        let name = ctx.required_input("name")?;
        let target = ctx.workspace_path(&ctx.input("path").unwrap_or_default());

        let digest = ctx.store.artifacts.download(ctx.run_id, &name).await?;
        let files = ctx.store.blobs.restore_manifest(&target, &digest).await?;
        info!(artifact = name.as_str(), files, "downloaded artifact");

        Ok(ActionOutput::default().with_output("download-path", target.display().to_string()))
    }
}
