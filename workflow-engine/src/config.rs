// Engine Configuration
// Runner pool, store location and execution limits loaded from YAML

use crate::utils::resolve_working_dir;
use crate::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Label that lets a runner accept any `runs-on` requirement
pub const WILDCARD_LABEL: &str = "*";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Root of the content-addressed store (blobs, cache index, artifacts)
    pub store_dir: PathBuf,

    /// Workspace directory steps run in (the enclosing git repository by default)
    pub work_dir: PathBuf,

    /// Scratch space for per-step file commands
    pub temp_dir: PathBuf,

    /// Available runners
    pub runners: Vec<RunnerConfig>,

    /// Global cap on concurrently running job instances (0 = unlimited)
    pub max_parallel_jobs: usize,

    /// Job timeout when a job sets no `timeout-minutes`
    pub default_job_timeout_minutes: u32,

    /// Shell used by `run` steps when neither the step nor the defaults name one
    pub default_shell: Option<String>,

    /// Whether steps see the engine's own process environment
    pub inherit_env: bool,
}

/// A runner definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Unique runner name
    pub name: String,

    /// Labels matched against `runs-on`
    #[serde(default)]
    pub labels: Vec<String>,

    /// Number of job instances the runner can host at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    1
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        let store_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".workflow-engine")
            .join("store");

        Self {
            store_dir,
            work_dir: resolve_working_dir(),
            temp_dir: std::env::temp_dir().join("workflow-engine"),
            runners: vec![RunnerConfig {
                name: "local".to_string(),
                labels: vec![WILDCARD_LABEL.to_string()],
                capacity: available_parallelism(),
            }],
            max_parallel_jobs: 0,
            default_job_timeout_minutes: 360,
            default_shell: None,
            inherit_env: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string and validate it
    pub fn from_yaml_str(content: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted in a single directory (handy for tests and sandboxes)
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            store_dir: root.join("store"),
            work_dir: root.join("work"),
            temp_dir: root.join("tmp"),
            ..Default::default()
        }
    }

    /// Replace the runner pool
    pub fn with_runners(mut self, runners: Vec<RunnerConfig>) -> Self {
        self.runners = runners;
        self
    }

    /// Check invariants the scheduler relies on
    pub fn validate(&self) -> EngineResult<()> {
        if self.runners.is_empty() {
            return Err(EngineError::Config(
                "at least one runner must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for runner in &self.runners {
            if runner.capacity == 0 {
                return Err(EngineError::Config(format!(
                    "runner '{}' has zero capacity",
                    runner.name
                )));
            }
            if !names.insert(runner.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate runner name '{}'",
                    runner.name
                )));
            }
        }

        Ok(())
    }
}

impl RunnerConfig {
    pub fn new(name: impl Into<String>, labels: &[&str], capacity: usize) -> Self {
        Self {
            name: name.into(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runners.len(), 1);
        assert_eq!(config.runners[0].labels, vec!["*"]);
        assert!(config.runners[0].capacity >= 1);
        assert_eq!(config.default_job_timeout_minutes, 360);
        assert!(config.store_dir.ends_with(".workflow-engine/store"));
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
store-dir: /var/lib/engine/store
max-parallel-jobs: 4
default-shell: bash
runners:
  - name: linux-1
    labels: [self-hosted, linux]
    capacity: 2
  - name: mac-1
    labels: [self-hosted, macos]
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/engine/store"));
        assert_eq!(config.max_parallel_jobs, 4);
        assert_eq!(config.default_shell.as_deref(), Some("bash"));
        assert_eq!(config.runners.len(), 2);
        assert_eq!(config.runners[1].capacity, 1);
        // Unspecified fields keep their defaults
        assert!(config.inherit_env);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let yaml = r#"
runners:
  - name: broken
    capacity: 0
"#;
        let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("zero capacity"));
    }

    #[test]
    fn test_rejects_duplicate_runner_names() {
        let config = EngineConfig::default().with_runners(vec![
            RunnerConfig::new("a", &["linux"], 1),
            RunnerConfig::new("a", &["macos"], 1),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate runner name"));
    }

    #[test]
    fn test_rejects_empty_runner_list() {
        let config = EngineConfig::default().with_runners(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yml");
        fs::write(&path, "max-parallel-jobs: 2\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.max_parallel_jobs, 2);
    }
}
