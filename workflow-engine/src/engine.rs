// Workflow Engine
// Entry point: holds registered workflows and turns repository events into runs

use crate::config::EngineConfig;
use crate::execution::{
    CancelToken, EventSender, ExecutionEvent, JobRunner, ProgressSender, RunContext, RunExecutor,
    RunResult,
};
use crate::runners::{Action, ActionRegistry, RunnerPool};
use crate::store::ContentStore;
use crate::trigger::{RepositoryEvent, TriggerEvaluator};
use crate::workflow::{Workflow, WorkflowParser};
use crate::{EngineError, EngineResult};

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Registered workflows plus the shared runner pool and store
#[derive(Debug)]
pub struct WorkflowEngine {
    config: Arc<EngineConfig>,
    store: ContentStore,
    pool: RunnerPool,
    actions: ActionRegistry,
    workflows: BTreeMap<String, Arc<Workflow>>,
    event_tx: Option<ProgressSender>,
    cancel: CancelToken,
}

impl WorkflowEngine {
    /// Validate the configuration and open the store and scratch directories
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.temp_dir).await?;
        tokio::fs::create_dir_all(&config.work_dir).await?;
        let store = ContentStore::open(&config.store_dir).await?;
        let pool = RunnerPool::new(&config.runners, config.max_parallel_jobs);

        info!(
            store = %config.store_dir.display(),
            runners = config.runners.len(),
            "workflow engine ready"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            pool,
            actions: ActionRegistry::with_builtins(),
            workflows: BTreeMap::new(),
            event_tx: None,
            cancel: CancelToken::new(),
        })
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register a custom action, replacing any built-in of the same name
    pub fn with_action(mut self, name: impl AsRef<str>, action: Arc<dyn Action>) -> Self {
        self.actions.register(name, action);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Validate and register a workflow under its display name.
    ///
    /// A workflow with the same name replaces the previous one.
    pub fn register(&mut self, workflow: Workflow) -> EngineResult<()> {
        WorkflowParser::validate(&workflow)?;
        let name = workflow.display_name().to_string();
        debug!(workflow = name.as_str(), jobs = workflow.jobs.len(), "registered workflow");
        self.workflows.insert(name, Arc::new(workflow));
        Ok(())
    }

    /// Load one workflow file, returning the name it was registered under.
    ///
    /// Workflows without a `name:` are named after the file stem.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> EngineResult<String> {
        let path = path.as_ref();
        let mut workflow = WorkflowParser::from_file(path)?;
        if workflow.name.is_none() {
            workflow.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        let name = workflow.display_name().to_string();
        self.register(workflow)
            .map_err(|e| match e {
                EngineError::InvalidWorkflow(msg) => {
                    EngineError::InvalidWorkflow(format!("{}: {}", path.display(), msg))
                }
                other => other,
            })?;
        Ok(name)
    }

    /// Load every `*.yml` and `*.yaml` file in a directory, in file name order
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> EngineResult<Vec<String>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_workflow = path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yml" || ext == "yaml");
            if is_workflow {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|path| self.load_file(path)).collect()
    }

    /// Registered workflows by name
    pub fn workflows(&self) -> impl Iterator<Item = (&str, &Workflow)> {
        self.workflows
            .iter()
            .map(|(name, workflow)| (name.as_str(), workflow.as_ref()))
    }

    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name).map(|w| w.as_ref())
    }

    /// Token that cancels every run of this engine
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start a run of every workflow the event triggers and wait for them.
    ///
    /// Triggers are evaluated for all workflows first, so an invalid
    /// dispatch input fails the call before any run starts. Results are
    /// ordered by workflow name.
    pub async fn handle_event(&self, event: &RepositoryEvent) -> EngineResult<Vec<RunResult>> {
        let mut matched = Vec::new();
        for (name, workflow) in &self.workflows {
            if let Some(trigger) = TriggerEvaluator::evaluate(workflow, event)? {
                matched.push((name.clone(), Arc::clone(workflow), trigger.inputs));
            }
        }

        info!(
            event = event.event_name(),
            matched = matched.len(),
            registered = self.workflows.len(),
            "evaluated triggers"
        );

        let executor = self.executor();
        let mut runs: JoinSet<(String, EngineResult<RunResult>)> = JoinSet::new();
        for (name, workflow, inputs) in matched {
            let run = self.run_context(workflow, event.clone(), inputs);
            let executor = executor.clone();
            let cancel = self.cancel.subscribe();
            runs.spawn(async move { (name, executor.execute(run, cancel).await) });
        }

        let mut finished = Vec::new();
        while let Some(joined) = runs.join_next().await {
            let (name, result) = joined?;
            finished.push((name, result?));
        }
        finished.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(finished.into_iter().map(|(_, result)| result).collect())
    }

    /// Run a registered workflow directly, bypassing its trigger filters.
    ///
    /// Inputs are checked against the `workflow_dispatch` declarations when
    /// the workflow has them.
    pub async fn run_workflow(
        &self,
        name: &str,
        event: RepositoryEvent,
        inputs: BTreeMap<String, Value>,
    ) -> EngineResult<RunResult> {
        let workflow = self
            .workflows
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))?;

        let inputs = TriggerEvaluator::resolve_manual_inputs(&workflow, &inputs).map_err(|e| {
            self.event_tx.send_event(ExecutionEvent::error(
                format!("workflow '{}' rejected its inputs: {}", name, e),
                None,
                None,
            ));
            e
        })?;

        let run = self.run_context(workflow, event, inputs);
        self.executor().execute(run, self.cancel.subscribe()).await
    }

    fn run_context(
        &self,
        workflow: Arc<Workflow>,
        event: RepositoryEvent,
        inputs: BTreeMap<String, Value>,
    ) -> RunContext {
        RunContext::new(workflow, event, inputs, self.config.work_dir.clone())
    }

    fn executor(&self) -> RunExecutor {
        let job_runner = JobRunner::new(
            Arc::clone(&self.config),
            self.actions.clone(),
            self.store.clone(),
        )
        .with_progress(self.event_tx.clone());
        RunExecutor::new(self.pool.clone(), Arc::new(job_runner))
            .with_progress(self.event_tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::progress_channel;

    fn valid_workflow(name: &str, on: &str) -> String {
        format!(
            "name: {}\non: {}\njobs:\n  build:\n    steps:\n      - run: echo hi\n",
            name, on
        )
    }

    #[tokio::test]
    async fn test_new_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(EngineConfig::in_dir(dir.path()))
            .await
            .unwrap();

        assert!(dir.path().join("store").is_dir());
        assert!(dir.path().join("tmp").is_dir());
        assert!(dir.path().join("work").is_dir());
        assert_eq!(engine.config().store_dir, dir.path().join("store"));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::in_dir(dir.path()).with_runners(vec![]);
        let err = WorkflowEngine::new(config).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_register_validates() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = WorkflowEngine::new(EngineConfig::in_dir(dir.path()))
            .await
            .unwrap();

        let cyclic = WorkflowParser::parse(
            r#"
on: push
jobs:
  a:
    needs: b
    steps:
      - run: echo a
  b:
    needs: a
    steps:
      - run: echo b
"#,
        )
        .unwrap();
        let err = engine.register(cyclic).unwrap_err();
        assert!(matches!(err, EngineError::Graph(_)));
        assert_eq!(engine.workflows().count(), 0);

        let ok = WorkflowParser::parse(&valid_workflow("CI", "push")).unwrap();
        engine.register(ok).unwrap();
        assert!(engine.workflow("CI").is_some());
    }

    #[tokio::test]
    async fn test_load_dir_reads_yaml_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("ci.yml"), valid_workflow("CI", "push")).unwrap();
        std::fs::write(
            workflows.join("nightly.yaml"),
            "on: schedule\njobs:\n  sweep:\n    steps:\n      - run: echo sweep\n",
        )
        .unwrap();
        std::fs::write(workflows.join("README.md"), "# not a workflow").unwrap();

        let mut engine = WorkflowEngine::new(EngineConfig::in_dir(dir.path()))
            .await
            .unwrap();
        let names = engine.load_dir(&workflows).unwrap();

        assert_eq!(names, vec!["CI".to_string(), "nightly".to_string()]);
        let registered: Vec<&str> = engine.workflows().map(|(name, _)| name).collect();
        assert_eq!(registered, vec!["CI", "nightly"]);
    }

    #[tokio::test]
    async fn test_load_file_reports_path_on_invalid_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yml");
        std::fs::write(&path, "on: push\njobs:\n  build:\n    steps: []\n").unwrap();

        let mut engine = WorkflowEngine::new(EngineConfig::in_dir(dir.path()))
            .await
            .unwrap();
        let err = engine.load_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.yml"), "{}", err);
    }

    #[tokio::test]
    async fn test_run_unknown_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WorkflowEngine::new(EngineConfig::in_dir(dir.path()))
            .await
            .unwrap();
        let err = engine
            .run_workflow("missing", RepositoryEvent::push("refs/heads/main", "s"), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_dispatch_inputs_fail_before_any_run() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = progress_channel();
        let mut engine = WorkflowEngine::new(EngineConfig::in_dir(dir.path()))
            .await
            .unwrap()
            .with_progress(tx);

        engine
            .register(WorkflowParser::parse(&valid_workflow("Any", "workflow_dispatch")).unwrap())
            .unwrap();
        engine
            .register(
                WorkflowParser::parse(
                    r#"
name: Deploy
on:
  workflow_dispatch:
    inputs:
      target:
        required: true
jobs:
  deploy:
    steps:
      - run: echo deploy
"#,
                )
                .unwrap(),
            )
            .unwrap();

        let event = RepositoryEvent::dispatch("refs/heads/main", BTreeMap::new());
        let err = engine.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        drop(engine);
        while let Some(event) = rx.recv().await {
            assert!(!matches!(event, ExecutionEvent::RunStarted { .. }));
        }
    }
}

#[cfg(all(test, unix))]
mod run_tests {
    use super::*;
    use crate::execution::{JobStatus, RunStatus};
    use crate::runners::{ActionContext, ActionError, ActionOutput};
    use serde_json::json;

    struct Greet;

    #[async_trait::async_trait]
    impl Action for Greet {
        async fn run(&self, ctx: &ActionContext) -> Result<ActionOutput, ActionError> {
            let who = ctx.required_input("who")?;
            let mut output = ActionOutput::default();
            output
                .outputs
                .insert("greeting".to_string(), format!("hello {}", who));
            Ok(output)
        }
    }

    async fn engine(root: &Path) -> WorkflowEngine {
        let mut config = EngineConfig::in_dir(root);
        config.inherit_env = true;
        WorkflowEngine::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_handle_event_runs_matching_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path()).await;
        engine
            .register(
                WorkflowParser::parse(
                    r#"
name: Build
on:
  push:
    branches: [main]
jobs:
  build:
    outputs:
      branch: ${{ steps.b.outputs.branch }}
    steps:
      - id: b
        run: echo "branch=$WORKFLOW_REF_NAME" >> "$WORKFLOW_OUTPUT"
"#,
                )
                .unwrap(),
            )
            .unwrap();
        engine
            .register(WorkflowParser::parse(&valid_lint()).unwrap())
            .unwrap();
        engine
            .register(
                WorkflowParser::parse(
                    "name: Release\non:\n  push:\n    tags: ['v*']\njobs:\n  publish:\n    steps:\n      - run: echo publish\n",
                )
                .unwrap(),
            )
            .unwrap();

        let results = engine
            .handle_event(&RepositoryEvent::push("refs/heads/main", "abc"))
            .await
            .unwrap();

        let names: Vec<&str> = results.iter().map(|r| r.workflow.as_str()).collect();
        assert_eq!(names, vec!["Build", "Lint"]);
        assert!(results.iter().all(|r| r.success()));
        assert_eq!(results[0].single("build").unwrap().outputs["branch"], "main");
    }

    fn valid_lint() -> String {
        "name: Lint\non: push\njobs:\n  lint:\n    steps:\n      - run: echo lint\n".to_string()
    }

    #[tokio::test]
    async fn test_run_workflow_with_custom_action_and_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path())
            .await
            .with_action("greet", Arc::new(Greet));
        engine
            .register(
                WorkflowParser::parse(
                    r#"
name: Hello
on:
  workflow_dispatch:
    inputs:
      who:
        default: world
jobs:
  hello:
    outputs:
      text: ${{ steps.g.outputs.greeting }}
    steps:
      - id: g
        uses: greet@v1
        with:
          who: ${{ inputs.who }}
"#,
                )
                .unwrap(),
            )
            .unwrap();

        let result = engine
            .run_workflow(
                "Hello",
                RepositoryEvent::dispatch("refs/heads/main", BTreeMap::new()),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert!(result.success(), "{:?}", result.jobs);
        assert_eq!(result.inputs["who"], json!("world"));
        assert_eq!(result.single("hello").unwrap().outputs["text"], "hello world");
    }

    #[tokio::test]
    async fn test_cancelled_token_cancels_new_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path()).await;
        engine
            .register(WorkflowParser::parse(&valid_lint()).unwrap())
            .unwrap();

        let token = engine.cancel_token();
        token.cancel();
        let result = engine
            .run_workflow("Lint", RepositoryEvent::push("refs/heads/main", "s"), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.single("lint").unwrap().status, JobStatus::Cancelled);

        token.reset();
        let result = engine
            .run_workflow("Lint", RepositoryEvent::push("refs/heads/main", "s"), BTreeMap::new())
            .await
            .unwrap();
        assert!(result.success());
    }
}
