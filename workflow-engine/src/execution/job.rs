// Job Runner
// Executes one job instance's steps in order on its runner

use crate::config::EngineConfig;
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::MatrixInstance;
use crate::execution::results::{JobResult, JobStatus, StepResult, StepStatus};
use crate::expression::{
    evaluate_condition, interpolate, interpolate_value, ExpressionContext, StatusCheck,
};
use crate::runners::file_commands::{parse_key_values, parse_paths};
use crate::runners::shell::wait_cancelled;
use crate::runners::{
    ActionContext, ActionRegistry, OutputCallback, PostJob, ShellInvocation, ShellRunner,
};
use crate::store::ContentStore;
use crate::utils::{minutes, step_directory};
use crate::workflow::{Job, RunDefaults, Step};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

/// Everything a job instance needs once it holds a runner
#[derive(Debug)]
pub struct JobInvocation {
    pub run: Arc<RunContext>,
    pub job_id: String,
    pub job: Job,
    pub matrix: MatrixInstance,
    /// Context with `github`, `inputs`, `matrix`, `needs` and `strategy` filled in
    pub context: ExpressionContext,
    pub runner: String,
    pub continue_on_error: bool,
    pub cancel: Option<watch::Receiver<bool>>,
}

/// How a step ended, before `continue-on-error` is applied
struct StepExecution {
    outcome: StepStatus,
    outputs: BTreeMap<String, String>,
    error: Option<String>,
    exit_code: Option<i32>,
    post: Option<PostJob>,
}

impl StepExecution {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: StepStatus::Failed,
            outputs: BTreeMap::new(),
            error: Some(error.into()),
            exit_code: None,
            post: None,
        }
    }
}

enum Limited<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Await `future` unless the timeout elapses or the run is cancelled first
async fn limited<F: Future>(
    future: F,
    timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
) -> Limited<F::Output> {
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, future).await.ok(),
            None => Some(future.await),
        }
    };
    tokio::select! {
        result = bounded => match result {
            Some(value) => Limited::Done(value),
            None => Limited::TimedOut,
        },
        _ = wait_cancelled(cancel) => Limited::Cancelled,
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

fn to_object(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    )
}

/// Mutable state threaded through the steps of one job
struct JobState {
    /// Declared `env` (workflow, job, `WORKFLOW_ENV`) visible as the `env` context
    env: BTreeMap<String, String>,
    /// Entries from `WORKFLOW_PATH`, most recent first
    extra_path: Vec<String>,
    failed: bool,
    cancelled: bool,
    timed_out: bool,
}

/// Step executor for job instances
#[derive(Debug, Clone)]
pub struct JobRunner {
    config: Arc<EngineConfig>,
    shell: ShellRunner,
    actions: ActionRegistry,
    store: ContentStore,
    event_tx: Option<ProgressSender>,
}

impl JobRunner {
    pub fn new(config: Arc<EngineConfig>, actions: ActionRegistry, store: ContentStore) -> Self {
        Self {
            config,
            shell: ShellRunner::new(),
            actions,
            store,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.event_tx = tx;
        self
    }

    /// Run every step of one job instance and collect the result.
    ///
    /// Never returns an error: failures are reported in the result.
    pub async fn run(&self, invocation: JobInvocation) -> JobResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let JobInvocation {
            run,
            job_id,
            job,
            matrix,
            mut context,
            runner,
            continue_on_error,
            cancel,
        } = invocation;
        let run_id = run.run_id;

        let scratch = self
            .config
            .temp_dir
            .join(run_id.to_string())
            .join(Uuid::new_v4().to_string());

        context.set(
            "runner",
            json!({
                "name": runner,
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "temp": scratch.display().to_string(),
            }),
        );
        context.set("job", json!({ "status": "success" }));

        let display_name = job
            .name
            .as_ref()
            .map(|name| interpolate(name, &context).unwrap_or_else(|_| name.clone()));

        self.event_tx.send_event(ExecutionEvent::job_started(
            run_id,
            &job_id,
            display_name.clone(),
            &matrix.name,
            &runner,
            job.steps.len(),
        ));
        info!(
            job = job_id.as_str(),
            matrix = matrix.name.as_str(),
            runner = runner.as_str(),
            "job started"
        );

        let mut result = JobResult {
            job_id: job_id.clone(),
            display_name,
            matrix_name: matrix.name.clone(),
            matrix: matrix.values.clone(),
            runner: Some(runner.clone()),
            status: JobStatus::Running,
            continue_on_error,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            error: None,
            started_at: Some(started_at),
            duration: Duration::ZERO,
        };

        match self
            .execute_steps(&run, &job_id, &job, &matrix, &mut context, &scratch, cancel, &mut result)
            .await
        {
            Ok(state) => {
                result.status = if state.cancelled {
                    JobStatus::Cancelled
                } else if state.failed || state.timed_out {
                    JobStatus::Failed
                } else {
                    JobStatus::Succeeded
                };
                if state.timed_out && result.error.is_none() {
                    result.error = Some(format!(
                        "job exceeded its timeout of {} minutes",
                        self.job_timeout_minutes(&job)
                    ));
                }
            }
            Err(error) => {
                warn!(job = job_id.as_str(), error = error.as_str(), "job setup failed");
                result.status = JobStatus::Failed;
                result.error = Some(error);
            }
        }

        result.outputs = self.job_outputs(&job, &context, run_id, &job_id);

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!(path = %scratch.display(), error = %e, "could not remove scratch directory");
        }

        result.duration = start.elapsed();
        self.event_tx.send_event(ExecutionEvent::job_completed(
            run_id,
            &job_id,
            &matrix.name,
            Some(runner),
            result.status,
            result.duration,
        ));
        info!(job = job_id.as_str(), status = %result.status, "job finished");
        result
    }

    fn job_timeout_minutes(&self, job: &Job) -> u32 {
        job.timeout_minutes
            .unwrap_or(self.config.default_job_timeout_minutes)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_steps(
        &self,
        run: &RunContext,
        job_id: &str,
        job: &Job,
        matrix: &MatrixInstance,
        context: &mut ExpressionContext,
        scratch: &Path,
        mut cancel: Option<watch::Receiver<bool>>,
        result: &mut JobResult,
    ) -> Result<JobState, String> {
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| format!("failed to create {}: {}", scratch.display(), e))?;

        let mut state = JobState {
            env: BTreeMap::new(),
            extra_path: Vec::new(),
            failed: false,
            cancelled: false,
            timed_out: false,
        };

        // Workflow env first so job env can refer to it through `env.*`
        for scope in [&run.workflow.env, &job.env] {
            let mut names: Vec<&String> = scope.keys().collect();
            names.sort();
            context.set("env", to_object(&state.env));
            for name in names {
                let value = interpolate(&scope[name], context)
                    .map_err(|e| format!("env '{}': {}", name, e))?;
                state.env.insert(name.clone(), value);
            }
        }

        let deadline = Instant::now() + minutes(self.job_timeout_minutes(job));
        let mut post_jobs = Vec::new();

        for (index, step) in job.steps.iter().enumerate() {
            if is_cancelled(&cancel) {
                state.cancelled = true;
                // Cleanup steps that still run must not be killed straight away
                cancel = None;
            }

            let name = step
                .name
                .as_ref()
                .map(|n| interpolate(n, context).unwrap_or_else(|_| n.clone()))
                .unwrap_or_else(|| step.display_name());

            let step_env = match self.step_env(step, &state, context) {
                Ok(env) => env,
                Err(error) => {
                    let execution = StepExecution::failed(error);
                    self.record_step(
                        run.run_id,
                        job_id,
                        matrix,
                        index,
                        step,
                        name,
                        execution,
                        Duration::ZERO,
                        &mut state,
                        context,
                        result,
                        &mut post_jobs,
                    );
                    continue;
                }
            };
            context.set("env", to_object(&step_env));

            if state.timed_out {
                self.skip_step(run.run_id, job_id, index, step, name, "job timed out", context, result);
                continue;
            }

            let status = StatusCheck {
                failed: state.failed,
                cancelled: state.cancelled,
                skipped: false,
            };
            let condition = step.if_condition.as_deref().unwrap_or("");
            match evaluate_condition(condition, context, status) {
                Ok(true) => {}
                Ok(false) => {
                    let reason = if condition.is_empty() {
                        "a previous step failed".to_string()
                    } else {
                        format!("condition '{}' evaluated to false", condition)
                    };
                    self.skip_step(run.run_id, job_id, index, step, name, &reason, context, result);
                    continue;
                }
                Err(e) => {
                    let execution = StepExecution::failed(format!("invalid condition: {}", e));
                    self.record_step(
                        run.run_id,
                        job_id,
                        matrix,
                        index,
                        step,
                        name,
                        execution,
                        Duration::ZERO,
                        &mut state,
                        context,
                        result,
                        &mut post_jobs,
                    );
                    continue;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.timed_out = true;
                self.skip_step(run.run_id, job_id, index, step, name, "job timed out", context, result);
                continue;
            }
            let timeout = match step.timeout_minutes {
                Some(limit) => minutes(limit).min(remaining),
                None => remaining,
            };

            self.event_tx.send_event(ExecutionEvent::step_started(
                run.run_id,
                job_id,
                &matrix.name,
                &name,
                index,
            ));
            debug!(job = job_id, step = name.as_str(), "step started");

            let step_start = Instant::now();
            let step_dir = scratch.join(format!("step-{}", index));
            let execution = match tokio::fs::create_dir_all(&step_dir).await {
                Err(e) => StepExecution::failed(format!("failed to prepare step files: {}", e)),
                Ok(()) => {
                    self.execute_step(
                        run,
                        job_id,
                        job,
                        index,
                        step,
                        step_env,
                        &step_dir,
                        timeout,
                        cancel.clone(),
                        &mut state,
                        context,
                    )
                    .await
                }
            };

            if execution.error.as_deref().map(|e| e.starts_with(TIMEOUT_PREFIX)).unwrap_or(false)
                && step.timeout_minutes.map(minutes).map(|t| t >= remaining).unwrap_or(true)
            {
                // The job deadline cut the step short, not its own limit
                state.timed_out = true;
            }

            self.record_step(
                run.run_id,
                job_id,
                matrix,
                index,
                step,
                name,
                execution,
                step_start.elapsed(),
                &mut state,
                context,
                result,
                &mut post_jobs,
            );
        }

        if !state.failed && !state.cancelled && !state.timed_out {
            for post in post_jobs {
                if let Err(e) = post.run(&self.store, &run.workspace).await {
                    warn!(job = job_id, error = %e, "post-job step failed");
                    self.event_tx.send_event(ExecutionEvent::warning(
                        format!("post-job step failed: {}", e),
                        Some(run.run_id),
                        Some(job_id.to_string()),
                    ));
                }
            }
        }

        Ok(state)
    }

    /// Environment visible to a step, excluding process and `WORKFLOW_*` variables
    fn step_env(
        &self,
        step: &Step,
        state: &JobState,
        context: &mut ExpressionContext,
    ) -> Result<BTreeMap<String, String>, String> {
        let mut env = state.env.clone();
        context.set("env", to_object(&env));

        let mut names: Vec<&String> = step.env.keys().collect();
        names.sort();
        for name in names {
            let value = interpolate(&step.env[name], context)
                .map_err(|e| format!("env '{}': {}", name, e))?;
            env.insert(name.clone(), value);
        }
        Ok(env)
    }

    /// Process environment for a step's shell.
    ///
    /// Later layers win: process env, declared env, `WORKFLOW_*` context.
    fn process_env(
        &self,
        run: &RunContext,
        job_id: &str,
        step_env: BTreeMap<String, String>,
        step_dir: &Path,
        state: &JobState,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env.extend(step_env);
        env.extend(run.environment(job_id));
        env.insert(
            "WORKFLOW_OUTPUT".to_string(),
            step_dir.join("output").display().to_string(),
        );
        env.insert(
            "WORKFLOW_ENV".to_string(),
            step_dir.join("env").display().to_string(),
        );
        env.insert(
            "WORKFLOW_PATH".to_string(),
            step_dir.join("path").display().to_string(),
        );

        if !state.extra_path.is_empty() {
            let mut path = state.extra_path.join(PATH_SEPARATOR);
            if let Some(existing) = env.get("PATH").filter(|p| !p.is_empty()) {
                path.push_str(PATH_SEPARATOR);
                path.push_str(existing);
            }
            env.insert("PATH".to_string(), path);
        }
        env
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        run: &RunContext,
        job_id: &str,
        job: &Job,
        index: usize,
        step: &Step,
        step_env: BTreeMap<String, String>,
        step_dir: &Path,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
        state: &mut JobState,
        context: &ExpressionContext,
    ) -> StepExecution {
        let env = self.process_env(run, job_id, step_env, step_dir, state);

        let mut execution = if let Some(script) = &step.run {
            self.execute_script(
                run, job_id, job, index, step, script, &env, step_dir, timeout, cancel, context,
            )
            .await
        } else if let Some(uses) = &step.uses {
            self.execute_action(run, job_id, step, uses, env, timeout, cancel, context)
                .await
        } else {
            StepExecution::failed("step has neither 'run' nor 'uses'")
        };

        if step.run.is_some() {
            if let Err(e) = self.apply_file_commands(step_dir, state, &mut execution).await {
                if execution.outcome == StepStatus::Succeeded {
                    execution.outcome = StepStatus::Failed;
                }
                execution.error.get_or_insert(e);
            }
        }
        execution
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_script(
        &self,
        run: &RunContext,
        job_id: &str,
        job: &Job,
        index: usize,
        step: &Step,
        script: &str,
        env: &HashMap<String, String>,
        step_dir: &Path,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
        context: &ExpressionContext,
    ) -> StepExecution {
        let script = match interpolate(script, context) {
            Ok(script) => script,
            Err(e) => return StepExecution::failed(format!("failed to evaluate script: {}", e)),
        };

        let shell_name = step
            .shell
            .clone()
            .or_else(|| run_default(job, run, |d| d.shell.as_ref()))
            .or_else(|| self.config.default_shell.clone());
        let shell = match self.shell.resolve(shell_name.as_deref()) {
            Ok(shell) => shell,
            Err(e) => return StepExecution::failed(e),
        };

        let working_directory = match step
            .working_directory
            .clone()
            .or_else(|| run_default(job, run, |d| d.working_directory.as_ref()))
            .map(|dir| interpolate(&dir, context))
            .transpose()
        {
            Ok(dir) => dir,
            Err(e) => return StepExecution::failed(format!("invalid working-directory: {}", e)),
        };
        let working_dir = step_directory(&run.workspace, working_directory.as_deref());

        for file in ["output", "env", "path"] {
            if let Err(e) = tokio::fs::write(step_dir.join(file), b"").await {
                return StepExecution::failed(format!("failed to prepare {} file: {}", file, e));
            }
        }

        let on_output: OutputCallback = {
            let tx = self.event_tx.clone();
            let run_id = run.run_id;
            let job_id = job_id.to_string();
            Arc::new(move |line: &str, is_error: bool| {
                tx.send_event(ExecutionEvent::step_output(run_id, &job_id, index, line, is_error));
            })
        };

        let output = self
            .shell
            .run(
                ShellInvocation {
                    shell,
                    script: &script,
                    env,
                    working_dir: &working_dir,
                    timeout: Some(timeout),
                },
                Some(on_output),
                cancel,
            )
            .await;

        let (outcome, error) = if output.success() {
            (StepStatus::Succeeded, None)
        } else if output.cancelled {
            (StepStatus::Cancelled, Some("step was cancelled".to_string()))
        } else if output.timed_out {
            (StepStatus::Failed, Some(timeout_message(timeout)))
        } else if let Some(spawn_error) = output.spawn_error {
            (StepStatus::Failed, Some(spawn_error))
        } else {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            (
                StepStatus::Failed,
                Some(format!("process completed with exit code {}", code)),
            )
        };

        StepExecution {
            outcome,
            outputs: BTreeMap::new(),
            error,
            exit_code: output.exit_code,
            post: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_action(
        &self,
        run: &RunContext,
        job_id: &str,
        step: &Step,
        uses: &str,
        env: HashMap<String, String>,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
        context: &ExpressionContext,
    ) -> StepExecution {
        let Some(action) = self.actions.resolve(uses) else {
            return StepExecution::failed(format!("unknown action '{}'", uses));
        };

        let mut inputs = BTreeMap::new();
        for (name, value) in &step.with {
            match interpolate_value(value, context) {
                Ok(value) => {
                    inputs.insert(name.clone(), value);
                }
                Err(e) => {
                    return StepExecution::failed(format!("input '{}': {}", name, e));
                }
            }
        }

        let action_context = ActionContext {
            run_id: run.run_id,
            job_id: job_id.to_string(),
            workspace: run.workspace.clone(),
            inputs,
            env,
            store: self.store.clone(),
        };

        match limited(action.run(&action_context), Some(timeout), cancel).await {
            Limited::Done(Ok(output)) => StepExecution {
                outcome: StepStatus::Succeeded,
                outputs: output.outputs,
                error: None,
                exit_code: None,
                post: output.post,
            },
            Limited::Done(Err(e)) => StepExecution::failed(e.to_string()),
            Limited::TimedOut => StepExecution::failed(timeout_message(timeout)),
            Limited::Cancelled => StepExecution {
                outcome: StepStatus::Cancelled,
                error: Some("step was cancelled".to_string()),
                ..StepExecution::failed("")
            },
        }
    }

    /// Read what the step wrote to `WORKFLOW_OUTPUT`, `WORKFLOW_ENV` and `WORKFLOW_PATH`
    async fn apply_file_commands(
        &self,
        step_dir: &Path,
        state: &mut JobState,
        execution: &mut StepExecution,
    ) -> Result<(), String> {
        let read = |name: &str| {
            let path: PathBuf = step_dir.join(name);
            async move { tokio::fs::read_to_string(&path).await.unwrap_or_default() }
        };

        let outputs = parse_key_values(&read("output").await)
            .map_err(|e| format!("invalid WORKFLOW_OUTPUT: {}", e))?;
        execution.outputs.extend(outputs);

        let env = parse_key_values(&read("env").await)
            .map_err(|e| format!("invalid WORKFLOW_ENV: {}", e))?;
        state.env.extend(env);

        for entry in parse_paths(&read("path").await) {
            state.extra_path.insert(0, entry);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn skip_step(
        &self,
        run_id: Uuid,
        job_id: &str,
        index: usize,
        step: &Step,
        name: String,
        reason: &str,
        context: &mut ExpressionContext,
        result: &mut JobResult,
    ) {
        self.event_tx.send_event(ExecutionEvent::StepSkipped {
            run_id,
            job_id: job_id.to_string(),
            step_index: index,
            reason: reason.to_string(),
        });
        let skipped = StepResult::skipped(index, step.id.clone(), name);
        publish_step(context, &skipped);
        result.steps.push(skipped);
    }

    #[allow(clippy::too_many_arguments)]
    fn record_step(
        &self,
        run_id: Uuid,
        job_id: &str,
        matrix: &MatrixInstance,
        index: usize,
        step: &Step,
        name: String,
        execution: StepExecution,
        duration: Duration,
        state: &mut JobState,
        context: &mut ExpressionContext,
        result: &mut JobResult,
        post_jobs: &mut Vec<PostJob>,
    ) {
        let conclusion = match execution.outcome {
            StepStatus::Failed if step.continue_on_error => StepStatus::Succeeded,
            StepStatus::Failed => {
                state.failed = true;
                StepStatus::Failed
            }
            StepStatus::Cancelled => {
                state.cancelled = true;
                StepStatus::Cancelled
            }
            other => other,
        };

        if let Some(error) = &execution.error {
            warn!(job = job_id, step = name.as_str(), error = error.as_str(), "step failed");
            if conclusion == StepStatus::Failed && result.error.is_none() {
                result.error = Some(format!("step '{}': {}", name, error));
            }
        }
        if let Some(post) = execution.post {
            post_jobs.push(post);
        }
        for (output, value) in &execution.outputs {
            self.event_tx.send_event(ExecutionEvent::OutputSet {
                run_id,
                job_id: job_id.to_string(),
                step_index: index,
                name: output.clone(),
                value: value.clone(),
            });
        }
        self.event_tx.send_event(ExecutionEvent::step_completed(
            run_id,
            job_id,
            &matrix.name,
            index,
            execution.outcome,
            duration,
            execution.exit_code,
        ));

        let step_result = StepResult {
            index,
            id: step.id.clone(),
            name,
            outcome: execution.outcome,
            conclusion,
            outputs: execution.outputs,
            error: execution.error,
            exit_code: execution.exit_code,
            duration,
        };
        publish_step(context, &step_result);
        if state.failed {
            context.set("job", json!({ "status": "failure" }));
        }
        result.steps.push(step_result);
    }

    /// Interpolate the job's `outputs:` after its steps ran
    fn job_outputs(
        &self,
        job: &Job,
        context: &ExpressionContext,
        run_id: Uuid,
        job_id: &str,
    ) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();
        for (name, template) in &job.outputs {
            match interpolate(template, context) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!(job = job_id, output = name.as_str(), error = %e, "failed to evaluate job output");
                    self.event_tx.send_event(ExecutionEvent::warning(
                        format!("output '{}': {}", name, e),
                        Some(run_id),
                        Some(job_id.to_string()),
                    ));
                }
            }
        }
        outputs
    }
}

const TIMEOUT_PREFIX: &str = "step timed out";

/// `defaults.run` value from the job, falling back to the workflow
fn run_default(
    job: &Job,
    run: &RunContext,
    pick: fn(&RunDefaults) -> Option<&String>,
) -> Option<String> {
    job.defaults
        .as_ref()
        .and_then(|d| d.run.as_ref())
        .and_then(pick)
        .or_else(|| {
            run.workflow
                .defaults
                .as_ref()
                .and_then(|d| d.run.as_ref())
                .and_then(pick)
        })
        .cloned()
}

fn timeout_message(timeout: Duration) -> String {
    format!("{} after {}s", TIMEOUT_PREFIX, timeout.as_secs())
}

/// Expose a finished step as `steps.<id>`
fn publish_step(context: &mut ExpressionContext, step: &StepResult) {
    if let Some(id) = &step.id {
        context.insert_into(
            "steps",
            id.clone(),
            json!({
                "outputs": to_object(&step.outputs),
                "outcome": step.outcome.as_context_str(),
                "conclusion": step.conclusion.as_context_str(),
            }),
        );
    }
}
