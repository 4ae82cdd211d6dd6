// Run Executor
// Dispatcher loop: decides job conditions, hands instances to runners and collects results

use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::job::{JobInvocation, JobRunner};
use crate::execution::results::{JobResult, JobStatus, RunResult, RunStatus};
use crate::execution::scheduler::Scheduler;
use crate::expression::{
    evaluate, evaluate_condition, interpolate, is_truthy, ExpressionContext, ExpressionError,
};
use crate::runners::{RunnerLease, RunnerPool};
use crate::workflow::{ContinueOnError, Job};
use crate::EngineResult;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation shared by an engine and its runs.
///
/// Cloning is cheap; every clone cancels the same runs.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel every run holding a receiver of this token
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Allow new runs again after a cancellation
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes one run of a workflow
#[derive(Debug, Clone)]
pub struct RunExecutor {
    pool: RunnerPool,
    job_runner: Arc<JobRunner>,
    event_tx: Option<ProgressSender>,
}

impl RunExecutor {
    pub fn new(pool: RunnerPool, job_runner: Arc<JobRunner>) -> Self {
        Self {
            pool,
            job_runner,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.event_tx = tx;
        self
    }

    /// Run every job instance to a final state.
    ///
    /// Only configuration problems (cycles, matrix errors) are returned as
    /// errors, and they surface before any job starts.
    pub async fn execute(
        &self,
        run: RunContext,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<RunResult> {
        let start = Instant::now();
        let run = Arc::new(run);
        let mut scheduler = Scheduler::new(Arc::clone(&run.workflow))?;
        let run_id = run.run_id;

        info!(
            run_id = %run_id,
            workflow = run.workflow_name(),
            event = run.event.event_name(),
            jobs = scheduler.instances().len(),
            "run started"
        );
        self.event_tx.send_event(ExecutionEvent::run_started(
            run_id,
            run.workflow_name(),
            run.event.event_name(),
            scheduler.instances().len(),
        ));

        let mut released = self.pool.subscribe();
        let mut cancel_rx = cancel;
        let mut cancel_open = true;
        let mut tasks: JoinSet<(usize, JobResult)> = JoinSet::new();

        if *cancel_rx.borrow_and_update() {
            self.cancel_pending(&mut scheduler, &run);
        }

        loop {
            self.decide(&mut scheduler, &run);

            let dispatch = scheduler.dispatch(&self.pool);
            for index in dispatch.unschedulable.into_iter().chain(dispatch.cancelled) {
                self.report_not_run(&scheduler, &run, index);
            }
            for (index, lease) in dispatch.started {
                self.spawn_job(&mut tasks, &scheduler, &run, index, lease, &cancel_rx);
            }

            if scheduler.is_finished() {
                break;
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok((index, result)) => {
                        let cancelled = scheduler.complete(index, result);
                        for sibling in cancelled {
                            self.report_not_run(&scheduler, &run, sibling);
                        }
                    }
                    Err(e) => error!(run_id = %run_id, error = %e, "job task failed to join"),
                },
                changed = released.changed(), if scheduler.has_queued() => {
                    if changed.is_err() {
                        warn!(run_id = %run_id, "runner pool closed");
                        self.cancel_pending(&mut scheduler, &run);
                    }
                }
                changed = cancel_rx.changed(), if cancel_open => match changed {
                    Ok(()) => {
                        if *cancel_rx.borrow_and_update() && !scheduler.is_cancelled() {
                            info!(run_id = %run_id, "run cancelled");
                            self.cancel_pending(&mut scheduler, &run);
                        }
                    }
                    Err(_) => cancel_open = false,
                },
                else => {
                    // Nothing running and nothing can start
                    warn!(run_id = %run_id, "run stalled, cancelling remaining jobs");
                    self.cancel_pending(&mut scheduler, &run);
                }
            }
        }

        let cancelled = scheduler.is_cancelled();
        let workflow = run.workflow_name().to_string();
        let jobs = scheduler.into_results();
        let status = RunStatus::aggregate(&jobs, cancelled);
        let duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::run_completed(
            run_id,
            workflow.as_str(),
            status,
            duration,
        ));
        info!(run_id = %run_id, workflow = workflow.as_str(), status = %status, "run finished");

        Ok(RunResult {
            run_id,
            workflow,
            event_name: run.event.event_name().to_string(),
            inputs: run.inputs.clone(),
            status,
            jobs,
            started_at: run.started_at,
            finished_at: Utc::now(),
            duration,
        })
    }

    /// Evaluate `if:` for every instance whose needs finished.
    ///
    /// Skips can make further instances ready, so this repeats until no
    /// pending instance is waiting on a decision.
    fn decide(&self, scheduler: &mut Scheduler, run: &RunContext) {
        loop {
            let awaiting = scheduler.awaiting_decision();
            if awaiting.is_empty() {
                return;
            }
            for index in awaiting {
                // Fail-fast from an earlier decision may have cancelled it
                if scheduler.instance(index).status != JobStatus::Pending {
                    continue;
                }
                self.decide_instance(scheduler, run, index);
            }
        }
    }

    fn decide_instance(&self, scheduler: &mut Scheduler, run: &RunContext, index: usize) {
        let Some(job) = scheduler.job(index).cloned() else {
            self.fail_instance(scheduler, run, index, "job definition is missing".to_string());
            return;
        };
        let instance = scheduler.instance(index).clone();
        let context = run.expression_context(
            &instance.job_id,
            &instance.matrix,
            scheduler.needs_context(&instance.job_id),
            scheduler.strategy_context(index),
        );
        let status = scheduler.dependency_status(&instance.job_id);
        let condition = job.if_condition.as_deref().unwrap_or("");

        match evaluate_condition(condition, &context, status) {
            Ok(true) => match resolve_placement(&job, &context) {
                Ok((labels, continue_on_error)) => {
                    debug!(job = instance.label().as_str(), labels = ?labels, "job queued");
                    self.event_tx.send_event(ExecutionEvent::job_queued(
                        run.run_id,
                        &instance.job_id,
                        &instance.matrix.name,
                        labels.clone(),
                    ));
                    scheduler.queue_job(index, labels, continue_on_error);
                }
                Err(e) => self.fail_instance(scheduler, run, index, e.to_string()),
            },
            Ok(false) => {
                let reason = if condition.is_empty() {
                    "a needed job did not succeed".to_string()
                } else {
                    format!("condition '{}' evaluated to false", condition)
                };
                scheduler.skip_job(index, &reason);
                self.event_tx.send_event(ExecutionEvent::job_skipped(
                    run.run_id,
                    &instance.job_id,
                    &instance.matrix.name,
                    JobStatus::Skipped,
                    reason,
                ));
            }
            Err(e) => {
                self.fail_instance(scheduler, run, index, format!("invalid condition: {}", e))
            }
        }
    }

    /// Fail an instance that never reached a runner, with fail-fast on its siblings
    fn fail_instance(&self, scheduler: &mut Scheduler, run: &RunContext, index: usize, error: String) {
        let cancelled = scheduler.fail_job(index, error);
        self.report_not_run(scheduler, run, index);
        for sibling in cancelled {
            self.report_not_run(scheduler, run, sibling);
        }
    }

    fn cancel_pending(&self, scheduler: &mut Scheduler, run: &RunContext) {
        for index in scheduler.cancel_all() {
            self.report_not_run(scheduler, run, index);
        }
    }

    /// Event for an instance that reached a final state without a runner
    fn report_not_run(&self, scheduler: &Scheduler, run: &RunContext, index: usize) {
        let instance = scheduler.instance(index);
        let reason = instance
            .result
            .as_ref()
            .and_then(|result| result.error.clone())
            .unwrap_or_default();
        if instance.status == JobStatus::Failed {
            warn!(job = instance.label().as_str(), reason = reason.as_str(), "job failed before start");
        }
        self.event_tx.send_event(ExecutionEvent::job_skipped(
            run.run_id,
            &instance.job_id,
            &instance.matrix.name,
            instance.status,
            reason,
        ));
    }

    fn spawn_job(
        &self,
        tasks: &mut JoinSet<(usize, JobResult)>,
        scheduler: &Scheduler,
        run: &Arc<RunContext>,
        index: usize,
        lease: RunnerLease,
        cancel: &watch::Receiver<bool>,
    ) {
        let instance = scheduler.instance(index).clone();
        let Some(job) = scheduler.job(index).cloned() else {
            return;
        };
        let context = run.expression_context(
            &instance.job_id,
            &instance.matrix,
            scheduler.needs_context(&instance.job_id),
            scheduler.strategy_context(index),
        );
        let display_name = job.name.clone();
        let invocation = JobInvocation {
            run: Arc::clone(run),
            job_id: instance.job_id.clone(),
            job,
            matrix: instance.matrix.clone(),
            context,
            runner: lease.runner().to_string(),
            continue_on_error: instance.continue_on_error,
            cancel: Some(cancel.clone()),
        };
        let job_runner = Arc::clone(&self.job_runner);

        tasks.spawn(async move {
            // A panicking job must still report back with its index
            let handle = tokio::spawn(async move { job_runner.run(invocation).await });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let mut result = JobResult::without_steps(
                        &instance.job_id,
                        display_name,
                        &instance.matrix.name,
                        &instance.matrix.values,
                        JobStatus::Failed,
                        Some(format!("job task aborted: {}", e)),
                    );
                    result.runner = Some(lease.runner().to_string());
                    result.continue_on_error = instance.continue_on_error;
                    result
                }
            };
            drop(lease);
            (index, result)
        });
    }
}

/// `runs-on` labels and `continue-on-error` for one instance
fn resolve_placement(
    job: &Job,
    context: &ExpressionContext,
) -> Result<(Vec<String>, bool), ExpressionError> {
    let labels = job
        .runs_on
        .as_ref()
        .map(|runs_on| runs_on.labels())
        .unwrap_or_default()
        .iter()
        .map(|label| interpolate(label, context))
        .collect::<Result<Vec<_>, _>>()?;

    let continue_on_error = match &job.continue_on_error {
        ContinueOnError::Bool(value) => *value,
        ContinueOnError::Expression(expression) => is_truthy(&evaluate(expression, context)?),
    };

    Ok((labels, continue_on_error))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RunnerConfig};
    use crate::execution::events::progress_channel;
    use crate::execution::results::StepStatus;
    use crate::runners::ActionRegistry;
    use crate::store::ContentStore;
    use crate::trigger::RepositoryEvent;
    use crate::workflow::WorkflowParser;

    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    async fn executor(root: &Path, runners: Vec<RunnerConfig>, max_parallel_jobs: usize) -> RunExecutor {
        let mut config = EngineConfig::in_dir(root).with_runners(runners);
        config.inherit_env = false;
        config.max_parallel_jobs = max_parallel_jobs;
        std::fs::create_dir_all(&config.work_dir).unwrap();
        let store = ContentStore::open(&config.store_dir).await.unwrap();
        let pool = RunnerPool::new(&config.runners, config.max_parallel_jobs);
        let job_runner = JobRunner::new(Arc::new(config), ActionRegistry::with_builtins(), store);
        RunExecutor::new(pool, Arc::new(job_runner))
    }

    fn local(capacity: usize) -> Vec<RunnerConfig> {
        vec![RunnerConfig::new("local", &["linux", "x64"], capacity)]
    }

    fn with_path(body: &str) -> String {
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
        format!("on: push\nenv:\n  PATH: \"{}\"\n{}", path, body)
    }

    async fn execute(executor: &RunExecutor, root: &Path, yaml: &str) -> RunResult {
        let workflow = WorkflowParser::parse_and_validate(yaml).unwrap();
        let run = RunContext::new(
            Arc::new(workflow),
            RepositoryEvent::push("refs/heads/main", "abc123"),
            BTreeMap::new(),
            root.join("work"),
        );
        let token = CancelToken::new();
        executor.execute(run, token.subscribe()).await.unwrap()
    }

    #[tokio::test]
    async fn test_outputs_flow_through_needs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(2), 0).await;
        let yaml = with_path(
            r#"
jobs:
  setup:
    outputs:
      version: ${{ steps.v.outputs.version }}
    steps:
      - id: v
        run: echo "version=2.1.0" >> "$WORKFLOW_OUTPUT"
  build:
    needs: setup
    outputs:
      seen: ${{ steps.b.outputs.seen }}
    steps:
      - id: b
        run: echo "seen=${{ needs.setup.outputs.version }}-${{ needs.setup.result }}" >> "$WORKFLOW_OUTPUT"
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;

        assert!(result.success(), "{:?}", result.jobs);
        assert_eq!(result.single("build").unwrap().outputs["seen"], "2.1.0-success");
        let order: Vec<&str> = result.jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(order, vec!["setup", "build"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_unless_always() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(2), 0).await;
        let yaml = with_path(
            r#"
jobs:
  build:
    steps:
      - run: exit 1
  deploy:
    needs: build
    steps:
      - run: echo deploy
  notify:
    needs: deploy
    if: always()
    steps:
      - run: echo notify
  report:
    needs: build
    if: failure()
    steps:
      - run: echo report
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.single("build").unwrap().status, JobStatus::Failed);
        assert_eq!(result.single("deploy").unwrap().status, JobStatus::Skipped);
        assert_eq!(result.single("notify").unwrap().status, JobStatus::Succeeded);
        assert_eq!(result.single("report").unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_runner_capacity_never_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = progress_channel();
        let executor = executor(dir.path(), local(2), 0).await.with_progress(Some(tx));
        let yaml = with_path(
            r#"
jobs:
  test:
    runs-on: linux
    strategy:
      matrix:
        shard: [1, 2, 3, 4, 5]
    steps:
      - run: sleep 0.2
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;
        assert!(result.success());
        drop(executor);

        let mut running = 0usize;
        let mut peak = 0usize;
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutionEvent::JobStarted { .. } => {
                    running += 1;
                    peak = peak.max(running);
                }
                ExecutionEvent::JobCompleted { .. } => running -= 1,
                _ => {}
            }
        }
        assert!(peak <= 2, "peak concurrency {}", peak);
        assert_eq!(result.jobs.len(), 5);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_queued_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(4), 0).await;
        let yaml = with_path(
            r#"
jobs:
  test:
    strategy:
      max-parallel: 1
      matrix:
        n: [1, 2, 3]
    steps:
      - run: test "${{ matrix.n }}" != "1"
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;

        let statuses: Vec<JobStatus> = result.job("test").iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Failed, JobStatus::Cancelled, JobStatus::Cancelled]
        );
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_unmatched_runner_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(1), 0).await;
        let yaml = with_path(
            r#"
jobs:
  mac:
    runs-on:
      - macos
      - ${{ 'arm64' }}
    steps:
      - run: echo never
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;
        let job = result.single("mac").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("macos, arm64"));
    }

    #[tokio::test]
    async fn test_unschedulable_instance_cancels_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(2), 0).await;
        let yaml = with_path(
            r#"
jobs:
  test:
    runs-on: ${{ matrix.os }}
    strategy:
      matrix:
        os: [windows, linux]
    steps:
      - run: echo ${{ matrix.os }}
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;

        let statuses: Vec<JobStatus> = result.job("test").iter().map(|j| j.status).collect();
        assert_eq!(statuses, vec![JobStatus::Failed, JobStatus::Cancelled]);
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_condition_error_cancels_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(2), 0).await;
        let yaml = with_path(
            r#"
jobs:
  test:
    if: ${{ fromJSON('{') }}
    strategy:
      matrix:
        n: [1, 2]
    steps:
      - run: echo never
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;

        let jobs = result.job("test");
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error.as_deref().unwrap().contains("invalid condition"));
        assert_eq!(jobs[1].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_job_continue_on_error_keeps_run_green() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(1), 0).await;
        let yaml = with_path(
            r#"
jobs:
  experimental:
    continue-on-error: ${{ matrix.channel == 'nightly' }}
    strategy:
      fail-fast: false
      matrix:
        channel: [stable, nightly]
    steps:
      - run: test "${{ matrix.channel }}" = "stable"
  after:
    needs: experimental
    steps:
      - run: echo ok
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;
        assert_eq!(result.status, RunStatus::Succeeded, "{:?}", result.jobs);
        assert_eq!(result.single("after").unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(1), 0).await;
        let yaml = with_path(
            r#"
jobs:
  slow:
    steps:
      - run: sleep 30
      - if: always()
        run: echo cleanup
  later:
    needs: slow
    steps:
      - run: echo later
"#,
        );
        let workflow = Arc::new(WorkflowParser::parse_and_validate(&yaml).unwrap());
        let token = CancelToken::new();
        let run = RunContext::new(
            workflow,
            RepositoryEvent::push("refs/heads/main", "abc123"),
            BTreeMap::new(),
            dir.path().join("work"),
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = executor.execute(run, token.subscribe()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(result.status, RunStatus::Cancelled);

        let slow = result.single("slow").unwrap();
        assert_eq!(slow.status, JobStatus::Cancelled);
        assert_eq!(slow.steps[0].outcome, StepStatus::Cancelled);
        assert_eq!(slow.steps[1].outcome, StepStatus::Succeeded);
        assert_eq!(result.single("later").unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_global_limit_serializes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), local(4), 1).await;
        let yaml = with_path(
            r#"
jobs:
  a:
    steps:
      - run: sleep 0.2
  b:
    steps:
      - run: sleep 0.2
"#,
        );
        let result = execute(&executor, dir.path(), &yaml).await;
        assert!(result.success());

        let (a, b) = (result.single("a").unwrap(), result.single("b").unwrap());
        assert_eq!(a.runner.as_deref(), Some("local"));
        let a_end = a.started_at.unwrap() + chrono::Duration::from_std(a.duration).unwrap();
        assert!(b.started_at.unwrap() >= a_end - chrono::Duration::milliseconds(50));
    }
}
