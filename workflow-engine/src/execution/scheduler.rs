// Scheduler
// Per-run job instance table: readiness, dispatch onto runners, fail-fast and cancellation

use crate::execution::graph::JobGraph;
use crate::execution::matrix::{MatrixExpander, MatrixInstance};
use crate::execution::results::{JobResult, JobStatus};
use crate::expression::StatusCheck;
use crate::runners::{RunnerLease, RunnerPool};
use crate::workflow::{Job, Workflow};
use crate::EngineResult;

use serde_json::{json, Map, Value};
use tracing::debug;

use std::sync::Arc;

/// One matrix combination of one job
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub index: usize,
    pub job_id: String,
    pub matrix: MatrixInstance,
    /// Position among the instances of the same job
    pub matrix_index: usize,
    pub status: JobStatus,
    /// Resolved `runs-on` labels, known once queued
    pub labels: Vec<String>,
    pub continue_on_error: bool,
    pub result: Option<JobResult>,
}

impl JobInstance {
    pub fn label(&self) -> String {
        if self.matrix.is_implicit() {
            self.job_id.clone()
        } else {
            format!("{} ({})", self.job_id, self.matrix.name)
        }
    }
}

/// Instances handed to runners by one `dispatch` call
#[derive(Debug, Default)]
pub struct Dispatch {
    pub started: Vec<(usize, RunnerLease)>,
    /// Queued instances no configured runner could ever host; now failed
    pub unschedulable: Vec<usize>,
    /// Siblings cancelled by fail-fast after an unschedulable failure
    pub cancelled: Vec<usize>,
}

/// Aggregate of every instance of a job, as dependents see it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failure => "failure",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Skipped => "skipped",
        }
    }
}

/// Decides what happens next in a run.
///
/// Owned by the run's dispatcher loop; every state change goes through
/// `&mut self`, so no locking is involved.
#[derive(Debug)]
pub struct Scheduler {
    workflow: Arc<Workflow>,
    graph: JobGraph,
    instances: Vec<JobInstance>,
    cancelled: bool,
}

impl Scheduler {
    /// Build the instance table: jobs in topological order, each expanded
    /// into its matrix combinations.
    pub fn new(workflow: Arc<Workflow>) -> EngineResult<Self> {
        let graph = JobGraph::from_workflow(&workflow)?;
        let mut instances = Vec::new();

        for node in graph.topological_order() {
            let combinations = MatrixExpander::expand_optional(node.job.strategy.as_ref())?;
            for (matrix_index, matrix) in combinations.into_iter().enumerate() {
                instances.push(JobInstance {
                    index: instances.len(),
                    job_id: node.id.clone(),
                    matrix,
                    matrix_index,
                    status: JobStatus::Pending,
                    labels: Vec::new(),
                    continue_on_error: false,
                    result: None,
                });
            }
        }

        Ok(Self {
            workflow,
            graph,
            instances,
            cancelled: false,
        })
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    pub fn instance(&self, index: usize) -> &JobInstance {
        &self.instances[index]
    }

    /// Job definition behind an instance
    pub fn job(&self, index: usize) -> Option<&Job> {
        self.workflow.jobs.get(&self.instances[index].job_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Pending instances whose needed jobs have all finished, in dispatch order
    pub fn awaiting_decision(&self) -> Vec<usize> {
        self.instances
            .iter()
            .filter(|instance| instance.status == JobStatus::Pending)
            .filter(|instance| {
                self.graph
                    .dependencies(&instance.job_id)
                    .iter()
                    .all(|dep| self.job_finished(dep))
            })
            .map(|instance| instance.index)
            .collect()
    }

    fn instances_of<'a>(&'a self, job_id: &'a str) -> impl Iterator<Item = &'a JobInstance> + 'a {
        self.instances
            .iter()
            .filter(move |instance| instance.job_id == job_id)
    }

    fn job_finished(&self, job_id: &str) -> bool {
        self.instances_of(job_id)
            .all(|instance| instance.status.is_terminal())
    }

    /// `needs.<id>.result` for a finished job
    pub fn job_outcome(&self, job_id: &str) -> JobOutcome {
        let mut any_cancelled = false;
        let mut all_skipped = true;

        for instance in self.instances_of(job_id) {
            match instance.status {
                JobStatus::Failed if !instance.continue_on_error => return JobOutcome::Failure,
                JobStatus::Cancelled => any_cancelled = true,
                _ => {}
            }
            if instance.status != JobStatus::Skipped {
                all_skipped = false;
            }
        }

        if any_cancelled {
            JobOutcome::Cancelled
        } else if all_skipped {
            JobOutcome::Skipped
        } else {
            JobOutcome::Success
        }
    }

    /// Status fed to `success()`, `failure()` and `cancelled()` in a job's `if:`
    pub fn dependency_status(&self, job_id: &str) -> StatusCheck {
        let failed = self
            .graph
            .ancestors(job_id)
            .iter()
            .any(|ancestor| self.job_outcome(ancestor) == JobOutcome::Failure);

        let direct: Vec<JobOutcome> = self
            .graph
            .dependencies(job_id)
            .iter()
            .map(|dep| self.job_outcome(dep))
            .collect();

        StatusCheck {
            failed,
            cancelled: self.cancelled || direct.contains(&JobOutcome::Cancelled),
            skipped: direct.contains(&JobOutcome::Skipped),
        }
    }

    /// The `needs` context: result and merged outputs of each direct dependency
    pub fn needs_context(&self, job_id: &str) -> Value {
        let mut needs = Map::new();
        for dep in self.graph.dependencies(job_id) {
            let mut outputs = Map::new();
            for instance in self.instances_of(dep) {
                if let Some(result) = &instance.result {
                    for (name, value) in &result.outputs {
                        outputs.insert(name.clone(), Value::String(value.clone()));
                    }
                }
            }
            needs.insert(
                dep.clone(),
                json!({
                    "result": self.job_outcome(dep).as_str(),
                    "outputs": outputs,
                }),
            );
        }
        Value::Object(needs)
    }

    /// The `strategy` context of an instance
    pub fn strategy_context(&self, index: usize) -> Value {
        let instance = &self.instances[index];
        let total = self.instances_of(&instance.job_id).count();
        let strategy = self.job(index).and_then(|job| job.strategy.as_ref());

        json!({
            "fail-fast": strategy.map(|s| s.fail_fast).unwrap_or(true),
            "max-parallel": strategy
                .and_then(|s| s.max_parallel)
                .map(|n| n as usize)
                .unwrap_or(total),
            "job-index": instance.matrix_index,
            "job-total": total,
        })
    }

    /// Condition passed: wait for a runner carrying `labels`
    pub fn queue_job(&mut self, index: usize, labels: Vec<String>, continue_on_error: bool) {
        let instance = &mut self.instances[index];
        instance.status = JobStatus::Queued;
        instance.labels = labels;
        instance.continue_on_error = continue_on_error;
    }

    /// Condition false (or a needed job did not succeed): the instance never runs
    pub fn skip_job(&mut self, index: usize, reason: &str) {
        debug!(job = self.instances[index].label().as_str(), reason, "skipping job");
        self.finish_without_running(index, JobStatus::Skipped, None);
    }

    /// Fail before reaching a runner (condition error, unschedulable).
    ///
    /// Returns the siblings cancelled by fail-fast.
    pub fn fail_job(&mut self, index: usize, error: String) -> Vec<usize> {
        self.finish_without_running(index, JobStatus::Failed, Some(error));
        self.apply_fail_fast(index)
    }

    fn finish_without_running(&mut self, index: usize, status: JobStatus, error: Option<String>) {
        let display_name = self.job(index).and_then(|job| job.name.clone());
        let instance = &mut self.instances[index];
        let mut result = JobResult::without_steps(
            &instance.job_id,
            display_name,
            &instance.matrix.name,
            &instance.matrix.values,
            status,
            error,
        );
        result.continue_on_error = instance.continue_on_error;
        instance.status = status;
        instance.result = Some(result);
    }

    /// Claim runners for queued instances.
    ///
    /// Walks the queue in dispatch order and starts every instance that has
    /// a free matching runner and room under its job's `max-parallel`.
    pub fn dispatch(&mut self, pool: &RunnerPool) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let queued: Vec<usize> = self
            .instances
            .iter()
            .filter(|instance| instance.status == JobStatus::Queued)
            .map(|instance| instance.index)
            .collect();

        for index in queued {
            // An earlier failure in this pass may have cancelled it
            if self.instances[index].status != JobStatus::Queued {
                continue;
            }
            let labels = self.instances[index].labels.clone();
            if !pool.can_satisfy(&labels) {
                let cancelled = self.fail_job(
                    index,
                    format!("no matching runner for labels [{}]", labels.join(", ")),
                );
                dispatch.unschedulable.push(index);
                dispatch.cancelled.extend(cancelled);
                continue;
            }

            if !self.below_max_parallel(index) {
                continue;
            }

            if let Some(lease) = pool.acquire(&labels) {
                self.instances[index].status = JobStatus::Running;
                dispatch.started.push((index, lease));
            }
        }

        dispatch
    }

    fn below_max_parallel(&self, index: usize) -> bool {
        let max_parallel = self
            .job(index)
            .and_then(|job| job.strategy.as_ref())
            .and_then(|strategy| MatrixExpander::max_parallel(strategy));

        match max_parallel {
            None => true,
            Some(limit) => {
                let running = self
                    .instances_of(&self.instances[index].job_id)
                    .filter(|instance| instance.status == JobStatus::Running)
                    .count();
                running < limit as usize
            }
        }
    }

    /// Record a finished instance.
    ///
    /// Returns the siblings cancelled by fail-fast.
    pub fn complete(&mut self, index: usize, mut result: JobResult) -> Vec<usize> {
        result.continue_on_error = result.continue_on_error || self.instances[index].continue_on_error;
        let instance = &mut self.instances[index];
        instance.status = result.status;
        instance.result = Some(result);
        self.apply_fail_fast(index)
    }

    /// Cancel waiting siblings of a hard-failed matrix instance
    fn apply_fail_fast(&mut self, index: usize) -> Vec<usize> {
        let hard_failure = self.instances[index]
            .result
            .as_ref()
            .is_some_and(|result| result.is_hard_failure());
        if !hard_failure || !self.fail_fast_applies(index) {
            return Vec::new();
        }

        let job_id = self.instances[index].job_id.clone();
        let siblings: Vec<usize> = self
            .instances_of(&job_id)
            .filter(|sibling| {
                matches!(sibling.status, JobStatus::Pending | JobStatus::Queued)
            })
            .map(|sibling| sibling.index)
            .collect();

        let reason = format!(
            "cancelled by fail-fast after '{}' failed",
            self.instances[index].label()
        );
        for &sibling in &siblings {
            self.finish_without_running(sibling, JobStatus::Cancelled, Some(reason.clone()));
        }
        siblings
    }

    fn fail_fast_applies(&self, index: usize) -> bool {
        self.job(index)
            .and_then(|job| job.strategy.as_ref())
            .map(|strategy| strategy.fail_fast && MatrixExpander::has_matrix(strategy))
            .unwrap_or(false)
    }

    /// Cancel the run: every instance not yet on a runner is cancelled.
    ///
    /// Running instances are signalled by the caller and report back
    /// through `complete`.
    pub fn cancel_all(&mut self) -> Vec<usize> {
        self.cancelled = true;
        let pending: Vec<usize> = self
            .instances
            .iter()
            .filter(|instance| {
                matches!(instance.status, JobStatus::Pending | JobStatus::Queued)
            })
            .map(|instance| instance.index)
            .collect();
        for &index in &pending {
            self.finish_without_running(
                index,
                JobStatus::Cancelled,
                Some("run was cancelled".to_string()),
            );
        }
        pending
    }

    pub fn has_queued(&self) -> bool {
        self.instances
            .iter()
            .any(|instance| instance.status == JobStatus::Queued)
    }

    pub fn running(&self) -> usize {
        self.instances
            .iter()
            .filter(|instance| instance.status == JobStatus::Running)
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.instances
            .iter()
            .all(|instance| instance.status.is_terminal())
    }

    /// Results of every instance in scheduling order
    pub fn into_results(self) -> Vec<JobResult> {
        self.instances
            .into_iter()
            .filter_map(|instance| instance.result)
            .collect()
    }
}
