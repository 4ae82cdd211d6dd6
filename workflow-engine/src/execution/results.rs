// Execution Results
// Step, job and run outcomes reported back to callers

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    /// Value seen through `steps.<id>.outcome` and `steps.<id>.conclusion`
    pub fn as_context_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "success",
            StepStatus::Failed => "failure",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_context_str())
    }
}

/// Result of a single step.
///
/// `outcome` is what happened; `conclusion` is what counts after
/// `continue-on-error` turned a failure into a success.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub outcome: StepStatus,
    pub conclusion: StepStatus,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl StepResult {
    pub(crate) fn skipped(index: usize, id: Option<String>, name: String) -> Self {
        Self {
            index,
            id,
            name,
            outcome: StepStatus::Skipped,
            conclusion: StepStatus::Skipped,
            outputs: BTreeMap::new(),
            error: None,
            exit_code: None,
            duration: Duration::ZERO,
        }
    }
}

/// Lifecycle of one job instance; the last four states are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "success",
            JobStatus::Failed => "failure",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of one job instance
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub display_name: Option<String>,
    /// Matrix combination name; empty for jobs without a matrix
    pub matrix_name: String,
    pub matrix: BTreeMap<String, Value>,
    pub runner: Option<String>,
    pub status: JobStatus,
    /// Job-level `continue-on-error` as resolved for this instance
    pub continue_on_error: bool,
    pub steps: Vec<StepResult>,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl JobResult {
    /// A result for an instance that never reached a runner
    pub(crate) fn without_steps(
        job_id: &str,
        display_name: Option<String>,
        matrix_name: &str,
        matrix: &BTreeMap<String, Value>,
        status: JobStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            display_name,
            matrix_name: matrix_name.to_string(),
            matrix: matrix.clone(),
            runner: None,
            status,
            continue_on_error: false,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            error,
            started_at: None,
            duration: Duration::ZERO,
        }
    }

    /// Whether dependents and the run see this instance as successful
    pub fn counts_as_success(&self) -> bool {
        match self.status {
            JobStatus::Succeeded => true,
            JobStatus::Failed => self.continue_on_error,
            _ => false,
        }
    }

    /// Failed and not excused by `continue-on-error`
    pub fn is_hard_failure(&self) -> bool {
        self.status == JobStatus::Failed && !self.continue_on_error
    }

    /// Job label used in logs: `test (ubuntu, 18)`
    pub fn label(&self) -> String {
        if self.matrix_name.is_empty() {
            self.job_id.clone()
        } else {
            format!("{} ({})", self.job_id, self.matrix_name)
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.id.as_deref() == Some(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Aggregate instance results: cancellation wins, then any hard failure
    pub fn aggregate(jobs: &[JobResult], cancelled: bool) -> Self {
        if cancelled {
            RunStatus::Cancelled
        } else if jobs.iter().any(JobResult::is_hard_failure) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "success",
            RunStatus::Failed => "failure",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of one workflow run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow: String,
    pub event_name: String,
    pub inputs: BTreeMap<String, Value>,
    pub status: RunStatus,
    /// One entry per job instance, in scheduling order
    pub jobs: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// All instances of a job
    pub fn job(&self, job_id: &str) -> Vec<&JobResult> {
        self.jobs.iter().filter(|job| job.job_id == job_id).collect()
    }

    /// The single instance of a job without a matrix
    pub fn single(&self, job_id: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|job| job.job_id == job_id)
    }
}
