// Execution Events
// Progress reporting and event types for workflow runs

use crate::execution::results::{JobStatus, RunStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started after its triggers matched
    RunStarted {
        run_id: Uuid,
        workflow: String,
        event_name: String,
        total_jobs: usize,
    },

    /// Every job instance reached a final state
    RunCompleted {
        run_id: Uuid,
        workflow: String,
        status: RunStatus,
        duration: Duration,
    },

    /// Job instance is waiting for a runner
    JobQueued {
        run_id: Uuid,
        job_id: String,
        matrix_instance: Option<String>,
        labels: Vec<String>,
    },

    /// Job instance claimed a runner
    JobStarted {
        run_id: Uuid,
        job_id: String,
        display_name: Option<String>,
        matrix_instance: Option<String>,
        runner: String,
        total_steps: usize,
    },

    /// Job instance finished on its runner
    JobCompleted {
        run_id: Uuid,
        job_id: String,
        matrix_instance: Option<String>,
        runner: Option<String>,
        status: JobStatus,
        duration: Duration,
    },

    /// Job instance never ran (condition false, dependency failed, cancelled)
    JobSkipped {
        run_id: Uuid,
        job_id: String,
        matrix_instance: Option<String>,
        status: JobStatus,
        reason: String,
    },

    StepStarted {
        run_id: Uuid,
        job_id: String,
        matrix_instance: Option<String>,
        step_name: String,
        step_index: usize,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        run_id: Uuid,
        job_id: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    StepCompleted {
        run_id: Uuid,
        job_id: String,
        matrix_instance: Option<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step condition evaluated to false
    StepSkipped {
        run_id: Uuid,
        job_id: String,
        step_index: usize,
        reason: String,
    },

    /// A step wrote an output through `WORKFLOW_OUTPUT` or an action
    OutputSet {
        run_id: Uuid,
        job_id: String,
        step_index: usize,
        name: String,
        value: String,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        run_id: Option<Uuid>,
        job_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

fn instance_name(matrix_name: &str) -> Option<String> {
    if matrix_name.is_empty() {
        None
    } else {
        Some(matrix_name.to_string())
    }
}

impl ExecutionEvent {
    pub fn run_started(
        run_id: Uuid,
        workflow: impl Into<String>,
        event_name: impl Into<String>,
        total_jobs: usize,
    ) -> Self {
        Self::RunStarted {
            run_id,
            workflow: workflow.into(),
            event_name: event_name.into(),
            total_jobs,
        }
    }

    pub fn run_completed(
        run_id: Uuid,
        workflow: impl Into<String>,
        status: RunStatus,
        duration: Duration,
    ) -> Self {
        Self::RunCompleted {
            run_id,
            workflow: workflow.into(),
            status,
            duration,
        }
    }

    pub fn job_queued(run_id: Uuid, job_id: &str, matrix_name: &str, labels: Vec<String>) -> Self {
        Self::JobQueued {
            run_id,
            job_id: job_id.to_string(),
            matrix_instance: instance_name(matrix_name),
            labels,
        }
    }

    pub fn job_started(
        run_id: Uuid,
        job_id: &str,
        display_name: Option<String>,
        matrix_name: &str,
        runner: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        Self::JobStarted {
            run_id,
            job_id: job_id.to_string(),
            display_name,
            matrix_instance: instance_name(matrix_name),
            runner: runner.into(),
            total_steps,
        }
    }

    pub fn job_completed(
        run_id: Uuid,
        job_id: &str,
        matrix_name: &str,
        runner: Option<String>,
        status: JobStatus,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            run_id,
            job_id: job_id.to_string(),
            matrix_instance: instance_name(matrix_name),
            runner,
            status,
            duration,
        }
    }

    pub fn job_skipped(
        run_id: Uuid,
        job_id: &str,
        matrix_name: &str,
        status: JobStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::JobSkipped {
            run_id,
            job_id: job_id.to_string(),
            matrix_instance: instance_name(matrix_name),
            status,
            reason: reason.into(),
        }
    }

    pub fn step_started(
        run_id: Uuid,
        job_id: &str,
        matrix_name: &str,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            run_id,
            job_id: job_id.to_string(),
            matrix_instance: instance_name(matrix_name),
            step_name: step_name.into(),
            step_index,
        }
    }

    pub fn step_output(
        run_id: Uuid,
        job_id: &str,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            run_id,
            job_id: job_id.to_string(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        run_id: Uuid,
        job_id: &str,
        matrix_name: &str,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            run_id,
            job_id: job_id.to_string(),
            matrix_instance: instance_name(matrix_name),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    pub fn warning(message: impl Into<String>, run_id: Option<Uuid>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            run_id,
            job_id,
        }
    }

    pub fn error(message: impl Into<String>, run_id: Option<Uuid>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            run_id,
            job_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();
        let run_id = Uuid::new_v4();

        tx.send_event(ExecutionEvent::run_started(run_id, "ci", "push", 2));
        tx.send_event(ExecutionEvent::job_queued(run_id, "build", "", vec![]));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::RunStarted { total_jobs: 2, .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(
            event2,
            ExecutionEvent::JobQueued { matrix_instance: None, .. }
        ));
    }

    #[test]
    fn test_event_construction() {
        let event = ExecutionEvent::job_completed(
            Uuid::nil(),
            "test",
            "linux, stable",
            Some("local".to_string()),
            JobStatus::Succeeded,
            Duration::from_secs(30),
        );

        if let ExecutionEvent::JobCompleted {
            job_id,
            matrix_instance,
            runner,
            status,
            duration,
            ..
        } = event
        {
            assert_eq!(job_id, "test");
            assert_eq!(matrix_instance.as_deref(), Some("linux, stable"));
            assert_eq!(runner.as_deref(), Some("local"));
            assert_eq!(status, JobStatus::Succeeded);
            assert_eq!(duration, Duration::from_secs(30));
        } else {
            panic!("Expected JobCompleted event");
        }
    }

    #[test]
    fn test_send_without_receiver_is_ignored() {
        let none: Option<ProgressSender> = None;
        none.send_event(ExecutionEvent::warning("dropped", None, None));

        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::error("closed", None, None));
    }
}
