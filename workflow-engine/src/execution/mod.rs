// Execution Engine Module
// Handles DAG construction, matrix expansion, scheduling and step execution

pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod job;
pub mod matrix;
pub mod results;
pub mod scheduler;

// Re-export key types
pub use context::RunContext;
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
};
pub use executor::{CancelToken, RunExecutor};
pub use graph::{GraphError, GraphErrorKind, JobGraph, JobNode};
pub use job::{JobInvocation, JobRunner};
pub use matrix::{MatrixError, MatrixExpander, MatrixInstance, MAX_MATRIX_COMBINATIONS};
pub use results::{JobResult, JobStatus, RunResult, RunStatus, StepResult, StepStatus};
pub use scheduler::{Dispatch, JobInstance, JobOutcome, Scheduler};
