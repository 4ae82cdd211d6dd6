// Workflow Engine Library
// Event-triggered workflow runs: triggers, job graphs, matrices, runners and a content-addressed cache

pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod store;
pub mod trigger;
pub mod utils;
pub mod workflow;

// Re-export commonly used types
pub use config::{EngineConfig, RunnerConfig};
pub use engine::WorkflowEngine;
pub use error::{EngineError, EngineResult};

// Re-export workflow types
pub use workflow::{Job, Step, Workflow, WorkflowParser};

// Re-export trigger types
pub use trigger::{RepositoryEvent, TriggerEvaluator, TriggerMatch};

// Re-export expression types
pub use expression::{ExpressionContext, ExpressionError};

// Re-export execution types
pub use execution::{
    progress_channel, CancelToken, ExecutionEvent, GraphError, JobGraph, JobResult, JobStatus,
    MatrixExpander, MatrixInstance, ProgressReceiver, ProgressSender, RunResult, RunStatus,
    StepResult, StepStatus,
};

// Re-export runner and store types
pub use runners::{Action, ActionContext, ActionError, ActionOutput, ActionRegistry};
pub use store::{ContentStore, StoreError};
