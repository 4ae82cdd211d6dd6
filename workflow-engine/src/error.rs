// Engine Errors
// Configuration-time error taxonomy shared across the crate

use crate::execution::graph::GraphError;
use crate::execution::matrix::MatrixError;
use crate::expression::ExpressionError;
use crate::store::StoreError;

use thiserror::Error;

/// Errors raised before or around execution.
///
/// Step and job failures are not errors: they are reported as statuses in
/// the run result. Everything here means the engine refused to start (or
/// continue) doing work.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("matrix error: {0}")]
    Matrix(#[from] MatrixError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("trigger error: {0}")]
    Trigger(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
