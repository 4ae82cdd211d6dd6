// Run Context
// Per-run facts exposed to expressions and to step environments

use crate::execution::matrix::MatrixInstance;
use crate::expression::ExpressionContext;
use crate::trigger::RepositoryEvent;
use crate::workflow::Workflow;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Immutable facts about one run, shared by every job instance
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow: Arc<Workflow>,
    pub event: RepositoryEvent,
    /// Dispatch inputs after defaults and coercion
    pub inputs: BTreeMap<String, Value>,
    pub workspace: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        workflow: Arc<Workflow>,
        event: RepositoryEvent,
        inputs: BTreeMap<String, Value>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow,
            event,
            inputs,
            workspace: workspace.into(),
            started_at: Utc::now(),
        }
    }

    pub fn workflow_name(&self) -> &str {
        self.workflow.display_name()
    }

    /// The `github` context as seen by `job_id`
    pub fn github(&self, job_id: &str) -> Value {
        json!({
            "event_name": self.event.event_name(),
            "event": self.event.payload(),
            "ref": self.event.git_ref(),
            "ref_name": self.event.ref_name(),
            "sha": self.event.sha(),
            "action": self.event.action(),
            "workflow": self.workflow_name(),
            "run_id": self.run_id.to_string(),
            "job": job_id,
            "workspace": self.workspace.display().to_string(),
        })
    }

    /// Expression context for one job instance before any step ran.
    ///
    /// `needs` and `strategy` come from the scheduler, which owns the
    /// results of other jobs.
    pub fn expression_context(
        &self,
        job_id: &str,
        matrix: &MatrixInstance,
        needs: Value,
        strategy: Value,
    ) -> ExpressionContext {
        let matrix_values: Map<String, Value> = matrix
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let inputs: Map<String, Value> = self
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        ExpressionContext::new()
            .with("github", self.github(job_id))
            .with("inputs", Value::Object(inputs))
            .with("matrix", Value::Object(matrix_values))
            .with("needs", needs)
            .with("strategy", strategy)
            .with("env", Value::Object(Map::new()))
            .with("steps", Value::Object(Map::new()))
            .with_workspace(self.workspace.clone())
    }

    /// `CI` and `WORKFLOW_*` variables; file command paths are added per step
    pub fn environment(&self, job_id: &str) -> Vec<(String, String)> {
        let mut vars = vec![
            ("CI".to_string(), "true".to_string()),
            ("WORKFLOW_RUN_ID".to_string(), self.run_id.to_string()),
            ("WORKFLOW_JOB".to_string(), job_id.to_string()),
            ("WORKFLOW_WORKFLOW".to_string(), self.workflow_name().to_string()),
            (
                "WORKFLOW_EVENT_NAME".to_string(),
                self.event.event_name().to_string(),
            ),
            (
                "WORKFLOW_WORKSPACE".to_string(),
                self.workspace.display().to_string(),
            ),
        ];
        if let Some(git_ref) = self.event.git_ref() {
            vars.push(("WORKFLOW_REF".to_string(), git_ref.to_string()));
        }
        if let Some(ref_name) = self.event.ref_name() {
            vars.push(("WORKFLOW_REF_NAME".to_string(), ref_name.to_string()));
        }
        if let Some(sha) = self.event.sha() {
            vars.push(("WORKFLOW_SHA".to_string(), sha.to_string()));
        }
        vars
    }
}
