use crate::execution::graph::JobGraph;
use crate::execution::matrix::MatrixExpander;
use crate::trigger::TriggerEvaluator;
use crate::workflow::models::Workflow;
use crate::{EngineError, EngineResult};

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Loads workflow definitions and checks them before anything is scheduled.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Workflow> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse(content: &str) -> EngineResult<Workflow> {
        let workflow: Workflow = serde_yaml::from_str(content)?;
        Ok(workflow)
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse_and_validate(content: &str) -> EngineResult<Workflow> {
        let workflow = Self::parse(content)?;
        Self::validate(&workflow)?;
        Ok(workflow)
    }

    /// Validate a parsed workflow for semantic correctness.
    ///
    /// Covers the dependency graph (unknown `needs`, cycles), matrix
    /// expansion limits, trigger filter conflicts and step shape.
    pub fn validate(workflow: &Workflow) -> EngineResult<()> {
        if workflow.on.event_names().is_empty() {
            return Err(EngineError::InvalidWorkflow(
                "workflow declares no trigger events".to_string(),
            ));
        }

        TriggerEvaluator::validate(&workflow.on)?;

        // Unknown dependencies and cycles
        JobGraph::from_workflow(workflow)?;

        for (job_id, job) in &workflow.jobs {
            if !is_valid_job_id(job_id) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "job id '{}' must start with a letter or '_' and contain only alphanumerics, '-' or '_'",
                    job_id
                )));
            }

            if job.steps.is_empty() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "Job '{}' has no steps",
                    job_id
                )));
            }

            if let Some(strategy) = &job.strategy {
                MatrixExpander::expand(strategy).map_err(|e| {
                    EngineError::InvalidWorkflow(format!("job '{}': {}", job_id, e))
                })?;

                if strategy.max_parallel == Some(0) {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "job '{}': max-parallel must be at least 1",
                        job_id
                    )));
                }
            }

            let mut step_ids = HashSet::new();
            for (step_idx, step) in job.steps.iter().enumerate() {
                let step_name = step.name.as_deref().unwrap_or("unnamed");

                match (step.run.is_some(), step.uses.is_some()) {
                    (false, false) => {
                        return Err(EngineError::InvalidWorkflow(format!(
                            "Step {} '{}' in job '{}' must have either 'run' or 'uses'",
                            step_idx, step_name, job_id
                        )));
                    }
                    (true, true) => {
                        return Err(EngineError::InvalidWorkflow(format!(
                            "Step {} '{}' in job '{}' cannot have both 'run' and 'uses'",
                            step_idx, step_name, job_id
                        )));
                    }
                    _ => {}
                }

                if let Some(id) = &step.id {
                    if !step_ids.insert(id.as_str()) {
                        return Err(EngineError::InvalidWorkflow(format!(
                            "duplicate step id '{}' in job '{}'",
                            id, job_id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn is_valid_job_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
on: push
jobs:
  build:
    steps:
      - run: echo "Hello"
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        assert!(workflow.name.is_none());
        assert!(workflow.jobs.contains_key("build"));
    }

    #[test]
    fn test_validate_missing_dependency() {
        let yaml = r#"
on: push
jobs:
  deploy:
    needs: build
    steps:
      - run: echo "Deploying"
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("unknown job 'build'"));
    }

    #[test]
    fn test_validate_circular_dependency() {
        let yaml = r#"
on: push
jobs:
  a:
    needs: c
    steps:
      - run: echo "a"
  b:
    needs: a
    steps:
      - run: echo "b"
  c:
    needs: b
    steps:
      - run: echo "c"
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn test_validate_empty_job() {
        let yaml = r#"
on: push
jobs:
  empty:
    steps: []
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn test_validate_step_without_run_or_uses() {
        let yaml = r#"
on: push
jobs:
  build:
    steps:
      - name: Invalid step
        env:
          FOO: bar
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err
            .to_string()
            .contains("must have either 'run' or 'uses'"));
    }

    #[test]
    fn test_validate_step_with_both_run_and_uses() {
        let yaml = r#"
on: push
jobs:
  build:
    steps:
      - name: Invalid step
        run: echo "Hello"
        uses: cache@v1
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("cannot have both 'run' and 'uses'"));
    }

    #[test]
    fn test_validate_duplicate_step_ids() {
        let yaml = r#"
on: push
jobs:
  build:
    steps:
      - id: version
        run: echo one
      - id: version
        run: echo two
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_validate_conflicting_branch_filters() {
        let yaml = r#"
on:
  push:
    branches: [main]
    branches-ignore: [dev]
jobs:
  build:
    steps:
      - run: echo hi
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("branches-ignore"));
    }

    #[test]
    fn test_validate_invalid_cron() {
        let yaml = r#"
on:
  schedule:
    - cron: 'not a cron'
jobs:
  build:
    steps:
      - run: echo hi
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        assert!(WorkflowParser::validate(&workflow).is_err());
    }

    #[test]
    fn test_validate_empty_matrix() {
        let yaml = r#"
on: push
jobs:
  test:
    strategy:
      matrix:
        os: []
    steps:
      - run: echo hi
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = WorkflowParser::validate(&workflow).unwrap_err();
        assert!(err.to_string().contains("job 'test'"));
    }

    #[test]
    fn test_validate_job_id_characters() {
        assert!(is_valid_job_id("build"));
        assert!(is_valid_job_id("_private-job_2"));
        assert!(!is_valid_job_id("2fast"));
        assert!(!is_valid_job_id("has space"));
        assert!(!is_valid_job_id(""));
    }

    #[test]
    fn test_parse_and_validate_complex_workflow() {
        let yaml = r#"
name: Rust CI

on:
  push:
    branches: [main, develop]
  pull_request:
    branches: [main]

env:
  CARGO_TERM_COLOR: always

jobs:
  check:
    name: Check
    steps:
      - run: cargo check --all-features

  test:
    name: Test Suite
    needs: check
    strategy:
      matrix:
        rust: [stable, beta, nightly]
    steps:
      - name: Run tests
        run: cargo test --all-features
        env:
          RUST_BACKTRACE: 1

  fmt:
    steps:
      - run: cargo fmt --all -- --check

  deploy:
    needs: [test, fmt]
    if: github.ref == 'refs/heads/main'
    steps:
      - run: echo "Deploying..."
"#;
        let workflow = WorkflowParser::parse_and_validate(yaml).unwrap();
        assert_eq!(workflow.name, Some("Rust CI".to_string()));
        assert_eq!(workflow.jobs.len(), 4);
        assert_eq!(workflow.jobs["deploy"].needs.to_vec(), vec!["test", "fmt"]);
    }
}
