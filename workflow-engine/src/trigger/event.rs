// Repository Events
// The inputs that can start a workflow run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::collections::BTreeMap;

/// Something that happened in a repository.
///
/// Paths are `None` when the source of the event does not know which files
/// changed; path filters then let the event through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RepositoryEvent {
    Push {
        git_ref: String,
        sha: String,
        #[serde(default)]
        changed_paths: Option<Vec<String>>,
    },
    PullRequest {
        action: String,
        base_ref: String,
        head_ref: String,
        sha: String,
        #[serde(default)]
        changed_paths: Option<Vec<String>>,
    },
    Schedule {
        /// The cron entry that fired, when the caller knows it
        #[serde(default)]
        cron: Option<String>,
        at: DateTime<Utc>,
    },
    WorkflowDispatch {
        git_ref: String,
        #[serde(default)]
        inputs: BTreeMap<String, Value>,
    },
    Other {
        name: String,
        #[serde(default)]
        action: Option<String>,
    },
}

impl RepositoryEvent {
    pub fn push(git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        RepositoryEvent::Push {
            git_ref: git_ref.into(),
            sha: sha.into(),
            changed_paths: None,
        }
    }

    pub fn pull_request(
        action: impl Into<String>,
        base_ref: impl Into<String>,
        head_ref: impl Into<String>,
        sha: impl Into<String>,
    ) -> Self {
        RepositoryEvent::PullRequest {
            action: action.into(),
            base_ref: base_ref.into(),
            head_ref: head_ref.into(),
            sha: sha.into(),
            changed_paths: None,
        }
    }

    pub fn schedule_at(at: DateTime<Utc>) -> Self {
        RepositoryEvent::Schedule { cron: None, at }
    }

    pub fn dispatch(git_ref: impl Into<String>, inputs: BTreeMap<String, Value>) -> Self {
        RepositoryEvent::WorkflowDispatch {
            git_ref: git_ref.into(),
            inputs,
        }
    }

    /// Attach the list of changed files to a push or pull request.
    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collected: Vec<String> = paths.into_iter().map(Into::into).collect();
        match &mut self {
            RepositoryEvent::Push { changed_paths, .. }
            | RepositoryEvent::PullRequest { changed_paths, .. } => {
                *changed_paths = Some(collected);
            }
            _ => {}
        }
        self
    }

    /// Name matched against the keys of a workflow's `on:` block
    pub fn event_name(&self) -> &str {
        match self {
            RepositoryEvent::Push { .. } => "push",
            RepositoryEvent::PullRequest { .. } => "pull_request",
            RepositoryEvent::Schedule { .. } => "schedule",
            RepositoryEvent::WorkflowDispatch { .. } => "workflow_dispatch",
            RepositoryEvent::Other { name, .. } => name,
        }
    }

    /// Fully qualified ref the run builds, if the event has one
    pub fn git_ref(&self) -> Option<&str> {
        match self {
            RepositoryEvent::Push { git_ref, .. }
            | RepositoryEvent::WorkflowDispatch { git_ref, .. } => Some(git_ref),
            RepositoryEvent::PullRequest { head_ref, .. } => Some(head_ref),
            _ => None,
        }
    }

    /// Short ref name: `refs/heads/main` becomes `main`
    pub fn ref_name(&self) -> Option<&str> {
        self.git_ref().map(short_ref)
    }

    pub fn sha(&self) -> Option<&str> {
        match self {
            RepositoryEvent::Push { sha, .. } | RepositoryEvent::PullRequest { sha, .. } => {
                Some(sha)
            }
            _ => None,
        }
    }

    /// Activity type (`opened`, `synchronize`, ...)
    pub fn action(&self) -> Option<&str> {
        match self {
            RepositoryEvent::PullRequest { action, .. } => Some(action),
            RepositoryEvent::Other { action, .. } => action.as_deref(),
            _ => None,
        }
    }

    pub fn changed_paths(&self) -> Option<&[String]> {
        match self {
            RepositoryEvent::Push { changed_paths, .. }
            | RepositoryEvent::PullRequest { changed_paths, .. } => changed_paths.as_deref(),
            _ => None,
        }
    }

    /// The event as a JSON document, exposed to expressions as `github.event`
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Kind of ref a push points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Branch,
    Tag,
}

/// Split a ref into its kind and short name.
///
/// Bare names (`main`) are treated as branches.
pub fn classify_ref(git_ref: &str) -> (RefKind, &str) {
    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (RefKind::Tag, tag)
    } else if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (RefKind::Branch, branch)
    } else {
        (RefKind::Branch, git_ref)
    }
}

fn short_ref(git_ref: &str) -> &str {
    classify_ref(git_ref).1
}
