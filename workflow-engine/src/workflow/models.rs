// Workflow Models
// Serde shapes of a workflow file: triggers, jobs, strategies and steps

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use std::collections::{BTreeMap, HashMap};

/// One workflow file.
///
/// Jobs are keyed by id in a `BTreeMap`, which makes every ordering
/// decision taken from them deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,

    /// `on:` block
    #[serde(rename = "on")]
    pub on: Trigger,

    /// Visible to every job; job and step `env` override it
    #[serde(default, deserialize_with = "scalar_map")]
    pub env: HashMap<String, String>,

    /// `defaults.run` shared by all jobs
    #[serde(default)]
    pub defaults: Option<Defaults>,

    pub jobs: BTreeMap<String, Job>,
}

impl Workflow {
    /// Name used in logs, events and run results.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed workflow")
    }
}

/// Accept any scalar as an environment value (`RUST_BACKTRACE: 1`, `CI: true`).
fn scalar_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                Value::Bool(_) | Value::Number(_) => value.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "environment variable '{}' must be a scalar, got {}",
                        key, other
                    )))
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// The three accepted shapes of `on:`: a bare event name, a list of
/// names, or a mapping from event name to its filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    Single(String),

    Multiple(Vec<String>),

    /// `on: { push: { branches: [main] }, schedule: [...] }`
    Detailed(BTreeMap<String, Option<EventSpec>>),
}

impl Trigger {
    /// Names of all events this trigger listens to.
    pub fn event_names(&self) -> Vec<&str> {
        match self {
            Trigger::Single(name) => vec![name.as_str()],
            Trigger::Multiple(names) => names.iter().map(String::as_str).collect(),
            Trigger::Detailed(events) => events.keys().map(String::as_str).collect(),
        }
    }

    /// Look up the declared configuration for an event.
    ///
    /// The outer `Option` is `None` when the event is not declared at all;
    /// the inner one is `None` when it is declared without any filters.
    pub fn spec_for(&self, event_name: &str) -> Option<Option<&EventSpec>> {
        match self {
            Trigger::Single(name) => (name == event_name).then_some(None),
            Trigger::Multiple(names) => names.iter().any(|n| n == event_name).then_some(None),
            Trigger::Detailed(events) => events.get(event_name).map(|spec| spec.as_ref()),
        }
    }
}

/// Per-event trigger body.
///
/// `schedule` is a list of cron entries while every other event takes a
/// filter mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSpec {
    Schedules(Vec<ScheduleEntry>),
    Config(EventConfig),
}

/// One `schedule` entry: `- cron: '30 5 * * 1-5'`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub cron: String,
}

/// Filter mapping of one event. Unset lists do not filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventConfig {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,

    /// Push only
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, rename = "tags-ignore")]
    pub tags_ignore: Vec<String>,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default, rename = "paths-ignore")]
    pub paths_ignore: Vec<String>,

    /// Activity types (opened, synchronize, published, ...)
    #[serde(default)]
    pub types: Vec<String>,

    /// `workflow_dispatch` only
    #[serde(default)]
    pub inputs: BTreeMap<String, WorkflowInput>,
}

/// A declared `workflow_dispatch` input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    /// Used when the dispatch omits the input
    #[serde(default)]
    pub default: Option<Value>,

    /// `string` (the default), `boolean`, `number` or `choice`
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,

    /// Allowed values of a `choice` input
    #[serde(default)]
    pub options: Vec<String>,
}

/// `defaults:` at workflow or job level
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    #[serde(default)]
    pub run: Option<RunDefaults>,
}

/// Fallback `shell` and `working-directory` for `run` steps
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunDefaults {
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// A job: steps run in order on one runner, once per matrix instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Job {
    /// May reference `matrix.*`
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub needs: JobNeeds,

    /// Runner labels the job requires
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<RunsOn>,

    /// Evaluated once the needed jobs finished; an empty condition means `success()`
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// Templates evaluated after the last step, exposed as `needs.<id>.outputs`
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    #[serde(default)]
    pub strategy: Option<Strategy>,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Falls back to the engine's default job timeout
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,

    /// Whether a failure of this job still counts as success for the run
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: ContinueOnError,
}

/// `needs:` as a single job id or a list
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum JobNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl JobNeeds {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            JobNeeds::None => vec![],
            JobNeeds::Single(id) => vec![id.clone()],
            JobNeeds::Multiple(ids) => ids.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            JobNeeds::None => true,
            JobNeeds::Single(_) => false,
            JobNeeds::Multiple(ids) => ids.is_empty(),
        }
    }
}

/// `runs-on:` labels a runner must carry.
///
/// Either form may contain `${{ matrix.* }}` references, resolved per
/// matrix instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    Label(String),

    Labels(Vec<String>),
}

impl RunsOn {
    pub fn labels(&self) -> Vec<String> {
        match self {
            RunsOn::Label(label) => vec![label.clone()],
            RunsOn::Labels(labels) => labels.clone(),
        }
    }
}

/// Job-level `continue-on-error`: a literal or an expression such as
/// `${{ matrix.experimental }}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContinueOnError {
    Bool(bool),
    Expression(String),
}

impl Default for ContinueOnError {
    fn default() -> Self {
        Self::Bool(false)
    }
}

/// `strategy:` of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Cancel not-yet-started sibling instances after a failure
    #[serde(default = "default_fail_fast", rename = "fail-fast")]
    pub fail_fast: bool,

    /// Cap on concurrently running instances of this job
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<u32>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            matrix: None,
            fail_fast: default_fail_fast(),
            max_parallel: None,
        }
    }
}

fn default_fail_fast() -> bool {
    true
}

/// A matrix: named axes plus `include`/`exclude` adjustments.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Matrix {
    /// Matrix axes (dynamic keys); each value must be a list
    #[serde(flatten)]
    pub dimensions: BTreeMap<String, Value>,

    #[serde(default)]
    pub include: Vec<BTreeMap<String, Value>>,

    /// Partial combinations; any product entry matching one is dropped
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, Value>>,
}

/// One step: either a `run` script or a `uses` action.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Step {
    /// Makes the step visible as `steps.<id>`
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    #[serde(default)]
    pub run: Option<String>,

    /// `bash`, `sh`, `pwsh`, `python`, ...
    #[serde(default)]
    pub shell: Option<String>,

    /// Relative paths resolve against the workspace
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Registered action reference such as `cache@v4`
    #[serde(default)]
    pub uses: Option<String>,

    #[serde(default)]
    pub with: BTreeMap<String, Value>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub env: HashMap<String, String>,

    /// A failure still concludes as success
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,
}

impl Step {
    /// Name shown in events: the explicit name, the action, or the first script line
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(uses) = &self.uses {
            format!("Run {}", uses)
        } else if let Some(run) = &self.run {
            let first_line = run.lines().next().unwrap_or(run);
            if first_line.chars().count() > 50 {
                let truncated: String = first_line.chars().take(47).collect();
                format!("Run {}...", truncated)
            } else {
                format!("Run {}", first_line)
            }
        } else {
            "Unnamed step".to_string()
        }
    }

    pub fn is_run(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_uses(&self) -> bool {
        self.uses.is_some()
    }
}
