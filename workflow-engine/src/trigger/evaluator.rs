// Trigger Evaluator
// Decides whether a repository event starts a workflow run

use crate::trigger::event::{classify_ref, RefKind, RepositoryEvent};
use crate::trigger::filters::{CronSchedule, PatternList};
use crate::workflow::models::{EventConfig, EventSpec, Trigger, Workflow, WorkflowInput};
use crate::{EngineError, EngineResult};

use serde_json::Value;
use tracing::debug;

use std::collections::BTreeMap;

/// Activity types a bare `pull_request` trigger reacts to
pub const DEFAULT_PULL_REQUEST_TYPES: [&str; 3] = ["opened", "synchronize", "reopened"];

/// A positive trigger decision
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    pub event_name: String,
    /// Resolved `workflow_dispatch` inputs (empty for other events)
    pub inputs: BTreeMap<String, Value>,
}

/// Matches events against a workflow's `on:` block
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    /// Check filter declarations without an event.
    ///
    /// Rejects conflicting include/ignore pairs, malformed globs, invalid
    /// cron entries and schedule/filter shape mix-ups.
    pub fn validate(trigger: &Trigger) -> EngineResult<()> {
        let events = match trigger {
            Trigger::Detailed(events) => events,
            _ => return Ok(()),
        };

        for (name, spec) in events {
            match (name.as_str(), spec) {
                (_, None) => {}
                ("schedule", Some(EventSpec::Schedules(entries))) => {
                    if entries.is_empty() {
                        return Err(EngineError::Trigger(
                            "schedule declares no cron entries".to_string(),
                        ));
                    }
                    for entry in entries {
                        CronSchedule::parse(&entry.cron).map_err(EngineError::Trigger)?;
                    }
                }
                ("schedule", Some(EventSpec::Config(_))) => {
                    return Err(EngineError::Trigger(
                        "schedule must be a list of cron entries".to_string(),
                    ));
                }
                (_, Some(EventSpec::Schedules(_))) => {
                    return Err(EngineError::Trigger(format!(
                        "event '{}' takes a filter mapping, not a list",
                        name
                    )));
                }
                (_, Some(EventSpec::Config(config))) => {
                    validate_config(name, config)?;
                }
            }
        }

        Ok(())
    }

    /// Resolve inputs for a run started by hand.
    ///
    /// Workflows declaring `workflow_dispatch` get the same validation and
    /// defaults as a dispatch event; otherwise inputs pass through as given.
    pub fn resolve_manual_inputs(
        workflow: &Workflow,
        supplied: &BTreeMap<String, Value>,
    ) -> EngineResult<BTreeMap<String, Value>> {
        match workflow.on.spec_for("workflow_dispatch") {
            Some(Some(EventSpec::Config(config))) => resolve_inputs(&config.inputs, supplied),
            Some(_) => resolve_inputs(&BTreeMap::new(), supplied),
            None => Ok(supplied.clone()),
        }
    }

    /// Evaluate a workflow's triggers against an event.
    ///
    /// Returns `Ok(None)` when the workflow does not react to the event and
    /// an error when its declarations are invalid or dispatch inputs do not
    /// satisfy the declared inputs.
    pub fn evaluate(
        workflow: &Workflow,
        event: &RepositoryEvent,
    ) -> EngineResult<Option<TriggerMatch>> {
        let event_name = event.event_name();
        let spec = match workflow.on.spec_for(event_name) {
            Some(spec) => spec,
            None => return Ok(None),
        };

        let config = match spec {
            None => None,
            Some(EventSpec::Config(config)) => Some(config),
            Some(EventSpec::Schedules(entries)) => {
                let fired = match event {
                    RepositoryEvent::Schedule { cron, at } => {
                        schedule_fires(entries.iter().map(|e| e.cron.as_str()), cron.as_deref(), *at)?
                    }
                    _ => {
                        return Err(EngineError::Trigger(format!(
                            "event '{}' takes a filter mapping, not a list",
                            event_name
                        )))
                    }
                };
                return Ok(fired.then(|| TriggerMatch {
                    event_name: event_name.to_string(),
                    inputs: BTreeMap::new(),
                }));
            }
        };

        let default_config = EventConfig::default();
        let config = config.unwrap_or(&default_config);

        let matched = match event {
            RepositoryEvent::Push {
                git_ref,
                changed_paths,
                ..
            } => push_matches(config, git_ref, changed_paths.as_deref())?,
            RepositoryEvent::PullRequest {
                action,
                base_ref,
                changed_paths,
                ..
            } => pull_request_matches(config, action, base_ref, changed_paths.as_deref())?,
            RepositoryEvent::Schedule { .. } => {
                // `schedule` declared without any entries never fires
                false
            }
            RepositoryEvent::WorkflowDispatch { inputs, .. } => {
                let resolved = resolve_inputs(&config.inputs, inputs)?;
                return Ok(Some(TriggerMatch {
                    event_name: event_name.to_string(),
                    inputs: resolved,
                }));
            }
            RepositoryEvent::Other { action, .. } => {
                config.types.is_empty()
                    || action
                        .as_deref()
                        .is_some_and(|a| config.types.iter().any(|t| t == a))
            }
        };

        debug!(
            workflow = workflow.display_name(),
            event = event_name,
            matched,
            "evaluated trigger"
        );

        Ok(matched.then(|| TriggerMatch {
            event_name: event_name.to_string(),
            inputs: BTreeMap::new(),
        }))
    }
}

fn validate_config(event_name: &str, config: &EventConfig) -> EngineResult<()> {
    let pairs = [
        ("branches", &config.branches, "branches-ignore", &config.branches_ignore),
        ("tags", &config.tags, "tags-ignore", &config.tags_ignore),
        ("paths", &config.paths, "paths-ignore", &config.paths_ignore),
    ];

    for (include_name, include, ignore_name, ignore) in pairs {
        if !include.is_empty() && !ignore.is_empty() {
            return Err(EngineError::Trigger(format!(
                "event '{}' cannot use both '{}' and '{}'",
                event_name, include_name, ignore_name
            )));
        }
        compile(include)?;
        compile(ignore)?;
    }

    for (name, input) in &config.inputs {
        if input.input_type.as_deref() == Some("choice") && input.options.is_empty() {
            return Err(EngineError::Trigger(format!(
                "choice input '{}' declares no options",
                name
            )));
        }
    }

    Ok(())
}

fn compile(patterns: &[String]) -> EngineResult<PatternList> {
    PatternList::new(patterns).map_err(EngineError::Trigger)
}

/// Include list must select the candidate; ignore list must not.
fn filter_pair(include: &[String], ignore: &[String], candidate: &str) -> EngineResult<bool> {
    if !include.is_empty() {
        return Ok(compile(include)?.matches(candidate));
    }
    if !ignore.is_empty() {
        return Ok(!compile(ignore)?.matches(candidate));
    }
    Ok(true)
}

fn paths_match(config: &EventConfig, changed: Option<&[String]>) -> EngineResult<bool> {
    let changed = match changed {
        Some(changed) => changed,
        None => return Ok(true),
    };

    if !config.paths.is_empty() {
        return Ok(compile(&config.paths)?.matches_any(changed.iter()));
    }
    if !config.paths_ignore.is_empty() {
        let ignored = compile(&config.paths_ignore)?;
        return Ok(changed.iter().any(|path| !ignored.matches(path)));
    }
    Ok(true)
}

fn push_matches(
    config: &EventConfig,
    git_ref: &str,
    changed: Option<&[String]>,
) -> EngineResult<bool> {
    let has_branch_filters = !config.branches.is_empty() || !config.branches_ignore.is_empty();
    let has_tag_filters = !config.tags.is_empty() || !config.tags_ignore.is_empty();

    let (kind, name) = classify_ref(git_ref);
    let ref_ok = match kind {
        RefKind::Branch if has_branch_filters => {
            filter_pair(&config.branches, &config.branches_ignore, name)?
        }
        RefKind::Branch => !has_tag_filters,
        RefKind::Tag if has_tag_filters => filter_pair(&config.tags, &config.tags_ignore, name)?,
        RefKind::Tag => !has_branch_filters,
    };

    if !ref_ok {
        return Ok(false);
    }
    paths_match(config, changed)
}

fn pull_request_matches(
    config: &EventConfig,
    action: &str,
    base_ref: &str,
    changed: Option<&[String]>,
) -> EngineResult<bool> {
    let type_ok = if config.types.is_empty() {
        DEFAULT_PULL_REQUEST_TYPES.contains(&action)
    } else {
        config.types.iter().any(|t| t == action)
    };
    if !type_ok {
        return Ok(false);
    }

    let (_, base) = classify_ref(base_ref);
    if !filter_pair(&config.branches, &config.branches_ignore, base)? {
        return Ok(false);
    }
    paths_match(config, changed)
}

fn schedule_fires<'a>(
    declared: impl Iterator<Item = &'a str>,
    fired_cron: Option<&str>,
    at: chrono::DateTime<chrono::Utc>,
) -> EngineResult<bool> {
    for expression in declared {
        let schedule = CronSchedule::parse(expression).map_err(EngineError::Trigger)?;
        let hit = match fired_cron {
            Some(fired) => {
                let fired: Vec<&str> = fired.split_whitespace().collect();
                fired.join(" ") == schedule.expression()
            }
            None => schedule.fires_at(at),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Validate supplied dispatch inputs against their declarations and fill
/// in defaults.
fn resolve_inputs(
    declared: &BTreeMap<String, WorkflowInput>,
    supplied: &BTreeMap<String, Value>,
) -> EngineResult<BTreeMap<String, Value>> {
    if let Some(unknown) = supplied.keys().find(|k| !declared.contains_key(*k)) {
        return Err(EngineError::InvalidInput(format!(
            "unexpected input '{}'",
            unknown
        )));
    }

    let mut resolved = BTreeMap::new();
    for (name, input) in declared {
        let value = match supplied.get(name).or(input.default.as_ref()) {
            Some(value) => value.clone(),
            None if input.required => {
                return Err(EngineError::InvalidInput(format!(
                    "missing required input '{}'",
                    name
                )))
            }
            None => continue,
        };
        resolved.insert(name.clone(), coerce_input(name, input, value)?);
    }

    Ok(resolved)
}

fn coerce_input(name: &str, input: &WorkflowInput, value: Value) -> EngineResult<Value> {
    let invalid = |expected: &str| {
        EngineError::InvalidInput(format!("input '{}' must be {}", name, expected))
    };

    match input.input_type.as_deref().unwrap_or("string") {
        "boolean" => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) if s == "true" => Ok(Value::Bool(true)),
            Value::String(s) if s == "false" => Ok(Value::Bool(false)),
            _ => Err(invalid("true or false")),
        },
        "number" => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("a number")),
            _ => Err(invalid("a number")),
        },
        "choice" => {
            let text = scalar_text(&value).ok_or_else(|| invalid("a string"))?;
            if input.options.iter().any(|o| *o == text) {
                Ok(Value::String(text))
            } else {
                Err(invalid(&format!("one of [{}]", input.options.join(", "))))
            }
        }
        _ => scalar_text(&value)
            .map(Value::String)
            .ok_or_else(|| invalid("a string")),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        _ => None,
    }
}
