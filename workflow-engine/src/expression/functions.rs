// Built-in Functions
// Status checks, string helpers, JSON conversion and hashFiles

use crate::expression::evaluator::{loose_eq, to_display_string, ExpressionContext, StatusCheck};
use crate::expression::ExpressionError;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use sha2::{Digest, Sha256};

use std::fs;
use std::path::Path;

pub struct BuiltinFunctions;

impl BuiltinFunctions {
    /// Call a function by (case-insensitive) name with evaluated arguments
    pub fn call(
        name: &str,
        args: &[Value],
        context: &ExpressionContext,
        status: StatusCheck,
    ) -> Result<Value, ExpressionError> {
        let lowered = name.to_ascii_lowercase();
        match lowered.as_str() {
            "success" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(status.is_success()))
            }
            "failure" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(status.failed && !status.cancelled))
            }
            "cancelled" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(status.cancelled))
            }
            "always" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(true))
            }
            "contains" => {
                arity(name, args, 2, 2)?;
                Ok(Value::Bool(contains(&args[0], &args[1])))
            }
            "startswith" => {
                arity(name, args, 2, 2)?;
                let (text, prefix) = lowered_pair(args);
                Ok(Value::Bool(text.starts_with(&prefix)))
            }
            "endswith" => {
                arity(name, args, 2, 2)?;
                let (text, suffix) = lowered_pair(args);
                Ok(Value::Bool(text.ends_with(&suffix)))
            }
            "format" => {
                arity(name, args, 1, usize::MAX)?;
                format(&to_display_string(&args[0]), &args[1..]).map(Value::String)
            }
            "join" => {
                arity(name, args, 1, 2)?;
                let separator = args.get(1).map(to_display_string);
                Ok(Value::String(join(&args[0], separator.as_deref().unwrap_or(","))))
            }
            "tojson" => {
                arity(name, args, 1, 1)?;
                serde_json::to_string_pretty(&args[0])
                    .map(Value::String)
                    .map_err(|e| invalid(name, e.to_string()))
            }
            "fromjson" => {
                arity(name, args, 1, 1)?;
                serde_json::from_str(&to_display_string(&args[0]))
                    .map_err(|e| invalid(name, format!("invalid JSON: {}", e)))
            }
            "hashfiles" => {
                arity(name, args, 1, usize::MAX)?;
                let workspace = context
                    .workspace()
                    .ok_or_else(|| invalid(name, "requires a workspace directory"))?;
                let patterns: Vec<String> = args.iter().map(to_display_string).collect();
                hash_files(workspace, &patterns).map(Value::String)
            }
            _ => Err(ExpressionError::UnknownFunction(name.to_string())),
        }
    }
}

fn invalid(function: &str, message: impl Into<String>) -> ExpressionError {
    ExpressionError::InvalidArguments {
        function: function.to_string(),
        message: message.into(),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else if max == usize::MAX {
            format!("at least {}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(invalid(
            name,
            format!("expects {} argument(s), got {}", expected, args.len()),
        ));
    }
    Ok(())
}

fn lowered_pair(args: &[Value]) -> (String, String) {
    (
        to_display_string(&args[0]).to_lowercase(),
        to_display_string(&args[1]).to_lowercase(),
    )
}

fn contains(search: &Value, item: &Value) -> bool {
    match search {
        Value::Array(items) => items.iter().any(|candidate| loose_eq(candidate, item)),
        _ => to_display_string(search)
            .to_lowercase()
            .contains(&to_display_string(item).to_lowercase()),
    }
}

fn join(value: &Value, separator: &str) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(to_display_string)
            .collect::<Vec<_>>()
            .join(separator),
        other => to_display_string(other),
    }
}

/// `format('{0} on {1}', a, b)`; `{{` and `}}` are literal braces
fn format(template: &str, args: &[Value]) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => {
                            return Err(invalid(
                                "format",
                                format!("invalid placeholder in '{}'", template),
                            ))
                        }
                    }
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| invalid("format", format!("empty placeholder in '{}'", template)))?;
                let arg = args.get(index).ok_or_else(|| {
                    invalid(
                        "format",
                        format!("placeholder {{{}}} has no matching argument", index),
                    )
                })?;
                out.push_str(&to_display_string(arg));
            }
            '}' => {
                return Err(invalid(
                    "format",
                    format!("unmatched '}}' in '{}'", template),
                ))
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

/// SHA-256 over the SHA-256 of every matching file, in path order.
///
/// Empty string when nothing matches.
pub fn hash_files(workspace: &Path, patterns: &[String]) -> Result<String, ExpressionError> {
    let mut include = GlobSetBuilder::new();
    let mut exclude = GlobSetBuilder::new();
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) => exclude.add(glob(negated)?),
            None => include.add(glob(pattern)?),
        };
    }
    let include = build(include)?;
    let exclude = build(exclude)?;

    let mut files = Vec::new();
    collect_files(workspace, workspace, &mut files)?;
    files.sort();

    let mut combined = Sha256::new();
    let mut matched = false;
    for relative in files {
        if !include.is_match(&relative) || exclude.is_match(&relative) {
            continue;
        }
        let bytes = fs::read(workspace.join(&relative))
            .map_err(|e| ExpressionError::HashFiles(format!("{}: {}", relative, e)))?;
        combined.update(Sha256::digest(&bytes));
        matched = true;
    }

    Ok(if matched {
        hex::encode(combined.finalize())
    } else {
        String::new()
    })
}

fn glob(pattern: &str) -> Result<Glob, ExpressionError> {
    globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| ExpressionError::HashFiles(e.to_string()))
}

fn build(builder: GlobSetBuilder) -> Result<GlobSet, ExpressionError> {
    builder
        .build()
        .map_err(|e| ExpressionError::HashFiles(e.to_string()))
}

/// Workspace-relative paths with `/` separators, skipping `.git`
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), ExpressionError> {
    let entries =
        fs::read_dir(dir).map_err(|e| ExpressionError::HashFiles(format!("{}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| ExpressionError::HashFiles(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            if entry.file_name() != ".git" {
                collect_files(root, &path, out)?;
            }
        } else if let Ok(relative) = path.strip_prefix(root) {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}
