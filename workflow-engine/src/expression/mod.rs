// Expression Module
// `${{ }}` interpolation and `if:` conditions over run contexts

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{is_truthy, to_display_string, Evaluator, ExpressionContext, StatusCheck};
pub use functions::BuiltinFunctions;
pub use lexer::{Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("unknown context '{0}'")]
    UnknownContext(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}(): {message}")]
    InvalidArguments { function: String, message: String },

    #[error("unterminated expression in '{0}'")]
    Unterminated(String),

    #[error("hashFiles: {0}")]
    HashFiles(String),
}

impl ExpressionError {
    pub fn syntax(message: impl Into<String>, position: usize) -> Self {
        ExpressionError::Syntax {
            message: message.into(),
            position,
        }
    }
}

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Evaluate one expression, bare or wrapped in `${{ }}`
pub fn evaluate(expression: &str, context: &ExpressionContext) -> Result<Value, ExpressionError> {
    let ast = ExprParser::parse_str(strip_wrapper(expression))?;
    Evaluator::new(context, StatusCheck::succeeded()).eval(&ast)
}

/// Whether the text contains any `${{ }}` placeholder
pub fn has_expressions(text: &str) -> bool {
    text.contains(OPEN)
}

/// Replace every `${{ expr }}` in a template with its text value
pub fn interpolate(template: &str, context: &ExpressionContext) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let body_start = start + OPEN.len();
        let end = find_close(&rest[body_start..])
            .ok_or_else(|| ExpressionError::Unterminated(template.to_string()))?;
        let body = &rest[body_start..body_start + end];

        let ast = ExprParser::parse_str(body)?;
        let value = Evaluator::new(context, StatusCheck::succeeded()).eval(&ast)?;
        out.push_str(&to_display_string(&value));

        rest = &rest[body_start + end + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Interpolate every string inside a JSON value (used for `with:` inputs).
///
/// A string that is exactly one placeholder keeps the evaluated value's type.
pub fn interpolate_value(value: &Value, context: &ExpressionContext) -> Result<Value, ExpressionError> {
    match value {
        Value::String(text) if has_expressions(text) => {
            let trimmed = text.trim();
            if is_single_expression(trimmed) {
                evaluate(trimmed, context)
            } else {
                interpolate(text, context).map(Value::String)
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| interpolate_value(v, context).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Evaluate an `if:` condition.
///
/// Empty conditions mean `success()`. Unless a status function appears
/// the expression is implicitly `success() && (expr)`.
pub fn evaluate_condition(
    condition: &str,
    context: &ExpressionContext,
    status: StatusCheck,
) -> Result<bool, ExpressionError> {
    let body = strip_wrapper(condition).trim();
    if body.is_empty() {
        return Ok(status.is_success());
    }

    let ast = ExprParser::parse_str(body)?;
    if !ast.uses_status_function() && !status.is_success() {
        return Ok(false);
    }

    let value = Evaluator::new(context, status).eval(&ast)?;
    Ok(is_truthy(&value))
}

/// `${{ a }}` -> `a`; anything else is returned unchanged
fn strip_wrapper(expression: &str) -> &str {
    let trimmed = expression.trim();
    if is_single_expression(trimmed) {
        &trimmed[OPEN.len()..trimmed.len() - CLOSE.len()]
    } else {
        trimmed
    }
}

fn is_single_expression(trimmed: &str) -> bool {
    trimmed.starts_with(OPEN)
        && find_close(&trimmed[OPEN.len()..])
            .is_some_and(|end| OPEN.len() + end + CLOSE.len() == trimmed.len())
}

/// Offset of the closing `}}`, ignoring braces inside string literals
fn find_close(body: &str) -> Option<usize> {
    let mut in_string = false;
    for (i, c) in body.char_indices() {
        if c == '\'' {
            in_string = !in_string;
        } else if !in_string && body[i..].starts_with(CLOSE) {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExpressionContext {
        ExpressionContext::new()
            .with("github", json!({ "ref": "refs/heads/main", "sha": "abc123" }))
            .with("matrix", json!({ "os": "ubuntu", "node": 20 }))
            .with("inputs", json!({ "dry-run": true }))
    }

    #[test]
    fn test_interpolate() {
        let ctx = context();
        assert_eq!(
            interpolate("build-${{ matrix.os }}-node${{ matrix.node }}", &ctx).unwrap(),
            "build-ubuntu-node20"
        );
        assert_eq!(interpolate("no placeholders", &ctx).unwrap(), "no placeholders");
        assert_eq!(
            interpolate("${{ format('{0}}}', 'x') }}", &ctx).unwrap(),
            "x}"
        );
        assert_eq!(interpolate("${{ inputs }}", &ctx).unwrap(), r#"{"dry-run":true}"#);
    }

    #[test]
    fn test_interpolate_unterminated() {
        let err = interpolate("echo ${{ matrix.os", &context()).unwrap_err();
        assert!(matches!(err, ExpressionError::Unterminated(_)));
    }

    #[test]
    fn test_interpolate_value_keeps_types() {
        let ctx = context();
        assert_eq!(
            interpolate_value(&json!("${{ inputs.dry-run }}"), &ctx).unwrap(),
            json!(true)
        );
        assert_eq!(
            interpolate_value(&json!(["v-${{ matrix.node }}", 3]), &ctx).unwrap(),
            json!(["v-20", 3])
        );
    }

    #[test]
    fn test_condition_implicit_success() {
        let ctx = context();
        let cond = "github.ref == 'refs/heads/main'";
        assert!(evaluate_condition(cond, &ctx, StatusCheck::succeeded()).unwrap());
        assert!(!evaluate_condition(cond, &ctx, StatusCheck::failed()).unwrap());
        assert!(evaluate_condition("${{ always() }}", &ctx, StatusCheck::failed()).unwrap());
        assert!(evaluate_condition("failure()", &ctx, StatusCheck::failed()).unwrap());
        assert!(!evaluate_condition("failure()", &ctx, StatusCheck::succeeded()).unwrap());
    }

    #[test]
    fn test_empty_condition_is_success() {
        let ctx = context();
        assert!(evaluate_condition("", &ctx, StatusCheck::succeeded()).unwrap());
        assert!(!evaluate_condition("  ", &ctx, StatusCheck::cancelled()).unwrap());
    }

    #[test]
    fn test_evaluate_wrapped_and_bare() {
        let ctx = context();
        assert_eq!(evaluate("${{ github.sha }}", &ctx).unwrap(), json!("abc123"));
        assert_eq!(evaluate("github.sha", &ctx).unwrap(), json!("abc123"));
    }
}
