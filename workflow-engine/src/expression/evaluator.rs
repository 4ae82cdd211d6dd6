// Expression Evaluator
// Evaluates parsed expressions against run contexts

use crate::expression::functions::BuiltinFunctions;
use crate::expression::parser::{number_value, BinaryOp, Expr};
use crate::expression::ExpressionError;

use serde_json::Value;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Context names expressions may reference; absent ones read as `null`
pub const KNOWN_CONTEXTS: [&str; 9] = [
    "github", "env", "matrix", "inputs", "needs", "steps", "job", "runner", "strategy",
];

/// The named values an expression can see.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    contexts: BTreeMap<String, Value>,
    workspace: Option<PathBuf>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `set`
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.contexts.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.contexts.get(name)
    }

    /// Insert `key` into an object context, creating the object when missing
    pub fn insert_into(&mut self, name: &str, key: impl Into<String>, value: Value) {
        let entry = self
            .contexts
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = entry {
            map.insert(key.into(), value);
        } else {
            let mut map = serde_json::Map::new();
            map.insert(key.into(), value);
            *entry = Value::Object(map);
        }
    }

    /// Directory `hashFiles()` resolves patterns against
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    fn lookup(&self, name: &str) -> Result<Value, ExpressionError> {
        if let Some(value) = self.contexts.get(name) {
            return Ok(value.clone());
        }
        if KNOWN_CONTEXTS.contains(&name) {
            Ok(Value::Null)
        } else {
            Err(ExpressionError::UnknownContext(name.to_string()))
        }
    }
}

/// Outcome of the work that ran before a condition is evaluated.
///
/// Feeds `success()`, `failure()` and `cancelled()`. `skipped` marks a
/// needed job that never ran, which makes `success()` false without making
/// `failure()` true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCheck {
    pub failed: bool,
    pub cancelled: bool,
    pub skipped: bool,
}

impl StatusCheck {
    pub fn succeeded() -> Self {
        Self::default()
    }

    pub fn failed() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.failed && !self.cancelled && !self.skipped
    }
}

pub struct Evaluator<'a> {
    context: &'a ExpressionContext,
    status: StatusCheck,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext, status: StatusCheck) -> Self {
        Self { context, status }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Context(name) => self.context.lookup(name),
            Expr::Member { object, property } => {
                let object = self.eval(object)?;
                Ok(property_of(&object, property))
            }
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                Ok(index_of(&object, &index))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if !is_truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(Value::Bool(compare(*op, &left, &right)))
            }
            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                BuiltinFunctions::call(name, &values, self.context, self.status)
            }
        }
    }
}

fn property_of(object: &Value, property: &str) -> Value {
    match object {
        Value::Object(map) => map
            .get(property)
            .or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(property))
                    .map(|(_, v)| v)
            })
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn index_of(object: &Value, index: &Value) -> Value {
    match (object, index) {
        (Value::Object(_), Value::String(key)) => property_of(object, key),
        (Value::Array(items), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| items.get(f as usize))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// `false`, `0`, `-0`, `NaN`, `''` and `null` are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used for interpolation: strings raw, `null` empty, others JSON
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => number_value(f).to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Equality with the platform's coercions: strings ignore case, mixed
/// scalar types compare as numbers.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            left == right
        }
        _ => to_number(left) == to_number(right),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> bool {
    if op == BinaryOp::Eq {
        return loose_eq(left, right);
    }
    if op == BinaryOp::Ne {
        return !loose_eq(left, right);
    }

    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => to_number(left).partial_cmp(&to_number(right)),
    };
    let Some(ordering) = ordering else {
        return false;
    };

    match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::ExprParser;
    use serde_json::json;

    fn context() -> ExpressionContext {
        ExpressionContext::new()
            .with(
                "github",
                json!({ "ref": "refs/heads/main", "event_name": "push" }),
            )
            .with("matrix", json!({ "os": "Linux", "node": 18 }))
            .with(
                "needs",
                json!({ "build": { "result": "success", "outputs": { "version": "1.2.3" } } }),
            )
            .with("list", json!(["a", "b"]))
    }

    fn eval(input: &str) -> Value {
        let ctx = context();
        let expr = ExprParser::parse_str(input).unwrap();
        Evaluator::new(&ctx, StatusCheck::succeeded())
            .eval(&expr)
            .unwrap()
    }

    #[test]
    fn test_property_access() {
        assert_eq!(eval("github.ref"), json!("refs/heads/main"));
        assert_eq!(eval("needs.build.outputs.version"), json!("1.2.3"));
        assert_eq!(eval("needs['build'].outputs['version']"), json!("1.2.3"));
        assert_eq!(eval("list[1]"), json!("b"));
        assert_eq!(eval("needs.missing.outputs.version"), Value::Null);
        // Unset but known context
        assert_eq!(eval("inputs.target"), Value::Null);
    }

    #[test]
    fn test_unknown_context_is_an_error() {
        let ctx = context();
        let expr = ExprParser::parse_str("secrets.token").unwrap();
        let err = Evaluator::new(&ctx, StatusCheck::succeeded())
            .eval(&expr)
            .unwrap_err();
        assert_eq!(err, ExpressionError::UnknownContext("secrets".to_string()));
    }

    #[test]
    fn test_string_equality_ignores_case() {
        assert_eq!(eval("matrix.os == 'linux'"), json!(true));
        assert_eq!(eval("matrix.os != 'LINUX'"), json!(false));
    }

    #[test]
    fn test_mixed_type_equality() {
        assert_eq!(eval("matrix.node == '18'"), json!(true));
        assert_eq!(eval("null == 0"), json!(true));
        assert_eq!(eval("true == 1"), json!(true));
        assert_eq!(eval("'abc' == 0"), json!(false));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eq!(eval("github.missing || 'fallback'"), json!("fallback"));
        assert_eq!(eval("matrix.os && matrix.node"), json!(18));
        assert_eq!(eval("!github.missing"), json!(true));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("matrix.node >= 16"), json!(true));
        assert_eq!(eval("matrix.node < 16"), json!(false));
        assert_eq!(eval("'abc' < 1"), json!(false));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!([])));
    }

    #[test]
    fn test_display_string() {
        assert_eq!(to_display_string(&json!(3.0)), "3");
        assert_eq!(to_display_string(&json!(2.5)), "2.5");
        assert_eq!(to_display_string(&Value::Null), "");
        assert_eq!(to_display_string(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_insert_into_creates_context() {
        let mut ctx = ExpressionContext::new();
        ctx.insert_into("steps", "build", json!({ "outcome": "success" }));
        assert_eq!(ctx.get("steps").unwrap()["build"]["outcome"], "success");
    }
}
