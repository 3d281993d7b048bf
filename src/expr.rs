use evalexpr::{
    ContextWithMutableVariables, DefaultNumericTypes, EvalexprError, HashMapContext,
    build_operator_tree,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use thiserror::Error;

/// Evaluation failure. Branch-local on gateway conditions (the branch is
/// simply not taken); escalates the instance on script tasks.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("syntax error: {0}")]
    Syntax(String),
}

fn classify(err: EvalexprError<DefaultNumericTypes>) -> EvalError {
    match err {
        EvalexprError::VariableIdentifierNotFound(name) => EvalError::UnknownVariable(name),
        other => EvalError::TypeMismatch(other.to_string()),
    }
}

fn to_eval_value(value: &Value) -> Option<evalexpr::Value> {
    match value {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            // Integers and floats stay distinct; evalexpr coerces only
            // int<->float in comparisons, never string<->number.
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    }
}

fn from_eval_value(value: evalexpr::Value) -> Value {
    match value {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => json!(i),
        evalexpr::Value::Float(f) => json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        _ => Value::Null,
    }
}

fn build_context(
    vars: &HashMap<String, Value>,
) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in vars {
        if let Some(ev) = to_eval_value(v) {
            let _ = ctx.set_value(k.clone(), ev);
        }
    }
    ctx
}

/// Evaluate an expression against a read-only variable view.
pub fn evaluate(expression: &str, vars: &HashMap<String, Value>) -> Result<Value, EvalError> {
    let tree: evalexpr::Node<DefaultNumericTypes> =
        build_operator_tree(expression).map_err(|e| EvalError::Syntax(e.to_string()))?;
    let ctx = build_context(vars);
    tree.eval_with_context(&ctx)
        .map(from_eval_value)
        .map_err(classify)
}

/// Evaluate a gateway condition. Non-boolean results are a type mismatch.
pub fn evaluate_bool(expression: &str, vars: &HashMap<String, Value>) -> Result<bool, EvalError> {
    let tree: evalexpr::Node<DefaultNumericTypes> =
        build_operator_tree(expression).map_err(|e| EvalError::Syntax(e.to_string()))?;
    let ctx = build_context(vars);
    tree.eval_boolean_with_context(&ctx).map_err(classify)
}

/// Run a script-task body: `name = expr` statements separated by
/// newlines or `;`. Assignments become visible to later statements.
/// Returns the writes in statement order.
pub fn run_script(
    script: &str,
    vars: &HashMap<String, Value>,
) -> Result<Vec<(String, Value)>, EvalError> {
    let mut visible = vars.clone();
    let mut writes = Vec::new();

    for statement in script.split(['\n', ';']) {
        let statement = statement.trim();
        if statement.is_empty() || statement.starts_with('#') {
            continue;
        }
        let (name, rhs) = split_assignment(statement)
            .ok_or_else(|| EvalError::Syntax(format!("not an assignment: {statement}")))?;
        let value = evaluate(rhs, &visible)?;
        visible.insert(name.to_string(), value.clone());
        writes.push((name.to_string(), value));
    }

    Ok(writes)
}

/// Split `name = expr` at the first `=` that is not part of a comparison
/// operator (`==`, `!=`, `<=`, `>=`).
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'=' {
            continue;
        }
        let next_eq = bytes.get(i + 1) == Some(&b'=');
        let prev_op = i > 0 && matches!(bytes[i - 1], b'=' | b'!' | b'<' | b'>');
        if next_eq || prev_op {
            continue;
        }
        let name = statement[..i].trim();
        let rhs = statement[i + 1..].trim();
        if name.is_empty() || rhs.is_empty() || !is_identifier(name) {
            return None;
        }
        return Some((name, rhs));
    }
    None
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn int_float_comparison_coerces() {
        let v = vars(&[("amount", json!(100))]);
        assert_eq!(evaluate_bool("amount > 50.5", &v), Ok(true));
    }

    #[test]
    fn string_number_comparison_is_type_mismatch() {
        let v = vars(&[("amount", json!("100"))]);
        assert!(matches!(
            evaluate_bool("amount > 50", &v),
            Err(EvalError::TypeMismatch(_))
        ));
    }

    #[test]
    fn unknown_variable_is_reported() {
        let v = vars(&[]);
        assert_eq!(
            evaluate_bool("missing > 1", &v),
            Err(EvalError::UnknownVariable("missing".into()))
        );
    }

    #[test]
    fn script_statements_see_earlier_assignments() {
        let v = vars(&[("x", json!(2))]);
        let writes = run_script("y = x * 10; z = y + 1", &v).unwrap();
        assert_eq!(
            writes,
            vec![("y".into(), json!(20)), ("z".into(), json!(21))]
        );
    }

    #[test]
    fn script_rejects_bare_expression() {
        let v = vars(&[]);
        assert!(matches!(
            run_script("1 + 1", &v),
            Err(EvalError::Syntax(_))
        ));
    }

    #[test]
    fn assignment_split_skips_comparisons() {
        assert_eq!(split_assignment("ok = a == b"), Some(("ok", "a == b")));
        assert_eq!(split_assignment("a >= b"), None);
    }
}
