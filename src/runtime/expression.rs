use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
    IterateVariablesContext, Node as EvalNode,
};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use crate::error::{EngineError, Result};

pub type EvalValue = evalexpr::Value<DefaultNumericTypes>;
pub type CompiledExpression = EvalNode<DefaultNumericTypes>;

/// Removes `${ }` wrappers, so `${x > 10}` and `x > 10` evaluate alike.
pub fn strip(expression: &str) -> String {
    let trimmed = expression.trim();
    if let Some(inner) = trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        if !inner.contains("${") {
            return inner.trim().to_string();
        }
    }
    trimmed.replace("${", "").replace('}', "")
}

pub fn compile(expression: &str) -> Result<CompiledExpression> {
    let clean = strip(expression);
    build_operator_tree::<DefaultNumericTypes>(&clean).map_err(|e| EngineError::expression(expression, e))
}

pub fn to_eval(value: &Value) -> Option<EvalValue> {
    match value {
        Value::String(s) => Some(EvalValue::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(EvalValue::Int(i))
            } else {
                n.as_f64().map(EvalValue::Float)
            }
        }
        Value::Bool(b) => Some(EvalValue::Boolean(*b)),
        Value::Null => Some(EvalValue::Empty),
        Value::Array(items) => items
            .iter()
            .map(to_eval)
            .collect::<Option<Vec<_>>>()
            .map(EvalValue::Tuple),
        Value::Object(_) => None,
    }
}

pub fn from_eval(value: EvalValue) -> Value {
    match value {
        EvalValue::String(s) => Value::String(s),
        EvalValue::Int(i) => Value::Number(i.into()),
        EvalValue::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        EvalValue::Boolean(b) => Value::Bool(b),
        EvalValue::Tuple(items) => Value::Array(items.into_iter().map(from_eval).collect()),
        EvalValue::Empty => Value::Null,
    }
}

/// Bridges process variables into an evalexpr context. Objects are not representable and are skipped.
pub fn context(variables: &HashMap<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (key, value) in variables {
        if let Some(ev) = to_eval(value) {
            let _ = eval_ctx.set_value(key.clone(), ev);
        }
    }
    eval_ctx
}

pub fn evaluate(expression: &str, variables: &HashMap<String, Value>) -> Result<Value> {
    let compiled = compile(expression)?;
    let eval_ctx = context(variables);
    compiled
        .eval_with_context(&eval_ctx)
        .map(from_eval)
        .map_err(|e| EngineError::expression(expression, e))
}

/// Evaluates a sequence flow or completion condition. Unknown variables are an error.
pub fn evaluate_bool(expression: &str, variables: &HashMap<String, Value>) -> Result<bool> {
    let compiled = compile(expression)?;
    let eval_ctx = context(variables);
    compiled
        .eval_boolean_with_context(&eval_ctx)
        .map_err(|e| EngineError::expression(expression, e))
}

/// Replaces `${..}` strings inside a parameter value. A bare variable
/// reference keeps the variable's JSON value, objects included.
pub fn resolve(value: &Value, variables: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) if s.trim_start().starts_with("${") => {
            let inner = strip(s);
            if let Some(found) = variables.get(&inner) {
                return Ok(found.clone());
            }
            evaluate(s, variables)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, variables))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut resolved = Map::new();
            for (key, field) in fields {
                resolved.insert(key.clone(), resolve(field, variables)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

pub fn resolve_params(params: &HashMap<String, Value>, variables: &HashMap<String, Value>) -> Result<Value> {
    let mut resolved = Map::new();
    for (key, value) in params {
        resolved.insert(key.clone(), resolve(value, variables)?);
    }
    Ok(Value::Object(resolved))
}

/// Runs a script and reports its value plus every variable it assigned or changed.
pub fn run_script(
    script: &CompiledExpression,
    source: &str,
    variables: &HashMap<String, Value>,
) -> Result<(Value, HashMap<String, Value>)> {
    let mut eval_ctx = context(variables);
    let result = script
        .eval_with_context_mut(&mut eval_ctx)
        .map_err(|e| EngineError::expression(source, e))?;

    let mut changed = HashMap::new();
    for (name, value) in eval_ctx.iter_variables() {
        let value = from_eval(value);
        if variables.get(&name) != Some(&value) {
            changed.insert(name, value);
        }
    }
    Ok((from_eval(result), changed))
}
