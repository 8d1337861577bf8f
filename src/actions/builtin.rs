use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::actions::{ServiceCall, ServiceError, ServiceHandler};
use crate::runtime::expression;

#[derive(Debug)]
pub struct LogAction;

#[async_trait]
impl ServiceHandler for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, call: ServiceCall) -> Result<Value, ServiceError> {
        if let Some(msg) = call.param("msg").and_then(|v| v.as_str()) {
            info!(activity = %call.activity_id, "[LOG] {}", msg);
        } else {
            info!(activity = %call.activity_id, "[LOG] {:?}", call.params);
        }
        Ok(Value::Null)
    }
}

/// Computes values for the task's output variable.
///
/// `value` is returned as is, `expression` is evaluated against the visible
/// variables, and an `assignments` list of `{key, value}` pairs returns an object
/// whose fields become variables when the task has no output variable.
#[derive(Debug)]
pub struct AssignAction;

#[async_trait]
impl ServiceHandler for AssignAction {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, params: &Value) -> anyhow::Result<()> {
        let has_any = ["value", "expression", "assignments"]
            .iter()
            .any(|key| params.get(key).is_some());
        if !has_any {
            return Err(anyhow!("assign needs one of 'value', 'expression' or 'assignments'"));
        }
        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            expression::compile(expr)?;
        }
        Ok(())
    }

    async fn execute(&self, call: ServiceCall) -> Result<Value, ServiceError> {
        if let Some(list) = call.param("assignments").and_then(|v| v.as_array()) {
            let mut assigned = Map::new();
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    assigned.insert(k.to_string(), v.clone());
                }
            }
            return Ok(Value::Object(assigned));
        }

        if let Some(expr) = call.param("expression").and_then(|v| v.as_str()) {
            let result = expression::evaluate(expr, &call.variables).map_err(|e| anyhow!(e))?;
            return Ok(result);
        }

        Ok(call.param("value").cloned().unwrap_or(Value::Null))
    }
}
