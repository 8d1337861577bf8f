//! Multi-instance activities.
//!
//! The execution entering the activity becomes an inactive multi-instance root
//! holding the counters; each instance is a child running the activity itself.

use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::dsl::MultiInstanceDef;
use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use crate::runtime::execution::ScopeKind;
use crate::runtime::expression;
use crate::runtime::graph::{NodeIndex, ProcessGraph};

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

fn definition<'a>(graph: &'a ProcessGraph, node: NodeIndex) -> Result<&'a MultiInstanceDef> {
    graph
        .node(node)
        .multi_instance
        .as_ref()
        .ok_or_else(|| EngineError::illegal(format!("{} is not a multi-instance activity", graph.node(node).id)))
}

pub fn enter(ctx: &mut CommandContext, graph: &ProcessGraph, execution: Uuid, node: NodeIndex) -> Result<()> {
    let definition = definition(graph, node)?;
    let items = collection_items(ctx, execution, definition)?;
    let count = match &items {
        Some(items) => items.len(),
        None => cardinality(ctx, execution, definition)?,
    };

    {
        let root = ctx.execution_mut(execution)?;
        root.scope = Some(ScopeKind::MultiInstanceRoot);
        root.is_active = false;
    }
    let active = if definition.sequential { count.min(1) } else { count };
    ctx.set_variable_local(execution, NR_OF_INSTANCES, json!(count))?;
    ctx.set_variable_local(execution, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    ctx.set_variable_local(execution, NR_OF_COMPLETED_INSTANCES, json!(0))?;
    debug!(
        execution = %execution,
        activity = %graph.node(node).id,
        instances = count,
        sequential = definition.sequential,
        "Multi-instance started"
    );

    if count == 0 {
        return finish(ctx, execution);
    }
    if definition.sequential {
        spawn_instance(ctx, execution, definition, 0, items.as_deref())?;
    } else {
        for index in 0..count {
            spawn_instance(ctx, execution, definition, index, items.as_deref())?;
        }
    }
    Ok(())
}

/// Called when an instance left the activity.
pub fn complete_instance(ctx: &mut CommandContext, graph: &ProcessGraph, instance: Uuid) -> Result<()> {
    let root = ctx
        .execution(instance)?
        .parent_id
        .ok_or_else(|| EngineError::illegal("multi-instance instance without root"))?;
    let node = ctx.node_of(root)?;
    let definition = definition(graph, node)?;

    let total = counter(ctx, root, NR_OF_INSTANCES);
    let completed = counter(ctx, root, NR_OF_COMPLETED_INSTANCES) + 1;
    ctx.set_variable_local(root, NR_OF_COMPLETED_INSTANCES, json!(completed))?;
    if !definition.sequential {
        let active = counter(ctx, root, NR_OF_ACTIVE_INSTANCES).saturating_sub(1);
        ctx.set_variable_local(root, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    }

    let condition_met = match &definition.completion_condition {
        Some(condition) => expression::evaluate_bool(condition, &ctx.variables(instance))?,
        None => false,
    };
    ctx.remove_execution(instance, None)?;

    if completed >= total || condition_met {
        debug!(execution = %root, completed, total, condition_met, "Multi-instance completed");
        ctx.remove_children(root, Some("multi-instance completion condition met"))?;
        return finish(ctx, root);
    }

    if definition.sequential {
        let items = collection_items(ctx, root, definition)?;
        spawn_instance(ctx, root, definition, completed as usize, items.as_deref())?;
    }
    Ok(())
}

fn spawn_instance(
    ctx: &mut CommandContext,
    root: Uuid,
    definition: &MultiInstanceDef,
    index: usize,
    items: Option<&[Value]>,
) -> Result<()> {
    let instance = ctx.create_child(root)?;
    ctx.set_variable_local(instance, LOOP_COUNTER, json!(index))?;
    if let (Some(element), Some(items)) = (&definition.element_variable, items) {
        let item = items.get(index).cloned().unwrap_or(Value::Null);
        ctx.set_variable_local(instance, element, item)?;
    }
    ctx.continue_process(instance, true);
    Ok(())
}

fn finish(ctx: &mut CommandContext, root: Uuid) -> Result<()> {
    let execution = ctx.execution_mut(root)?;
    for name in [NR_OF_INSTANCES, NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES] {
        execution.variables.remove(name);
    }
    execution.scope = None;
    execution.is_active = true;
    ctx.leave(root);
    Ok(())
}

fn counter(ctx: &CommandContext, root: Uuid, name: &str) -> u64 {
    ctx.executions()
        .get(root)
        .and_then(|e| e.variables.get(name))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Items of the input collection: a variable name or a `${..}` expression.
fn collection_items(ctx: &CommandContext, execution: Uuid, definition: &MultiInstanceDef) -> Result<Option<Vec<Value>>> {
    let Some(collection) = &definition.collection else {
        return Ok(None);
    };
    let variables = ctx.variables(execution);
    let value = if collection.contains("${") {
        expression::resolve(&Value::String(collection.clone()), &variables)?
    } else {
        variables
            .get(collection)
            .cloned()
            .ok_or_else(|| EngineError::expression(collection, "collection variable is not set"))?
    };
    match value {
        Value::Array(items) => Ok(Some(items)),
        Value::Null => Ok(Some(Vec::new())),
        other => Err(EngineError::expression(collection, format!("expected a list, got {}", other))),
    }
}

fn cardinality(ctx: &CommandContext, execution: Uuid, definition: &MultiInstanceDef) -> Result<usize> {
    let Some(cardinality) = &definition.cardinality else {
        return Err(EngineError::illegal("multi-instance needs a collection or a cardinality"));
    };
    let value = match cardinality.trim().parse::<u64>() {
        Ok(literal) => json!(literal),
        Err(_) => expression::evaluate(cardinality, &ctx.variables(execution))?,
    };
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| EngineError::expression(cardinality, format!("expected a non-negative integer, got {}", value)))
}
