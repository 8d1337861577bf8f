use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::nodes::{flow, multi_instance};
use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::execution::ScopeKind;
use crate::runtime::expression;
use crate::runtime::graph::{FlowIndex, FlowNodeKind, NodeIndex, ProcessGraph};
use crate::runtime::propagation;
use crate::runtime::subscription::EventType;

/// Runs one agenda operation. Operations whose execution was removed by an
/// earlier operation of the same command are dropped.
pub async fn execute(ctx: &mut CommandContext, operation: Operation) -> Result<()> {
    if !ctx.exists(operation.execution()) {
        trace!(?operation, "Skipping operation of a removed execution");
        return Ok(());
    }

    match operation {
        Operation::ContinueProcess { execution, synchronous } => continue_process(ctx, execution, synchronous).await,
        Operation::TakeOutgoingSequenceFlows { execution } => take_outgoing_sequence_flows(ctx, execution),
        Operation::TriggerExecution {
            execution,
            node,
            payload,
            subscription,
        } => {
            if let Some(subscription) = subscription {
                if !ctx.state().subscriptions.contains_key(&subscription) {
                    trace!(execution = %execution, "Subscription gone, trigger dropped");
                    return Ok(());
                }
            }
            let key = ctx.execution(execution)?.graph_key.clone();
            let behaviors = ctx.behaviors(&key)?;
            let behavior = behaviors
                .get(node)
                .ok_or_else(|| EngineError::illegal(format!("no behavior for node {}", node)))?;
            behavior.trigger(ctx, execution, payload)
        }
        Operation::EndExecution { execution } => end_execution(ctx, execution),
        Operation::EvaluateInactiveJoins { scope } => evaluate_inactive_joins(ctx, scope),
        Operation::DestroyScope {
            scope,
            reason,
            end_activity,
        } => {
            ctx.remove_children(scope, Some(&reason))?;
            if ctx.execution(scope)?.is_scope(ScopeKind::ProcessInstance) {
                return ctx.end_process_instance(scope, end_activity, Some(&reason));
            }
            complete_scope(ctx, scope, end_activity)
        }
    }
}

async fn continue_process(ctx: &mut CommandContext, execution: Uuid, synchronous: bool) -> Result<()> {
    let graph = ctx.graph_of(execution)?;
    let node_index = ctx.node_of(execution)?;
    let node = graph.node(node_index);
    ctx.execution_mut(execution)?.current_flow = None;

    // Executions created by a boundary host or a multi-instance root run the
    // activity itself.
    let (hosted, instance) = match ctx.execution(execution)?.parent_id {
        Some(parent) => {
            let parent = ctx.execution(parent)?;
            let same_node = parent.current_node == Some(node_index);
            (
                same_node && parent.is_scope(ScopeKind::BoundaryHost),
                same_node && parent.is_scope(ScopeKind::MultiInstanceRoot),
            )
        }
        None => (false, false),
    };

    if node.asynchronous && !synchronous && !hosted && !instance {
        let job = ctx.schedule_async(execution)?;
        debug!(execution = %execution, node = %node.id, job_id = %job, "Asynchronous continuation");
        return Ok(());
    }

    if !node.boundary_events.is_empty() && !hosted && !instance {
        return enter_boundary_host(ctx, &graph, execution, node_index);
    }

    if node.multi_instance.is_some() && !instance {
        return multi_instance::enter(ctx, &graph, execution, node_index);
    }

    ctx.start_activity(execution)?;
    debug!(execution = %execution, node = %node.id, kind = node.kind.name(), "Executing node");
    let key = ctx.execution(execution)?.graph_key.clone();
    let behaviors = ctx.behaviors(&key)?;
    let behavior = behaviors
        .get(node_index)
        .ok_or_else(|| EngineError::illegal(format!("no behavior for node {}", node.id)))?;
    behavior.execute(ctx, execution).await
}

/// The execution becomes an inactive host with one child running the activity
/// and one waiting child per boundary event.
fn enter_boundary_host(ctx: &mut CommandContext, graph: &ProcessGraph, host: Uuid, node: NodeIndex) -> Result<()> {
    {
        let execution = ctx.execution_mut(host)?;
        execution.scope = Some(ScopeKind::BoundaryHost);
        execution.is_active = false;
    }
    let activity = ctx.create_child(host)?;

    for &boundary in &graph.node(node).boundary_events {
        let waiter = ctx.create_child_at(host, boundary)?;
        ctx.execution_mut(waiter)?.is_active = false;
        ctx.listen_for_trigger(waiter, boundary)?;
    }

    ctx.continue_process(activity, true);
    Ok(())
}

fn take_outgoing_sequence_flows(ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
    let graph = ctx.graph_of(execution)?;
    let node_index = ctx.node_of(execution)?;
    let node = graph.node(node_index);

    let completed = ctx.end_activity(execution, None)?;
    if let (true, Some(handler)) = (completed, node.compensation_handler) {
        let scope = ctx.enclosing_scope(execution)?;
        ctx.subscribe(EventType::Compensate, &node.id, scope, handler)?;
    }

    if let Some(parent) = ctx.execution(execution)?.parent_id {
        let parent_execution = ctx.execution(parent)?;
        if parent_execution.current_node == Some(node_index) {
            if parent_execution.is_scope(ScopeKind::MultiInstanceRoot) {
                return multi_instance::complete_instance(ctx, &graph, execution);
            }
            if parent_execution.is_scope(ScopeKind::BoundaryHost) {
                return leave_boundary_host(ctx, parent);
            }
        }
    }

    if node.outgoing.is_empty() {
        ctx.end_execution(execution);
        return Ok(());
    }

    let selected = select_outgoing_flows(ctx, &graph, execution, node_index)?;
    let parent = ctx
        .execution(execution)?
        .parent_id
        .ok_or_else(|| EngineError::illegal("process instance cannot take sequence flows"))?;

    ctx.token_moved_in(parent);
    for (position, flow) in selected.into_iter().enumerate() {
        let token = if position == 0 { execution } else { ctx.create_child(parent)? };
        let target = graph.flow(flow).target;
        let t = ctx.execution_mut(token)?;
        t.current_node = Some(target);
        t.current_flow = Some(flow);
        t.is_active = true;
        trace!(execution = %token, flow = %graph.flow(flow).id, "Taking sequence flow");
        ctx.continue_process(token, false);
    }
    Ok(())
}

fn select_outgoing_flows(
    ctx: &CommandContext,
    graph: &ProcessGraph,
    execution: Uuid,
    node_index: NodeIndex,
) -> Result<Vec<FlowIndex>> {
    let node = graph.node(node_index);
    if matches!(node.kind, FlowNodeKind::ParallelGateway) {
        return Ok(node.outgoing.clone());
    }

    let variables = ctx.variables(execution);
    let exclusive = matches!(node.kind, FlowNodeKind::ExclusiveGateway);
    let mut selected = Vec::new();

    for &flow in &node.outgoing {
        if node.default_flow == Some(flow) {
            continue;
        }
        let taken = match &graph.flow(flow).condition {
            Some(condition) => expression::evaluate_bool(condition, &variables)?,
            None => true,
        };
        if taken {
            selected.push(flow);
            if exclusive {
                break;
            }
        }
    }

    if selected.is_empty() {
        match node.default_flow {
            Some(default) => selected.push(default),
            None => return Err(EngineError::NoOutgoingFlow(node.id.clone())),
        }
    }
    Ok(selected)
}

fn leave_boundary_host(ctx: &mut CommandContext, host: Uuid) -> Result<()> {
    ctx.remove_children(host, None)?;
    let execution = ctx.execution_mut(host)?;
    execution.scope = None;
    execution.is_active = true;
    ctx.leave(host);
    Ok(())
}

fn end_execution(ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
    let graph = ctx.graph_of(execution)?;
    let current = ctx.execution(execution)?;
    if current.is_process_instance() {
        return ctx.end_process_instance(execution, None, None);
    }

    let parent = current.parent_id;
    let compensation_of = current.compensation_of;
    let end_activity_id = current.current_node.map(|n| graph.node(n).id.clone());
    ctx.remove_execution(execution, None)?;

    if let Some(thrower) = compensation_of {
        return propagation::continue_compensation(ctx, thrower);
    }

    let Some(parent) = parent else {
        return Ok(());
    };
    if ctx.executions().children(parent).is_empty() {
        complete_scope(ctx, parent, end_activity_id)
    } else {
        ctx.plan(Operation::EvaluateInactiveJoins { scope: parent });
        Ok(())
    }
}

/// Completes a scope whose last token is gone.
pub fn complete_scope(ctx: &mut CommandContext, scope: Uuid, end_activity_id: Option<String>) -> Result<()> {
    match ctx.execution(scope)?.scope {
        Some(ScopeKind::ProcessInstance) => ctx.end_process_instance(scope, end_activity_id, None),
        Some(ScopeKind::SubProcess) => {
            // Compensation of the inner activities stays possible from the outer scope.
            let outer = ctx.enclosing_scope(scope)?;
            for subscription in ctx.state_mut().subscriptions.values_mut() {
                if subscription.execution_id == scope && subscription.event_type == EventType::Compensate {
                    subscription.execution_id = outer;
                }
            }
            ctx.clear_wait_state(scope);

            // A multi-instance instance keeps loopCounter and its element for the
            // completion condition; the instance is removed right after.
            let node = ctx.execution(scope)?.current_node;
            let multi_instance = ctx
                .execution(scope)?
                .parent_id
                .and_then(|parent| ctx.executions().get(parent))
                .is_some_and(|parent| parent.is_scope(ScopeKind::MultiInstanceRoot) && parent.current_node == node);

            let execution = ctx.execution_mut(scope)?;
            execution.scope = None;
            execution.is_active = true;
            if !multi_instance {
                execution.variables.clear();
            }
            ctx.leave(scope);
            Ok(())
        }
        other => {
            warn!(execution = %scope, scope = ?other, "Scope left without tokens");
            Ok(())
        }
    }
}

fn evaluate_inactive_joins(ctx: &mut CommandContext, scope: Uuid) -> Result<()> {
    let graph = ctx.graph_of(scope)?;
    let mut seen = Vec::new();
    for child in ctx.executions().children(scope) {
        let Some(execution) = ctx.executions().get(child) else {
            continue;
        };
        let Some(node) = execution.current_node else {
            continue;
        };
        if execution.is_active
            || execution.scope.is_some()
            || seen.contains(&node)
            || !matches!(graph.node(node).kind, FlowNodeKind::InclusiveGateway)
        {
            continue;
        }
        seen.push(node);
        flow::try_inclusive_join(ctx, &graph, child)?;
    }
    Ok(())
}
