//! Routing of thrown events: errors and escalations bubble up the execution
//! tree, signals are broadcast, compensation runs the recorded handlers.

use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::execution::ScopeKind;
use crate::runtime::graph::{EventTrigger, FlowNodeKind, NodeIndex, ProcessGraph};
use crate::runtime::subscription::{EventSubscription, EventType};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Thrown {
    Error,
    Escalation,
}

/// Picks the catching node for `code`: an exact match wins over a catch-all.
fn select_catch<'a>(
    candidates: impl Iterator<Item = (NodeIndex, &'a Option<String>)>,
    code: &str,
) -> Option<NodeIndex> {
    let mut catch_all = None;
    for (index, expected) in candidates {
        match expected {
            Some(expected) if expected == code => return Some(index),
            None if catch_all.is_none() => catch_all = Some(index),
            _ => {}
        }
    }
    catch_all
}

fn caught_code(trigger: &EventTrigger, thrown: Thrown) -> Option<&Option<String>> {
    match (trigger, thrown) {
        (EventTrigger::Error(code), Thrown::Error) | (EventTrigger::Escalation(code), Thrown::Escalation) => Some(code),
        _ => None,
    }
}

fn boundary_catch(graph: &ProcessGraph, activity: NodeIndex, thrown: Thrown, code: &str) -> Option<NodeIndex> {
    let candidates = graph.node(activity).boundary_events.iter().filter_map(|&boundary| {
        let trigger = graph.node(boundary).kind.trigger()?;
        caught_code(trigger, thrown).map(|expected| (boundary, expected))
    });
    select_catch(candidates, code)
}

fn event_sub_process_catch(graph: &ProcessGraph, scope: Option<NodeIndex>, thrown: Thrown, code: &str) -> Option<NodeIndex> {
    let starts: Vec<NodeIndex> = graph
        .event_sub_processes(scope)
        .filter_map(|sub_process| graph.event_start_of(sub_process))
        .collect();
    let candidates = starts.into_iter().filter_map(|start| {
        let trigger = graph.node(start).kind.trigger()?;
        caught_code(trigger, thrown).map(|expected| (start, expected))
    });
    select_catch(candidates, code)
}

enum Catcher {
    Boundary { host: Uuid, boundary: NodeIndex, cancel: bool },
    EventSubProcess { scope: Uuid, start: NodeIndex },
}

/// Walks from the throwing execution to the process instance, then continues at
/// the calling activity of a super process.
fn find_catcher(ctx: &CommandContext, from: Uuid, thrown: Thrown, code: &str) -> Result<Option<Catcher>> {
    let mut current = Some(from);
    while let Some(id) = current {
        let execution = ctx.execution(id)?;
        let graph = ctx.graph(&execution.graph_key)?;

        if let (Some(ScopeKind::BoundaryHost), Some(node)) = (execution.scope, execution.current_node) {
            if let Some(boundary) = boundary_catch(&graph, node, thrown, code) {
                let cancel = match graph.node(boundary).kind {
                    FlowNodeKind::BoundaryEvent { cancel_activity, .. } => cancel_activity,
                    _ => true,
                };
                return Ok(Some(Catcher::Boundary { host: id, boundary, cancel }));
            }
        }

        if execution.is_flow_scope() {
            let scope_node = if execution.is_process_instance() {
                None
            } else {
                execution.current_node
            };
            if let Some(start) = event_sub_process_catch(&graph, scope_node, thrown, code) {
                return Ok(Some(Catcher::EventSubProcess { scope: id, start }));
            }
        }

        current = execution.parent_id.or(execution.super_execution_id);
    }
    Ok(None)
}

fn error_payload(code: &str) -> HashMap<String, Value> {
    HashMap::from([("errorCode".to_string(), Value::String(code.to_string()))])
}

/// BPMN error: always interrupting. Fails the command when nothing catches it.
pub fn throw_error(ctx: &mut CommandContext, from: Uuid, code: &str) -> Result<()> {
    info!(execution = %from, code, "BPMN error thrown");
    match find_catcher(ctx, from, Thrown::Error, code)? {
        Some(Catcher::Boundary { host, boundary, .. }) => interrupt_activity(ctx, host, boundary, error_payload(code)),
        Some(Catcher::EventSubProcess { scope, start }) => start_event_sub_process(ctx, scope, start, error_payload(code)),
        None => Err(EngineError::UnhandledBpmnError(code.to_string())),
    }
}

/// Escalation: caught like an error but may be non-interrupting. Uncaught
/// escalations are ignored.
pub fn throw_escalation(ctx: &mut CommandContext, from: Uuid, code: &str) -> Result<()> {
    let payload = HashMap::from([("escalationCode".to_string(), Value::String(code.to_string()))]);
    match find_catcher(ctx, from, Thrown::Escalation, code)? {
        Some(Catcher::Boundary { host, boundary, cancel: true }) => interrupt_activity(ctx, host, boundary, payload),
        Some(Catcher::Boundary { host, boundary, cancel: false }) => fork_from_boundary(ctx, host, boundary, payload),
        Some(Catcher::EventSubProcess { scope, start }) => start_event_sub_process(ctx, scope, start, payload),
        None => {
            warn!(execution = %from, code, "Escalation not caught");
            Ok(())
        }
    }
}

/// Cancels the activity below `host` and continues from the boundary event.
pub fn interrupt_activity(
    ctx: &mut CommandContext,
    host: Uuid,
    boundary: NodeIndex,
    payload: HashMap<String, Value>,
) -> Result<()> {
    let graph = ctx.graph_of(host)?;
    let reason = format!("interrupted by boundary event {}", graph.node(boundary).id);
    debug!(execution = %host, boundary = %graph.node(boundary).id, "Interrupting activity");
    ctx.remove_children(host, Some(&reason))?;
    {
        let execution = ctx.execution_mut(host)?;
        execution.scope = None;
        execution.current_node = Some(boundary);
        execution.is_active = true;
    }
    ctx.start_activity(host)?;
    ctx.set_variables(host, payload)?;
    ctx.leave(host);
    Ok(())
}

/// Non-interrupting boundary event: a new token leaves the boundary event while
/// the activity keeps running.
pub fn fork_from_boundary(
    ctx: &mut CommandContext,
    host: Uuid,
    boundary: NodeIndex,
    payload: HashMap<String, Value>,
) -> Result<()> {
    let scope = ctx
        .execution(host)?
        .parent_id
        .ok_or_else(|| EngineError::illegal("boundary host without parent"))?;
    let token = ctx.create_child_at(scope, boundary)?;
    ctx.start_activity(token)?;
    ctx.set_variables(token, payload)?;
    ctx.leave(token);
    Ok(())
}

/// Starts the event sub-process owning `start` inside the scope execution.
pub fn start_event_sub_process(
    ctx: &mut CommandContext,
    scope: Uuid,
    start: NodeIndex,
    payload: HashMap<String, Value>,
) -> Result<()> {
    let graph = ctx.graph_of(scope)?;
    let start_node = graph.node(start);
    let sub_process = start_node
        .parent
        .ok_or_else(|| EngineError::illegal(format!("start event {} is not inside a sub-process", start_node.id)))?;
    let interrupting = match start_node.kind {
        FlowNodeKind::StartEvent { interrupting, .. } => interrupting,
        _ => true,
    };

    if interrupting {
        let reason = format!("interrupted by event sub-process {}", graph.node(sub_process).id);
        ctx.remove_children(scope, Some(&reason))?;
        ctx.clear_wait_state(scope);
    }
    info!(
        execution = %scope,
        sub_process = %graph.node(sub_process).id,
        interrupting,
        "Starting event sub-process"
    );

    let inner_scope = ctx.create_child_at(scope, sub_process)?;
    {
        let execution = ctx.execution_mut(inner_scope)?;
        execution.scope = Some(ScopeKind::SubProcess);
        execution.is_active = false;
    }
    ctx.start_activity(inner_scope)?;
    ctx.register_event_sub_processes(inner_scope, Some(sub_process))?;

    let token = ctx.create_child_at(inner_scope, start)?;
    ctx.start_activity(token)?;
    ctx.set_variables(token, payload)?;
    ctx.leave(token);
    Ok(())
}

/// Delivers a signal to every subscribed execution and starts the processes
/// with a matching signal start event. Returns the number of receivers.
pub fn throw_signal(ctx: &mut CommandContext, name: &str, payload: &HashMap<String, Value>) -> Result<usize> {
    let subscriptions = ctx.state().subscriptions_named(EventType::Signal, name);
    let mut receivers = subscriptions.len();
    for subscription in subscriptions {
        ctx.plan(Operation::TriggerExecution {
            execution: subscription.execution_id,
            node: subscription.node,
            payload: payload.clone(),
            subscription: Some(subscription.id),
        });
    }

    for graph in ctx.latest_graphs() {
        let starts: Vec<NodeIndex> = graph
            .root_nodes
            .iter()
            .copied()
            .filter(|&index| {
                matches!(&graph.node(index).kind,
                    FlowNodeKind::StartEvent { trigger: EventTrigger::Signal(signal), .. } if signal == name)
            })
            .collect();
        for start in starts {
            ctx.start_process_instance(&graph, payload.clone(), None, None, Some(start))?;
            receivers += 1;
        }
    }

    info!(signal = name, receivers, "Signal thrown");
    Ok(receivers)
}

/// Runs the compensation handlers registered in the thrower's scope, most
/// recently completed activity first. Returns `false` when there was nothing to
/// compensate; otherwise the thrower waits and is triggered after the last handler.
pub fn throw_compensation(ctx: &mut CommandContext, thrower: Uuid, activity: Option<&str>) -> Result<bool> {
    let scope = ctx.enclosing_scope(thrower)?;
    let mut subscriptions: Vec<EventSubscription> = ctx
        .state()
        .subscriptions_of(scope)
        .into_iter()
        .filter(|s| s.event_type == EventType::Compensate)
        .filter(|s| activity.is_none_or(|a| s.event_name == a))
        .collect();
    if subscriptions.is_empty() {
        debug!(execution = %thrower, "Nothing to compensate");
        return Ok(false);
    }
    subscriptions.sort_by_key(|s| Reverse(s.created));

    for subscription in &subscriptions {
        ctx.state_mut().subscriptions.remove(&subscription.id);
    }
    info!(execution = %thrower, handlers = subscriptions.len(), "Compensation thrown");
    {
        let execution = ctx.execution_mut(thrower)?;
        execution.pending_compensation = subscriptions.iter().map(|s| s.node).collect();
        execution.is_active = false;
    }
    start_next_handler(ctx, thrower)?;
    Ok(true)
}

/// Called when a compensation handler finished.
pub fn continue_compensation(ctx: &mut CommandContext, thrower: Uuid) -> Result<()> {
    if !ctx.exists(thrower) {
        return Ok(());
    }
    if !ctx.execution(thrower)?.pending_compensation.is_empty() {
        return start_next_handler(ctx, thrower);
    }

    let execution = ctx.execution_mut(thrower)?;
    execution.is_active = true;
    let node = execution
        .current_node
        .ok_or_else(|| EngineError::illegal("compensation thrower is not at a node"))?;
    ctx.plan(Operation::TriggerExecution {
        execution: thrower,
        node,
        payload: HashMap::new(),
        subscription: None,
    });
    Ok(())
}

fn start_next_handler(ctx: &mut CommandContext, thrower: Uuid) -> Result<()> {
    let scope = ctx.enclosing_scope(thrower)?;
    let handler = {
        let execution = ctx.execution_mut(thrower)?;
        if execution.pending_compensation.is_empty() {
            return Ok(());
        }
        execution.pending_compensation.remove(0)
    };
    let token = ctx.create_child_at(scope, handler)?;
    ctx.execution_mut(token)?.compensation_of = Some(thrower);
    ctx.continue_process(token, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_code_wins_over_catch_all() {
        let any = None;
        let specific = Some("E1".to_string());
        let other = Some("E2".to_string());
        let candidates = vec![(0, &any), (1, &other), (2, &specific)];
        assert_eq!(select_catch(candidates.clone().into_iter(), "E1"), Some(2));
        assert_eq!(select_catch(candidates.into_iter(), "E9"), Some(0));
    }

    #[test]
    fn no_candidate_catches_nothing() {
        let other = Some("E2".to_string());
        assert_eq!(select_catch(vec![(0, &other)].into_iter(), "E1"), None);
    }
}
