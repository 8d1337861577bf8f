use anyhow::{Result as AnyResult, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use crate::runtime::graph::{EventTrigger, FlowNodeKind, NodeIndex, ProcessGraph};
use crate::runtime::node::{ActivityBehavior, BehaviorDefinition};
use crate::runtime::propagation;

// --- INTERMEDIATE CATCH EVENT ---

#[derive(Debug)]
pub struct CatchEventBehavior {
    node: NodeIndex,
}

pub struct CatchEventDefinition;

impl BehaviorDefinition for CatchEventDefinition {
    fn kind(&self) -> &str {
        "intermediateCatchEvent"
    }

    fn prepare(&self, _graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(CatchEventBehavior { node }))
    }
}

#[async_trait]
impl ActivityBehavior for CatchEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.listen_for_trigger(execution, self.node)
    }

    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, payload: HashMap<String, Value>) -> Result<()> {
        ctx.clear_wait_state(execution);

        // Reached through an event-based gateway: the token still sits on the gateway.
        let current = ctx.node_of(execution)?;
        if current != self.node {
            let graph = ctx.graph_of(execution)?;
            let flow = graph
                .node(current)
                .outgoing
                .iter()
                .copied()
                .find(|&flow| graph.flow(flow).target == self.node);
            ctx.end_activity(execution, None)?;
            let token = ctx.execution_mut(execution)?;
            token.current_node = Some(self.node);
            token.current_flow = flow;
            ctx.start_activity(execution)?;
        }

        ctx.set_variables(execution, payload)?;
        ctx.leave(execution);
        Ok(())
    }
}

// --- INTERMEDIATE THROW EVENT ---

#[derive(Debug)]
pub struct ThrowEventBehavior {
    trigger: EventTrigger,
}

pub struct ThrowEventDefinition;

impl BehaviorDefinition for ThrowEventDefinition {
    fn kind(&self) -> &str {
        "intermediateThrowEvent"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let flow_node = graph.node(node);
        let FlowNodeKind::IntermediateThrowEvent { trigger } = &flow_node.kind else {
            return Err(anyhow!("{} is not a throw event", flow_node.id));
        };
        Ok(Box::new(ThrowEventBehavior {
            trigger: trigger.clone(),
        }))
    }
}

#[async_trait]
impl ActivityBehavior for ThrowEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        match &self.trigger {
            EventTrigger::Signal(name) => {
                propagation::throw_signal(ctx, name, &HashMap::new())?;
            }
            EventTrigger::Escalation(code) => {
                propagation::throw_escalation(ctx, execution, code.as_deref().unwrap_or_default())?;
            }
            EventTrigger::Compensate(activity) => {
                if propagation::throw_compensation(ctx, execution, activity.as_deref())? {
                    return Ok(());
                }
            }
            _ => {}
        }
        ctx.leave(execution);
        Ok(())
    }

    /// Resumed once all compensation handlers are done.
    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, _payload: HashMap<String, Value>) -> Result<()> {
        ctx.leave(execution);
        Ok(())
    }
}

// --- BOUNDARY EVENT ---

/// Triggered on the waiting child of a boundary host.
#[derive(Debug)]
pub struct BoundaryEventBehavior {
    node: NodeIndex,
    cancel_activity: bool,
}

pub struct BoundaryEventDefinition;

impl BehaviorDefinition for BoundaryEventDefinition {
    fn kind(&self) -> &str {
        "boundaryEvent"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let flow_node = graph.node(node);
        let FlowNodeKind::BoundaryEvent { cancel_activity, .. } = flow_node.kind else {
            return Err(anyhow!("{} is not a boundary event", flow_node.id));
        };
        Ok(Box::new(BoundaryEventBehavior { node, cancel_activity }))
    }
}

#[async_trait]
impl ActivityBehavior for BoundaryEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.leave(execution);
        Ok(())
    }

    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, payload: HashMap<String, Value>) -> Result<()> {
        let host = ctx
            .execution(execution)?
            .parent_id
            .ok_or_else(|| EngineError::illegal("boundary event without host"))?;
        if self.cancel_activity {
            propagation::interrupt_activity(ctx, host, self.node, payload)
        } else {
            propagation::fork_from_boundary(ctx, host, self.node, payload)
        }
    }
}
