use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use crate::runtime::graph::{NodeIndex, ProcessGraph};
use crate::runtime::node::{ActivityBehavior, BehaviorDefinition};

// --- EXCLUSIVE GATEWAY ---

/// Branch selection happens when the token leaves; see the outgoing flow selection.
#[derive(Debug)]
pub struct ExclusiveGatewayBehavior;

pub struct ExclusiveGatewayDefinition;

impl BehaviorDefinition for ExclusiveGatewayDefinition {
    fn kind(&self) -> &str {
        "exclusiveGateway"
    }

    fn prepare(&self, _graph: &ProcessGraph, _node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(ExclusiveGatewayBehavior))
    }
}

#[async_trait]
impl ActivityBehavior for ExclusiveGatewayBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.leave(execution);
        Ok(())
    }
}

// --- PARALLEL GATEWAY ---

#[derive(Debug)]
pub struct ParallelGatewayBehavior {
    node: NodeIndex,
    incoming: usize,
}

pub struct ParallelGatewayDefinition;

impl BehaviorDefinition for ParallelGatewayDefinition {
    fn kind(&self) -> &str {
        "parallelGateway"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(ParallelGatewayBehavior {
            node,
            incoming: graph.node(node).incoming.len(),
        }))
    }
}

#[async_trait]
impl ActivityBehavior for ParallelGatewayBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        if self.incoming <= 1 {
            ctx.leave(execution);
            return Ok(());
        }

        ctx.execution_mut(execution)?.is_active = false;
        let waiting = waiting_at(ctx, execution, self.node)?;
        debug!(execution = %execution, arrived = waiting.len(), expected = self.incoming, "Parallel join");
        if waiting.len() < self.incoming {
            return Ok(());
        }

        let merged: Vec<Uuid> = waiting
            .into_iter()
            .filter(|w| *w != execution)
            .take(self.incoming - 1)
            .collect();
        merge(ctx, execution, merged)
    }

    fn trigger(&self, _ctx: &mut CommandContext, execution: Uuid, _payload: HashMap<String, Value>) -> Result<()> {
        Err(EngineError::illegal(format!("execution {} waits in a parallel join and cannot be triggered", execution)))
    }
}

// --- INCLUSIVE GATEWAY ---

#[derive(Debug)]
pub struct InclusiveGatewayBehavior;

pub struct InclusiveGatewayDefinition;

impl BehaviorDefinition for InclusiveGatewayDefinition {
    fn kind(&self) -> &str {
        "inclusiveGateway"
    }

    fn prepare(&self, _graph: &ProcessGraph, _node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(InclusiveGatewayBehavior))
    }
}

#[async_trait]
impl ActivityBehavior for InclusiveGatewayBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let graph = ctx.graph_of(execution)?;
        if graph.node(ctx.node_of(execution)?).incoming.len() <= 1 {
            ctx.leave(execution);
            return Ok(());
        }
        ctx.execution_mut(execution)?.is_active = false;
        try_inclusive_join(ctx, &graph, execution)
    }

    fn trigger(&self, _ctx: &mut CommandContext, execution: Uuid, _payload: HashMap<String, Value>) -> Result<()> {
        Err(EngineError::illegal(format!("execution {} waits in an inclusive join and cannot be triggered", execution)))
    }
}

/// Merges the executions waiting at an inclusive gateway once no other token of
/// the scope can still reach it.
pub fn try_inclusive_join(ctx: &mut CommandContext, graph: &ProcessGraph, execution: Uuid) -> Result<()> {
    let gateway = ctx.node_of(execution)?;
    let waiting = waiting_at(ctx, execution, gateway)?;
    let parent = ctx
        .execution(execution)?
        .parent_id
        .ok_or_else(|| EngineError::illegal("join outside of a scope"))?;

    let blocked = ctx
        .executions()
        .children(parent)
        .into_iter()
        .filter(|child| !waiting.contains(child))
        .filter_map(|child| ctx.executions().get(child)?.current_node)
        .any(|node| node == gateway || graph.can_reach(node, gateway));
    if blocked {
        debug!(execution = %execution, gateway = %graph.node(gateway).id, "Inclusive join still waiting");
        return Ok(());
    }

    let keep = match waiting.first() {
        _ if waiting.contains(&execution) => execution,
        Some(first) => *first,
        None => return Ok(()),
    };
    let merged = waiting.into_iter().filter(|w| *w != keep).collect();
    merge(ctx, keep, merged)
}

/// Inactive siblings of `execution` waiting at `node`, in arrival order.
fn waiting_at(ctx: &CommandContext, execution: Uuid, node: NodeIndex) -> Result<Vec<Uuid>> {
    let Some(parent) = ctx.execution(execution)?.parent_id else {
        return Ok(vec![execution]);
    };
    Ok(ctx
        .executions()
        .children(parent)
        .into_iter()
        .filter(|child| {
            ctx.executions().get(*child).is_some_and(|c| {
                c.current_node == Some(node) && !c.is_active && c.scope.is_none()
            })
        })
        .collect())
}

fn merge(ctx: &mut CommandContext, keep: Uuid, merged: Vec<Uuid>) -> Result<()> {
    for other in merged {
        ctx.end_activity(other, None)?;
        ctx.remove_execution(other, None)?;
    }
    ctx.execution_mut(keep)?.is_active = true;
    ctx.leave(keep);
    Ok(())
}

// --- EVENT-BASED GATEWAY ---

/// Waits for whichever event behind the gateway comes first. The catch event
/// that fires moves the token off the gateway and removes the other waits.
#[derive(Debug)]
pub struct EventBasedGatewayBehavior {
    targets: Vec<NodeIndex>,
}

pub struct EventBasedGatewayDefinition;

impl BehaviorDefinition for EventBasedGatewayDefinition {
    fn kind(&self) -> &str {
        "eventBasedGateway"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let targets = graph
            .node(node)
            .outgoing
            .iter()
            .map(|&flow| graph.flow(flow).target)
            .collect();
        Ok(Box::new(EventBasedGatewayBehavior { targets }))
    }
}

#[async_trait]
impl ActivityBehavior for EventBasedGatewayBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        for &target in &self.targets {
            ctx.listen_for_trigger(execution, target)?;
        }
        Ok(())
    }

    fn trigger(&self, _ctx: &mut CommandContext, execution: Uuid, _payload: HashMap<String, Value>) -> Result<()> {
        Err(EngineError::illegal(format!(
            "execution {} waits at an event-based gateway; deliver one of its events instead",
            execution
        )))
    }
}
