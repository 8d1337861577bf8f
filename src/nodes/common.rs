use anyhow::{Result as AnyResult, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::graph::{EventTrigger, FlowNodeKind, NodeIndex, ProcessGraph};
use crate::runtime::node::{ActivityBehavior, BehaviorDefinition};
use crate::runtime::propagation;

// --- START EVENT ---

#[derive(Debug)]
pub struct StartEventBehavior {
    node: NodeIndex,
}

pub struct StartEventDefinition;

impl BehaviorDefinition for StartEventDefinition {
    fn kind(&self) -> &str {
        "startEvent"
    }

    fn prepare(&self, _graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(StartEventBehavior { node }))
    }
}

#[async_trait]
impl ActivityBehavior for StartEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.leave(execution);
        Ok(())
    }

    /// Fired on the scope execution when the start event of an event
    /// sub-process catches its event.
    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, payload: HashMap<String, Value>) -> Result<()> {
        propagation::start_event_sub_process(ctx, execution, self.node, payload)
    }
}

// --- END EVENT ---

#[derive(Debug)]
pub struct EndEventBehavior {
    activity_id: String,
    trigger: EventTrigger,
}

pub struct EndEventDefinition;

impl BehaviorDefinition for EndEventDefinition {
    fn kind(&self) -> &str {
        "endEvent"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let flow_node = graph.node(node);
        let FlowNodeKind::EndEvent { trigger } = &flow_node.kind else {
            return Err(anyhow!("{} is not an end event", flow_node.id));
        };
        Ok(Box::new(EndEventBehavior {
            activity_id: flow_node.id.clone(),
            trigger: trigger.clone(),
        }))
    }
}

#[async_trait]
impl ActivityBehavior for EndEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        match &self.trigger {
            EventTrigger::Error(code) => {
                ctx.end_activity(execution, None)?;
                propagation::throw_error(ctx, execution, code.as_deref().unwrap_or_default())
            }
            EventTrigger::Escalation(code) => {
                propagation::throw_escalation(ctx, execution, code.as_deref().unwrap_or_default())?;
                ctx.end_execution(execution);
                Ok(())
            }
            EventTrigger::Signal(name) => {
                propagation::throw_signal(ctx, name, &HashMap::new())?;
                ctx.end_execution(execution);
                Ok(())
            }
            EventTrigger::Compensate(activity) => {
                if !propagation::throw_compensation(ctx, execution, activity.as_deref())? {
                    ctx.end_execution(execution);
                }
                Ok(())
            }
            EventTrigger::Terminate { all } => self.terminate(ctx, execution, *all),
            _ => {
                ctx.end_execution(execution);
                Ok(())
            }
        }
    }

    /// Resumed once all compensation handlers are done.
    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, _payload: HashMap<String, Value>) -> Result<()> {
        ctx.end_execution(execution);
        Ok(())
    }
}

impl EndEventBehavior {
    fn terminate(&self, ctx: &mut CommandContext, execution: Uuid, all: bool) -> Result<()> {
        let scope = if all {
            let mut root = ctx.execution(execution)?.process_instance_id;
            while let Some(caller) = ctx.execution(root)?.super_execution_id {
                root = ctx.execution(caller)?.process_instance_id;
            }
            root
        } else {
            ctx.enclosing_scope(execution)?
        };

        info!(execution = %execution, scope = %scope, all, "Terminate end event reached");
        // A terminate in a called process is not the end activity of its caller.
        let own_instance = ctx.execution(scope)?.process_instance_id == ctx.execution(execution)?.process_instance_id;
        ctx.end_activity(execution, None)?;
        ctx.plan(Operation::DestroyScope {
            scope,
            reason: format!("terminated by {}", self.activity_id),
            end_activity: own_instance.then(|| self.activity_id.clone()),
        });
        Ok(())
    }
}

// --- TASK ---

/// Plain task: no work, the token passes straight through.
#[derive(Debug)]
pub struct TaskBehavior;

pub struct TaskDefinition;

impl BehaviorDefinition for TaskDefinition {
    fn kind(&self) -> &str {
        "task"
    }

    fn prepare(&self, _graph: &ProcessGraph, _node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(TaskBehavior))
    }
}

#[async_trait]
impl ActivityBehavior for TaskBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.leave(execution);
        Ok(())
    }
}
