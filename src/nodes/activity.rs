use anyhow::{Result as AnyResult, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actions::{ServiceCall, ServiceError};
use crate::dsl::Mapping;
use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use crate::runtime::execution::ScopeKind;
use crate::runtime::expression::{self, CompiledExpression};
use crate::runtime::graph::{FlowNodeKind, NodeIndex, ProcessGraph};
use crate::runtime::node::{ActivityBehavior, BehaviorDefinition};
use crate::runtime::propagation;
use crate::runtime::subscription::EventType;

// --- USER TASK ---

/// Waits until the task is completed through `ProcessEngine::trigger`.
#[derive(Debug)]
pub struct UserTaskBehavior {
    assignee: Option<String>,
}

pub struct UserTaskDefinition;

impl BehaviorDefinition for UserTaskDefinition {
    fn kind(&self) -> &str {
        "userTask"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let assignee = match &graph.node(node).kind {
            FlowNodeKind::UserTask { assignee } => assignee.clone(),
            _ => None,
        };
        Ok(Box::new(UserTaskBehavior { assignee }))
    }
}

#[async_trait]
impl ActivityBehavior for UserTaskBehavior {
    async fn execute(&self, _ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        debug!(execution = %execution, assignee = ?self.assignee, "User task waiting");
        Ok(())
    }
}

// --- RECEIVE TASK ---

#[derive(Debug)]
pub struct ReceiveTaskBehavior {
    node: NodeIndex,
    message: Option<String>,
}

pub struct ReceiveTaskDefinition;

impl BehaviorDefinition for ReceiveTaskDefinition {
    fn kind(&self) -> &str {
        "receiveTask"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let message = match &graph.node(node).kind {
            FlowNodeKind::ReceiveTask { message } => message.clone(),
            _ => None,
        };
        Ok(Box::new(ReceiveTaskBehavior { node, message }))
    }
}

#[async_trait]
impl ActivityBehavior for ReceiveTaskBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        if let Some(message) = &self.message {
            ctx.subscribe(EventType::Message, message, execution, self.node)?;
        }
        Ok(())
    }

    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, payload: HashMap<String, Value>) -> Result<()> {
        ctx.clear_wait_state(execution);
        ctx.set_variables(execution, payload)?;
        ctx.leave(execution);
        Ok(())
    }
}

// --- SERVICE TASK ---

/// 将 ServiceHandler 包装为活动
#[derive(Debug)]
pub struct ServiceTaskBehavior {
    activity_id: String,
    handler: String,
    params: HashMap<String, Value>,
    output: Option<String>,
}

pub struct ServiceTaskDefinition;

impl BehaviorDefinition for ServiceTaskDefinition {
    fn kind(&self) -> &str {
        "serviceTask"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let flow_node = graph.node(node);
        let FlowNodeKind::ServiceTask { handler, params, output } = &flow_node.kind else {
            return Err(anyhow!("{} is not a service task", flow_node.id));
        };
        Ok(Box::new(ServiceTaskBehavior {
            activity_id: flow_node.id.clone(),
            handler: handler.clone(),
            params: params.clone(),
            output: output.clone(),
        }))
    }
}

#[async_trait]
impl ActivityBehavior for ServiceTaskBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let handler = ctx.handler(&self.handler).ok_or_else(|| EngineError::Service {
            handler: self.handler.clone(),
            source: anyhow!("handler is not registered"),
        })?;

        // 1. Resolve parameters against the visible variables
        let variables = ctx.variables(execution);
        let params = expression::resolve_params(&self.params, &variables)?;
        let call = ServiceCall {
            execution_id: execution,
            process_instance_id: ctx.execution(execution)?.process_instance_id,
            activity_id: self.activity_id.clone(),
            params,
            variables,
        };

        // 2. Run the handler
        let result = match handler.execute(call).await {
            Ok(result) => result,
            Err(ServiceError::Bpmn { code, message }) => {
                debug!(execution = %execution, code = %code, message = ?message, "Service raised a BPMN error");
                return propagation::throw_error(ctx, execution, &code);
            }
            Err(ServiceError::Failure(source)) => {
                return Err(EngineError::Service {
                    handler: self.handler.clone(),
                    source,
                });
            }
        };

        // 3. Write the output
        match (&self.output, result) {
            (Some(output), result) => ctx.set_variable(execution, output, result)?,
            (None, Value::Object(fields)) => {
                for (name, value) in fields {
                    ctx.set_variable(execution, &name, value)?;
                }
            }
            (None, _) => {}
        }

        ctx.leave(execution);
        Ok(())
    }
}

// --- SCRIPT TASK ---

#[derive(Debug)]
pub struct ScriptTaskBehavior {
    script: CompiledExpression,
    source: String,
    result_variable: Option<String>,
}

pub struct ScriptTaskDefinition;

impl BehaviorDefinition for ScriptTaskDefinition {
    fn kind(&self) -> &str {
        "scriptTask"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let flow_node = graph.node(node);
        let FlowNodeKind::ScriptTask { script, result_variable } = &flow_node.kind else {
            return Err(anyhow!("{} is not a script task", flow_node.id));
        };
        Ok(Box::new(ScriptTaskBehavior {
            script: expression::compile(script)?,
            source: script.clone(),
            result_variable: result_variable.clone(),
        }))
    }
}

#[async_trait]
impl ActivityBehavior for ScriptTaskBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let variables = ctx.variables(execution);
        let (result, changed) = expression::run_script(&self.script, &self.source, &variables)?;
        ctx.set_variables(execution, changed)?;
        if let Some(name) = &self.result_variable {
            ctx.set_variable(execution, name, result)?;
        }
        ctx.leave(execution);
        Ok(())
    }
}

// --- EMBEDDED SUB-PROCESS ---

#[derive(Debug)]
pub struct SubProcessBehavior {
    node: NodeIndex,
    start: Option<NodeIndex>,
}

pub struct SubProcessDefinition;

impl BehaviorDefinition for SubProcessDefinition {
    fn kind(&self) -> &str {
        "subProcess"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        Ok(Box::new(SubProcessBehavior {
            node,
            start: graph.none_start_event(Some(node)),
        }))
    }
}

#[async_trait]
impl ActivityBehavior for SubProcessBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let start = self
            .start
            .ok_or_else(|| EngineError::illegal("sub-process without a none start event"))?;
        {
            let scope = ctx.execution_mut(execution)?;
            scope.scope = Some(ScopeKind::SubProcess);
            scope.is_active = false;
        }
        ctx.register_event_sub_processes(execution, Some(self.node))?;
        let token = ctx.create_child_at(execution, start)?;
        ctx.continue_process(token, false);
        Ok(())
    }

    fn trigger(&self, _ctx: &mut CommandContext, execution: Uuid, _payload: HashMap<String, Value>) -> Result<()> {
        Err(EngineError::illegal(format!("sub-process scope {} cannot be triggered", execution)))
    }
}

// --- CALL ACTIVITY ---

#[derive(Debug)]
pub struct CallActivityBehavior {
    called_element: String,
    inputs: Vec<Mapping>,
    outputs: Vec<Mapping>,
    inherit_variables: bool,
}

pub struct CallActivityDefinition;

impl BehaviorDefinition for CallActivityDefinition {
    fn kind(&self) -> &str {
        "callActivity"
    }

    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> AnyResult<Box<dyn ActivityBehavior>> {
        let flow_node = graph.node(node);
        let FlowNodeKind::CallActivity {
            called_element,
            inputs,
            outputs,
            inherit_variables,
        } = &flow_node.kind
        else {
            return Err(anyhow!("{} is not a call activity", flow_node.id));
        };
        Ok(Box::new(CallActivityBehavior {
            called_element: called_element.clone(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            inherit_variables: *inherit_variables,
        }))
    }
}

/// A mapping source is either a variable name or a `${..}` expression.
fn map_value(source: &str, variables: &HashMap<String, Value>) -> Result<Value> {
    if source.contains("${") {
        expression::resolve(&Value::String(source.to_string()), variables)
    } else {
        Ok(variables.get(source).cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ActivityBehavior for CallActivityBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let graph = ctx.latest_graph(&self.called_element)?;
        let variables = ctx.variables(execution);

        let mut input = if self.inherit_variables {
            variables.clone()
        } else {
            HashMap::new()
        };
        for mapping in &self.inputs {
            input.insert(mapping.target.clone(), map_value(&mapping.source, &variables)?);
        }

        let business_key = ctx.execution(execution)?.business_key.clone();
        let child = ctx.start_process_instance(&graph, input, business_key, Some(execution), None)?;
        ctx.execution_mut(execution)?.sub_instance_id = Some(child);
        info!(execution = %execution, called = %self.called_element, instance_id = %child, "Called process started");
        Ok(())
    }

    /// Resumed with the variables of the finished called instance.
    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, payload: HashMap<String, Value>) -> Result<()> {
        if ctx.execution(execution)?.sub_instance_id.is_some() {
            return Err(EngineError::illegal(format!(
                "call activity {} is still waiting for its called process",
                execution
            )));
        }

        if self.outputs.is_empty() && self.inherit_variables {
            ctx.set_variables(execution, payload)?;
        } else {
            for mapping in &self.outputs {
                let value = map_value(&mapping.source, &payload)?;
                ctx.set_variable(execution, &mapping.target, value)?;
            }
        }
        ctx.leave(execution);
        Ok(())
    }
}
