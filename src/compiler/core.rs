use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use std::collections::{HashMap, HashSet};

use crate::compiler::expander::Expander;
use crate::dsl::{EventDefinition, Flow, Node, NodeType, ProcessDefinition};
use crate::runtime::expression;
use crate::runtime::graph::{EventTrigger, FlowNode, FlowNodeKind, NodeIndex, ProcessGraph, SequenceFlow};
use crate::runtime::timer::TimerDefinition;

/// Turns a [`ProcessDefinition`] into a validated, indexed [`ProcessGraph`].
pub struct Compiler {
    id_map: HashMap<String, NodeIndex>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry<'a> {
    node: &'a Node,
    parent: Option<NodeIndex>,
}

impl Compiler {
    pub fn new() -> Self {
        Self { id_map: HashMap::new() }
    }

    pub fn compile(&mut self, raw_definition: ProcessDefinition) -> Result<ProcessGraph> {
        if raw_definition.id.trim().is_empty() {
            bail!("Process id must not be empty");
        }

        // 0. Pass 0: Expand
        let definition = Expander::new().expand(raw_definition)?;

        // 1. Pass 1: Indexing (sub-process contents are flattened after their parent)
        let mut entries = Vec::new();
        let mut scopes = Vec::new();
        self.index_scope(&definition.nodes, &definition.flows, None, &mut entries, &mut scopes)?;

        // 2. Pass 2: Transform
        let mut nodes = Vec::with_capacity(entries.len());
        for entry in &entries {
            nodes.push(self.transform_node(entry)?);
        }
        let mut root_nodes = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            match entry.parent {
                Some(parent) => nodes[parent].children.push(index),
                None => root_nodes.push(index),
            }
        }

        // 3. Pass 3: Sequence flows
        let flows = self.resolve_flows(&scopes, &mut nodes)?;

        // 4. Pass 4: Boundary events and compensation handlers
        self.attach_boundary_events(&entries, &mut nodes)?;

        let graph = ProcessGraph {
            key: definition.id,
            name: definition.name,
            version: 0,
            nodes,
            flows,
            root_nodes,
            node_ids: std::mem::take(&mut self.id_map),
        };

        // 5. Pass 5: Validate
        validate(&graph)?;
        Ok(graph)
    }

    fn index_scope<'a>(
        &mut self,
        nodes: &'a [Node],
        flows: &'a [Flow],
        parent: Option<NodeIndex>,
        entries: &mut Vec<Entry<'a>>,
        scopes: &mut Vec<(Option<NodeIndex>, &'a [Flow])>,
    ) -> Result<()> {
        scopes.push((parent, flows));
        for node in nodes {
            if node.id.trim().is_empty() {
                bail!("Node id must not be empty");
            }
            let index = entries.len();
            if self.id_map.insert(node.id.clone(), index).is_some() {
                bail!("Duplicate node ID: {}", node.id);
            }
            entries.push(Entry { node, parent });
            if let NodeType::SubProcess { nodes: inner, flows: inner_flows, .. } = &node.kind {
                self.index_scope(inner, inner_flows, Some(index), entries, scopes)?;
            }
        }
        Ok(())
    }

    fn resolve_target(&self, id: &str) -> Result<NodeIndex> {
        self.id_map
            .get(id)
            .copied()
            .ok_or_else(|| anyhow!("Target node not found: {}", id))
    }

    fn transform_node(&self, entry: &Entry<'_>) -> Result<FlowNode> {
        let node = entry.node;
        let kind = match &node.kind {
            NodeType::StartEvent { event, interrupting } => FlowNodeKind::StartEvent {
                trigger: event_trigger(&node.id, event.as_ref())?,
                interrupting: *interrupting,
            },
            NodeType::EndEvent { event } => FlowNodeKind::EndEvent {
                trigger: event_trigger(&node.id, event.as_ref())?,
            },
            NodeType::IntermediateCatchEvent { event } => FlowNodeKind::IntermediateCatchEvent {
                trigger: event_trigger(&node.id, Some(event))?,
            },
            NodeType::IntermediateThrowEvent { event } => FlowNodeKind::IntermediateThrowEvent {
                trigger: event_trigger(&node.id, event.as_ref())?,
            },
            NodeType::BoundaryEvent {
                attached_to,
                event,
                cancel_activity,
                ..
            } => FlowNodeKind::BoundaryEvent {
                attached_to: self
                    .resolve_target(attached_to)
                    .with_context(|| format!("Boundary event {} is attached to an unknown activity", node.id))?,
                trigger: event_trigger(&node.id, Some(event))?,
                cancel_activity: *cancel_activity,
            },
            NodeType::Task => FlowNodeKind::Task,
            NodeType::UserTask { assignee } => FlowNodeKind::UserTask {
                assignee: assignee.clone(),
            },
            NodeType::ReceiveTask { message } => FlowNodeKind::ReceiveTask {
                message: message.clone(),
            },
            NodeType::ServiceTask { handler, params, output } => {
                if handler.trim().is_empty() {
                    bail!("Service task {} has no handler", node.id);
                }
                FlowNodeKind::ServiceTask {
                    handler: handler.clone(),
                    params: params.clone(),
                    output: output.clone(),
                }
            }
            NodeType::ScriptTask { script, result_variable } => {
                expression::compile(script).with_context(|| format!("Invalid script in {}", node.id))?;
                FlowNodeKind::ScriptTask {
                    script: script.clone(),
                    result_variable: result_variable.clone(),
                }
            }
            NodeType::ExclusiveGateway => FlowNodeKind::ExclusiveGateway,
            NodeType::ParallelGateway => FlowNodeKind::ParallelGateway,
            NodeType::InclusiveGateway => FlowNodeKind::InclusiveGateway,
            NodeType::EventBasedGateway => FlowNodeKind::EventBasedGateway,
            NodeType::SubProcess { triggered_by_event, .. } => FlowNodeKind::SubProcess {
                triggered_by_event: *triggered_by_event,
            },
            NodeType::CallActivity {
                called_element,
                inputs,
                outputs,
                inherit_variables,
            } => {
                if called_element.trim().is_empty() {
                    bail!("Call activity {} has no called element", node.id);
                }
                FlowNodeKind::CallActivity {
                    called_element: called_element.clone(),
                    inputs: inputs.clone(),
                    outputs: outputs.clone(),
                    inherit_variables: *inherit_variables,
                }
            }
            NodeType::Parallel { .. } => bail!("Parallel block {} was not expanded", node.id),
        };

        if let Some(characteristics) = &node.multi_instance {
            if characteristics.collection.is_none() && characteristics.cardinality.is_none() {
                bail!("Multi-instance activity {} needs a collection or a cardinality", node.id);
            }
            if let Some(condition) = &characteristics.completion_condition {
                expression::compile(condition)
                    .with_context(|| format!("Invalid completion condition in {}", node.id))?;
            }
        }

        Ok(FlowNode {
            id: node.id.clone(),
            name: node.name.clone(),
            kind,
            parent: entry.parent,
            children: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            default_flow: None,
            boundary_events: Vec::new(),
            asynchronous: node.asynchronous,
            multi_instance: node.multi_instance.clone(),
            compensation_handler: None,
            for_compensation: false,
        })
    }

    fn resolve_flows(
        &self,
        scopes: &[(Option<NodeIndex>, &[Flow])],
        nodes: &mut [FlowNode],
    ) -> Result<Vec<SequenceFlow>> {
        let mut flows = Vec::new();
        let mut flow_ids = HashSet::new();

        for (scope, scope_flows) in scopes {
            for flow in scope_flows.iter() {
                let source = self.resolve_target(&flow.source)?;
                let target = self.resolve_target(&flow.target)?;
                if nodes[source].parent != *scope || nodes[target].parent != *scope {
                    bail!(
                        "Flow {} -> {} must connect nodes of the scope it is declared in",
                        flow.source,
                        flow.target
                    );
                }

                let index = flows.len();
                let id = flow.id.clone().unwrap_or_else(|| format!("flow_{}", index + 1));
                if !flow_ids.insert(id.clone()) {
                    bail!("Duplicate flow ID: {}", id);
                }
                if let Some(condition) = &flow.condition {
                    expression::compile(condition)
                        .with_context(|| format!("Invalid condition on flow {}", id))?;
                }

                if flow.is_default {
                    if nodes[source].default_flow.is_some() {
                        bail!("Node {} has more than one default flow", flow.source);
                    }
                    nodes[source].default_flow = Some(index);
                }
                nodes[source].outgoing.push(index);
                nodes[target].incoming.push(index);
                flows.push(SequenceFlow {
                    id,
                    source,
                    target,
                    condition: flow.condition.clone(),
                });
            }
        }
        Ok(flows)
    }

    fn attach_boundary_events(&self, entries: &[Entry<'_>], nodes: &mut [FlowNode]) -> Result<()> {
        for (index, entry) in entries.iter().enumerate() {
            let NodeType::BoundaryEvent { handler, .. } = &entry.node.kind else {
                continue;
            };
            let FlowNodeKind::BoundaryEvent { attached_to, trigger, .. } = &nodes[index].kind else {
                continue;
            };
            let attached = *attached_to;
            let compensate = matches!(trigger, EventTrigger::Compensate(_));

            if !nodes[attached].kind.is_activity() {
                bail!("Boundary event {} must be attached to an activity", entry.node.id);
            }
            if nodes[attached].parent != nodes[index].parent {
                bail!("Boundary event {} must be in the scope of {}", entry.node.id, nodes[attached].id);
            }

            if compensate {
                let handler_id = handler
                    .as_deref()
                    .ok_or_else(|| anyhow!("Compensation boundary event {} needs a handler", entry.node.id))?;
                let handler_index = self.resolve_target(handler_id)?;
                if !nodes[handler_index].kind.is_activity() {
                    bail!("Compensation handler {} must be an activity", handler_id);
                }
                if nodes[attached].compensation_handler.is_some() {
                    bail!("Activity {} has more than one compensation handler", nodes[attached].id);
                }
                nodes[attached].compensation_handler = Some(handler_index);
                nodes[handler_index].for_compensation = true;
            } else {
                nodes[attached].boundary_events.push(index);
            }
        }
        Ok(())
    }
}

fn event_trigger(node_id: &str, event: Option<&EventDefinition>) -> Result<EventTrigger> {
    let Some(event) = event else {
        return Ok(EventTrigger::None);
    };
    let trigger = match event {
        EventDefinition::Timer { duration, date, cycle } => {
            let timer = match (duration, date, cycle) {
                (Some(duration), None, None) => TimerDefinition::Duration(duration.clone()),
                (None, Some(date), None) => TimerDefinition::Date(date.clone()),
                (None, None, Some(cycle)) => TimerDefinition::Cycle(cycle.clone()),
                _ => bail!("Timer of {} needs exactly one of duration, date or cycle", node_id),
            };
            timer
                .validate()
                .with_context(|| format!("Invalid timer on {}", node_id))?;
            EventTrigger::Timer(timer)
        }
        EventDefinition::Message { name } | EventDefinition::Signal { name } if name.trim().is_empty() => {
            bail!("Event of {} needs a name", node_id)
        }
        EventDefinition::Message { name } => EventTrigger::Message(name.clone()),
        EventDefinition::Signal { name } => EventTrigger::Signal(name.clone()),
        EventDefinition::Error { code } => EventTrigger::Error(code.clone()),
        EventDefinition::Escalation { code } => EventTrigger::Escalation(code.clone()),
        EventDefinition::Compensate { activity } => EventTrigger::Compensate(activity.clone()),
        EventDefinition::Terminate { all } => EventTrigger::Terminate { all: *all },
    };
    Ok(trigger)
}

fn trigger_name(trigger: &EventTrigger) -> &'static str {
    match trigger {
        EventTrigger::None => "none",
        EventTrigger::Timer(_) => "timer",
        EventTrigger::Message(_) => "message",
        EventTrigger::Signal(_) => "signal",
        EventTrigger::Error(_) => "error",
        EventTrigger::Escalation(_) => "escalation",
        EventTrigger::Compensate(_) => "compensate",
        EventTrigger::Terminate { .. } => "terminate",
    }
}

fn is_waitable(trigger: &EventTrigger) -> bool {
    matches!(
        trigger,
        EventTrigger::Timer(_) | EventTrigger::Message(_) | EventTrigger::Signal(_)
    )
}

/// Structural rules that hold for every deployable graph.
fn validate(graph: &ProcessGraph) -> Result<()> {
    validate_scope(graph, None)?;

    for (index, node) in graph.nodes.iter().enumerate() {
        match &node.kind {
            FlowNodeKind::SubProcess { .. } => validate_scope(graph, Some(index))?,
            FlowNodeKind::EndEvent { trigger } => {
                if !node.outgoing.is_empty() {
                    bail!("End event {} cannot have outgoing flows", node.id);
                }
                if matches!(trigger, EventTrigger::Timer(_) | EventTrigger::Message(_)) {
                    bail!("End event {} cannot throw a {} event", node.id, trigger_name(trigger));
                }
            }
            FlowNodeKind::IntermediateCatchEvent { trigger } if !is_waitable(trigger) => {
                bail!("Catch event {} cannot wait for a {} event", node.id, trigger_name(trigger));
            }
            FlowNodeKind::IntermediateThrowEvent { trigger }
                if !matches!(
                    trigger,
                    EventTrigger::None | EventTrigger::Signal(_) | EventTrigger::Escalation(_) | EventTrigger::Compensate(_)
                ) =>
            {
                bail!("Throw event {} cannot throw a {} event", node.id, trigger_name(trigger));
            }
            FlowNodeKind::BoundaryEvent {
                trigger,
                cancel_activity,
                ..
            } => {
                if !node.incoming.is_empty() {
                    bail!("Boundary event {} cannot have incoming flows", node.id);
                }
                match trigger {
                    EventTrigger::None | EventTrigger::Terminate { .. } => {
                        bail!("Boundary event {} cannot catch a {} event", node.id, trigger_name(trigger))
                    }
                    EventTrigger::Error(_) if !cancel_activity => {
                        bail!("Error boundary event {} must cancel the activity", node.id)
                    }
                    EventTrigger::Compensate(_) if !node.outgoing.is_empty() => {
                        bail!("Compensation boundary event {} cannot have outgoing flows", node.id)
                    }
                    _ => {}
                }
            }
            FlowNodeKind::EventBasedGateway => {
                if node.outgoing.is_empty() {
                    bail!("Event-based gateway {} needs outgoing flows", node.id);
                }
                for &flow in &node.outgoing {
                    let target = graph.node(graph.flow(flow).target);
                    let valid = matches!(&target.kind, FlowNodeKind::IntermediateCatchEvent { trigger } if is_waitable(trigger));
                    if !valid {
                        bail!(
                            "Event-based gateway {} must lead to timer, message or signal catch events, found {}",
                            node.id,
                            target.id
                        );
                    }
                    if target.incoming.len() != 1 {
                        bail!("Catch event {} after an event-based gateway must have one incoming flow", target.id);
                    }
                }
            }
            _ => {}
        }

        if node.for_compensation && (!node.incoming.is_empty() || !node.outgoing.is_empty()) {
            bail!("Compensation handler {} cannot have sequence flows", node.id);
        }
    }
    Ok(())
}

/// Start event rules of the process itself, an embedded or an event sub-process.
fn validate_scope(graph: &ProcessGraph, scope: Option<NodeIndex>) -> Result<()> {
    let scope_name = scope.map_or_else(|| graph.key.clone(), |index| graph.node(index).id.clone());
    let event_scope = scope.is_some_and(|index| {
        matches!(graph.node(index).kind, FlowNodeKind::SubProcess { triggered_by_event: true })
    });

    let starts: Vec<&FlowNode> = graph
        .children_of(scope)
        .iter()
        .map(|&index| graph.node(index))
        .filter(|node| matches!(node.kind, FlowNodeKind::StartEvent { .. }))
        .collect();

    for start in &starts {
        if !start.incoming.is_empty() {
            bail!("Start event {} cannot have incoming flows", start.id);
        }
    }
    let triggers: Vec<&EventTrigger> = starts.iter().filter_map(|s| s.kind.trigger()).collect();
    let none_starts = triggers.iter().filter(|t| matches!(t, EventTrigger::None)).count();

    if event_scope {
        let Some(index) = scope else {
            return Ok(());
        };
        let sub_process = graph.node(index);
        if !sub_process.incoming.is_empty() || !sub_process.outgoing.is_empty() {
            bail!("Event sub-process {} cannot have sequence flows", sub_process.id);
        }
        if sub_process.multi_instance.is_some() || sub_process.asynchronous {
            bail!("Event sub-process {} cannot be asynchronous or multi-instance", sub_process.id);
        }
        match triggers.as_slice() {
            [trigger]
                if matches!(
                    trigger,
                    EventTrigger::Timer(_)
                        | EventTrigger::Message(_)
                        | EventTrigger::Signal(_)
                        | EventTrigger::Error(_)
                        | EventTrigger::Escalation(_)
                ) => {}
            _ => bail!(
                "Event sub-process {} needs exactly one timer, message, signal, error or escalation start event",
                sub_process.id
            ),
        }
        return Ok(());
    }

    match scope {
        None => {
            if starts.is_empty() {
                bail!("Process {} has no start event", scope_name);
            }
            if none_starts > 1 {
                bail!("Process {} has more than one none start event", scope_name);
            }
            if let Some(trigger) = triggers
                .iter()
                .find(|t| !matches!(t, EventTrigger::None) && !is_waitable(t))
            {
                bail!("Process {} cannot start on a {} event", scope_name, trigger_name(trigger));
            }
        }
        Some(_) => {
            if starts.len() != 1 || none_starts != 1 {
                bail!("Sub-process {} needs exactly one none start event", scope_name);
            }
        }
    }
    Ok(())
}
