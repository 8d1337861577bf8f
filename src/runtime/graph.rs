use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::dsl::{Mapping, MultiInstanceDef};
use crate::runtime::timer::TimerDefinition;

pub type NodeIndex = usize;
pub type FlowIndex = usize;

/// 编译后的流程图 (indexed, validated form of a process definition)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub key: String,
    pub name: String,
    /// Assigned by the repository on deployment.
    pub version: u32,
    pub nodes: Vec<FlowNode>,
    pub flows: Vec<SequenceFlow>,
    /// Nodes directly inside the process (not nested in a sub-process).
    pub root_nodes: Vec<NodeIndex>,
    pub node_ids: HashMap<String, NodeIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: FlowNodeKind,
    /// Enclosing sub-process, `None` for nodes of the process itself.
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub incoming: Vec<FlowIndex>,
    pub outgoing: Vec<FlowIndex>,
    pub default_flow: Option<FlowIndex>,
    pub boundary_events: Vec<NodeIndex>,
    pub asynchronous: bool,
    pub multi_instance: Option<MultiInstanceDef>,
    pub compensation_handler: Option<NodeIndex>,
    pub for_compensation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EventTrigger {
    None,
    Timer(TimerDefinition),
    Message(String),
    Signal(String),
    Error(Option<String>),
    Escalation(Option<String>),
    Compensate(Option<String>),
    Terminate { all: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlowNodeKind {
    StartEvent { trigger: EventTrigger, interrupting: bool },
    EndEvent { trigger: EventTrigger },
    IntermediateCatchEvent { trigger: EventTrigger },
    IntermediateThrowEvent { trigger: EventTrigger },
    BoundaryEvent { attached_to: NodeIndex, trigger: EventTrigger, cancel_activity: bool },
    Task,
    UserTask { assignee: Option<String> },
    ReceiveTask { message: Option<String> },
    ServiceTask { handler: String, params: HashMap<String, Value>, output: Option<String> },
    ScriptTask { script: String, result_variable: Option<String> },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    SubProcess { triggered_by_event: bool },
    CallActivity {
        called_element: String,
        inputs: Vec<Mapping>,
        outputs: Vec<Mapping>,
        inherit_variables: bool,
    },
}

impl FlowNodeKind {
    /// Behavior registry key, also reported as activity type in history.
    pub fn name(&self) -> &'static str {
        match self {
            FlowNodeKind::StartEvent { .. } => "startEvent",
            FlowNodeKind::EndEvent { .. } => "endEvent",
            FlowNodeKind::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
            FlowNodeKind::IntermediateThrowEvent { .. } => "intermediateThrowEvent",
            FlowNodeKind::BoundaryEvent { .. } => "boundaryEvent",
            FlowNodeKind::Task => "task",
            FlowNodeKind::UserTask { .. } => "userTask",
            FlowNodeKind::ReceiveTask { .. } => "receiveTask",
            FlowNodeKind::ServiceTask { .. } => "serviceTask",
            FlowNodeKind::ScriptTask { .. } => "scriptTask",
            FlowNodeKind::ExclusiveGateway => "exclusiveGateway",
            FlowNodeKind::ParallelGateway => "parallelGateway",
            FlowNodeKind::InclusiveGateway => "inclusiveGateway",
            FlowNodeKind::EventBasedGateway => "eventBasedGateway",
            FlowNodeKind::SubProcess { .. } => "subProcess",
            FlowNodeKind::CallActivity { .. } => "callActivity",
        }
    }

    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            FlowNodeKind::Task
                | FlowNodeKind::UserTask { .. }
                | FlowNodeKind::ReceiveTask { .. }
                | FlowNodeKind::ServiceTask { .. }
                | FlowNodeKind::ScriptTask { .. }
                | FlowNodeKind::SubProcess { triggered_by_event: false }
                | FlowNodeKind::CallActivity { .. }
        )
    }

    pub fn trigger(&self) -> Option<&EventTrigger> {
        match self {
            FlowNodeKind::StartEvent { trigger, .. }
            | FlowNodeKind::EndEvent { trigger }
            | FlowNodeKind::IntermediateCatchEvent { trigger }
            | FlowNodeKind::IntermediateThrowEvent { trigger }
            | FlowNodeKind::BoundaryEvent { trigger, .. } => Some(trigger),
            _ => None,
        }
    }
}

impl ProcessGraph {
    /// Key under which this version is stored: `key:version`.
    pub fn deployment_key(&self) -> String {
        format!("{}:{}", self.key, self.version)
    }

    pub fn node(&self, index: NodeIndex) -> &FlowNode {
        &self.nodes[index]
    }

    pub fn flow(&self, index: FlowIndex) -> &SequenceFlow {
        &self.flows[index]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.node_ids.get(id).copied()
    }

    pub fn children_of(&self, scope: Option<NodeIndex>) -> &[NodeIndex] {
        match scope {
            Some(index) => &self.nodes[index].children,
            None => &self.root_nodes,
        }
    }

    /// The start event without a trigger, where a scope begins when entered normally.
    pub fn none_start_event(&self, scope: Option<NodeIndex>) -> Option<NodeIndex> {
        self.children_of(scope).iter().copied().find(|&index| {
            matches!(
                self.nodes[index].kind,
                FlowNodeKind::StartEvent { trigger: EventTrigger::None, .. }
            )
        })
    }

    pub fn event_sub_processes(&self, scope: Option<NodeIndex>) -> impl Iterator<Item = NodeIndex> + '_ {
        self.children_of(scope).iter().copied().filter(|&index| {
            matches!(
                self.nodes[index].kind,
                FlowNodeKind::SubProcess { triggered_by_event: true }
            )
        })
    }

    /// The triggered start event of an event sub-process.
    pub fn event_start_of(&self, sub_process: NodeIndex) -> Option<NodeIndex> {
        self.nodes[sub_process]
            .children
            .iter()
            .copied()
            .find(|&index| matches!(self.nodes[index].kind, FlowNodeKind::StartEvent { .. }))
    }

    /// Whether a token at `from` can still arrive at `to`, following sequence
    /// flows and the flows leaving boundary events.
    pub fn can_reach(&self, from: NodeIndex, to: NodeIndex) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            let node = &self.nodes[current];
            for &flow in &node.outgoing {
                queue.push_back(self.flows[flow].target);
            }
            for &boundary in &node.boundary_events {
                queue.push_back(boundary);
            }
        }
        false
    }
}
