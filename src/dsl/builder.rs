use crate::dsl::{
    Branch, EventDefinition, Flow, Mapping, MultiInstanceDef, Node, NodeType, ProcessDefinition,
};
use serde_json::Value;
use std::collections::HashMap;

pub struct ProcessBuilder {
    id: String,
    name: String,
    pub nodes: Vec<Node>, // public for manual manipulation in tests
    flows: Vec<Flow>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            nodes: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    fn push(self, id: &str, kind: NodeType) -> Self {
        self.node(Node::new(id, kind))
    }

    pub fn start_event(self, id: &str) -> Self {
        self.push(id, NodeType::StartEvent { event: None, interrupting: true })
    }

    /// Start event carrying a trigger (message, signal, timer, or error/escalation
    /// inside an event sub-process).
    pub fn event_start(self, id: &str, event: EventDefinition, interrupting: bool) -> Self {
        self.push(id, NodeType::StartEvent { event: Some(event), interrupting })
    }

    pub fn end_event(self, id: &str) -> Self {
        self.push(id, NodeType::EndEvent { event: None })
    }

    pub fn event_end(self, id: &str, event: EventDefinition) -> Self {
        self.push(id, NodeType::EndEvent { event: Some(event) })
    }

    pub fn error_end(self, id: &str, code: &str) -> Self {
        self.event_end(id, EventDefinition::error(Some(code)))
    }

    pub fn terminate_end(self, id: &str) -> Self {
        self.event_end(id, EventDefinition::Terminate { all: false })
    }

    pub fn task(self, id: &str) -> Self {
        self.push(id, NodeType::Task)
    }

    pub fn user_task(self, id: &str) -> Self {
        self.push(id, NodeType::UserTask { assignee: None })
    }

    pub fn receive_task(self, id: &str, message: &str) -> Self {
        self.push(id, NodeType::ReceiveTask { message: Some(message.to_string()) })
    }

    pub fn service_task(self, id: &str, handler: &str) -> ServiceTaskBuilder {
        ServiceTaskBuilder {
            process_builder: self,
            id: id.to_string(),
            handler: handler.to_string(),
            params: HashMap::new(),
            output: None,
        }
    }

    pub fn script_task(self, id: &str, script: &str, result_variable: Option<&str>) -> Self {
        self.push(
            id,
            NodeType::ScriptTask {
                script: script.to_string(),
                result_variable: result_variable.map(str::to_string),
            },
        )
    }

    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.push(id, NodeType::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.push(id, NodeType::ParallelGateway)
    }

    pub fn inclusive_gateway(self, id: &str) -> Self {
        self.push(id, NodeType::InclusiveGateway)
    }

    pub fn event_based_gateway(self, id: &str) -> Self {
        self.push(id, NodeType::EventBasedGateway)
    }

    pub fn catch_event(self, id: &str, event: EventDefinition) -> Self {
        self.push(id, NodeType::IntermediateCatchEvent { event })
    }

    pub fn timer_catch(self, id: &str, duration: &str) -> Self {
        self.catch_event(id, EventDefinition::timer_duration(duration))
    }

    pub fn message_catch(self, id: &str, message: &str) -> Self {
        self.catch_event(id, EventDefinition::message(message))
    }

    pub fn signal_catch(self, id: &str, signal: &str) -> Self {
        self.catch_event(id, EventDefinition::signal(signal))
    }

    pub fn throw_event(self, id: &str, event: Option<EventDefinition>) -> Self {
        self.push(id, NodeType::IntermediateThrowEvent { event })
    }

    pub fn signal_throw(self, id: &str, signal: &str) -> Self {
        self.throw_event(id, Some(EventDefinition::signal(signal)))
    }

    pub fn boundary_event(
        self,
        id: &str,
        attached_to: &str,
        event: EventDefinition,
        cancel_activity: bool,
    ) -> Self {
        self.push(
            id,
            NodeType::BoundaryEvent {
                attached_to: attached_to.to_string(),
                event,
                cancel_activity,
                handler: None,
            },
        )
    }

    /// Compensate boundary event linking `attached_to` with its compensation handler.
    pub fn compensation(self, id: &str, attached_to: &str, handler: &str) -> Self {
        self.push(
            id,
            NodeType::BoundaryEvent {
                attached_to: attached_to.to_string(),
                event: EventDefinition::Compensate { activity: None },
                cancel_activity: true,
                handler: Some(handler.to_string()),
            },
        )
    }

    /// Embedded sub-process; `inner` contributes nodes and flows, its id is ignored.
    pub fn sub_process(self, id: &str, inner: ProcessBuilder) -> Self {
        self.push(
            id,
            NodeType::SubProcess {
                triggered_by_event: false,
                nodes: inner.nodes,
                flows: inner.flows,
            },
        )
    }

    pub fn event_sub_process(self, id: &str, inner: ProcessBuilder) -> Self {
        self.push(
            id,
            NodeType::SubProcess {
                triggered_by_event: true,
                nodes: inner.nodes,
                flows: inner.flows,
            },
        )
    }

    pub fn call_activity(self, id: &str, called_element: &str) -> CallActivityBuilder {
        CallActivityBuilder {
            process_builder: self,
            id: id.to_string(),
            called_element: called_element.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            inherit_variables: false,
        }
    }

    /// 添加并行块
    pub fn parallel(self, id: &str, branches: Vec<Vec<Node>>) -> Self {
        let branches = branches.into_iter().map(|nodes| Branch { nodes }).collect();
        self.push(id, NodeType::Parallel { branches })
    }

    /// Marks an already added node as asynchronous.
    pub fn asynchronous(mut self, id: &str) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.asynchronous = true;
        }
        self
    }

    /// Attaches multi-instance characteristics to an already added node.
    pub fn multi_instance(mut self, id: &str, characteristics: MultiInstanceDef) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.multi_instance = Some(characteristics);
        }
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.flows.push(Flow::new(source, target));
        self
    }

    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        let mut flow = Flow::new(source, target);
        flow.condition = Some(condition.to_string());
        self.flows.push(flow);
        self
    }

    pub fn connect_default(mut self, source: &str, target: &str) -> Self {
        let mut flow = Flow::new(source, target);
        flow.is_default = true;
        self.flows.push(flow);
        self
    }

    pub fn build(self) -> ProcessDefinition {
        ProcessDefinition {
            id: self.id,
            name: self.name,
            nodes: self.nodes,
            flows: self.flows,
        }
    }
}

pub struct ServiceTaskBuilder {
    process_builder: ProcessBuilder,
    id: String,
    handler: String,
    params: HashMap<String, Value>,
    output: Option<String>,
}

impl ServiceTaskBuilder {
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn output(mut self, var_name: &str) -> Self {
        self.output = Some(var_name.to_string());
        self
    }

    pub fn build(mut self) -> ProcessBuilder {
        self.process_builder.nodes.push(Node::new(
            &self.id,
            NodeType::ServiceTask {
                handler: self.handler,
                params: self.params,
                output: self.output,
            },
        ));
        self.process_builder
    }
}

pub struct CallActivityBuilder {
    process_builder: ProcessBuilder,
    id: String,
    called_element: String,
    inputs: Vec<Mapping>,
    outputs: Vec<Mapping>,
    inherit_variables: bool,
}

impl CallActivityBuilder {
    pub fn input(mut self, source: &str, target: &str) -> Self {
        self.inputs.push(Mapping::new(source, target));
        self
    }

    pub fn output(mut self, source: &str, target: &str) -> Self {
        self.outputs.push(Mapping::new(source, target));
        self
    }

    pub fn inherit_variables(mut self) -> Self {
        self.inherit_variables = true;
        self
    }

    pub fn build(mut self) -> ProcessBuilder {
        self.process_builder.nodes.push(Node::new(
            &self.id,
            NodeType::CallActivity {
                called_element: self.called_element,
                inputs: self.inputs,
                outputs: self.outputs,
                inherit_variables: self.inherit_variables,
            },
        ));
        self.process_builder
    }
}
