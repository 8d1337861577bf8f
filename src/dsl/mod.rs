pub mod builder;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// 原始 DSL 定义的流程 (process definition as authored in YAML or via the builder)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// DSL 中的节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeType,
    /// Continue through a job instead of executing in the caller's command.
    #[serde(default, skip_serializing_if = "is_false")]
    pub asynchronous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceDef>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_true() -> bool {
    true
}

impl Node {
    pub fn new(id: &str, kind: NodeType) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            kind,
            asynchronous: false,
            multi_instance: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn multi_instance(mut self, characteristics: MultiInstanceDef) -> Self {
        self.multi_instance = Some(characteristics);
        self
    }
}

/// DSL 中的节点类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeType {
    StartEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<EventDefinition>,
        /// Only meaningful for start events of event sub-processes.
        #[serde(default = "default_true")]
        interrupting: bool,
    },
    EndEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<EventDefinition>,
    },
    IntermediateCatchEvent {
        event: EventDefinition,
    },
    IntermediateThrowEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<EventDefinition>,
    },
    BoundaryEvent {
        attached_to: String,
        event: EventDefinition,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        /// Compensation handler activity, for compensate boundary events.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handler: Option<String>,
    },
    Task,
    UserTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    ReceiveTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ServiceTask {
        handler: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    ScriptTask {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    SubProcess {
        #[serde(default)]
        triggered_by_event: bool,
        #[serde(default)]
        nodes: Vec<Node>,
        #[serde(default)]
        flows: Vec<Flow>,
    },
    CallActivity {
        called_element: String,
        #[serde(default)]
        inputs: Vec<Mapping>,
        #[serde(default)]
        outputs: Vec<Mapping>,
        #[serde(default)]
        inherit_variables: bool,
    },
    /// Shorthand block, expanded into a forking and a joining parallel gateway.
    Parallel {
        branches: Vec<Branch>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventDefinition {
    Timer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cycle: Option<String>,
    },
    Message {
        name: String,
    },
    Signal {
        name: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Escalation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Compensate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<String>,
    },
    Terminate {
        #[serde(default)]
        all: bool,
    },
}

impl EventDefinition {
    pub fn timer_duration(duration: &str) -> Self {
        EventDefinition::Timer {
            duration: Some(duration.to_string()),
            date: None,
            cycle: None,
        }
    }

    pub fn timer_cycle(cycle: &str) -> Self {
        EventDefinition::Timer {
            duration: None,
            date: None,
            cycle: Some(cycle.to_string()),
        }
    }

    pub fn message(name: &str) -> Self {
        EventDefinition::Message { name: name.to_string() }
    }

    pub fn signal(name: &str) -> Self {
        EventDefinition::Signal { name: name.to_string() }
    }

    pub fn error(code: Option<&str>) -> Self {
        EventDefinition::Error { code: code.map(str::to_string) }
    }

    pub fn escalation(code: Option<&str>) -> Self {
        EventDefinition::Escalation { code: code.map(str::to_string) }
    }
}

/// DSL 中的连线
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "default", default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl Flow {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            id: None,
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            is_default: false,
        }
    }
}

/// Variable mapping across a call activity boundary. `source` is a variable
/// name or a `${..}` expression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mapping {
    pub source: String,
    pub target: String,
}

impl Mapping {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultiInstanceDef {
    #[serde(default)]
    pub sequential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

impl MultiInstanceDef {
    pub fn cardinality(expression: impl Into<String>) -> Self {
        Self {
            cardinality: Some(expression.into()),
            ..Default::default()
        }
    }

    pub fn collection(collection: &str, element_variable: &str) -> Self {
        Self {
            collection: Some(collection.to_string()),
            element_variable: Some(element_variable.to_string()),
            ..Default::default()
        }
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn completion_condition(mut self, condition: &str) -> Self {
        self.completion_condition = Some(condition.to_string());
        self
    }
}
