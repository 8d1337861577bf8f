use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::graph::NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Message,
    Signal,
    Compensate,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Message => "message",
            EventType::Signal => "signal",
            EventType::Compensate => "compensate",
        };
        f.write_str(name)
    }
}

/// An execution waiting for a named event.
///
/// `node` is the node whose behavior handles the event: the catch event, boundary
/// event or event sub-process start event. For compensation it is the handler
/// activity and `event_name` the id of the compensated activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSubscription {
    pub id: Uuid,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub node: NodeIndex,
    pub activity_id: String,
    /// Creation order within the engine.
    pub created: u64,
}
