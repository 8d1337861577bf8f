pub mod activity;
pub mod common;
pub mod event;
pub mod flow;
pub mod multi_instance;

use std::sync::Arc;

use crate::runtime::node::BehaviorDefinition;
use crate::runtime::repository::Repository;

/// Registers the behavior of every node kind the compiler can produce.
pub fn register_standard_behaviors(repository: &Repository) {
    let definitions: Vec<Arc<dyn BehaviorDefinition>> = vec![
        Arc::new(common::StartEventDefinition),
        Arc::new(common::EndEventDefinition),
        Arc::new(common::TaskDefinition),
        Arc::new(event::CatchEventDefinition),
        Arc::new(event::ThrowEventDefinition),
        Arc::new(event::BoundaryEventDefinition),
        Arc::new(flow::ExclusiveGatewayDefinition),
        Arc::new(flow::ParallelGatewayDefinition),
        Arc::new(flow::InclusiveGatewayDefinition),
        Arc::new(flow::EventBasedGatewayDefinition),
        Arc::new(activity::UserTaskDefinition),
        Arc::new(activity::ReceiveTaskDefinition),
        Arc::new(activity::ServiceTaskDefinition),
        Arc::new(activity::ScriptTaskDefinition),
        Arc::new(activity::SubProcessDefinition),
        Arc::new(activity::CallActivityDefinition),
    ];
    for definition in definitions {
        repository.register_definition(definition);
    }
}
