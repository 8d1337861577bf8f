mod common;

use async_trait::async_trait;
use common::{Failing, end_activity, engine, final_variables, vars};
use procession::dsl::builder::ProcessBuilder;
use procession::dsl::ProcessDefinition;
use procession::runtime::context::CommandContext;
use procession::runtime::graph::{NodeIndex, ProcessGraph};
use procession::runtime::history::HistoricActivityQuery;
use procession::runtime::node::{ActivityBehavior, BehaviorDefinition};
use procession::{EngineConfig, EngineError, ProcessEngine};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn approval() -> ProcessDefinition {
    ProcessBuilder::new("approval")
        .start_event("start")
        .user_task("review")
        .end_event("end")
        .connect("start", "review")
        .connect("review", "end")
        .build()
}

fn routing() -> ProcessDefinition {
    ProcessBuilder::new("routing")
        .start_event("start")
        .exclusive_gateway("check")
        .user_task("big")
        .user_task("small")
        .end_event("end")
        .connect("start", "check")
        .connect_if("check", "big", "${amount > 100}")
        .connect_default("check", "small")
        .connect("big", "end")
        .connect("small", "end")
        .build()
}

#[tokio::test]
async fn user_task_waits_until_triggered() {
    let engine = engine();
    engine.deploy(approval()).await.expect("deploy");

    let id = engine
        .start_process_instance_by_key("approval", vars(&[("amount", json!(10))]))
        .await
        .expect("start");
    assert!(engine.process_instance_exists(id).await);
    assert_eq!(engine.active_activity_ids(id).await, vec!["review"]);

    let task = engine.find_execution(id, "review").await.expect("token at review");
    engine
        .trigger(task, vars(&[("approved", json!(true))]))
        .await
        .expect("complete review");

    assert!(!engine.process_instance_exists(id).await);
    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("end"));
    let variables = final_variables(&engine, id).await;
    assert_eq!(variables.get("approved"), Some(&json!(true)));
    assert_eq!(variables.get("amount"), Some(&json!(10)));
}

#[tokio::test]
async fn exclusive_gateway_routes_on_conditions() {
    let engine = engine();
    engine.deploy(routing()).await.expect("deploy");

    let large = engine
        .start_process_instance_by_key("routing", vars(&[("amount", json!(150))]))
        .await
        .expect("start large");
    let small = engine
        .start_process_instance_by_key("routing", vars(&[("amount", json!(50))]))
        .await
        .expect("start small");

    assert_eq!(engine.active_activity_ids(large).await, vec!["big"]);
    assert_eq!(engine.active_activity_ids(small).await, vec!["small"]);
}

#[tokio::test]
async fn missing_outgoing_flow_rolls_the_start_back() {
    let engine = engine();
    engine
        .deploy(
            ProcessBuilder::new("strict")
                .start_event("start")
                .exclusive_gateway("check")
                .end_event("end")
                .connect("start", "check")
                .connect_if("check", "end", "${amount > 100}")
                .build(),
        )
        .await
        .expect("deploy");

    let err = engine
        .start_process_instance_by_key("strict", vars(&[("amount", json!(5))]))
        .await
        .expect_err("no flow can be taken");
    assert!(matches!(err, EngineError::NoOutgoingFlow(ref id) if id == "check"), "{}", err);
    assert!(
        engine
            .historic_activity_instances(&HistoricActivityQuery::new())
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn unknown_variable_in_condition_is_an_error() {
    let engine = engine();
    engine.deploy(routing()).await.expect("deploy");

    let err = engine
        .start_process_instance_by_key("routing", HashMap::new())
        .await
        .expect_err("amount is not set");
    assert!(matches!(err, EngineError::Expression { .. }), "{}", err);
}

#[tokio::test]
async fn script_task_writes_assignments_and_result() {
    let engine = engine();
    engine
        .deploy(
            ProcessBuilder::new("pricing")
                .start_event("start")
                .script_task("calc", "total = quantity * unitPrice; total * 2", Some("doubled"))
                .user_task("wait")
                .connect("start", "calc")
                .connect("calc", "wait")
                .build(),
        )
        .await
        .expect("deploy");

    let id = engine
        .start_process_instance_by_key("pricing", vars(&[("quantity", json!(3)), ("unitPrice", json!(10))]))
        .await
        .expect("start");

    assert_eq!(engine.get_variable(id, "total").await.expect("read"), Some(json!(30)));
    assert_eq!(engine.get_variable(id, "doubled").await.expect("read"), Some(json!(60)));
}

#[tokio::test]
async fn failing_service_leaves_the_instance_where_it_was() {
    let engine = engine();
    engine.register_handler(Arc::new(Failing {
        name: "charge".to_string(),
    }));
    engine
        .deploy(
            ProcessBuilder::new("checkout")
                .start_event("start")
                .user_task("review")
                .service_task("charge", "charge")
                .build()
                .end_event("end")
                .connect("start", "review")
                .connect("review", "charge")
                .connect("charge", "end")
                .build(),
        )
        .await
        .expect("deploy");

    let id = engine.start_process_instance_by_key("checkout", HashMap::new()).await.expect("start");
    let task = engine.find_execution(id, "review").await.expect("token at review");

    let err = engine
        .trigger(task, vars(&[("paid", json!(true))]))
        .await
        .expect_err("charge fails");
    assert!(matches!(err, EngineError::Service { ref handler, .. } if handler == "charge"), "{}", err);

    assert_eq!(engine.active_activity_ids(id).await, vec!["review"]);
    assert_eq!(engine.find_execution(id, "review").await, Some(task));
    assert_eq!(engine.get_variable(id, "paid").await.expect("read"), None);
}

#[tokio::test]
async fn variables_can_be_read_and_written_from_outside() {
    let engine = engine();
    engine.deploy(approval()).await.expect("deploy");
    let id = engine
        .start_process_instance_by_key("approval", vars(&[("amount", json!(10))]))
        .await
        .expect("start");
    let task = engine.find_execution(id, "review").await.expect("token at review");

    engine.set_variable(task, "amount", json!(20)).await.expect("update amount");
    engine.set_variable_local(task, "draft", json!("v1")).await.expect("local draft");

    assert_eq!(engine.get_variable(id, "amount").await.expect("read"), Some(json!(20)));
    assert_eq!(engine.get_variable(id, "draft").await.expect("read"), None);
    assert_eq!(
        engine.get_variables(task).await.expect("read all"),
        vars(&[("amount", json!(20)), ("draft", json!("v1"))])
    );
}

#[tokio::test]
async fn deleting_an_instance_records_the_reason() {
    let engine = engine();
    engine.deploy(approval()).await.expect("deploy");
    let id = engine.start_process_instance_by_key("approval", HashMap::new()).await.expect("start");

    engine.delete_process_instance(id, "cancelled by user").await.expect("delete");

    assert!(!engine.process_instance_exists(id).await);
    let history = engine.historic_process_instance(id).await.expect("history");
    assert_eq!(history.delete_reason.as_deref(), Some("cancelled by user"));
    assert!(history.end_time.is_some());

    let review = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id).activity_id("review"))
        .await;
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].delete_reason.as_deref(), Some("cancelled by user"));

    let err = engine.delete_process_instance(id, "again").await.expect_err("already gone");
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));
}

#[tokio::test]
async fn business_key_is_kept_on_instance_and_history() {
    let engine = engine();
    engine.deploy(approval()).await.expect("deploy");
    let id = engine
        .start_process_instance_with_business_key("approval", Some("order-42"), HashMap::new())
        .await
        .expect("start");

    let executions = engine.executions(id).await;
    assert_eq!(executions[0].id, id);
    assert_eq!(executions[0].business_key.as_deref(), Some("order-42"));
    let history = engine.historic_process_instance(id).await.expect("history");
    assert_eq!(history.business_key.as_deref(), Some("order-42"));
    assert_eq!(history.process_key, "approval");
}

#[tokio::test]
async fn endless_loop_hits_the_operation_limit() {
    let engine = ProcessEngine::new(EngineConfig {
        max_operations_per_command: 50,
        ..Default::default()
    });
    engine
        .deploy(
            ProcessBuilder::new("spin")
                .start_event("start")
                .exclusive_gateway("again")
                .task("work")
                .end_event("end")
                .connect("start", "again")
                .connect_if("again", "end", "${false}")
                .connect_default("again", "work")
                .connect("work", "again")
                .build(),
        )
        .await
        .expect("deploy");

    let err = engine
        .start_process_instance_by_key("spin", HashMap::new())
        .await
        .expect_err("loop never ends");
    assert!(matches!(err, EngineError::AgendaOverflow(50)), "{}", err);
}

#[tokio::test]
async fn unknown_targets_are_reported() {
    let engine = engine();
    engine.deploy(approval()).await.expect("deploy");

    let err = engine
        .trigger(Uuid::new_v4(), HashMap::new())
        .await
        .expect_err("no such execution");
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));

    let err = engine
        .get_variable(Uuid::new_v4(), "x")
        .await
        .expect_err("no such execution");
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));

    let err = engine
        .start_process_instance_by_key("nope", HashMap::new())
        .await
        .expect_err("no such process");
    assert!(matches!(err, EngineError::DefinitionNotFound(ref key) if key == "nope"));

    let id = engine.start_process_instance_by_key("approval", HashMap::new()).await.expect("start");
    let err = engine.trigger(id, HashMap::new()).await.expect_err("root does not wait");
    assert!(matches!(err, EngineError::IllegalState(_)), "{}", err);
}

#[derive(Debug)]
struct MarkVisited;

#[async_trait]
impl ActivityBehavior for MarkVisited {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> procession::Result<()> {
        ctx.set_variable(execution, "visited", json!(true))?;
        ctx.leave(execution);
        Ok(())
    }
}

struct MarkVisitedDefinition;

impl BehaviorDefinition for MarkVisitedDefinition {
    fn kind(&self) -> &str {
        "task"
    }

    fn prepare(&self, _graph: &ProcessGraph, _node: NodeIndex) -> anyhow::Result<Box<dyn ActivityBehavior>> {
        Ok(Box::new(MarkVisited))
    }
}

#[tokio::test]
async fn registered_behavior_replaces_a_node_kind() {
    let engine = engine();
    engine.register_behavior(Arc::new(MarkVisitedDefinition));
    engine
        .deploy(
            ProcessBuilder::new("custom")
                .start_event("start")
                .task("work")
                .end_event("end")
                .connect("start", "work")
                .connect("work", "end")
                .build(),
        )
        .await
        .expect("deploy");

    let id = engine.start_process_instance_by_key("custom", HashMap::new()).await.expect("start");
    assert_eq!(final_variables(&engine, id).await.get("visited"), Some(&json!(true)));
}

#[tokio::test]
async fn redeploying_creates_a_new_version() {
    let engine = engine();
    let first = engine.deploy(approval()).await.expect("deploy v1");
    let old = engine.start_process_instance_by_key("approval", HashMap::new()).await.expect("start v1");

    let second = engine
        .deploy(
            ProcessBuilder::new("approval")
                .start_event("start")
                .user_task("check")
                .end_event("end")
                .connect("start", "check")
                .connect("check", "end")
                .build(),
        )
        .await
        .expect("deploy v2");
    assert_eq!((first.version, second.version), (1, 2));
    assert_eq!(engine.definition("approval").expect("latest").version, 2);
    assert_eq!(engine.definitions().len(), 1);

    let new = engine.start_process_instance_by_key("approval", HashMap::new()).await.expect("start v2");
    assert_eq!(engine.active_activity_ids(new).await, vec!["check"]);
    assert_eq!(engine.historic_process_instance(new).await.expect("history").process_version, 2);

    // running instances stay on the version they started with
    let task = engine.find_execution(old, "review").await.expect("old instance at review");
    engine.trigger(task, HashMap::new()).await.expect("complete old review");
    assert!(!engine.process_instance_exists(old).await);
}

#[tokio::test]
async fn deployment_checks_service_handlers() {
    let engine = engine();

    let err = engine
        .deploy(
            ProcessBuilder::new("unknown-handler")
                .start_event("start")
                .service_task("charge", "payments")
                .build()
                .connect("start", "charge")
                .build(),
        )
        .await
        .expect_err("handler is missing");
    assert!(matches!(err, EngineError::Deployment(_)));
    assert!(err.to_string().contains("Service handler not found: payments"), "{}", err);

    let err = engine
        .deploy(
            ProcessBuilder::new("bad-params")
                .start_event("start")
                .service_task("set", "assign")
                .build()
                .connect("start", "set")
                .build(),
        )
        .await
        .expect_err("assign without parameters");
    assert!(err.to_string().contains("Invalid parameters for node set"), "{}", err);
    assert!(engine.definition("bad-params").is_none());
}

#[tokio::test]
async fn service_result_object_sets_each_field_without_output() {
    let engine = engine();
    engine
        .deploy(
            ProcessBuilder::new("defaults")
                .start_event("start")
                .service_task("init", "assign")
                .param(
                    "assignments",
                    json!([{ "key": "status", "value": "open" }, { "key": "priority", "value": 2 }]),
                )
                .build()
                .user_task("wait")
                .connect("start", "init")
                .connect("init", "wait")
                .build(),
        )
        .await
        .expect("deploy");

    let id = engine.start_process_instance_by_key("defaults", HashMap::new()).await.expect("start");
    assert_eq!(engine.get_variable(id, "status").await.expect("read"), Some(json!("open")));
    assert_eq!(engine.get_variable(id, "priority").await.expect("read"), Some(json!(2)));
}
