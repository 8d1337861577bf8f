mod common;

use common::{engine, vars};
use procession::dsl::builder::ProcessBuilder;
use procession::dsl::ProcessDefinition;
use procession::runtime::history::{HistoricActivityQuery, HistoryLevel};
use procession::{EngineConfig, ProcessEngine};
use serde_json::json;
use uuid::Uuid;

fn two_steps() -> ProcessDefinition {
    ProcessBuilder::new("steps")
        .start_event("start")
        .task("prepare")
        .user_task("approve")
        .end_event("end")
        .connect("start", "prepare")
        .connect("prepare", "approve")
        .connect("approve", "end")
        .build()
}

fn with_level(level: HistoryLevel) -> ProcessEngine {
    ProcessEngine::new(EngineConfig {
        history_level: level,
        ..Default::default()
    })
}

async fn run_to_approval(engine: &ProcessEngine) -> Uuid {
    engine.deploy(two_steps()).await.expect("deploy");
    engine
        .start_process_instance_by_key("steps", vars(&[("amount", json!(5))]))
        .await
        .expect("start")
}

async fn approve(engine: &ProcessEngine, id: Uuid) {
    let task = engine.find_execution(id, "approve").await.expect("waiting at approve");
    engine
        .trigger(task, vars(&[("approved", json!(true))]))
        .await
        .expect("approve");
}

fn activity_ids(activities: &[procession::runtime::history::HistoricActivityInstance]) -> Vec<&str> {
    activities.iter().map(|a| a.activity_id.as_str()).collect()
}

#[tokio::test]
async fn activity_level_records_every_visited_node() {
    let engine = with_level(HistoryLevel::Activity);
    let id = run_to_approval(&engine).await;

    let all = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id))
        .await;
    assert_eq!(activity_ids(&all), vec!["start", "prepare", "approve"]);
    assert_eq!(all[2].activity_type, "userTask");

    let open = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id).unfinished())
        .await;
    assert_eq!(activity_ids(&open), vec!["approve"]);
    assert!(open[0].end_time.is_none());

    approve(&engine, id).await;
    let finished = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id).finished())
        .await;
    assert_eq!(activity_ids(&finished), vec!["start", "prepare", "approve", "end"]);

    let instance = engine.historic_process_instance(id).await.expect("instance history");
    assert_eq!(instance.process_version, 1);
    assert_eq!(instance.end_activity_id.as_deref(), Some("end"));
    assert!(instance.end_time.is_some_and(|end| end >= instance.start_time));
    // variables are only kept at full level
    assert!(instance.variables.is_empty());
    assert!(engine.historic_variable_updates(id).await.is_empty());
}

#[tokio::test]
async fn instance_level_skips_activities() {
    let engine = with_level(HistoryLevel::Instance);
    let id = run_to_approval(&engine).await;
    approve(&engine, id).await;

    assert!(engine.historic_process_instance(id).await.is_some());
    assert!(
        engine
            .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id))
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn none_level_records_nothing() {
    let engine = with_level(HistoryLevel::None);
    let id = run_to_approval(&engine).await;
    approve(&engine, id).await;

    assert!(engine.historic_process_instance(id).await.is_none());
    assert!(
        engine
            .historic_activity_instances(&HistoricActivityQuery::new())
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn full_level_keeps_variable_updates_and_final_values() {
    let engine = engine();
    let id = run_to_approval(&engine).await;
    approve(&engine, id).await;

    let updates = engine.historic_variable_updates(id).await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].name, "approved");
    assert_eq!(updates[0].value, json!(true));
    assert_eq!(updates[0].execution_id, id);

    let instance = engine.historic_process_instance(id).await.expect("instance history");
    assert_eq!(instance.variables, vars(&[("amount", json!(5)), ("approved", json!(true))]));
}

#[tokio::test]
async fn activity_query_filters_by_activity() {
    let engine = engine();
    let first = run_to_approval(&engine).await;
    let second = engine
        .start_process_instance_by_key("steps", vars(&[("amount", json!(6))]))
        .await
        .expect("start");

    let approvals = engine
        .historic_activity_instances(&HistoricActivityQuery::new().activity_id("approve"))
        .await;
    let instances: Vec<Uuid> = approvals.iter().map(|a| a.process_instance_id).collect();
    assert_eq!(instances.len(), 2);
    assert!(instances.contains(&first) && instances.contains(&second));
}

#[tokio::test]
async fn terminate_end_is_recorded_as_the_end_activity() {
    let engine = engine();
    engine
        .deploy(
            ProcessBuilder::new("abort")
                .start_event("start")
                .parallel_gateway("fork")
                .user_task("wait")
                .terminate_end("stop")
                .connect("start", "fork")
                .connect("fork", "wait")
                .connect("fork", "stop")
                .build(),
        )
        .await
        .expect("deploy");
    let id = engine
        .start_process_instance_by_key("abort", vars(&[("amount", json!(1))]))
        .await
        .expect("start");

    assert!(!engine.process_instance_exists(id).await);
    let instance = engine.historic_process_instance(id).await.expect("instance history");
    assert_eq!(instance.end_activity_id.as_deref(), Some("stop"));
    assert_eq!(instance.delete_reason.as_deref(), Some("terminated by stop"));
    let wait = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id).activity_id("wait"))
        .await;
    assert_eq!(wait[0].delete_reason.as_deref(), Some("terminated by stop"));
}
