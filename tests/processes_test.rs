mod common;

use chrono::Duration;
use common::{end_activity, engine, engine_with_clock, final_variables, full_history, vars};
use procession::ProcessEngine;
use procession::compiler::load_process_from_yaml;
use procession::runtime::history::HistoricActivityQuery;
use serde_json::json;
use std::path::Path;

async fn deploy_bundled(engine: &ProcessEngine, file: &str) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("processes").join(file);
    let definition = load_process_from_yaml(&path).expect("bundled process should load");
    engine.deploy(definition).await.expect("bundled process should deploy");
}

#[tokio::test]
async fn order_fulfillment_packs_and_invoices() {
    let engine = engine();
    deploy_bundled(&engine, "order_fulfillment.yaml").await;

    let small = engine
        .start_process_instance_by_key("order-fulfillment", vars(&[("quantity", json!(2)), ("unitPrice", json!(100))]))
        .await
        .expect("start small order");
    assert_eq!(end_activity(&engine, small).await.as_deref(), Some("end"));
    let variables = final_variables(&engine, small).await;
    assert_eq!(variables.get("total"), Some(&json!(200)));
    assert_eq!(variables.get("packing"), Some(&json!("packed")));
    assert_eq!(variables.get("invoiceAmount"), Some(&json!(215)));
    let reviews = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(small).activity_id("review"))
        .await;
    assert!(reviews.is_empty());

    let large = engine
        .start_process_instance_by_key("order-fulfillment", vars(&[("quantity", json!(20)), ("unitPrice", json!(100))]))
        .await
        .expect("start large order");
    assert_eq!(end_activity(&engine, large).await.as_deref(), Some("end"));
    let reviews = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(large).activity_id("review"))
        .await;
    assert_eq!(reviews.len(), 1);
}

#[tokio::test]
async fn approval_reminder_escalates_after_the_deadline() {
    let (engine, clock) = engine_with_clock(full_history());
    deploy_bundled(&engine, "approval_reminder.yaml").await;
    let id = engine
        .start_process_instance_by_key("approval-reminder", Default::default())
        .await
        .expect("start");

    clock.advance(Duration::seconds(1));
    assert_eq!(engine.run_due_jobs().await, 1);
    assert_eq!(engine.active_activity_ids(id).await, vec!["approve"]);

    clock.advance(Duration::seconds(2));
    assert_eq!(engine.run_due_jobs().await, 2);

    assert!(!engine.process_instance_exists(id).await);
    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("rejected"));
    assert_eq!(final_variables(&engine, id).await.get("decision"), Some(&json!("rejected")));
    let reminders = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id).activity_id("sendReminder"))
        .await;
    assert_eq!(reminders.len(), 2);
}

#[tokio::test]
async fn approval_reminder_can_be_approved_in_time() {
    let (engine, _clock) = engine_with_clock(full_history());
    deploy_bundled(&engine, "approval_reminder.yaml").await;
    let id = engine
        .start_process_instance_by_key("approval-reminder", Default::default())
        .await
        .expect("start");

    let task = engine.find_execution(id, "approve").await.expect("waiting approval");
    engine
        .trigger(task, vars(&[("decision", json!("approved"))]))
        .await
        .expect("approve");

    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("approved"));
    assert!(engine.jobs(None).await.is_empty());
}

#[tokio::test]
async fn document_review_publishes_with_enough_reviewers() {
    let engine = engine();
    deploy_bundled(&engine, "document_review.yaml").await;

    let id = engine
        .start_process_instance_by_key("document-review", vars(&[("reviewers", json!(["ann", "bob"]))]))
        .await
        .expect("start");

    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("done"));
    assert_eq!(final_variables(&engine, id).await.get("reviewCount"), Some(&json!(2)));
    let reviews = engine
        .historic_activity_instances(&HistoricActivityQuery::new().process_instance_id(id).activity_id("review"))
        .await;
    assert_eq!(reviews.len(), 2);
}

#[tokio::test]
async fn document_review_falls_back_to_draft() {
    let engine = engine();
    deploy_bundled(&engine, "document_review.yaml").await;

    let id = engine
        .start_process_instance_by_key("document-review", vars(&[("reviewers", json!(["ann"]))]))
        .await
        .expect("start");

    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("draft"));
    let variables = final_variables(&engine, id).await;
    assert_eq!(variables.get("status"), Some(&json!("draft")));
    assert_eq!(variables.get("errorCode"), Some(&json!("TOO_FEW_REVIEWS")));
    assert_eq!(variables.get("reviewCount"), Some(&json!(1)));
}
