mod common;

use common::{Recorder, end_activity, engine, final_variables, vars};
use procession::EngineError;
use procession::dsl::builder::ProcessBuilder;
use procession::dsl::{EventDefinition, ProcessDefinition};
use serde_json::json;
use std::collections::HashMap;

fn listener() -> ProcessDefinition {
    ProcessBuilder::new("listener")
        .start_event("start")
        .signal_catch("waitForGo", "go")
        .end_event("end")
        .connect("start", "waitForGo")
        .connect("waitForGo", "end")
        .build()
}

fn payment_wait() -> ProcessDefinition {
    ProcessBuilder::new("invoice")
        .start_event("start")
        .message_catch("awaitPayment", "payment")
        .end_event("paid")
        .connect("start", "awaitPayment")
        .connect("awaitPayment", "paid")
        .build()
}

#[tokio::test]
async fn signal_reaches_every_waiting_instance() {
    let engine = engine();
    engine.deploy(listener()).await.expect("deploy");
    let first = engine.start_process_instance_by_key("listener", HashMap::new()).await.expect("start");
    let second = engine.start_process_instance_by_key("listener", HashMap::new()).await.expect("start");

    let received = engine
        .signal_event_received("go", vars(&[("by", json!("ops"))]))
        .await
        .expect("broadcast");
    assert_eq!(received, 2);

    for id in [first, second] {
        assert!(!engine.process_instance_exists(id).await);
        assert_eq!(final_variables(&engine, id).await.get("by"), Some(&json!("ops")));
    }
    assert_eq!(engine.signal_event_received("go", HashMap::new()).await.expect("broadcast"), 0);
}

#[tokio::test]
async fn signal_start_event_creates_an_instance() {
    let engine = engine();
    let alarm = Recorder::new("alarm");
    engine.register_handler(alarm.clone());
    engine
        .deploy(
            ProcessBuilder::new("onAlarm")
                .event_start("alarmed", EventDefinition::signal("alarm"), true)
                .service_task("handle", "alarm")
                .build()
                .end_event("end")
                .connect("alarmed", "handle")
                .connect("handle", "end")
                .build(),
        )
        .await
        .expect("deploy");

    assert_eq!(engine.signal_event_received("alarm", HashMap::new()).await.expect("signal"), 1);
    assert_eq!(alarm.calls(), vec!["handle"]);
}

#[tokio::test]
async fn thrown_signal_resumes_another_process() {
    let engine = engine();
    engine.deploy(listener()).await.expect("deploy listener");
    engine
        .deploy(
            ProcessBuilder::new("announcer")
                .start_event("start")
                .signal_throw("shout", "go")
                .end_event("end")
                .connect("start", "shout")
                .connect("shout", "end")
                .build(),
        )
        .await
        .expect("deploy announcer");

    let waiting = engine.start_process_instance_by_key("listener", HashMap::new()).await.expect("start listener");
    let announcer = engine.start_process_instance_by_key("announcer", HashMap::new()).await.expect("start announcer");

    assert!(!engine.process_instance_exists(announcer).await);
    assert!(!engine.process_instance_exists(waiting).await);
    assert_eq!(end_activity(&engine, waiting).await.as_deref(), Some("end"));
}

#[tokio::test]
async fn correlation_needs_exactly_one_receiver() {
    let engine = engine();
    engine.deploy(payment_wait()).await.expect("deploy");
    let first = engine.start_process_instance_by_key("invoice", HashMap::new()).await.expect("start");
    let second = engine.start_process_instance_by_key("invoice", HashMap::new()).await.expect("start");

    let err = engine
        .correlate_message("payment", None, HashMap::new())
        .await
        .expect_err("two instances wait for payment");
    assert!(matches!(err, EngineError::AmbiguousCorrelation(ref name) if name == "payment"), "{}", err);

    let receiver = engine
        .correlate_message("payment", Some(first), vars(&[("amount", json!(99))]))
        .await
        .expect("correlate to first");
    assert_eq!(receiver, first);
    assert!(!engine.process_instance_exists(first).await);
    assert_eq!(final_variables(&engine, first).await.get("amount"), Some(&json!(99)));
    assert_eq!(engine.active_activity_ids(second).await, vec!["awaitPayment"]);

    let err = engine
        .correlate_message("refund", Some(second), HashMap::new())
        .await
        .expect_err("nobody waits for refunds");
    assert!(
        matches!(err, EngineError::NoSubscription { ref event_type, ref name } if event_type == "message" && name == "refund"),
        "{}",
        err
    );
}

#[tokio::test]
async fn message_start_event_creates_an_instance() {
    let engine = engine();
    engine
        .deploy(
            ProcessBuilder::new("order")
                .event_start("received", EventDefinition::message("newOrder"), true)
                .user_task("review")
                .connect("received", "review")
                .build(),
        )
        .await
        .expect("deploy");

    let id = engine
        .correlate_message("newOrder", None, vars(&[("item", json!("book"))]))
        .await
        .expect("message starts an instance");
    assert_eq!(engine.active_activity_ids(id).await, vec!["review"]);
    assert_eq!(engine.get_variable(id, "item").await.expect("read"), Some(json!("book")));

    let direct = engine
        .start_process_instance_by_message("newOrder", HashMap::new())
        .await
        .expect("start by message");
    assert_ne!(direct, id);

    let err = engine
        .start_process_instance_by_message("unknown", HashMap::new())
        .await
        .expect_err("no message start for unknown");
    assert!(matches!(err, EngineError::NoSubscription { .. }), "{}", err);

    // only the message can start it
    let err = engine
        .start_process_instance_by_key("order", HashMap::new())
        .await
        .expect_err("no none start event");
    assert!(
        matches!(err, EngineError::IllegalState(ref message) if message.contains("starts by message, signal or timer")),
        "{}",
        err
    );
}

#[tokio::test]
async fn receive_task_waits_for_its_message() {
    let engine = engine();
    engine
        .deploy(
            ProcessBuilder::new("shipping")
                .start_event("start")
                .receive_task("awaitPickup", "pickedUp")
                .end_event("end")
                .connect("start", "awaitPickup")
                .connect("awaitPickup", "end")
                .build(),
        )
        .await
        .expect("deploy");
    let id = engine.start_process_instance_by_key("shipping", HashMap::new()).await.expect("start");
    let task = engine.find_execution(id, "awaitPickup").await.expect("waiting receive task");

    let err = engine
        .message_event_received("delivered", task, HashMap::new())
        .await
        .expect_err("wrong message");
    assert!(matches!(err, EngineError::NoSubscription { .. }), "{}", err);

    engine
        .message_event_received("pickedUp", task, vars(&[("carrier", json!("UPS"))]))
        .await
        .expect("deliver message");
    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("end"));
    assert_eq!(final_variables(&engine, id).await.get("carrier"), Some(&json!("UPS")));
}
