mod common;

use chrono::Duration;
use common::{Failing, Recorder, end_activity, engine, engine_with_clock, full_history, start_time, vars};
use procession::dsl::builder::ProcessBuilder;
use procession::dsl::{EventDefinition, ProcessDefinition};
use procession::runtime::job::{JobExecutor, JobKind};
use procession::{EngineConfig, EngineError, ProcessEngine};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn async_work(handler: &str) -> ProcessDefinition {
    ProcessBuilder::new("background")
        .start_event("start")
        .service_task("work", handler)
        .build()
        .asynchronous("work")
        .end_event("end")
        .connect("start", "work")
        .connect("work", "end")
        .build()
}

#[tokio::test]
async fn asynchronous_activity_runs_as_a_job() {
    let engine = engine();
    let work = Recorder::new("work");
    engine.register_handler(work.clone());
    engine.deploy(async_work("work")).await.expect("deploy");

    let id = engine.start_process_instance_by_key("background", HashMap::new()).await.expect("start");
    assert!(work.calls().is_empty());
    assert_eq!(engine.active_activity_ids(id).await, vec!["work"]);
    let jobs = engine.jobs(Some(id)).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::AsyncContinuation);
    assert_eq!(jobs[0].activity_id, "work");
    assert_eq!(jobs[0].retries, 3);

    assert_eq!(engine.run_due_jobs().await, 1);
    assert_eq!(work.calls(), vec!["work"]);
    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("end"));
}

#[tokio::test]
async fn failing_job_is_retried_then_dead_lettered() {
    let (engine, clock) = engine_with_clock(full_history());
    engine.register_handler(Arc::new(Failing {
        name: "flaky".to_string(),
    }));
    engine.deploy(async_work("flaky")).await.expect("deploy");
    let id = engine.start_process_instance_by_key("background", HashMap::new()).await.expect("start");
    let job_id = engine.jobs(Some(id)).await[0].id;

    let err = engine.execute_job(job_id).await.expect_err("handler fails");
    assert!(matches!(err, EngineError::Service { .. }), "{}", err);
    let job = engine.jobs(Some(id)).await.remove(0);
    assert_eq!(job.retries, 2);
    assert_eq!(job.due, start_time() + Duration::seconds(10));
    assert!(job.exception_message.as_deref().is_some_and(|m| m.contains("boom")));

    for _ in 0..2 {
        clock.advance(Duration::seconds(10));
        assert_eq!(engine.run_due_jobs().await, 0);
    }
    assert!(engine.jobs(Some(id)).await.is_empty());
    let dead = engine.dead_letter_jobs().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
    assert_eq!(dead[0].retries, 0);
    assert_eq!(engine.active_activity_ids(id).await, vec!["work"]);

    let fixed = Recorder::new("flaky");
    engine.register_handler(fixed.clone());
    engine.retry_dead_letter_job(job_id, 2).await.expect("retry");
    assert!(engine.dead_letter_jobs().await.is_empty());
    assert_eq!(engine.run_due_jobs().await, 1);
    assert_eq!(fixed.calls(), vec!["work"]);
    assert!(!engine.process_instance_exists(id).await);

    let err = engine.retry_dead_letter_job(job_id, 1).await.expect_err("job is gone");
    assert!(matches!(err, EngineError::JobNotFound(_)));
}

#[tokio::test]
async fn recorded_failure_counts_against_retries() {
    let (engine, _clock) = engine_with_clock(full_history());
    engine.register_handler(Recorder::new("work"));
    engine.deploy(async_work("work")).await.expect("deploy");
    let id = engine.start_process_instance_by_key("background", HashMap::new()).await.expect("start");

    let acquired = engine.acquire_due_jobs("worker-1").await;
    assert_eq!(acquired.len(), 1);
    let job = engine.jobs(Some(id)).await.remove(0);
    assert_eq!(job.lock_owner.as_deref(), Some("worker-1"));
    // locked jobs are not handed out twice
    assert!(engine.acquire_due_jobs("worker-2").await.is_empty());

    engine.record_job_failure(acquired[0], "timed out").await;
    let job = engine.jobs(Some(id)).await.remove(0);
    assert_eq!(job.retries, 2);
    assert_eq!(job.exception_message.as_deref(), Some("timed out"));
    assert!(job.lock_owner.is_none());
}

#[tokio::test]
async fn timer_duration_can_come_from_a_variable() {
    let (engine, clock) = engine_with_clock(full_history());
    engine
        .deploy(
            ProcessBuilder::new("delayed")
                .start_event("start")
                .timer_catch("pause", "${delay}")
                .end_event("end")
                .connect("start", "pause")
                .connect("pause", "end")
                .build(),
        )
        .await
        .expect("deploy");

    let id = engine
        .start_process_instance_by_key("delayed", vars(&[("delay", json!("PT2H"))]))
        .await
        .expect("start");
    let jobs = engine.jobs(Some(id)).await;
    assert_eq!(jobs[0].kind, JobKind::Timer);
    assert_eq!(jobs[0].due, start_time() + Duration::hours(2));

    clock.advance(Duration::hours(2));
    assert_eq!(engine.run_due_jobs().await, 1);
    assert_eq!(end_activity(&engine, id).await.as_deref(), Some("end"));

    let err = engine
        .start_process_instance_by_key("delayed", vars(&[("delay", json!("two hours"))]))
        .await
        .expect_err("not a duration");
    assert!(matches!(err, EngineError::InvalidTimer(_)), "{}", err);
}

#[tokio::test]
async fn timer_date_fires_at_the_given_time() {
    let (engine, clock) = engine_with_clock(full_history());
    engine
        .deploy(
            ProcessBuilder::new("appointment")
                .start_event("start")
                .catch_event(
                    "nineOClock",
                    EventDefinition::Timer {
                        duration: None,
                        date: Some("2030-01-01T09:00:00Z".to_string()),
                        cycle: None,
                    },
                )
                .end_event("end")
                .connect("start", "nineOClock")
                .connect("nineOClock", "end")
                .build(),
        )
        .await
        .expect("deploy");
    let id = engine.start_process_instance_by_key("appointment", HashMap::new()).await.expect("start");

    clock.advance(Duration::minutes(30));
    assert_eq!(engine.run_due_jobs().await, 0);
    clock.advance(Duration::minutes(30));
    assert_eq!(engine.run_due_jobs().await, 1);
    assert!(!engine.process_instance_exists(id).await);
}

#[tokio::test]
async fn timer_start_event_starts_instances_until_redeployed() {
    let (engine, clock) = engine_with_clock(full_history());
    let ping = Recorder::new("ping");
    engine.register_handler(ping.clone());
    let hourly = || {
        ProcessBuilder::new("hourly")
            .event_start("tick", EventDefinition::timer_cycle("R/PT1H"), true)
            .service_task("ping", "ping")
            .build()
            .end_event("end")
            .connect("tick", "ping")
            .connect("ping", "end")
            .build()
    };
    engine.deploy(hourly()).await.expect("deploy v1");

    let jobs = engine.jobs(None).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::TimerStart);
    assert_eq!(jobs[0].graph_key, "hourly:1");
    assert_eq!(jobs[0].due, start_time() + Duration::hours(1));

    for fired in 1..=2 {
        clock.advance(Duration::hours(1));
        assert_eq!(engine.run_due_jobs().await, 1);
        assert_eq!(ping.calls().len(), fired);
    }

    engine.deploy(hourly()).await.expect("deploy v2");
    let jobs = engine.jobs(None).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].graph_key, "hourly:2");
    assert_eq!(jobs[0].due, start_time() + Duration::hours(3));
}

#[tokio::test]
async fn job_executor_drives_jobs_in_the_background() {
    let engine = Arc::new(ProcessEngine::new(EngineConfig {
        job_executor: procession::config::JobExecutorConfig {
            poll_interval_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    }));
    let work = Recorder::new("work");
    engine.register_handler(work.clone());
    engine.deploy(async_work("work")).await.expect("deploy");
    let id = engine.start_process_instance_by_key("background", HashMap::new()).await.expect("start");

    let handle = JobExecutor::new(engine.clone()).start();
    for _ in 0..200 {
        if !engine.process_instance_exists(id).await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert!(!engine.process_instance_exists(id).await);
    assert_eq!(work.calls(), vec!["work"]);
}

#[tokio::test]
async fn failed_deployment_leaves_the_previous_version_live() {
    let (engine, _clock) = engine_with_clock(full_history());
    let ticker = |cycle: &str| {
        ProcessBuilder::new("ticker")
            .event_start("tick", EventDefinition::timer_cycle(cycle), true)
            .end_event("end")
            .connect("tick", "end")
            .build()
    };
    engine.deploy(ticker("R/PT1H")).await.expect("deploy v1");

    let err = engine
        .deploy(ticker("${interval}"))
        .await
        .expect_err("interval is unknown at deployment");
    assert!(matches!(err, EngineError::Expression { .. }), "{}", err);
    assert_eq!(engine.definition("ticker").map(|graph| graph.version), Some(1));
    let jobs = engine.jobs(None).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].graph_key, "ticker:1");

    let redeployed = engine.deploy(ticker("R/PT2H")).await.expect("deploy v2");
    assert_eq!(redeployed.version, 2);
    assert_eq!(engine.jobs(None).await[0].graph_key, "ticker:2");
}

#[tokio::test]
async fn out_of_range_timer_is_rejected() {
    let engine = engine();
    let err = engine
        .deploy(
            ProcessBuilder::new("forever")
                .start_event("start")
                .timer_catch("wait", "P999999999999Y")
                .end_event("end")
                .connect("start", "wait")
                .connect("wait", "end")
                .build(),
        )
        .await
        .expect_err("duration does not fit");
    assert!(matches!(err, EngineError::Deployment(_)), "{}", err);

    engine
        .deploy(
            ProcessBuilder::new("later")
                .start_event("start")
                .timer_catch("wait", "${delay}")
                .end_event("end")
                .connect("start", "wait")
                .connect("wait", "end")
                .build(),
        )
        .await
        .expect("deploy");
    let err = engine
        .start_process_instance_by_key("later", vars(&[("delay", json!("P100000000Y"))]))
        .await
        .expect_err("due date out of range");
    assert!(matches!(err, EngineError::InvalidTimer(_)), "{}", err);
}
