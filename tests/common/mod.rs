#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use procession::actions::{ServiceCall, ServiceError, ServiceHandler};
use procession::runtime::clock::ManualClock;
use procession::runtime::history::HistoryLevel;
use procession::{EngineConfig, ProcessEngine};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Records the activity id of every call; returns `Null`.
#[derive(Debug)]
pub struct Recorder {
    name: String,
    calls: Mutex<Vec<String>>,
    params: Mutex<Vec<Value>>,
}

impl Recorder {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("recorder lock").clone()
    }

    pub fn params(&self) -> Vec<Value> {
        self.params.lock().expect("recorder lock").clone()
    }
}

#[async_trait]
impl ServiceHandler for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, call: ServiceCall) -> Result<Value, ServiceError> {
        self.calls.lock().expect("recorder lock").push(call.activity_id.clone());
        self.params.lock().expect("recorder lock").push(call.params.clone());
        Ok(Value::Null)
    }
}

/// Always fails with a technical error.
#[derive(Debug)]
pub struct Failing {
    pub name: String,
}

#[async_trait]
impl ServiceHandler for Failing {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _call: ServiceCall) -> Result<Value, ServiceError> {
        Err(ServiceError::Failure(anyhow!("boom")))
    }
}

/// Raises a BPMN error with the code given in the `code` parameter.
#[derive(Debug)]
pub struct RaiseBpmnError;

#[async_trait]
impl ServiceHandler for RaiseBpmnError {
    fn name(&self) -> &str {
        "raise"
    }

    async fn execute(&self, call: ServiceCall) -> Result<Value, ServiceError> {
        let code = call.param("code").and_then(Value::as_str).unwrap_or("UNKNOWN");
        Err(ServiceError::bpmn(code))
    }
}

pub fn full_history() -> EngineConfig {
    EngineConfig {
        history_level: HistoryLevel::Full,
        ..Default::default()
    }
}

pub fn engine() -> ProcessEngine {
    ProcessEngine::new(full_history())
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 8, 0, 0).single().expect("valid start time")
}

pub fn engine_with_clock(config: EngineConfig) -> (ProcessEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_time()));
    (ProcessEngine::with_clock(config, clock.clone()), clock)
}

pub fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Final variables of an ended instance, as recorded in full history.
pub async fn final_variables(engine: &ProcessEngine, instance: uuid::Uuid) -> HashMap<String, Value> {
    engine
        .historic_process_instance(instance)
        .await
        .expect("instance should have history")
        .variables
}

pub async fn end_activity(engine: &ProcessEngine, instance: uuid::Uuid) -> Option<String> {
    engine
        .historic_process_instance(instance)
        .await
        .expect("instance should have history")
        .end_activity_id
}
