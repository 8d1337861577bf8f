use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryLevel {
    None,
    Instance,
    #[default]
    Activity,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricProcessInstance {
    pub id: Uuid,
    pub process_key: String,
    pub process_version: u32,
    pub business_key: Option<String>,
    pub super_process_instance_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_activity_id: Option<String>,
    pub delete_reason: Option<String>,
    /// Variables at the end of the instance; recorded at `full` level.
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricActivityInstance {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub delete_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricVariableUpdate {
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub name: String,
    pub value: Value,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoricActivityQuery {
    process_instance_id: Option<Uuid>,
    activity_id: Option<String>,
    finished: Option<bool>,
}

impl HistoricActivityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_instance_id(mut self, id: Uuid) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn activity_id(mut self, activity_id: &str) -> Self {
        self.activity_id = Some(activity_id.to_string());
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = Some(true);
        self
    }

    pub fn unfinished(mut self) -> Self {
        self.finished = Some(false);
        self
    }

    fn matches(&self, activity: &HistoricActivityInstance) -> bool {
        self.process_instance_id.is_none_or(|id| activity.process_instance_id == id)
            && self.activity_id.as_ref().is_none_or(|id| &activity.activity_id == id)
            && self.finished.is_none_or(|f| activity.end_time.is_some() == f)
    }
}

/// History records. Lives in the engine state, so it commits and rolls back with commands.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    level: HistoryLevel,
    process_instances: HashMap<Uuid, HistoricProcessInstance>,
    activities: Vec<HistoricActivityInstance>,
    activity_index: HashMap<Uuid, usize>,
    variable_updates: Vec<HistoricVariableUpdate>,
}

impl HistoryStore {
    pub fn new(level: HistoryLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn level(&self) -> HistoryLevel {
        self.level
    }

    pub fn start_process(&mut self, instance: HistoricProcessInstance) {
        if self.level >= HistoryLevel::Instance {
            self.process_instances.insert(instance.id, instance);
        }
    }

    pub fn end_process(
        &mut self,
        id: Uuid,
        end_activity_id: Option<String>,
        delete_reason: Option<String>,
        variables: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) {
        let full = self.level >= HistoryLevel::Full;
        if let Some(instance) = self.process_instances.get_mut(&id) {
            if instance.end_time.is_some() {
                return;
            }
            instance.end_time = Some(now);
            instance.end_activity_id = end_activity_id;
            instance.delete_reason = delete_reason;
            if full {
                instance.variables = variables;
            }
        }
    }

    pub fn start_activity(&mut self, activity: HistoricActivityInstance) {
        if self.level >= HistoryLevel::Activity {
            self.activity_index.insert(activity.id, self.activities.len());
            self.activities.push(activity);
        }
    }

    pub fn end_activity(&mut self, id: Uuid, delete_reason: Option<String>, now: DateTime<Utc>) {
        if let Some(&index) = self.activity_index.get(&id) {
            let activity = &mut self.activities[index];
            if activity.end_time.is_none() {
                activity.end_time = Some(now);
                activity.delete_reason = delete_reason;
            }
        }
    }

    pub fn variable_updated(&mut self, update: HistoricVariableUpdate) {
        if self.level >= HistoryLevel::Full {
            self.variable_updates.push(update);
        }
    }

    pub fn process_instance(&self, id: Uuid) -> Option<&HistoricProcessInstance> {
        self.process_instances.get(&id)
    }

    pub fn activities(&self, query: &HistoricActivityQuery) -> Vec<HistoricActivityInstance> {
        self.activities
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect()
    }

    pub fn variable_updates(&self, process_instance_id: Uuid) -> Vec<HistoricVariableUpdate> {
        self.variable_updates
            .iter()
            .filter(|u| u.process_instance_id == process_instance_id)
            .cloned()
            .collect()
    }
}
