use std::collections::HashMap;
use uuid::Uuid;

use crate::runtime::execution::ExecutionTree;
use crate::runtime::history::{HistoryLevel, HistoryStore};
use crate::runtime::job::Job;
use crate::runtime::subscription::{EventSubscription, EventType};

/// All runtime state of the engine. Commands work on a clone and the engine
/// swaps it in only when the command succeeds.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub executions: ExecutionTree,
    pub subscriptions: HashMap<Uuid, EventSubscription>,
    pub jobs: HashMap<Uuid, Job>,
    pub dead_letter_jobs: HashMap<Uuid, Job>,
    pub history: HistoryStore,
    sequence: u64,
}

impl EngineState {
    pub fn new(history_level: HistoryLevel) -> Self {
        Self {
            history: HistoryStore::new(history_level),
            ..Default::default()
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Subscriptions matching a type and name, oldest first.
    pub fn subscriptions_named(&self, event_type: EventType, name: &str) -> Vec<EventSubscription> {
        let mut matching: Vec<EventSubscription> = self
            .subscriptions
            .values()
            .filter(|s| s.event_type == event_type && s.event_name == name)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created);
        matching
    }

    pub fn subscriptions_of(&self, execution_id: Uuid) -> Vec<EventSubscription> {
        let mut owned: Vec<EventSubscription> = self
            .subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        owned.sort_by_key(|s| s.created);
        owned
    }
}
