use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actions::ServiceHandler;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runtime::agenda::{Agenda, Operation};
use crate::runtime::clock::Clock;
use crate::runtime::execution::{Execution, ExecutionTree};
use crate::runtime::graph::{EventTrigger, NodeIndex, ProcessGraph};
use crate::runtime::history::{HistoricActivityInstance, HistoricProcessInstance, HistoricVariableUpdate};
use crate::runtime::job::{Job, JobKind};
use crate::runtime::operations;
use crate::runtime::repository::{PreparedBehaviors, Repository};
use crate::runtime::storage::EngineState;
use crate::runtime::subscription::{EventSubscription, EventType};
use crate::runtime::timer::{Repeat, TimerDefinition};

/// 命令上下文 (one transactional command)
///
/// Owns a working copy of the engine state and the agenda. Behaviors mutate
/// state and plan operations through it; the engine commits the copy only when
/// the whole agenda ran without error.
pub struct CommandContext {
    state: EngineState,
    agenda: Agenda,
    repository: Arc<Repository>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    // Scopes whose tokens moved during this command
    moved_in: Vec<Uuid>,
}

impl CommandContext {
    pub fn new(
        state: EngineState,
        repository: Arc<Repository>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            state,
            agenda: Agenda::default(),
            repository,
            clock,
            config,
            moved_in: Vec::new(),
        }
    }

    pub fn into_state(self) -> EngineState {
        self.state
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        &mut self.state
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Agenda ---

    pub fn plan(&mut self, operation: Operation) {
        self.agenda.plan(operation);
    }

    pub fn continue_process(&mut self, execution: Uuid, synchronous: bool) {
        self.plan(Operation::ContinueProcess { execution, synchronous });
    }

    pub fn leave(&mut self, execution: Uuid) {
        self.plan(Operation::TakeOutgoingSequenceFlows { execution });
    }

    pub fn end_execution(&mut self, execution: Uuid) {
        self.plan(Operation::EndExecution { execution });
    }

    /// Marks a scope whose waiting inclusive joins must be re-checked once the
    /// agenda is drained.
    pub fn token_moved_in(&mut self, scope: Uuid) {
        if !self.moved_in.contains(&scope) {
            self.moved_in.push(scope);
        }
    }

    /// Drains the agenda. Every time it runs dry, inclusive joins in scopes
    /// where tokens moved are evaluated again, since a token may have left
    /// every path to them.
    pub async fn run_agenda(&mut self) -> Result<()> {
        let limit = self.config.max_operations_per_command;
        loop {
            while let Some(operation) = self.agenda.next() {
                if self.agenda.executed() > limit {
                    return Err(EngineError::AgendaOverflow(limit));
                }
                operations::execute(self, operation).await?;
            }

            let moved = std::mem::take(&mut self.moved_in);
            for scope in moved {
                if self.exists(scope) {
                    self.plan(Operation::EvaluateInactiveJoins { scope });
                }
            }
            if self.agenda.is_empty() {
                return Ok(());
            }
        }
    }

    // --- Repository ---

    pub fn graph(&self, deployment_key: &str) -> Result<Arc<ProcessGraph>> {
        self.repository
            .graph(deployment_key)
            .ok_or_else(|| EngineError::DefinitionNotFound(deployment_key.to_string()))
    }

    pub fn latest_graph(&self, key: &str) -> Result<Arc<ProcessGraph>> {
        self.repository
            .latest(key)
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))
    }

    pub fn latest_graphs(&self) -> Vec<Arc<ProcessGraph>> {
        self.repository.latest_graphs()
    }

    pub fn behaviors(&self, deployment_key: &str) -> Result<PreparedBehaviors> {
        self.repository
            .behaviors(deployment_key)
            .ok_or_else(|| EngineError::DefinitionNotFound(deployment_key.to_string()))
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.repository.handler(name)
    }

    pub fn graph_of(&self, execution: Uuid) -> Result<Arc<ProcessGraph>> {
        let key = &self.execution(execution)?.graph_key;
        self.graph(key)
    }

    pub fn node_of(&self, execution: Uuid) -> Result<NodeIndex> {
        self.execution(execution)?
            .current_node
            .ok_or_else(|| EngineError::illegal(format!("execution {} is not at a node", execution)))
    }

    // --- Executions ---

    pub fn executions(&self) -> &ExecutionTree {
        &self.state.executions
    }

    pub fn exists(&self, execution: Uuid) -> bool {
        self.state.executions.contains(execution)
    }

    pub fn execution(&self, id: Uuid) -> Result<&Execution> {
        self.state.executions.require(id)
    }

    pub fn execution_mut(&mut self, id: Uuid) -> Result<&mut Execution> {
        self.state.executions.require_mut(id)
    }

    pub fn create_child(&mut self, parent: Uuid) -> Result<Uuid> {
        let now = self.now();
        self.state.executions.create_child(parent, now)
    }

    pub fn create_child_at(&mut self, parent: Uuid, node: NodeIndex) -> Result<Uuid> {
        let child = self.create_child(parent)?;
        self.execution_mut(child)?.current_node = Some(node);
        Ok(child)
    }

    pub fn enclosing_scope(&self, execution: Uuid) -> Result<Uuid> {
        self.state.executions.enclosing_scope(execution)
    }

    // --- Variables ---

    pub fn variables(&self, execution: Uuid) -> HashMap<String, Value> {
        self.state.executions.visible_variables(execution)
    }

    pub fn variable(&self, execution: Uuid, name: &str) -> Option<Value> {
        self.state.executions.get_variable(execution, name)
    }

    pub fn set_variable(&mut self, execution: Uuid, name: &str, value: Value) -> Result<()> {
        let target = self.state.executions.set_variable(execution, name, value.clone())?;
        self.record_variable(target, name, value)
    }

    pub fn set_variables(&mut self, execution: Uuid, variables: HashMap<String, Value>) -> Result<()> {
        for (name, value) in variables {
            self.set_variable(execution, &name, value)?;
        }
        Ok(())
    }

    pub fn set_variable_local(&mut self, execution: Uuid, name: &str, value: Value) -> Result<()> {
        self.state.executions.set_variable_local(execution, name, value.clone())?;
        self.record_variable(execution, name, value)
    }

    fn record_variable(&mut self, execution: Uuid, name: &str, value: Value) -> Result<()> {
        let process_instance_id = self.execution(execution)?.process_instance_id;
        let time = self.now();
        self.state.history.variable_updated(HistoricVariableUpdate {
            process_instance_id,
            execution_id: execution,
            name: name.to_string(),
            value,
            time,
        });
        Ok(())
    }

    // --- History ---

    /// Opens the historic activity instance for the node the execution is at.
    pub fn start_activity(&mut self, execution: Uuid) -> Result<()> {
        let graph = self.graph_of(execution)?;
        let node = graph.node(self.node_of(execution)?);
        let now = self.now();
        let id = Uuid::new_v4();
        let exec = self.state.executions.require_mut(execution)?;
        exec.activity_instance_id = Some(id);
        let process_instance_id = exec.process_instance_id;
        self.state.history.start_activity(HistoricActivityInstance {
            id,
            process_instance_id,
            execution_id: execution,
            activity_id: node.id.clone(),
            activity_type: node.kind.name().to_string(),
            start_time: now,
            end_time: None,
            delete_reason: None,
        });
        Ok(())
    }

    /// Closes the open activity instance, if any. Returns whether one was open.
    pub fn end_activity(&mut self, execution: Uuid, delete_reason: Option<&str>) -> Result<bool> {
        let now = self.now();
        match self.execution_mut(execution)?.activity_instance_id.take() {
            Some(id) => {
                self.state.history.end_activity(id, delete_reason.map(str::to_string), now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- Subscriptions and jobs ---

    pub fn subscribe(
        &mut self,
        event_type: EventType,
        event_name: &str,
        execution: Uuid,
        node: NodeIndex,
    ) -> Result<Uuid> {
        let graph = self.graph_of(execution)?;
        let process_instance_id = self.execution(execution)?.process_instance_id;
        let id = Uuid::new_v4();
        let created = self.state.next_sequence();
        self.state.subscriptions.insert(
            id,
            EventSubscription {
                id,
                event_type,
                event_name: event_name.to_string(),
                execution_id: execution,
                process_instance_id,
                node,
                activity_id: graph.node(node).id.clone(),
                created,
            },
        );
        debug!(execution = %execution, event = %event_type, name = event_name, "Subscribed");
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_job(
        &mut self,
        kind: JobKind,
        graph: &ProcessGraph,
        node: NodeIndex,
        execution: Option<Uuid>,
        process_instance_id: Option<Uuid>,
        due: DateTime<Utc>,
        repeat: Option<Repeat>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let created = self.state.next_sequence();
        let retries = self.config.job_executor.default_retries;
        self.state.jobs.insert(
            id,
            Job {
                id,
                kind,
                graph_key: graph.deployment_key(),
                node,
                activity_id: graph.node(node).id.clone(),
                execution_id: execution,
                process_instance_id,
                due,
                repeat,
                retries,
                exception_message: None,
                lock_owner: None,
                lock_expiration: None,
                created,
            },
        );
        id
    }

    /// Timer job firing `node` for `execution`, due according to the node's timer.
    pub fn schedule_timer(&mut self, execution: Uuid, node: NodeIndex, timer: &TimerDefinition) -> Result<Uuid> {
        let graph = self.graph_of(execution)?;
        let schedule = timer.schedule(self.now(), &self.variables(execution))?;
        let process_instance_id = self.execution(execution)?.process_instance_id;
        let id = self.insert_job(
            JobKind::Timer,
            &graph,
            node,
            Some(execution),
            Some(process_instance_id),
            schedule.due,
            schedule.repeat,
        );
        debug!(execution = %execution, due = %schedule.due, "Timer scheduled");
        Ok(id)
    }

    pub fn schedule_timer_start(&mut self, graph: &ProcessGraph, node: NodeIndex, timer: &TimerDefinition) -> Result<Uuid> {
        let schedule = timer.schedule(self.now(), &HashMap::new())?;
        Ok(self.insert_job(JobKind::TimerStart, graph, node, None, None, schedule.due, schedule.repeat))
    }

    pub fn schedule_async(&mut self, execution: Uuid) -> Result<Uuid> {
        let graph = self.graph_of(execution)?;
        let node = self.node_of(execution)?;
        let process_instance_id = self.execution(execution)?.process_instance_id;
        let now = self.now();
        Ok(self.insert_job(
            JobKind::AsyncContinuation,
            &graph,
            node,
            Some(execution),
            Some(process_instance_id),
            now,
            None,
        ))
    }

    /// Registers whatever the event definition of `node` waits for: a message or
    /// signal subscription, or a timer job. Other triggers need no registration.
    pub fn listen_for_trigger(&mut self, execution: Uuid, node: NodeIndex) -> Result<()> {
        let graph = self.graph_of(execution)?;
        match graph.node(node).kind.trigger() {
            Some(EventTrigger::Message(name)) => {
                self.subscribe(EventType::Message, name, execution, node)?;
            }
            Some(EventTrigger::Signal(name)) => {
                self.subscribe(EventType::Signal, name, execution, node)?;
            }
            Some(EventTrigger::Timer(timer)) => {
                self.schedule_timer(execution, node, timer)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drops message/signal subscriptions and jobs of an execution. Compensation
    /// subscriptions stay.
    pub fn clear_wait_state(&mut self, execution: Uuid) {
        self.state
            .subscriptions
            .retain(|_, s| s.execution_id != execution || s.event_type == EventType::Compensate);
        self.state.jobs.retain(|_, j| j.execution_id != Some(execution));
    }

    /// Registers the start events of the event sub-processes directly inside `scope_node`
    /// on the scope execution.
    pub fn register_event_sub_processes(&mut self, scope: Uuid, scope_node: Option<NodeIndex>) -> Result<()> {
        let graph = self.graph_of(scope)?;
        let starts: Vec<NodeIndex> = graph
            .event_sub_processes(scope_node)
            .filter_map(|sub_process| graph.event_start_of(sub_process))
            .collect();
        for start in starts {
            self.listen_for_trigger(scope, start)?;
        }
        Ok(())
    }

    // --- Lifecycle ---

    /// Deletes an execution with its subtree, subscriptions, jobs and called
    /// process instances. Open history entries are closed with `reason`.
    pub fn remove_execution(&mut self, id: Uuid, reason: Option<&str>) -> Result<()> {
        let now = self.now();
        for current in self.state.executions.subtree(id) {
            let Some(execution) = self.state.executions.get(current) else {
                continue;
            };
            let activity = execution.activity_instance_id;
            let sub_instance = execution.sub_instance_id;
            let is_root = execution.is_process_instance();
            let variables = execution.variables.clone();

            if let Some(activity) = activity {
                self.state.history.end_activity(activity, reason.map(str::to_string), now);
            }
            if let Some(sub_instance) = sub_instance {
                self.remove_execution(sub_instance, reason)?;
            }
            self.state.subscriptions.retain(|_, s| s.execution_id != current);
            self.state.jobs.retain(|_, j| j.execution_id != Some(current));
            if is_root {
                self.state
                    .history
                    .end_process(current, None, reason.map(str::to_string), variables, now);
            }
            self.state.executions.remove(current);
        }
        Ok(())
    }

    pub fn remove_children(&mut self, id: Uuid, reason: Option<&str>) -> Result<()> {
        for child in self.state.executions.children(id) {
            self.remove_execution(child, reason)?;
        }
        Ok(())
    }

    /// Creates a process instance and plans its first token. `start_node`
    /// defaults to the none start event of the process.
    pub fn start_process_instance(
        &mut self,
        graph: &ProcessGraph,
        variables: HashMap<String, Value>,
        business_key: Option<String>,
        super_execution: Option<Uuid>,
        start_node: Option<NodeIndex>,
    ) -> Result<Uuid> {
        let start = match start_node {
            Some(node) => node,
            None => graph.none_start_event(None).ok_or_else(|| {
                EngineError::illegal(format!(
                    "process '{}' has no none start event; it starts by message, signal or timer",
                    graph.key
                ))
            })?,
        };

        let now = self.now();
        let deployment_key = graph.deployment_key();
        let root = self.state.executions.create_process_instance(
            &deployment_key,
            business_key.clone(),
            variables,
            super_execution,
            now,
        );
        let super_process_instance_id = match super_execution {
            Some(execution) => Some(self.execution(execution)?.process_instance_id),
            None => None,
        };
        self.state.history.start_process(HistoricProcessInstance {
            id: root,
            process_key: graph.key.clone(),
            process_version: graph.version,
            business_key,
            super_process_instance_id,
            start_time: now,
            end_time: None,
            end_activity_id: None,
            delete_reason: None,
            variables: HashMap::new(),
        });
        info!(instance_id = %root, process = %deployment_key, "Process instance started");

        self.register_event_sub_processes(root, None)?;
        let token = self.create_child_at(root, start)?;
        self.continue_process(token, false);
        Ok(root)
    }

    /// Ends a process instance. A waiting call activity in the parent process is
    /// resumed with the instance's variables.
    pub fn end_process_instance(
        &mut self,
        root: Uuid,
        end_activity_id: Option<String>,
        delete_reason: Option<&str>,
    ) -> Result<()> {
        self.remove_children(root, delete_reason)?;
        let execution = self.execution(root)?;
        let super_execution = execution.super_execution_id;
        let variables = execution.variables.clone();
        let now = self.now();

        self.state.subscriptions.retain(|_, s| s.execution_id != root);
        self.state.jobs.retain(|_, j| j.execution_id != Some(root));
        self.state.history.end_process(
            root,
            end_activity_id,
            delete_reason.map(str::to_string),
            variables.clone(),
            now,
        );
        self.state.executions.remove(root);
        info!(instance_id = %root, "Process instance ended");

        if let Some(super_execution) = super_execution {
            if let Some(caller) = self.state.executions.get_mut(super_execution) {
                caller.sub_instance_id = None;
                if let Some(node) = caller.current_node {
                    self.plan(Operation::TriggerExecution {
                        execution: super_execution,
                        node,
                        payload: variables,
                        subscription: None,
                    });
                }
            }
        }
        Ok(())
    }
}
