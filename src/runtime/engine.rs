use chrono::Duration;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::ServiceHandler;
use crate::actions::builtin::{AssignAction, LogAction};
use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::dsl::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::nodes;
use crate::runtime::agenda::Operation;
use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::context::CommandContext;
use crate::runtime::execution::Execution;
use crate::runtime::graph::{EventTrigger, FlowNodeKind, NodeIndex, ProcessGraph};
use crate::runtime::history::{HistoricActivityInstance, HistoricActivityQuery, HistoricProcessInstance, HistoricVariableUpdate};
use crate::runtime::job::{Job, JobKind};
use crate::runtime::node::BehaviorDefinition;
use crate::runtime::propagation;
use crate::runtime::repository::Repository;
use crate::runtime::storage::EngineState;
use crate::runtime::subscription::{EventSubscription, EventType};

/// 流程引擎
///
/// Every public operation runs as one command: it works on a copy of the
/// runtime state, drains the agenda, and commits only if nothing failed.
/// Commands are serialized by the state lock.
pub struct ProcessEngine {
    repository: Arc<Repository>,
    state: Mutex<EngineState>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let repository = Arc::new(Repository::new());
        nodes::register_standard_behaviors(&repository);
        repository.register_handler(Arc::new(LogAction));
        repository.register_handler(Arc::new(AssignAction));

        Self {
            repository,
            state: Mutex::new(EngineState::new(config.history_level)),
            clock,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn register_handler(&self, handler: Arc<dyn ServiceHandler>) {
        self.repository.register_handler(handler);
    }

    /// Replaces the behavior used for one node kind in later deployments.
    pub fn register_behavior(&self, definition: Arc<dyn BehaviorDefinition>) {
        self.repository.register_definition(definition);
    }

    fn begin(&self, state: &EngineState) -> CommandContext {
        CommandContext::new(
            state.clone(),
            self.repository.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    async fn commit(&self, mut guard: MutexGuard<'_, EngineState>, mut ctx: CommandContext) -> Result<()> {
        ctx.run_agenda().await?;
        *guard = ctx.into_state();
        Ok(())
    }

    // --- Repository ---

    /// Compiles and deploys a definition as the next version of its key. Timer
    /// start events of the previous version are unscheduled.
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessGraph>> {
        let graph = Compiler::new().compile(definition).map_err(EngineError::Deployment)?;
        let timer_starts: Vec<(NodeIndex, EventTrigger)> = graph
            .root_nodes
            .iter()
            .filter_map(|&index| match &graph.node(index).kind {
                FlowNodeKind::StartEvent { trigger: trigger @ EventTrigger::Timer(_), .. } => Some((index, trigger.clone())),
                _ => None,
            })
            .collect();

        let mut guard = self.state.lock().await;
        let deployment = self.repository.prepare(graph).map_err(EngineError::Deployment)?;

        // The new version only becomes visible once its start timers are scheduled.
        let mut ctx = self.begin(&guard);
        let prefix = format!("{}:", deployment.graph.key);
        ctx.state_mut()
            .jobs
            .retain(|_, job| !(job.kind == JobKind::TimerStart && job.graph_key.starts_with(&prefix)));
        for (index, trigger) in timer_starts {
            if let EventTrigger::Timer(timer) = trigger {
                ctx.schedule_timer_start(&deployment.graph, index, &timer)?;
            }
        }
        ctx.run_agenda().await?;
        let deployed = self.repository.publish(deployment);
        *guard = ctx.into_state();
        Ok(deployed)
    }

    pub fn definition(&self, key: &str) -> Option<Arc<ProcessGraph>> {
        self.repository.latest(key)
    }

    pub fn definitions(&self) -> Vec<Arc<ProcessGraph>> {
        self.repository.latest_graphs()
    }

    // --- Starting instances ---

    pub async fn start_process_instance_by_key(&self, key: &str, variables: HashMap<String, Value>) -> Result<Uuid> {
        self.start_process_instance_with_business_key(key, None, variables).await
    }

    pub async fn start_process_instance_with_business_key(
        &self,
        key: &str,
        business_key: Option<&str>,
        variables: HashMap<String, Value>,
    ) -> Result<Uuid> {
        let graph = self
            .repository
            .latest(key)
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        let guard = self.state.lock().await;
        let mut ctx = self.begin(&guard);
        let id = ctx.start_process_instance(&graph, variables, business_key.map(str::to_string), None, None)?;
        self.commit(guard, ctx).await?;
        Ok(id)
    }

    /// Starts the latest process with a message start event for `message`.
    pub async fn start_process_instance_by_message(&self, message: &str, variables: HashMap<String, Value>) -> Result<Uuid> {
        let (graph, start) = self
            .message_start(message)
            .ok_or_else(|| EngineError::NoSubscription {
                event_type: "message start".to_string(),
                name: message.to_string(),
            })?;
        let guard = self.state.lock().await;
        let mut ctx = self.begin(&guard);
        let id = ctx.start_process_instance(&graph, variables, None, None, Some(start))?;
        self.commit(guard, ctx).await?;
        Ok(id)
    }

    fn message_start(&self, message: &str) -> Option<(Arc<ProcessGraph>, NodeIndex)> {
        self.repository.latest_graphs().into_iter().find_map(|graph| {
            let start = graph.root_nodes.iter().copied().find(|&index| {
                matches!(&graph.node(index).kind,
                    FlowNodeKind::StartEvent { trigger: EventTrigger::Message(name), .. } if name == message)
            })?;
            Some((graph, start))
        })
    }

    // --- Triggering ---

    /// Completes the wait state an execution is in (user task, receive task,
    /// catch event) and continues the process.
    pub async fn trigger(&self, execution_id: Uuid, variables: HashMap<String, Value>) -> Result<()> {
        let guard = self.state.lock().await;
        let execution = guard.executions.require(execution_id)?;
        if !execution.is_active || execution.scope.is_some() {
            return Err(EngineError::illegal(format!("execution {} is not waiting in an activity", execution_id)));
        }
        let node = execution
            .current_node
            .ok_or_else(|| EngineError::illegal(format!("execution {} is not at a node", execution_id)))?;

        let mut ctx = self.begin(&guard);
        ctx.plan(Operation::TriggerExecution {
            execution: execution_id,
            node,
            payload: variables,
            subscription: None,
        });
        self.commit(guard, ctx).await
    }

    /// Delivers a message to the subscription of one execution.
    pub async fn message_event_received(
        &self,
        message: &str,
        execution_id: Uuid,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        let guard = self.state.lock().await;
        let subscription = guard
            .subscriptions_of(execution_id)
            .into_iter()
            .find(|s| s.event_type == EventType::Message && s.event_name == message)
            .ok_or_else(|| EngineError::NoSubscription {
                event_type: EventType::Message.to_string(),
                name: message.to_string(),
            })?;
        let mut ctx = self.begin(&guard);
        deliver(&mut ctx, &subscription, variables);
        self.commit(guard, ctx).await
    }

    /// Correlates a message to the one execution waiting for it, optionally
    /// within a process instance. Without a waiting execution the message may
    /// start a new instance. Returns the process instance that received it.
    pub async fn correlate_message(
        &self,
        message: &str,
        process_instance_id: Option<Uuid>,
        variables: HashMap<String, Value>,
    ) -> Result<Uuid> {
        let guard = self.state.lock().await;
        let matching: Vec<EventSubscription> = guard
            .subscriptions_named(EventType::Message, message)
            .into_iter()
            .filter(|s| process_instance_id.is_none_or(|id| s.process_instance_id == id))
            .collect();

        match matching.as_slice() {
            [subscription] => {
                let target = subscription.process_instance_id;
                let mut ctx = self.begin(&guard);
                deliver(&mut ctx, subscription, variables);
                self.commit(guard, ctx).await?;
                Ok(target)
            }
            [] if process_instance_id.is_none() => {
                drop(guard);
                self.start_process_instance_by_message(message, variables).await
            }
            [] => Err(EngineError::NoSubscription {
                event_type: EventType::Message.to_string(),
                name: message.to_string(),
            }),
            _ => Err(EngineError::AmbiguousCorrelation(message.to_string())),
        }
    }

    /// Broadcasts a signal. Returns how many subscriptions and signal start
    /// events received it.
    pub async fn signal_event_received(&self, signal: &str, variables: HashMap<String, Value>) -> Result<usize> {
        let guard = self.state.lock().await;
        let mut ctx = self.begin(&guard);
        let receivers = propagation::throw_signal(&mut ctx, signal, &variables)?;
        self.commit(guard, ctx).await?;
        Ok(receivers)
    }

    // --- Variables ---

    pub async fn get_variable(&self, execution_id: Uuid, name: &str) -> Result<Option<Value>> {
        let guard = self.state.lock().await;
        guard.executions.require(execution_id)?;
        Ok(guard.executions.get_variable(execution_id, name))
    }

    pub async fn get_variables(&self, execution_id: Uuid) -> Result<HashMap<String, Value>> {
        let guard = self.state.lock().await;
        guard.executions.require(execution_id)?;
        Ok(guard.executions.visible_variables(execution_id))
    }

    pub async fn set_variable(&self, execution_id: Uuid, name: &str, value: Value) -> Result<()> {
        let guard = self.state.lock().await;
        let mut ctx = self.begin(&guard);
        ctx.set_variable(execution_id, name, value)?;
        self.commit(guard, ctx).await
    }

    pub async fn set_variable_local(&self, execution_id: Uuid, name: &str, value: Value) -> Result<()> {
        let guard = self.state.lock().await;
        let mut ctx = self.begin(&guard);
        ctx.set_variable_local(execution_id, name, value)?;
        self.commit(guard, ctx).await
    }

    // --- Lifecycle ---

    /// Deletes a running process instance with everything below it, including
    /// process instances started by its call activities.
    pub async fn delete_process_instance(&self, process_instance_id: Uuid, reason: &str) -> Result<()> {
        let guard = self.state.lock().await;
        if !guard.executions.require(process_instance_id)?.is_process_instance() {
            return Err(EngineError::illegal(format!("{} is not a process instance", process_instance_id)));
        }
        let mut ctx = self.begin(&guard);
        ctx.remove_execution(process_instance_id, Some(reason))?;
        info!(instance_id = %process_instance_id, reason, "Process instance deleted");
        self.commit(guard, ctx).await
    }

    // --- Queries ---

    pub async fn process_instance_exists(&self, process_instance_id: Uuid) -> bool {
        self.state.lock().await.executions.contains(process_instance_id)
    }

    /// All executions of an instance, depth-first from the root.
    pub async fn executions(&self, process_instance_id: Uuid) -> Vec<Execution> {
        let guard = self.state.lock().await;
        guard
            .executions
            .instance_executions(process_instance_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Ids of the nodes where active tokens of the instance currently wait.
    pub async fn active_activity_ids(&self, process_instance_id: Uuid) -> Vec<String> {
        let guard = self.state.lock().await;
        guard
            .executions
            .instance_executions(process_instance_id)
            .into_iter()
            .filter(|e| e.is_active && e.scope.is_none())
            .filter_map(|e| {
                let graph = self.repository.graph(&e.graph_key)?;
                Some(graph.node(e.current_node?).id.clone())
            })
            .collect()
    }

    /// The active execution of an instance at the given activity.
    pub async fn find_execution(&self, process_instance_id: Uuid, activity_id: &str) -> Option<Uuid> {
        let guard = self.state.lock().await;
        guard
            .executions
            .instance_executions(process_instance_id)
            .into_iter()
            .filter(|e| e.is_active && e.scope.is_none())
            .find(|e| {
                self.repository
                    .graph(&e.graph_key)
                    .zip(e.current_node)
                    .is_some_and(|(graph, node)| graph.node(node).id == activity_id)
            })
            .map(|e| e.id)
    }

    /// Process instance started by the call activity execution, if it is waiting for one.
    pub async fn sub_process_instance(&self, execution_id: Uuid) -> Option<Uuid> {
        self.state.lock().await.executions.get(execution_id)?.sub_instance_id
    }

    pub async fn event_subscriptions(&self, process_instance_id: Option<Uuid>) -> Vec<EventSubscription> {
        let guard = self.state.lock().await;
        let mut subscriptions: Vec<EventSubscription> = guard
            .subscriptions
            .values()
            .filter(|s| process_instance_id.is_none_or(|id| s.process_instance_id == id))
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created);
        subscriptions
    }

    pub async fn jobs(&self, process_instance_id: Option<Uuid>) -> Vec<Job> {
        let guard = self.state.lock().await;
        let mut jobs: Vec<Job> = guard
            .jobs
            .values()
            .filter(|j| process_instance_id.is_none_or(|id| j.process_instance_id == Some(id)))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.due, j.created));
        jobs
    }

    pub async fn dead_letter_jobs(&self) -> Vec<Job> {
        let guard = self.state.lock().await;
        let mut jobs: Vec<Job> = guard.dead_letter_jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created);
        jobs
    }

    // --- Jobs ---

    /// Locks due jobs for `owner`, earliest first, at most one batch.
    pub async fn acquire_due_jobs(&self, owner: &str) -> Vec<Uuid> {
        let mut guard = self.state.lock().await;
        let now = self.clock.now();
        let config = &self.config.job_executor;

        let mut due: Vec<&mut Job> = guard
            .jobs
            .values_mut()
            .filter(|j| j.is_due(now) && !j.is_locked(now))
            .collect();
        due.sort_by_key(|j| (j.due, j.created));

        due.into_iter()
            .take(config.batch_size)
            .map(|job| {
                job.lock_owner = Some(owner.to_string());
                job.lock_expiration = Some(now + Duration::milliseconds(config.lock_time_ms as i64));
                job.id
            })
            .collect()
    }

    /// Runs one job in its own command. On failure the job loses a retry and is
    /// rescheduled, or moved to the dead letter jobs when none are left.
    pub async fn execute_job(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.state.lock().await;
        let job = guard.jobs.get(&job_id).cloned().ok_or(EngineError::JobNotFound(job_id))?;

        let mut ctx = self.begin(&guard);
        let outcome = match run_job(&mut ctx, &job) {
            Ok(()) => ctx.run_agenda().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                *guard = ctx.into_state();
                debug!(job_id = %job_id, kind = ?job.kind, activity = %job.activity_id, "Job executed");
                Ok(())
            }
            Err(e) => {
                self.fail_job(&mut guard, job_id, &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn record_job_failure(&self, job_id: Uuid, message: &str) {
        let mut guard = self.state.lock().await;
        self.fail_job(&mut guard, job_id, message);
    }

    fn fail_job(&self, state: &mut EngineState, job_id: Uuid, message: &str) {
        let Some(mut job) = state.jobs.remove(&job_id) else {
            return;
        };
        job.retries = job.retries.saturating_sub(1);
        job.exception_message = Some(message.to_string());
        job.lock_owner = None;
        job.lock_expiration = None;

        if job.retries == 0 {
            warn!(job_id = %job_id, activity = %job.activity_id, error = message, "Job out of retries, moved to dead letter jobs");
            state.dead_letter_jobs.insert(job_id, job);
        } else {
            job.due = self.clock.now() + Duration::milliseconds(self.config.job_executor.retry_wait_ms as i64);
            warn!(job_id = %job_id, retries = job.retries, error = message, "Job failed, retry scheduled");
            state.jobs.insert(job_id, job);
        }
    }

    /// Moves a dead letter job back to the executable jobs, due now.
    pub async fn retry_dead_letter_job(&self, job_id: Uuid, retries: u32) -> Result<()> {
        let mut guard = self.state.lock().await;
        let mut job = guard.dead_letter_jobs.remove(&job_id).ok_or(EngineError::JobNotFound(job_id))?;
        job.retries = retries.max(1);
        job.due = self.clock.now();
        guard.jobs.insert(job_id, job);
        Ok(())
    }

    /// Executes due jobs inline until none are left. Returns how many succeeded.
    pub async fn run_due_jobs(&self) -> usize {
        let mut executed = 0;
        loop {
            let due = self.acquire_due_jobs("inline").await;
            if due.is_empty() {
                return executed;
            }
            for job_id in due {
                match self.execute_job(job_id).await {
                    Ok(()) => executed += 1,
                    Err(e) => warn!(job_id = %job_id, error = %e, "Job failed"),
                }
            }
        }
    }

    // --- History ---

    pub async fn historic_process_instance(&self, process_instance_id: Uuid) -> Option<HistoricProcessInstance> {
        self.state.lock().await.history.process_instance(process_instance_id).cloned()
    }

    pub async fn historic_activity_instances(&self, query: &HistoricActivityQuery) -> Vec<HistoricActivityInstance> {
        self.state.lock().await.history.activities(query)
    }

    pub async fn historic_variable_updates(&self, process_instance_id: Uuid) -> Vec<HistoricVariableUpdate> {
        self.state.lock().await.history.variable_updates(process_instance_id)
    }
}

fn deliver(ctx: &mut CommandContext, subscription: &EventSubscription, payload: HashMap<String, Value>) {
    ctx.plan(Operation::TriggerExecution {
        execution: subscription.execution_id,
        node: subscription.node,
        payload,
        subscription: Some(subscription.id),
    });
}

/// Removes the job, schedules the next firing of a repeating timer, and plans
/// what the job stands for.
fn run_job(ctx: &mut CommandContext, job: &Job) -> Result<()> {
    ctx.state_mut().jobs.remove(&job.id);

    if let Some(following) = job.repeat.and_then(|repeat| repeat.next()) {
        let mut next = job.clone();
        next.id = Uuid::new_v4();
        next.due = Duration::try_milliseconds(following.interval_ms)
            .and_then(|interval| job.due.checked_add_signed(interval))
            .ok_or_else(|| EngineError::InvalidTimer(format!("repeat of job {}", job.id)))?;
        next.repeat = if following.remaining == Some(0) { None } else { Some(following) };
        next.retries = ctx.config().job_executor.default_retries;
        next.exception_message = None;
        next.lock_owner = None;
        next.lock_expiration = None;
        next.created = ctx.state_mut().next_sequence();
        ctx.state_mut().jobs.insert(next.id, next);
    }

    match job.kind {
        JobKind::Timer | JobKind::AsyncContinuation => {
            let Some(execution) = job.execution_id.filter(|id| ctx.exists(*id)) else {
                warn!(job_id = %job.id, "Job execution no longer exists");
                return Ok(());
            };
            let operation = if job.kind == JobKind::Timer {
                Operation::TriggerExecution {
                    execution,
                    node: job.node,
                    payload: HashMap::new(),
                    subscription: None,
                }
            } else {
                Operation::ContinueProcess {
                    execution,
                    synchronous: true,
                }
            };
            ctx.plan(operation);
        }
        JobKind::TimerStart => {
            let graph = ctx.graph(&job.graph_key)?;
            ctx.start_process_instance(&graph, HashMap::new(), None, None, Some(job.node))?;
        }
    }
    Ok(())
}
