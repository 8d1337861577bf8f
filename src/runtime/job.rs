use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::runtime::engine::ProcessEngine;
use crate::runtime::graph::NodeIndex;
use crate::runtime::timer::Repeat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    /// Fires a timer catch event, boundary event or event sub-process start.
    Timer,
    /// Continues an asynchronous activity in its own command.
    AsyncContinuation,
    /// Starts a new process instance at a timer start event.
    TimerStart,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub graph_key: String,
    pub node: NodeIndex,
    pub activity_id: String,
    pub execution_id: Option<Uuid>,
    pub process_instance_id: Option<Uuid>,
    pub due: DateTime<Utc>,
    pub repeat: Option<Repeat>,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expiration: Option<DateTime<Utc>>,
    pub created: u64,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due <= now
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiration.is_some_and(|expires| expires > now)
    }
}

/// Background worker that polls for due jobs and runs each in its own command.
pub struct JobExecutor {
    engine: Arc<ProcessEngine>,
    owner: String,
}

pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl JobExecutorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!("Job executor task failed: {}", e);
        }
    }
}

impl JobExecutor {
    pub fn new(engine: Arc<ProcessEngine>) -> Self {
        Self {
            engine,
            owner: format!("job-executor-{}", Uuid::new_v4()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn start(self) -> JobExecutorHandle {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        JobExecutorHandle { shutdown: tx, join }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.engine.config().job_executor.clone();
        info!(owner = %self.owner, "Job executor started.");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(config.poll_interval()) => {
                    let due = self.engine.acquire_due_jobs(&self.owner).await;
                    for job_id in due {
                        match timeout(config.job_timeout(), self.engine.execute_job(job_id)).await {
                            Ok(Ok(())) => debug!(job_id = %job_id, "Job executed"),
                            Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "Job failed"),
                            Err(_) => {
                                error!(job_id = %job_id, "Job timed out after {:?}", config.job_timeout());
                                self.engine.record_job_failure(job_id, "job timed out").await;
                            }
                        }
                    }
                }
            }
        }

        info!(owner = %self.owner, "Job executor stopped.");
    }
}
