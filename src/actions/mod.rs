use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;
use uuid::Uuid;

pub mod builtin;

/// Input handed to a service handler. `params` has its `${..}` references
/// resolved; `variables` is a snapshot of what the execution sees.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub activity_id: String,
    pub params: Value,
    pub variables: HashMap<String, Value>,
}

impl ServiceCall {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Business error, routed to error boundary events and error event sub-processes.
    #[error("BPMN error '{code}'")]
    Bpmn { code: String, message: Option<String> },
    /// Technical failure; fails the command (and the job, when run asynchronously).
    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn bpmn(code: &str) -> Self {
        ServiceError::Bpmn {
            code: code.to_string(),
            message: None,
        }
    }
}

/// 插件接口：所有服务任务处理器必须实现此 Trait
///
/// Handlers run while the engine holds its command lock and must not call back
/// into the [`ProcessEngine`](crate::ProcessEngine).
#[async_trait]
pub trait ServiceHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Checked once per service task when a process is deployed.
    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, call: ServiceCall) -> Result<Value, ServiceError>;
}
