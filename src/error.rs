use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the runtime. A command failing with any of these leaves
/// the committed engine state untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("no outgoing sequence flow selectable for activity '{0}'")]
    NoOutgoingFlow(String),

    #[error("unhandled BPMN error '{0}'")]
    UnhandledBpmnError(String),

    #[error("no {event_type} subscription found for '{name}'")]
    NoSubscription { event_type: String, name: String },

    #[error("message '{0}' matches more than one subscription")]
    AmbiguousCorrelation(String),

    #[error("expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("invalid timer definition '{0}'")]
    InvalidTimer(String),

    #[error("service handler '{handler}' failed: {source}")]
    Service {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("agenda exceeded {0} operations in a single command")]
    AgendaOverflow(usize),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("deployment failed: {0}")]
    Deployment(#[source] anyhow::Error),
}

impl EngineError {
    pub fn expression(expression: &str, message: impl ToString) -> Self {
        EngineError::Expression {
            expression: expression.to_string(),
            message: message.to_string(),
        }
    }

    pub fn illegal(message: impl Into<String>) -> Self {
        EngineError::IllegalState(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
