use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::runtime::graph::NodeIndex;

/// Structural step of process execution, planned on the agenda of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Enter the node the execution points at. `synchronous` skips the
    /// asynchronous continuation of the node (set when a job resumes it).
    ContinueProcess { execution: Uuid, synchronous: bool },
    /// Leave the current node along its selected outgoing flows.
    TakeOutgoingSequenceFlows { execution: Uuid },
    /// Resume an execution through the behavior of `node`. Skipped when the
    /// subscription that caused it no longer exists.
    TriggerExecution {
        execution: Uuid,
        node: NodeIndex,
        payload: HashMap<String, Value>,
        subscription: Option<Uuid>,
    },
    EndExecution { execution: Uuid },
    /// Re-check inclusive gateways waiting in a scope after a token disappeared.
    EvaluateInactiveJoins { scope: Uuid },
    /// Delete everything inside a scope, then complete the scope. A process
    /// instance records `end_activity` as the activity it ended in.
    DestroyScope {
        scope: Uuid,
        reason: String,
        end_activity: Option<String>,
    },
}

impl Operation {
    pub fn execution(&self) -> Uuid {
        match self {
            Operation::ContinueProcess { execution, .. }
            | Operation::TakeOutgoingSequenceFlows { execution }
            | Operation::TriggerExecution { execution, .. }
            | Operation::EndExecution { execution } => *execution,
            Operation::EvaluateInactiveJoins { scope } | Operation::DestroyScope { scope, .. } => *scope,
        }
    }
}

/// FIFO work queue of one command.
#[derive(Debug, Default)]
pub struct Agenda {
    operations: VecDeque<Operation>,
    executed: usize,
}

impl Agenda {
    pub fn plan(&mut self, operation: Operation) {
        self.operations.push_back(operation);
    }

    pub fn next(&mut self) -> Option<Operation> {
        let operation = self.operations.pop_front()?;
        self.executed += 1;
        Some(operation)
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
