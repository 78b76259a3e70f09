// Error types for the orchestration core

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, CobaltError>;

/// Errors surfaced by the orchestration core.
///
/// Validation and not-found errors are returned synchronously to callers.
/// Execution and liveness failures are recovered locally up to the retry
/// budget and become terminal task state rather than errors. Compensation
/// failures always escalate and require operator intervention.
#[derive(Debug, Error)]
pub enum CobaltError {
    /// Malformed submission, rejected synchronously.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown task, agent, or workflow id.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind ("task", "agent", "workflow").
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// Idempotency key collision with an incompatible payload, or an illegal
    /// state transition (e.g. cancel after a terminal status).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Workflow step predecessors do not form a DAG.
    #[error("Cyclic workflow graph: {0}")]
    CyclicGraph(String),

    /// Lost an assignment race against a concurrent transition. Internal,
    /// retried transparently against the next candidate.
    #[error("Assignment race lost")]
    AssignmentRace,

    /// Agent-reported task failure.
    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    /// Synthetic failure raised by the heartbeat monitor.
    #[error("Liveness timeout for agent {agent_id}")]
    LivenessTimeout {
        /// The agent whose heartbeat went stale.
        agent_id: String,
    },

    /// Saga rollback itself failed. Never auto-retried.
    #[error("Compensation failed for workflow {workflow_id} at step {step_id}")]
    CompensationFailure {
        /// The workflow being rolled back.
        workflow_id: String,
        /// The compensation step that failed.
        step_id: String,
    },

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message bus operation failed.
    #[error("Bus error: {0}")]
    Bus(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CobaltError {
    /// Returns whether this error is retried internally and never surfaced.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::AssignmentRace)
    }

    /// Returns whether this error requires operator intervention.
    #[must_use]
    pub fn requires_intervention(&self) -> bool {
        matches!(self, Self::CompensationFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CobaltError::NotFound { kind: "task", id: "task-1".to_string() };
        assert_eq!(err.to_string(), "task not found: task-1");

        let err = CobaltError::LivenessTimeout { agent_id: "agent-1".to_string() };
        assert_eq!(err.to_string(), "Liveness timeout for agent agent-1");
    }

    #[test]
    fn test_error_classification() {
        assert!(CobaltError::AssignmentRace.is_internal());
        assert!(!CobaltError::Validation("bad".to_string()).is_internal());

        let comp = CobaltError::CompensationFailure {
            workflow_id: "wf-1".to_string(),
            step_id: "step-2".to_string(),
        };
        assert!(comp.requires_intervention());
        assert!(!CobaltError::AssignmentRace.requires_intervention());
    }

    #[test]
    fn test_storage_error_conversion() {
        let storage = StorageError::NotFound("task-9".to_string());
        let err: CobaltError = storage.into();
        assert!(matches!(err, CobaltError::Storage(_)));
    }
}
