//! Bus event payloads and subject names.
//!
//! Delivery is at-least-once; every handler must be idempotent. Consumers
//! guard against duplicates by checking the current task status before
//! acting on an event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subject carrying task assignments from the scheduler to agents.
pub const SUBJECT_TASK_ASSIGN: &str = "tasks.assign";

/// Subject carrying completion reports from agents back to the scheduler.
pub const SUBJECT_TASK_RESULTS: &str = "tasks.results";

/// Subject carrying cooperative cancellation signals to agents.
pub const SUBJECT_TASK_CANCEL: &str = "tasks.cancel";

/// Assignment of a task to an agent, published on `tasks.assign`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    /// The assigned task.
    pub task_id: String,
    /// The agent the task was assigned to.
    pub agent_id: String,
    /// Attempt number for this execution (1-based).
    pub attempt: u32,
    /// Input payload for the task.
    pub input: Value,
}

/// Terminal outcome reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum TaskOutcome {
    /// The task completed with a result payload.
    Completed(Value),
    /// The task failed with an error message.
    Failed(String),
}

/// Completion report from an agent, published on `tasks.results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    /// The task being reported.
    pub task_id: String,
    /// The reporting agent.
    pub agent_id: String,
    /// The terminal outcome.
    pub outcome: TaskOutcome,
}

/// Cancellation request for a running task, published on `tasks.cancel`.
///
/// Agents acknowledge cancellation asynchronously; the task stays in
/// `Cancelling` until the acknowledgement arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationSignal {
    /// The task to cancel.
    pub task_id: String,
}
