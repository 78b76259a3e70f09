//! Task data structures for the orchestration core.
//!
//! This module defines the task record, its lifecycle state machine,
//! priority tiers, and the submission payload accepted by the scheduler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::{CobaltError, Result};

/// Default execution timeout for a task, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Default retry budget for a failed task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task priority tier (higher ordinal = more urgent).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low = 0,
    /// Default tier.
    #[default]
    Normal = 1,
    /// Urgent work.
    High = 2,
    /// Most urgent tier.
    Critical = 3,
}

impl Priority {
    /// Builds a priority from its ordinal value (0–3).
    ///
    /// # Arguments
    /// * `value` - The ordinal priority value
    ///
    /// # Returns
    /// `Some(Priority)` for 0–3, `None` otherwise.
    #[must_use]
    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Returns the ordinal value of this priority.
    #[must_use]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Returns the next tier up, saturating at `Critical`.
    ///
    /// Used by priority aging to keep long-pending tasks from starving.
    #[must_use]
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is admitted and waiting for assignment.
    #[default]
    Pending,
    /// Task is assigned to an agent and executing.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed (terminal only once the retry budget is exhausted).
    Failed,
    /// Cancellation was requested; waiting for the agent to acknowledge.
    Cancelling,
    /// Task was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Checks if the task can transition to the given status.
    ///
    /// # Arguments
    /// * `to` - The target status
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Pending: assignment, or synchronous cancel
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            // From Running: terminal outcomes or cooperative cancellation
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelling) => true,
            // From Cancelling: agent acknowledged, or raced a final report
            (Self::Cancelling, Self::Cancelled | Self::Completed | Self::Failed) => true,
            // From Failed: automatic retry re-admission
            (Self::Failed, Self::Pending) => true,
            // Same status is always valid
            (a, b) if *a == b => true,
            // All other transitions are invalid
            _ => false,
        }
    }

    /// Returns whether the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Where a task originated, when it did not come from a direct submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskOrigin {
    /// The task was created from a conversational turn.
    Chat {
        /// The conversation session the turn belongs to.
        session_id: String,
        /// The message that triggered the task.
        message_id: String,
    },
}

/// Role a task plays inside a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    /// A forward workflow step.
    Step,
    /// A saga compensation for a previously completed step.
    Compensation,
}

/// Back-reference from a task to the workflow step it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    /// The owning workflow.
    pub workflow_id: String,
    /// The step this task executes (or compensates).
    pub step_id: String,
    /// Whether this task is a forward step or a compensation.
    pub role: StepRole,
}

/// Submission payload for a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human-readable name for the task.
    pub name: String,
    /// Description of what the task does.
    #[serde(default)]
    pub description: String,
    /// Capabilities an agent must declare to execute this task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Priority tier.
    #[serde(default)]
    pub priority: Priority,
    /// Input data for the task.
    #[serde(default)]
    pub input: Value,
    /// Execution timeout in seconds. `None` uses the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Callback target fired on terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Caller-supplied token preventing duplicate creation on retried submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Pins execution to a specific agent instead of capability matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Where the task originated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<TaskOrigin>,
    /// Retry budget override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    /// Creates a new task spec with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required_capabilities: BTreeSet::new(),
            priority: Priority::default(),
            input: Value::Null,
            timeout_seconds: None,
            webhook_url: None,
            idempotency_key: None,
            agent_id: None,
            origin: None,
            max_retries: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a required capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Sets the priority tier.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the input payload.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the webhook callback target.
    #[must_use]
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Pins the task to a specific agent.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Validates the submission payload.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` if required fields are malformed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CobaltError::Validation("task name cannot be empty".to_string()));
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 {
                return Err(CobaltError::Validation(
                    "timeout_seconds must be greater than zero".to_string(),
                ));
            }
        }
        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(CobaltError::Validation(format!(
                    "webhook_url must be an http(s) URL, got '{url}'"
                )));
            }
        }
        if self.required_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(CobaltError::Validation("capabilities cannot be empty strings".to_string()));
        }
        Ok(())
    }

    /// Checks whether another spec is payload-compatible for idempotent
    /// re-submission. A key re-used with a different payload is a conflict.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.name == other.name
            && self.input == other.input
            && self.required_capabilities == other.required_capabilities
            && self.priority == other.priority
    }
}

/// A single unit of work assignable to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for the task.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Description of what the task does.
    pub description: String,
    /// Capabilities an agent must declare to execute this task.
    pub required_capabilities: BTreeSet<String>,
    /// Priority tier at admission. Aging promotes the effective tier in the
    /// admission queue only; the admitted tier is preserved here.
    pub priority: Priority,
    /// Input data for the task.
    pub input: Value,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// The agent executing this task. `Some` iff status is `Running` or
    /// `Cancelling` (set transiently during the assignment window).
    pub assigned_agent_id: Option<String>,
    /// Pinned agent, when the submitter addressed a specific agent.
    pub pinned_agent_id: Option<String>,
    /// Number of execution attempts so far.
    pub attempt: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Backoff eligibility: the task must not be re-assigned before this.
    pub not_before: Option<DateTime<Utc>>,
    /// Execution timeout in seconds.
    pub timeout_seconds: u64,
    /// Callback target fired on terminal status.
    pub webhook_url: Option<String>,
    /// Idempotency key supplied at submission.
    pub idempotency_key: Option<String>,
    /// Where the task originated.
    pub origin: Option<TaskOrigin>,
    /// Workflow back-reference for step tasks.
    pub workflow: Option<WorkflowRef>,
    /// Timestamp when the task was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp when the current attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp when the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result payload on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl Task {
    /// Creates a new pending task from a validated spec.
    ///
    /// # Arguments
    /// * `id` - Unique identifier for the task
    /// * `spec` - The submission payload
    #[must_use]
    pub fn from_spec(id: String, spec: TaskSpec) -> Self {
        Self {
            id,
            name: spec.name,
            description: spec.description,
            required_capabilities: spec.required_capabilities,
            priority: spec.priority,
            input: spec.input,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            pinned_agent_id: spec.agent_id,
            attempt: 0,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            not_before: None,
            timeout_seconds: spec.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            webhook_url: spec.webhook_url,
            idempotency_key: spec.idempotency_key,
            origin: spec.origin,
            workflow: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Tags the task with a workflow step back-reference.
    #[must_use]
    pub fn with_workflow_ref(mut self, workflow_ref: WorkflowRef) -> Self {
        self.workflow = Some(workflow_ref);
        self
    }

    /// Marks the task as running on the given agent.
    ///
    /// # Arguments
    /// * `agent_id` - The agent the task was assigned to
    /// * `now` - The assignment timestamp
    pub fn begin(&mut self, agent_id: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.assigned_agent_id = Some(agent_id.to_string());
        self.started_at = Some(now);
        self.attempt += 1;
        self.not_before = None;
    }

    /// Marks the task as completed with the given result.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.assigned_agent_id = None;
    }

    /// Marks the task as failed with the given error.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.assigned_agent_id = None;
    }

    /// Returns whether the retry budget allows another attempt.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.max_retries
    }

    /// Re-admits a failed task for retry with a backoff eligibility delay.
    ///
    /// # Arguments
    /// * `not_before` - Earliest instant the task may be re-assigned
    pub fn reset_for_retry(&mut self, not_before: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.assigned_agent_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.not_before = Some(not_before);
    }

    /// Marks the task as awaiting cooperative cancellation.
    pub fn begin_cancellation(&mut self) {
        self.status = TaskStatus::Cancelling;
    }

    /// Marks the task as cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        self.assigned_agent_id = None;
    }

    /// Computes the execution deadline for the current attempt.
    ///
    /// # Returns
    /// `Some(deadline)` while the task is running, `None` otherwise.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.started_at.map(|started| started + Duration::seconds(self.timeout_seconds as i64))
    }

    /// Returns whether the running task's deadline has elapsed.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Running)
            && self.deadline().is_some_and(|deadline| now > deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering_and_promotion() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);

        assert_eq!(Priority::Low.promoted(), Priority::Normal);
        assert_eq!(Priority::High.promoted(), Priority::Critical);
        assert_eq!(Priority::Critical.promoted(), Priority::Critical);

        assert_eq!(Priority::from_ordinal(2), Some(Priority::High));
        assert_eq!(Priority::from_ordinal(4), None);
    }

    #[test]
    fn test_status_transitions() {
        // Pending transitions
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));

        // Running transitions
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelling));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));

        // Retry re-admission
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));

        // Terminal statuses stay terminal
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Pending));

        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_spec_validation() {
        assert!(TaskSpec::new("analyze").validate().is_ok());
        assert!(TaskSpec::new("  ").validate().is_err());
        assert!(TaskSpec::new("t").with_timeout_seconds(0).validate().is_err());
        assert!(TaskSpec::new("t").with_webhook_url("ftp://example.com").validate().is_err());
        assert!(TaskSpec::new("t").with_webhook_url("https://example.com/cb").validate().is_ok());
    }

    #[test]
    fn test_spec_compatibility() {
        let a = TaskSpec::new("t").with_capability("python").with_input(json!({"n": 1}));
        let b = TaskSpec::new("t").with_capability("python").with_input(json!({"n": 1}));
        let c = TaskSpec::new("t").with_capability("rust").with_input(json!({"n": 1}));
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn test_task_lifecycle() {
        let mut task = Task::from_spec("task-1".to_string(), TaskSpec::new("test"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 0);

        let now = Utc::now();
        task.begin("agent-1", now);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_agent_id.as_deref(), Some("agent-1"));
        assert_eq!(task.attempt, 1);

        task.complete(json!({"ok": true}), now);
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.assigned_agent_id.is_none());
        assert_eq!(task.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_retry_budget() {
        let mut task = Task::from_spec("task-1".to_string(), TaskSpec::new("test"));
        task.max_retries = 1;

        let now = Utc::now();
        task.begin("agent-1", now);
        task.fail("boom", now);
        assert!(task.can_retry());

        task.reset_for_retry(now);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.not_before.is_some());

        task.begin("agent-1", now);
        task.fail("boom again", now);
        assert!(!task.can_retry());
    }

    #[test]
    fn test_deadline() {
        let mut task = Task::from_spec(
            "task-1".to_string(),
            TaskSpec::new("test").with_timeout_seconds(60),
        );
        assert_eq!(task.deadline(), None);

        let started = Utc::now();
        task.begin("agent-1", started);
        let deadline = task.deadline().unwrap();
        assert_eq!(deadline, started + Duration::seconds(60));

        assert!(!task.is_overdue(started + Duration::seconds(59)));
        assert!(task.is_overdue(started + Duration::seconds(61)));
    }
}
