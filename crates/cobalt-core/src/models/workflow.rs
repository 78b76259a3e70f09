//! Workflow data structures for the orchestration core.
//!
//! A workflow is a directed acyclic graph of steps, each backed by a task.
//! Execution ordering derives solely from the declared predecessor edges;
//! the advisory `order` field is display-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::{CobaltError, Result};

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow is defined but not yet started.
    #[default]
    Draft,
    /// Workflow steps are executing.
    Active,
    /// All steps completed.
    Completed,
    /// A step exhausted its retries; see the failure marker for the outcome
    /// of compensation.
    Failed,
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step is waiting for its predecessors.
    #[default]
    Pending,
    /// Step task is submitted or executing.
    Running,
    /// Step task completed.
    Completed,
    /// Step task failed terminally.
    Failed,
}

impl StepStatus {
    /// Returns whether the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How a failed workflow ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// All declared compensations completed; side effects were rolled back.
    RolledBack,
    /// A compensation itself failed. Manual intervention is required; the
    /// workflow is excluded from any further automatic retry.
    CompensationFailed,
}

/// Failure marker recorded on a `Failed` workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    /// Rollback outcome.
    pub kind: FailureKind,
    /// The step whose terminal failure triggered compensation.
    pub failed_step_id: String,
}

/// How a step selects its executing agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRequirement {
    /// Match any idle agent declaring these capabilities.
    Capabilities(BTreeSet<String>),
    /// Pin the step to a specific agent.
    Agent(String),
}

impl Default for StepRequirement {
    fn default() -> Self {
        Self::Capabilities(BTreeSet::new())
    }
}

/// Compensating action declared for a step at workflow-definition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Name for the compensation task.
    pub name: String,
    /// Input payload for the compensation task.
    #[serde(default)]
    pub input: Value,
    /// Designated compensating agent; `None` reuses the step's requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Definition of a single workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique (per-workflow) step identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Agent selection for this step.
    #[serde(default)]
    pub requirement: StepRequirement,
    /// Steps that must complete before this one may start. These edges are
    /// the sole ordering authority.
    #[serde(default)]
    pub predecessors: Vec<String>,
    /// Saga compensation for this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSpec>,
    /// Input payload for the step task.
    #[serde(default)]
    pub input: Value,
    /// Execution timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Advisory display order. Never used for sequencing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
}

impl StepSpec {
    /// Creates a new step spec with the given id and name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            requirement: StepRequirement::default(),
            predecessors: Vec::new(),
            compensation: None,
            input: Value::Null,
            timeout_seconds: None,
            order: None,
        }
    }

    /// Requires a capability for this step.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        match &mut self.requirement {
            StepRequirement::Capabilities(set) => {
                set.insert(capability.into());
            }
            StepRequirement::Agent(_) => {
                let mut set = BTreeSet::new();
                set.insert(capability.into());
                self.requirement = StepRequirement::Capabilities(set);
            }
        }
        self
    }

    /// Pins this step to a specific agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.requirement = StepRequirement::Agent(agent_id.into());
        self
    }

    /// Adds a predecessor edge.
    #[must_use]
    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.predecessors.push(predecessor.into());
        self
    }

    /// Declares a compensation for this step.
    #[must_use]
    pub fn with_compensation(mut self, compensation: CompensationSpec) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Sets the step input payload.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// Submission payload for a new workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Human-readable name.
    pub name: String,
    /// Description of the workflow.
    #[serde(default)]
    pub description: String,
    /// The workflow steps, in declaration order.
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    /// Creates a new workflow spec.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self { name: name.into(), description: String::new(), steps }
    }

    /// Validates the structural constraints of the spec.
    ///
    /// Cycle detection runs separately in the workflow engine; this method
    /// checks names, uniqueness, and that predecessor ids exist.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` if the spec is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CobaltError::Validation("workflow name cannot be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(CobaltError::Validation("workflow must declare at least one step".to_string()));
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(CobaltError::Validation("step id cannot be empty".to_string()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(CobaltError::Validation(format!("duplicate step id '{}'", step.id)));
            }
        }

        for step in &self.steps {
            for predecessor in &step.predecessors {
                if !seen.contains(predecessor.as_str()) {
                    return Err(CobaltError::Validation(format!(
                        "step '{}' references unknown predecessor '{}'",
                        step.id, predecessor
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Runtime state of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// The step definition.
    pub spec: StepSpec,
    /// Current status.
    pub status: StepStatus,
    /// The task currently bound to this step, once submitted.
    pub task_id: Option<String>,
    /// The compensation task, once submitted during rollback.
    pub compensation_task_id: Option<String>,
    /// Whether the compensation task completed.
    pub compensated: bool,
    /// Result payload from the completed step task.
    pub result: Option<Value>,
    /// Error from the failed step task.
    pub error: Option<String>,
}

impl StepState {
    fn new(spec: StepSpec) -> Self {
        Self {
            spec,
            status: StepStatus::Pending,
            task_id: None,
            compensation_task_id: None,
            compensated: false,
            result: None,
            error: None,
        }
    }
}

/// A workflow instance: definition plus execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for the workflow.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Description of the workflow.
    pub description: String,
    /// Steps in declaration order.
    pub steps: Vec<StepState>,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// Failure marker, set when status is `Failed`.
    pub failure: Option<WorkflowFailure>,
    /// Step ids in the order they completed. Compensation walks this in
    /// reverse.
    pub completion_order: Vec<String>,
    /// Timestamp when the workflow was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp when the workflow became active.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp when the workflow reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Creates a draft workflow from a validated spec.
    ///
    /// # Arguments
    /// * `id` - Unique identifier for the workflow
    /// * `spec` - The submission payload
    #[must_use]
    pub fn from_spec(id: String, spec: WorkflowSpec) -> Self {
        Self {
            id,
            name: spec.name,
            description: spec.description,
            steps: spec.steps.into_iter().map(StepState::new).collect(),
            status: WorkflowStatus::Draft,
            failure: None,
            completion_order: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Looks up a step by id.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.spec.id == step_id)
    }

    /// Looks up a step by id, mutably.
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.spec.id == step_id)
    }

    /// Marks the workflow active.
    pub fn activate(&mut self, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Active;
        self.started_at = Some(now);
    }

    /// Records a step completion, preserving completion order for rollback.
    ///
    /// # Arguments
    /// * `step_id` - The completed step
    /// * `result` - The step task's result payload
    pub fn record_step_completed(&mut self, step_id: &str, result: Value) {
        if let Some(step) = self.step_mut(step_id) {
            step.status = StepStatus::Completed;
            step.result = Some(result);
        }
        self.completion_order.push(step_id.to_string());
    }

    /// Records a terminal step failure.
    pub fn record_step_failed(&mut self, step_id: &str, error: impl Into<String>) {
        if let Some(step) = self.step_mut(step_id) {
            step.status = StepStatus::Failed;
            step.error = Some(error.into());
        }
    }

    /// Returns whether every step has completed.
    #[must_use]
    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Returns whether a step failure has put the workflow into rollback.
    #[must_use]
    pub fn rolling_back(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Returns whether a compensation task is currently in flight.
    #[must_use]
    pub fn compensation_in_flight(&self) -> bool {
        self.steps.iter().any(|s| s.compensation_task_id.is_some() && !s.compensated)
    }

    /// Marks the workflow completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Marks the workflow failed with a rollback outcome marker.
    ///
    /// # Arguments
    /// * `kind` - Whether compensation rolled back cleanly or itself failed
    /// * `failed_step_id` - The step that triggered the failure
    /// * `now` - Timestamp of the terminal transition
    pub fn fail(&mut self, kind: FailureKind, failed_step_id: &str, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Failed;
        self.failure =
            Some(WorkflowFailure { kind, failed_step_id: failed_step_id.to_string() });
        self.completed_at = Some(now);
    }

    /// Returns whether this workflow requires operator intervention.
    #[must_use]
    pub fn manual_intervention_required(&self) -> bool {
        matches!(
            self.failure,
            Some(WorkflowFailure { kind: FailureKind::CompensationFailed, .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_spec() -> WorkflowSpec {
        WorkflowSpec::new(
            "deploy",
            vec![
                StepSpec::new("a", "build").with_capability("build"),
                StepSpec::new("b", "test").with_capability("test").after("a"),
                StepSpec::new("c", "ship").with_capability("deploy").after("b"),
            ],
        )
    }

    #[test]
    fn test_spec_validation() {
        assert!(linear_spec().validate().is_ok());

        let empty = WorkflowSpec::new("w", vec![]);
        assert!(empty.validate().is_err());

        let duplicate = WorkflowSpec::new(
            "w",
            vec![StepSpec::new("a", "one"), StepSpec::new("a", "two")],
        );
        assert!(duplicate.validate().is_err());

        let dangling =
            WorkflowSpec::new("w", vec![StepSpec::new("a", "one").after("missing")]);
        assert!(dangling.validate().is_err());
    }

    #[test]
    fn test_step_lookup() {
        let workflow = Workflow::from_spec("wf-1".to_string(), linear_spec());
        assert!(workflow.step("b").is_some());
        assert!(workflow.step("z").is_none());
        assert_eq!(workflow.step("b").unwrap().spec.predecessors, vec!["a".to_string()]);
    }

    #[test]
    fn test_completion_order_preserved() {
        let mut workflow = Workflow::from_spec("wf-1".to_string(), linear_spec());
        workflow.activate(Utc::now());

        workflow.record_step_completed("a", json!({"artifact": "x"}));
        workflow.record_step_completed("b", json!({"passed": true}));
        assert_eq!(workflow.completion_order, vec!["a".to_string(), "b".to_string()]);
        assert!(!workflow.all_steps_completed());

        workflow.record_step_completed("c", json!({}));
        assert!(workflow.all_steps_completed());
    }

    #[test]
    fn test_failure_markers() {
        let mut workflow = Workflow::from_spec("wf-1".to_string(), linear_spec());
        workflow.activate(Utc::now());
        workflow.record_step_failed("b", "agent exploded");

        workflow.fail(FailureKind::RolledBack, "b", Utc::now());
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(!workflow.manual_intervention_required());

        workflow.fail(FailureKind::CompensationFailed, "b", Utc::now());
        assert!(workflow.manual_intervention_required());
    }
}
