//! Workflow engine with saga compensation.
//!
//! Drives a workflow by submitting frontier steps as ordinary tasks and
//! advancing on their terminal reports. When a step fails terminally, the
//! engine rolls the workflow back: declared compensations run as ordinary
//! tasks, strictly sequentially, in reverse completion order. A workflow
//! whose compensation itself fails is marked for manual intervention and
//! never retried automatically.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use cobalt_core::error::{CobaltError, Result};
use cobalt_core::models::{
    FailureKind, StepRequirement, StepRole, StepSpec, StepStatus, Task, TaskSpec, Workflow,
    WorkflowRef, WorkflowSpec, WorkflowStatus,
};
use cobalt_core::storage::{StateStore, StorageError};

use crate::scheduler::{Scheduler, StepListener};
use crate::workflow::dag;

/// Executes workflows over the scheduler.
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    scheduler: Arc<Scheduler>,
    /// Serializes workflow state mutations; step reports for the same
    /// workflow may arrive concurrently.
    advance_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine").finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Creates an engine over the given store and scheduler.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler, advance_lock: tokio::sync::Mutex::new(()) }
    }

    /// Validates and starts a workflow.
    ///
    /// Root steps are submitted immediately; independent frontier steps
    /// execute in parallel.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` for a malformed spec or
    /// `CobaltError::CyclicGraph` if the predecessor edges contain a cycle.
    pub async fn start(&self, spec: WorkflowSpec) -> Result<Workflow> {
        spec.validate()?;
        dag::validate_acyclic(&spec)?;

        let id = format!("wf-{}", uuid::Uuid::new_v4());
        let mut workflow = Workflow::from_spec(id, spec);
        workflow.activate(Utc::now());
        self.store.insert_workflow(&workflow).await?;

        let submitted = self.submit_frontier(&mut workflow).await?;
        self.store.update_workflow(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            submitted,
            "Workflow started"
        );
        Ok(workflow)
    }

    /// Fetches a workflow by id.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the workflow is unknown.
    pub async fn get(&self, workflow_id: &str) -> Result<Workflow> {
        match self.store.get_workflow(workflow_id).await {
            Ok(workflow) => Ok(workflow),
            Err(StorageError::NotFound(_)) => {
                Err(CobaltError::NotFound { kind: "workflow", id: workflow_id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Submits every frontier step as a task and marks it running.
    async fn submit_frontier(&self, workflow: &mut Workflow) -> Result<usize> {
        let ready = dag::ready_steps(workflow);
        let mut submitted = 0;
        for step_id in ready {
            let Some(step) = workflow.step(&step_id) else { continue };
            let spec = step_task_spec(&step.spec);
            let workflow_ref = WorkflowRef {
                workflow_id: workflow.id.clone(),
                step_id: step_id.clone(),
                role: StepRole::Step,
            };
            let task = self.scheduler.submit_for_workflow(spec, workflow_ref).await?;
            if let Some(step) = workflow.step_mut(&step_id) {
                step.status = StepStatus::Running;
                step.task_id = Some(task.id);
            }
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Submits the next compensation in reverse completion order.
    ///
    /// # Returns
    /// `true` if a compensation was submitted, `false` if the rollback
    /// chain is exhausted.
    async fn submit_next_compensation(&self, workflow: &mut Workflow) -> Result<bool> {
        let next = workflow
            .completion_order
            .iter()
            .rev()
            .find(|step_id| {
                workflow.step(step_id).is_some_and(|step| {
                    step.spec.compensation.is_some() && step.compensation_task_id.is_none()
                })
            })
            .cloned();

        let Some(step_id) = next else { return Ok(false) };
        let Some(step) = workflow.step(&step_id) else { return Ok(false) };
        let Some(compensation) = step.spec.compensation.clone() else { return Ok(false) };

        let mut spec = TaskSpec::new(compensation.name).with_input(compensation.input);
        match compensation.agent_id {
            Some(agent_id) => spec = spec.with_agent_id(agent_id),
            None => {
                spec = apply_requirement(spec, &step.spec.requirement);
            }
        }

        let workflow_ref = WorkflowRef {
            workflow_id: workflow.id.clone(),
            step_id: step_id.clone(),
            role: StepRole::Compensation,
        };
        let task = self.scheduler.submit_for_workflow(spec, workflow_ref).await?;
        if let Some(step) = workflow.step_mut(&step_id) {
            step.compensation_task_id = Some(task.id.clone());
        }
        info!(
            workflow_id = %workflow.id,
            step_id = %step_id,
            task_id = %task.id,
            "Compensation submitted"
        );
        Ok(true)
    }

    /// Cancels the in-flight sibling steps of a failed workflow, best
    /// effort. Cancellations run detached: a pending sibling cancels
    /// synchronously and re-enters this engine, which must not happen
    /// under the advance lock.
    fn cancel_inflight_steps(&self, workflow: &Workflow, except: &str) {
        for step in &workflow.steps {
            if step.spec.id == except || step.status != StepStatus::Running {
                continue;
            }
            let Some(task_id) = step.task_id.clone() else { continue };
            let scheduler = Arc::clone(&self.scheduler);
            let workflow_id = workflow.id.clone();
            let step_id = step.spec.id.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.cancel(&task_id).await {
                    warn!(
                        workflow_id = %workflow_id,
                        step_id = %step_id,
                        error = %e,
                        "Failed to cancel in-flight step"
                    );
                }
            });
        }
    }

    /// The id of the step whose failure triggered the rollback.
    fn failed_step_id(workflow: &Workflow) -> String {
        workflow
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.spec.id.clone())
            .unwrap_or_default()
    }

    async fn advance_after_step_completed(&self, task: &Task, workflow_ref: &WorkflowRef) -> Result<()> {
        let mut workflow = self.get(&workflow_ref.workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Ok(());
        }

        let result = task.result.clone().unwrap_or(serde_json::Value::Null);
        workflow.record_step_completed(&workflow_ref.step_id, result);

        if workflow.all_steps_completed() {
            workflow.complete(Utc::now());
            info!(workflow_id = %workflow.id, "Workflow completed");
        } else if workflow.rolling_back() {
            // A sibling already failed; this late completion joins the
            // rollback set. The chain is strictly sequential, so only
            // extend it when no compensation is in flight.
            if !workflow.compensation_in_flight()
                && !self.submit_next_compensation(&mut workflow).await?
            {
                let failed = Self::failed_step_id(&workflow);
                workflow.fail(FailureKind::RolledBack, &failed, Utc::now());
            }
        } else {
            self.submit_frontier(&mut workflow).await?;
        }
        self.store.update_workflow(&workflow).await?;
        Ok(())
    }

    async fn advance_after_step_failed(&self, task: &Task, workflow_ref: &WorkflowRef) -> Result<()> {
        let mut workflow = self.get(&workflow_ref.workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Ok(());
        }

        let already_rolling_back = workflow.rolling_back() || workflow.compensation_in_flight();
        let error = task.error.clone().unwrap_or_else(|| "step failed".to_string());
        workflow.record_step_failed(&workflow_ref.step_id, error);
        warn!(
            workflow_id = %workflow.id,
            step_id = %workflow_ref.step_id,
            "Step failed terminally, rolling back"
        );

        if already_rolling_back {
            // A cancelled or racing sibling; the first failure already
            // started the rollback chain
            self.store.update_workflow(&workflow).await?;
            return Ok(());
        }

        self.cancel_inflight_steps(&workflow, &workflow_ref.step_id);

        if !self.submit_next_compensation(&mut workflow).await? {
            workflow.fail(FailureKind::RolledBack, &workflow_ref.step_id, Utc::now());
            info!(workflow_id = %workflow.id, "Workflow rolled back (no compensations declared)");
        }
        self.store.update_workflow(&workflow).await?;
        Ok(())
    }

    async fn advance_after_compensation_completed(&self, workflow_ref: &WorkflowRef) -> Result<()> {
        let mut workflow = self.get(&workflow_ref.workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Ok(());
        }

        if let Some(step) = workflow.step_mut(&workflow_ref.step_id) {
            step.compensated = true;
        }
        if !self.submit_next_compensation(&mut workflow).await? {
            let failed = Self::failed_step_id(&workflow);
            workflow.fail(FailureKind::RolledBack, &failed, Utc::now());
            info!(workflow_id = %workflow.id, "Workflow rolled back");
        }
        self.store.update_workflow(&workflow).await?;
        Ok(())
    }

    async fn advance_after_compensation_failed(&self, workflow_ref: &WorkflowRef) -> Result<()> {
        let mut workflow = self.get(&workflow_ref.workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Ok(());
        }

        let failed = Self::failed_step_id(&workflow);
        workflow.fail(FailureKind::CompensationFailed, &failed, Utc::now());
        self.store.update_workflow(&workflow).await?;
        error!(
            workflow_id = %workflow.id,
            step_id = %workflow_ref.step_id,
            "Compensation failed; manual intervention required"
        );
        Ok(())
    }
}

#[async_trait]
impl StepListener for WorkflowEngine {
    async fn on_step_task_completed(&self, task: &Task) {
        let Some(workflow_ref) = task.workflow.clone() else { return };
        let _guard = self.advance_lock.lock().await;
        let outcome = match workflow_ref.role {
            StepRole::Step => self.advance_after_step_completed(task, &workflow_ref).await,
            StepRole::Compensation => {
                self.advance_after_compensation_completed(&workflow_ref).await
            }
        };
        if let Err(e) = outcome {
            error!(
                workflow_id = %workflow_ref.workflow_id,
                step_id = %workflow_ref.step_id,
                error = %e,
                "Failed to advance workflow"
            );
        }
    }

    async fn on_step_task_failed(&self, task: &Task) {
        let Some(workflow_ref) = task.workflow.clone() else { return };
        let _guard = self.advance_lock.lock().await;
        let outcome = match workflow_ref.role {
            StepRole::Step => self.advance_after_step_failed(task, &workflow_ref).await,
            StepRole::Compensation => self.advance_after_compensation_failed(&workflow_ref).await,
        };
        if let Err(e) = outcome {
            error!(
                workflow_id = %workflow_ref.workflow_id,
                step_id = %workflow_ref.step_id,
                error = %e,
                "Failed to roll back workflow"
            );
        }
    }
}

/// Builds the task spec for a forward step.
fn step_task_spec(step: &StepSpec) -> TaskSpec {
    let mut spec = TaskSpec::new(step.name.clone()).with_input(step.input.clone());
    if let Some(timeout) = step.timeout_seconds {
        spec = spec.with_timeout_seconds(timeout);
    }
    apply_requirement(spec, &step.requirement)
}

fn apply_requirement(mut spec: TaskSpec, requirement: &StepRequirement) -> TaskSpec {
    match requirement {
        StepRequirement::Capabilities(capabilities) => {
            for capability in capabilities {
                spec = spec.with_capability(capability.clone());
            }
            spec
        }
        StepRequirement::Agent(agent_id) => spec.with_agent_id(agent_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_core::models::StepSpec;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn test_step_task_spec_carries_requirement() {
        let step = StepSpec::new("a", "build")
            .with_capability("rust")
            .with_input(json!({"target": "release"}));
        let spec = step_task_spec(&step);
        assert_eq!(spec.name, "build");
        assert_eq!(spec.required_capabilities, BTreeSet::from(["rust".to_string()]));
        assert_eq!(spec.input, json!({"target": "release"}));
        assert!(spec.agent_id.is_none());
    }

    #[test]
    fn test_step_task_spec_pins_agent() {
        let step = StepSpec::new("a", "deploy").with_agent("deployer-1");
        let spec = step_task_spec(&step);
        assert_eq!(spec.agent_id.as_deref(), Some("deployer-1"));
        assert!(spec.required_capabilities.is_empty());
    }
}
