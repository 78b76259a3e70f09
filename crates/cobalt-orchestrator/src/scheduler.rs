//! Task scheduler.
//!
//! Owns admission, assignment, completion, retry, and cancellation for
//! tasks. Runs a periodic scheduling pass that drains the admission queue
//! against the idle agent pool, and consumes completion reports from the
//! bus.
//!
//! All status changes go through compare-and-swap transitions in the state
//! store. A lost race is re-read and either retried against the next
//! candidate or dropped as a duplicate; it is never surfaced to callers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use cobalt_core::bus::{encode, MessageBus};
use cobalt_core::config::{CallbackConfig, SchedulerConfig};
use cobalt_core::error::{CobaltError, Result};
use cobalt_core::events::{
    AssignmentEvent, CancellationSignal, CompletionReport, TaskOutcome, SUBJECT_TASK_ASSIGN,
    SUBJECT_TASK_CANCEL, SUBJECT_TASK_RESULTS,
};
use cobalt_core::models::{Agent, AgentStatus, Task, TaskSpec, TaskStatus, WorkflowRef};
use cobalt_core::storage::{StateStore, StorageError};

use crate::callback::CallbackDispatcher;
use crate::queue::AdmissionQueue;
use crate::registry::AgentRegistry;

/// Observer notified when a workflow step task reaches a terminal status.
#[async_trait]
pub trait StepListener: Send + Sync {
    /// Called when a step task completes successfully.
    async fn on_step_task_completed(&self, task: &Task);

    /// Called when a step task fails terminally or is cancelled.
    async fn on_step_task_failed(&self, task: &Task);
}

/// Task scheduler over a state store, agent registry, and message bus.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<AgentRegistry>,
    queue: Arc<AdmissionQueue>,
    callbacks: CallbackDispatcher,
    config: SchedulerConfig,
    listener: tokio::sync::RwLock<Option<Arc<dyn StepListener>>>,
    shutdown_tx: Mutex<Option<watch::Sender<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Arguments
    /// * `store` - The authoritative state store
    /// * `bus` - Transport for assignment and cancellation events
    /// * `registry` - The agent registry
    /// * `config` - Scheduler tuning
    /// * `callback_config` - Webhook callback tuning
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<AgentRegistry>,
        config: SchedulerConfig,
        callback_config: CallbackConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            queue: Arc::new(AdmissionQueue::new()),
            callbacks: CallbackDispatcher::new(callback_config),
            config,
            listener: tokio::sync::RwLock::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Registers the workflow engine as observer of step task outcomes.
    pub async fn set_step_listener(&self, listener: Arc<dyn StepListener>) {
        *self.listener.write().await = Some(listener);
    }

    /// Submits a task for execution.
    ///
    /// If the spec carries an idempotency key already bound to a live task
    /// with the same payload, that task is returned instead of creating a
    /// duplicate. A terminally failed task does not block re-submission
    /// under the same key.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` for a malformed spec, or
    /// `CobaltError::Conflict` when the idempotency key is reused with a
    /// different payload.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task> {
        spec.validate()?;

        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.store.find_task_by_idempotency_key(key).await? {
                let same_payload = existing.name == spec.name
                    && existing.input == spec.input
                    && existing.required_capabilities == spec.required_capabilities
                    && existing.priority == spec.priority;
                if !same_payload {
                    return Err(CobaltError::Conflict(format!(
                        "idempotency key '{key}' is bound to task {} with a different payload",
                        existing.id
                    )));
                }
                if existing.status != TaskStatus::Failed {
                    debug!(task_id = %existing.id, key = %key, "Idempotent re-submission");
                    return Ok(existing);
                }
            }
        }

        self.admit(spec, None).await
    }

    /// Submits a workflow step (or compensation) task on behalf of the
    /// workflow engine.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` for a malformed spec.
    pub async fn submit_for_workflow(
        &self,
        spec: TaskSpec,
        workflow_ref: WorkflowRef,
    ) -> Result<Task> {
        spec.validate()?;
        self.admit(spec, Some(workflow_ref)).await
    }

    async fn admit(&self, spec: TaskSpec, workflow_ref: Option<WorkflowRef>) -> Result<Task> {
        let id = format!("task-{}", uuid::Uuid::new_v4());
        let mut task = Task::from_spec(id, spec);
        if let Some(workflow_ref) = workflow_ref {
            task = task.with_workflow_ref(workflow_ref);
        }
        self.store.insert_task(&task).await?;
        self.queue.push(&task).await;
        info!(
            task_id = %task.id,
            name = %task.name,
            priority = task.priority.ordinal(),
            "Task submitted"
        );
        Ok(task)
    }

    /// Fetches a task by id.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the task is unknown.
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        match self.store.get_task(task_id).await {
            Ok(task) => Ok(task),
            Err(StorageError::NotFound(_)) => {
                Err(CobaltError::NotFound { kind: "task", id: task_id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs one scheduling pass: ages the queue, then assigns every
    /// eligible pending task for which a compatible idle agent exists.
    ///
    /// # Returns
    /// The number of tasks assigned in this pass.
    ///
    /// # Errors
    /// Returns a storage error if the pass cannot read the store at all;
    /// per-task races are absorbed.
    pub async fn run_scheduling_pass(&self) -> Result<usize> {
        let now = Utc::now();
        let threshold = Duration::seconds(self.config.aging_threshold_seconds as i64);
        self.queue.apply_aging(now, threshold).await;

        let mut assigned = 0;
        let mut unassigned = Vec::new();

        while let Some(entry) = self.queue.pop_eligible(now).await {
            let task = match self.store.get_task(&entry.task_id).await {
                Ok(task) => task,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    // Keep every popped entry; the store may recover
                    self.queue.requeue(entry).await;
                    self.requeue_all(unassigned).await;
                    return Err(e.into());
                }
            };
            // Stale entry: the task was cancelled or already picked up
            if task.status != TaskStatus::Pending {
                continue;
            }

            let agent = match self.registry.select_for(&task).await {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    unassigned.push(entry);
                    continue;
                }
                Err(e) => {
                    self.queue.requeue(entry).await;
                    self.requeue_all(unassigned).await;
                    return Err(e);
                }
            };

            match self.try_assign(task, agent, now).await {
                Ok(()) => assigned += 1,
                Err(CobaltError::AssignmentRace) => {
                    debug!(task_id = %entry.task_id, "Assignment race lost, requeueing");
                    self.queue.requeue(entry).await;
                }
                Err(e) => {
                    self.queue.requeue(entry).await;
                    self.requeue_all(unassigned).await;
                    return Err(e);
                }
            }
        }

        self.requeue_all(unassigned).await;
        Ok(assigned)
    }

    async fn requeue_all(&self, entries: Vec<crate::queue::QueuedTask>) {
        for entry in entries {
            self.queue.requeue(entry).await;
        }
    }

    /// Assigns a pending task to an idle agent via paired CAS transitions.
    async fn try_assign(&self, mut task: Task, mut agent: Agent, now: DateTime<Utc>) -> Result<()> {
        task.begin(&agent.id, now);
        match self.store.transition_task(&task, TaskStatus::Pending).await {
            Ok(()) => {}
            Err(StorageError::PreconditionFailed(_)) => return Err(CobaltError::AssignmentRace),
            Err(e) => return Err(e.into()),
        }

        agent.assign(&task.id);
        match self.store.transition_agent(&agent, AgentStatus::Idle).await {
            Ok(()) => {}
            Err(StorageError::PreconditionFailed(_)) => {
                // Undo the task side and let the next pass retry
                let mut rollback = task.clone();
                rollback.status = TaskStatus::Pending;
                rollback.assigned_agent_id = None;
                rollback.started_at = None;
                rollback.attempt = rollback.attempt.saturating_sub(1);
                if let Err(e) = self.store.transition_task(&rollback, TaskStatus::Running).await {
                    error!(task_id = %task.id, error = %e, "Failed to roll back lost assignment");
                }
                return Err(CobaltError::AssignmentRace);
            }
            Err(e) => return Err(e.into()),
        }

        let event = AssignmentEvent {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            attempt: task.attempt,
            input: task.input.clone(),
        };
        self.bus.publish(SUBJECT_TASK_ASSIGN, encode(&event)?).await?;
        info!(
            task_id = %task.id,
            agent_id = %agent.id,
            attempt = task.attempt,
            "Task assigned"
        );
        Ok(())
    }

    /// Applies a completion report from an agent.
    ///
    /// Handling is idempotent: a duplicate report for a task already in a
    /// terminal status is silently ignored.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the reported task is unknown.
    pub async fn report_completion(&self, report: CompletionReport) -> Result<()> {
        let task = self.get_task(&report.task_id).await?;

        if task.status.is_terminal() {
            debug!(task_id = %task.id, "Duplicate completion report ignored");
            return Ok(());
        }
        if task.status == TaskStatus::Pending {
            // The task was reclaimed and re-queued before this report landed
            warn!(task_id = %task.id, agent_id = %report.agent_id, "Stale completion report ignored");
            return Ok(());
        }

        let expected = task.status;
        match report.outcome {
            TaskOutcome::Completed(result) => {
                self.finish_success(task, expected, result, &report.agent_id).await
            }
            TaskOutcome::Failed(error) => {
                self.handle_failure(task, expected, error, Some(&report.agent_id)).await
            }
        }
    }

    async fn finish_success(
        &self,
        mut task: Task,
        expected: TaskStatus,
        result: serde_json::Value,
        agent_id: &str,
    ) -> Result<()> {
        let now = Utc::now();
        task.complete(result, now);
        match self.store.transition_task(&task, expected).await {
            Ok(()) => {}
            Err(StorageError::PreconditionFailed(_)) => {
                debug!(task_id = %task.id, "Completion raced a concurrent transition, ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.release_agent(agent_id, &task.id, true, now).await;
        info!(task_id = %task.id, agent_id = %agent_id, "Task completed");
        self.callbacks.notify(&task);
        self.notify_listener(&task).await;
        Ok(())
    }

    /// Applies a task failure: retry with backoff while the budget allows,
    /// terminal failure otherwise.
    async fn handle_failure(
        &self,
        mut task: Task,
        expected: TaskStatus,
        error: String,
        agent_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();

        // Cancelling tasks never retry; the failure just finishes them
        let retry = expected == TaskStatus::Running && task.can_retry();
        if retry {
            let delay = self.backoff_delay(task.attempt);
            task.error = Some(error.clone());
            task.reset_for_retry(now + delay);
            match self.store.transition_task(&task, expected).await {
                Ok(()) => {}
                Err(StorageError::PreconditionFailed(_)) => {
                    debug!(task_id = %task.id, "Failure report raced a concurrent transition, ignored");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            self.queue.push(&task).await;
            warn!(
                task_id = %task.id,
                attempt = task.attempt,
                max_retries = task.max_retries,
                delay_ms = delay.num_milliseconds(),
                error = %error,
                "Task failed, retry scheduled"
            );
        } else {
            task.fail(error.clone(), now);
            match self.store.transition_task(&task, expected).await {
                Ok(()) => {}
                Err(StorageError::PreconditionFailed(_)) => {
                    debug!(task_id = %task.id, "Failure report raced a concurrent transition, ignored");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            error!(
                task_id = %task.id,
                attempt = task.attempt,
                error = %error,
                "Task failed terminally"
            );
            self.callbacks.notify(&task);
            self.notify_listener(&task).await;
        }

        if let Some(agent_id) = agent_id {
            self.release_agent(agent_id, &task.id, false, now).await;
        }
        Ok(())
    }

    /// Requests cancellation of a task.
    ///
    /// A pending task is cancelled synchronously. A running task moves to
    /// `Cancelling` and a signal is published for the agent to acknowledge.
    ///
    /// # Returns
    /// The task's status after the request.
    ///
    /// # Errors
    /// Returns `CobaltError::Conflict` if the task is already terminal.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        let mut task = self.get_task(task_id).await?;
        let now = Utc::now();

        match task.status {
            TaskStatus::Pending => {
                self.queue.remove(&task.id).await;
                task.cancel(now);
                match self.store.transition_task(&task, TaskStatus::Pending).await {
                    Ok(()) => {}
                    Err(StorageError::PreconditionFailed(_)) => {
                        // Raced an assignment; retry against the new status
                        return Box::pin(self.cancel(task_id)).await;
                    }
                    Err(e) => return Err(e.into()),
                }
                info!(task_id = %task.id, "Pending task cancelled");
                self.callbacks.notify(&task);
                self.notify_listener(&task).await;
                Ok(TaskStatus::Cancelled)
            }
            TaskStatus::Running => {
                task.begin_cancellation();
                match self.store.transition_task(&task, TaskStatus::Running).await {
                    Ok(()) => {}
                    Err(StorageError::PreconditionFailed(_)) => {
                        return Box::pin(self.cancel(task_id)).await;
                    }
                    Err(e) => return Err(e.into()),
                }
                let signal = CancellationSignal { task_id: task.id.clone() };
                self.bus.publish(SUBJECT_TASK_CANCEL, encode(&signal)?).await?;
                info!(task_id = %task.id, "Cancellation requested");
                Ok(TaskStatus::Cancelling)
            }
            TaskStatus::Cancelling => Ok(TaskStatus::Cancelling),
            status => {
                Err(CobaltError::Conflict(format!("task {task_id} is already terminal ({status:?})")))
            }
        }
    }

    /// Acknowledges a cooperative cancellation from the executing agent.
    ///
    /// # Errors
    /// Returns `CobaltError::Conflict` if the task is not awaiting
    /// cancellation.
    pub async fn acknowledge_cancellation(&self, task_id: &str) -> Result<()> {
        let mut task = self.get_task(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            return Ok(());
        }
        if task.status != TaskStatus::Cancelling {
            return Err(CobaltError::Conflict(format!(
                "task {task_id} is not awaiting cancellation ({:?})",
                task.status
            )));
        }

        let now = Utc::now();
        let agent_id = task.assigned_agent_id.clone();
        task.cancel(now);
        match self.store.transition_task(&task, TaskStatus::Cancelling).await {
            Ok(()) => {}
            Err(StorageError::PreconditionFailed(_)) => {
                debug!(task_id = %task.id, "Cancellation ack raced a final report, ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(agent_id) = agent_id {
            self.idle_agent_without_counting(&agent_id, &task.id, now).await;
        }
        info!(task_id = %task.id, "Task cancelled");
        self.callbacks.notify(&task);
        self.notify_listener(&task).await;
        Ok(())
    }

    /// Reclaims the current task of a lost agent by synthesizing a liveness
    /// failure that flows through the ordinary retry path.
    ///
    /// Called by the heartbeat monitor after marking the agent `Error`.
    ///
    /// # Errors
    /// Returns a storage error if the reclaim cannot be persisted.
    pub async fn reclaim_from_lost_agent(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let task = match self.get_task(task_id).await {
            Ok(task) => task,
            Err(CobaltError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        // A task already awaiting cancellation just finalizes; the agent
        // will never acknowledge
        if task.status == TaskStatus::Cancelling {
            return self.acknowledge_cancellation(&task.id).await;
        }
        if task.status != TaskStatus::Running {
            return Ok(());
        }

        let error = CobaltError::LivenessTimeout { agent_id: agent_id.to_string() }.to_string();
        // The agent is already marked Error; do not release it back to idle
        self.handle_failure(task, TaskStatus::Running, error, None).await
    }

    /// Fails every running task whose execution deadline has elapsed.
    ///
    /// The agent is signalled to stop, and the task flows through the
    /// ordinary retry path.
    ///
    /// # Errors
    /// Returns a storage error if the overdue scan fails.
    pub async fn check_deadlines(&self) -> Result<()> {
        let now = Utc::now();
        let running = self.store.tasks_in_status(TaskStatus::Running).await?;
        for task in running {
            if !task.is_overdue(now) {
                continue;
            }
            warn!(
                task_id = %task.id,
                timeout_seconds = task.timeout_seconds,
                "Task exceeded its execution deadline"
            );
            let signal = CancellationSignal { task_id: task.id.clone() };
            self.bus.publish(SUBJECT_TASK_CANCEL, encode(&signal)?).await?;

            let agent_id = task.assigned_agent_id.clone();
            let error = format!("execution timeout after {}s", task.timeout_seconds);
            self.handle_failure(task, TaskStatus::Running, error, agent_id.as_deref()).await?;
        }
        Ok(())
    }

    /// Rebuilds the admission queue from the store's pending set.
    ///
    /// Called on startup so tasks admitted by a previous process are not
    /// stranded.
    ///
    /// # Errors
    /// Returns a storage error if the pending scan fails.
    pub async fn rebuild_queue(&self) -> Result<usize> {
        let pending = self.store.tasks_in_status(TaskStatus::Pending).await?;
        let count = pending.len();
        for task in pending {
            self.queue.push(&task).await;
        }
        if count > 0 {
            info!(count, "Admission queue rebuilt from store");
        }
        Ok(count)
    }

    /// Starts the scheduling loop and the results consumer in background
    /// tasks.
    ///
    /// # Errors
    /// Returns `CobaltError::Conflict` if the scheduler is already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = {
            let mut slot = self
                .shutdown_tx
                .lock()
                .map_err(|_| CobaltError::Bus("scheduler shutdown lock poisoned".to_string()))?;
            if slot.is_some() {
                return Err(CobaltError::Conflict("scheduler is already running".to_string()));
            }
            let (tx, rx) = watch::channel(());
            *slot = Some(tx.clone());
            (tx, rx)
        };
        drop(shutdown_tx);

        self.spawn_scheduling_loop(shutdown_rx.clone());
        self.spawn_results_consumer(shutdown_rx).await?;
        info!("Scheduler started");
        Ok(())
    }

    fn spawn_scheduling_loop(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                time::interval(std::time::Duration::from_millis(scheduler.config.pass_interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Scheduling loop shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.run_scheduling_pass().await {
                            error!(error = %e, "Scheduling pass failed");
                        }
                        if let Err(e) = scheduler.check_deadlines().await {
                            error!(error = %e, "Deadline check failed");
                        }
                    }
                }
            }
        });
    }

    async fn spawn_results_consumer(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<()> {
        let mut receiver = self.bus.subscribe(SUBJECT_TASK_RESULTS).await?;
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Results consumer shutdown signal received");
                        break;
                    }
                    payload = receiver.recv() => {
                        match payload {
                            Ok(payload) => {
                                match cobalt_core::bus::decode::<CompletionReport>(payload) {
                                    Ok(report) => {
                                        if let Err(e) = scheduler.report_completion(report).await {
                                            error!(error = %e, "Failed to apply completion report");
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "Malformed completion report"),
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Results consumer lagged; reports dropped");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Signals the background tasks to stop.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Computes the retry delay for the given attempt with symmetric jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_seconds as f64;
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = base * self.config.backoff_multiplier.powi(exponent as i32);
        let jitter = self.config.backoff_jitter;
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::milliseconds((raw * factor * 1000.0) as i64)
    }

    async fn notify_listener(&self, task: &Task) {
        if task.workflow.is_none() {
            return;
        }
        let listener = self.listener.read().await.clone();
        if let Some(listener) = listener {
            match task.status {
                TaskStatus::Completed => listener.on_step_task_completed(task).await,
                TaskStatus::Failed | TaskStatus::Cancelled => {
                    listener.on_step_task_failed(task).await;
                }
                _ => {}
            }
        }
    }

    /// Releases an agent back to idle after its task reached a terminal
    /// status, counting the outcome. Races and missing agents are absorbed.
    async fn release_agent(&self, agent_id: &str, task_id: &str, success: bool, now: DateTime<Utc>) {
        let Ok(mut agent) = self.store.get_agent(agent_id).await else {
            return;
        };
        if agent.status != AgentStatus::Running || agent.current_task_id.as_deref() != Some(task_id)
        {
            return;
        }
        agent.release(success, now);
        if let Err(e) = self.store.transition_agent(&agent, AgentStatus::Running).await {
            debug!(agent_id = %agent_id, error = %e, "Agent release raced, ignored");
        }
    }

    /// Idles an agent after a cancellation, without touching its outcome
    /// counters.
    async fn idle_agent_without_counting(&self, agent_id: &str, task_id: &str, now: DateTime<Utc>) {
        let Ok(mut agent) = self.store.get_agent(agent_id).await else {
            return;
        };
        if agent.status != AgentStatus::Running || agent.current_task_id.as_deref() != Some(task_id)
        {
            return;
        }
        agent.status = AgentStatus::Idle;
        agent.current_task_id = None;
        agent.idle_since = Some(now);
        if let Err(e) = self.store.transition_agent(&agent, AgentStatus::Running).await {
            debug!(agent_id = %agent_id, error = %e, "Agent release raced, ignored");
        }
    }

    /// The underlying state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }
}
