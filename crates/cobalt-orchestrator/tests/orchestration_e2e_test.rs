//! End-to-end orchestration tests driving the scheduler and workflow
//! engine directly, without the background loops, so every step is
//! deterministic.

use std::collections::BTreeSet;
use std::sync::Arc;

use cobalt_core::bus::{MemoryBus, MessageBus};
use cobalt_core::config::CobaltConfig;
use cobalt_core::events::{CompletionReport, TaskOutcome};
use cobalt_core::models::{
    CompensationSpec, FailureKind, StepSpec, TaskSpec, TaskStatus, WorkflowSpec, WorkflowStatus,
};
use cobalt_core::storage::{MemoryStateStore, StateStore};
use cobalt_orchestrator::Orchestrator;
use serde_json::json;

struct Harness {
    store: Arc<dyn StateStore>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let mut config = CobaltConfig::default();
        // Immediate, jitter-free retries keep the tests deterministic
        config.scheduler.backoff_base_seconds = 0;
        config.scheduler.backoff_jitter = 0.0;
        let orchestrator = Orchestrator::new(Arc::clone(&store), bus, config).await;
        Self { store, orchestrator }
    }

    async fn register(&self, agent_id: &str, capabilities: &[&str]) {
        let capabilities: BTreeSet<String> =
            capabilities.iter().map(|s| (*s).to_string()).collect();
        self.orchestrator.registry().register(agent_id, capabilities).await.unwrap();
    }

    /// Runs scheduling passes and returns the tasks currently running.
    async fn assign(&self) -> Vec<cobalt_core::models::Task> {
        self.orchestrator.scheduler().run_scheduling_pass().await.unwrap();
        self.store.tasks_in_status(TaskStatus::Running).await.unwrap()
    }

    async fn complete(&self, task: &cobalt_core::models::Task, result: serde_json::Value) {
        let agent_id = task.assigned_agent_id.clone().unwrap();
        self.orchestrator
            .scheduler()
            .report_completion(CompletionReport {
                task_id: task.id.clone(),
                agent_id,
                outcome: TaskOutcome::Completed(result),
            })
            .await
            .unwrap();
    }

    async fn fail(&self, task: &cobalt_core::models::Task, error: &str) {
        let agent_id = task.assigned_agent_id.clone().unwrap();
        self.orchestrator
            .scheduler()
            .report_completion(CompletionReport {
                task_id: task.id.clone(),
                agent_id,
                outcome: TaskOutcome::Failed(error.to_string()),
            })
            .await
            .unwrap();
    }

    /// Assigns and terminally fails the named step task until its retry
    /// budget is exhausted.
    async fn exhaust(&self, task_name: &str) {
        loop {
            let running = self.assign().await;
            let Some(task) = running.iter().find(|t| t.name == task_name) else {
                // Nothing assignable: the task went terminal
                break;
            };
            self.fail(task, "deliberate failure").await;
            let task = self.store.get_task(&task.id).await.unwrap();
            if task.status == TaskStatus::Failed {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_single_task_lifecycle() {
    let h = Harness::new().await;
    h.register("worker", &["nlp"]).await;

    let task = h
        .orchestrator
        .scheduler()
        .submit(TaskSpec::new("summarize").with_capability("nlp").with_input(json!({"doc": 7})))
        .await
        .unwrap();

    let running = h.assign().await;
    assert_eq!(running.len(), 1);
    h.complete(&running[0], json!({"summary": "done"})).await;

    let task = h.store.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({"summary": "done"})));
}

#[tokio::test]
async fn test_retry_then_success_on_another_agent() {
    let h = Harness::new().await;
    h.register("agent-a", &[]).await;

    let task = h.orchestrator.scheduler().submit(TaskSpec::new("flaky")).await.unwrap();

    let running = h.assign().await;
    h.fail(&running[0], "transient").await;

    // Second attempt lands on a newly registered agent
    h.register("agent-b", &[]).await;
    let mut found = false;
    for _ in 0..5 {
        let running = h.assign().await;
        if let Some(t) = running.iter().find(|t| t.id == task.id) {
            h.complete(t, json!({})).await;
            found = true;
            break;
        }
    }
    assert!(found, "retried task was never re-assigned");

    let task = h.store.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt, 2);
}

#[tokio::test]
async fn test_linear_workflow_completes_in_order() {
    let h = Harness::new().await;
    h.register("worker", &[]).await;

    let spec = WorkflowSpec::new(
        "pipeline",
        vec![
            StepSpec::new("extract", "extract"),
            StepSpec::new("transform", "transform").after("extract"),
            StepSpec::new("load", "load").after("transform"),
        ],
    );
    let workflow = h.orchestrator.engine().start(spec).await.unwrap();

    for expected in ["extract", "transform", "load"] {
        let running = h.assign().await;
        let step_tasks: Vec<_> =
            running.iter().filter(|t| t.workflow.is_some()).collect();
        assert_eq!(step_tasks.len(), 1);
        assert_eq!(step_tasks[0].name, expected);
        h.complete(step_tasks[0], json!({})).await;
    }

    let workflow = h.orchestrator.engine().get(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(
        workflow.completion_order,
        vec!["extract".to_string(), "transform".to_string(), "load".to_string()]
    );
}

#[tokio::test]
async fn test_diamond_workflow_runs_branches_in_parallel() {
    let h = Harness::new().await;
    h.register("worker-1", &[]).await;
    h.register("worker-2", &[]).await;

    let spec = WorkflowSpec::new(
        "diamond",
        vec![
            StepSpec::new("a", "root"),
            StepSpec::new("b", "left").after("a"),
            StepSpec::new("c", "right").after("a"),
            StepSpec::new("d", "join").after("b").after("c"),
        ],
    );
    let workflow = h.orchestrator.engine().start(spec).await.unwrap();

    let running = h.assign().await;
    assert_eq!(running.len(), 1);
    h.complete(&running[0], json!({})).await;

    // Both branches execute concurrently on the two workers
    let running = h.assign().await;
    assert_eq!(running.len(), 2);
    for task in &running {
        h.complete(task, json!({})).await;
    }

    let running = h.assign().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].name, "join");
    h.complete(&running[0], json!({})).await;

    let workflow = h.orchestrator.engine().get(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_cyclic_workflow_rejected() {
    let h = Harness::new().await;
    let spec = WorkflowSpec::new(
        "loop",
        vec![StepSpec::new("a", "one").after("b"), StepSpec::new("b", "two").after("a")],
    );
    assert!(h.orchestrator.engine().start(spec).await.is_err());
}

#[tokio::test]
async fn test_saga_rolls_back_in_reverse_completion_order() {
    let h = Harness::new().await;
    h.register("worker", &[]).await;

    let spec = WorkflowSpec::new(
        "provision",
        vec![
            StepSpec::new("vm", "create-vm").with_compensation(CompensationSpec {
                name: "delete-vm".to_string(),
                input: json!(null),
                agent_id: None,
            }),
            StepSpec::new("dns", "create-dns").after("vm").with_compensation(
                CompensationSpec {
                    name: "delete-dns".to_string(),
                    input: json!(null),
                    agent_id: None,
                },
            ),
            StepSpec::new("cert", "issue-cert").after("dns"),
        ],
    );
    let workflow = h.orchestrator.engine().start(spec).await.unwrap();

    // Complete the first two steps, then exhaust the third
    for _ in 0..2 {
        let running = h.assign().await;
        h.complete(&running[0], json!({})).await;
    }
    h.exhaust("issue-cert").await;

    // Compensations run one at a time, latest completion first
    let running = h.assign().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].name, "delete-dns");
    h.complete(&running[0], json!({})).await;

    let running = h.assign().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].name, "delete-vm");
    h.complete(&running[0], json!({})).await;

    let workflow = h.orchestrator.engine().get(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let failure = workflow.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::RolledBack);
    assert_eq!(failure.failed_step_id, "cert");
    assert!(!workflow.manual_intervention_required());
}

#[tokio::test]
async fn test_failed_compensation_requires_intervention() {
    let h = Harness::new().await;
    h.register("worker", &[]).await;

    let spec = WorkflowSpec::new(
        "fragile",
        vec![
            StepSpec::new("setup", "setup").with_compensation(CompensationSpec {
                name: "teardown".to_string(),
                input: json!(null),
                agent_id: None,
            }),
            StepSpec::new("work", "work").after("setup"),
        ],
    );
    let workflow = h.orchestrator.engine().start(spec).await.unwrap();

    let running = h.assign().await;
    h.complete(&running[0], json!({})).await;
    h.exhaust("work").await;

    // The compensation itself keeps failing
    h.exhaust("teardown").await;

    let workflow = h.orchestrator.engine().get(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.failure.as_ref().unwrap().kind, FailureKind::CompensationFailed);
    assert!(workflow.manual_intervention_required());

    // A failed rollback is never resumed automatically
    assert_eq!(h.orchestrator.scheduler().run_scheduling_pass().await.unwrap(), 0);
}

#[tokio::test]
async fn test_workflow_without_compensations_rolls_back_trivially() {
    let h = Harness::new().await;
    h.register("worker", &[]).await;

    let spec = WorkflowSpec::new("plain", vec![StepSpec::new("only", "only-step")]);
    let workflow = h.orchestrator.engine().start(spec).await.unwrap();

    h.exhaust("only-step").await;

    let workflow = h.orchestrator.engine().get(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.failure.as_ref().unwrap().kind, FailureKind::RolledBack);
}

#[tokio::test]
async fn test_step_failure_cancels_inflight_sibling() {
    let h = Harness::new().await;
    h.register("worker-1", &[]).await;
    h.register("worker-2", &[]).await;

    let spec = WorkflowSpec::new(
        "parallel",
        vec![
            StepSpec::new("a", "branch-a"),
            StepSpec::new("b", "branch-b"),
            StepSpec::new("join", "join").after("a").after("b"),
        ],
    );
    let workflow = h.orchestrator.engine().start(spec).await.unwrap();

    let running = h.assign().await;
    assert_eq!(running.len(), 2);
    let failing = running.iter().find(|t| t.name == "branch-a").unwrap();
    let sibling = running.iter().find(|t| t.name == "branch-b").unwrap();

    // Exhaust branch-a while branch-b is still in flight
    h.fail(failing, "boom").await;
    let mut current = h.store.get_task(&failing.id).await.unwrap();
    while current.status != TaskStatus::Failed {
        let running = h.assign().await;
        if let Some(t) = running.iter().find(|t| t.id == failing.id) {
            h.fail(t, "boom").await;
        }
        current = h.store.get_task(&failing.id).await.unwrap();
    }

    // The sibling cancellation runs on a detached task; let it land
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let sibling = h.store.get_task(&sibling.id).await.unwrap();
    assert_eq!(sibling.status, TaskStatus::Cancelling);

    let workflow = h.orchestrator.engine().get(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_capability_routing_across_fleet() {
    let h = Harness::new().await;
    h.register("cpu-worker", &["python"]).await;
    h.register("gpu-worker", &["python", "gpu"]).await;

    let gpu_task = h
        .orchestrator
        .scheduler()
        .submit(TaskSpec::new("train").with_capability("python").with_capability("gpu"))
        .await
        .unwrap();
    h.orchestrator
        .scheduler()
        .submit(TaskSpec::new("lint").with_capability("python"))
        .await
        .unwrap();

    let running = h.assign().await;
    assert_eq!(running.len(), 2);
    let gpu_task = h.store.get_task(&gpu_task.id).await.unwrap();
    assert_eq!(gpu_task.assigned_agent_id.as_deref(), Some("gpu-worker"));
}
