//! In-memory state store backed by `RwLock`-guarded maps.
//!
//! Used by tests and single-process deployments. Compare-and-swap
//! transitions hold the write lock across the status check and the write,
//! so they are atomic with respect to concurrent callers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use super::{StateStore, StorageError, StorageResult};
use crate::models::{Agent, AgentStatus, ConversationSession, Task, TaskStatus, Workflow};

/// In-memory [`StateStore`] implementation.
#[derive(Default)]
pub struct MemoryStateStore {
    tasks: RwLock<HashMap<String, Task>>,
    agents: RwLock<HashMap<String, Agent>>,
    workflows: RwLock<HashMap<String, Workflow>>,
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStateStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_task(&self, task: &Task) -> StorageResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StorageError::Conflict(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StorageResult<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))
    }

    async fn update_task(&self, task: &Task) -> StorageResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(StorageError::NotFound(format!("task {}", task.id)));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn transition_task(&self, task: &Task, expected: TaskStatus) -> StorageResult<()> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get(&task.id)
            .ok_or_else(|| StorageError::NotFound(format!("task {}", task.id)))?;
        if stored.status != expected {
            return Err(StorageError::PreconditionFailed(format!(
                "task {} is {:?}, expected {:?}",
                task.id, stored.status, expected
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_task_by_idempotency_key(&self, key: &str) -> StorageResult<Option<Task>> {
        let tasks = self.tasks.read().await;
        // A terminally failed task does not shadow its live replacement
        // under the same key
        let mut failed_match = None;
        for task in tasks.values() {
            if task.idempotency_key.as_deref() != Some(key) {
                continue;
            }
            if task.status == TaskStatus::Failed {
                failed_match = Some(task.clone());
            } else {
                return Ok(Some(task.clone()));
            }
        }
        Ok(failed_match)
    }

    async fn tasks_in_status(&self, status: TaskStatus) -> StorageResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.values().filter(|t| t.status == status).cloned().collect())
    }

    async fn upsert_agent(&self, agent: &Agent) -> StorageResult<()> {
        self.agents.write().await.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_id}")))
    }

    async fn update_agent(&self, agent: &Agent) -> StorageResult<()> {
        let mut agents = self.agents.write().await;
        if !agents.contains_key(&agent.id) {
            return Err(StorageError::NotFound(format!("agent {}", agent.id)));
        }
        agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn transition_agent(&self, agent: &Agent, expected: AgentStatus) -> StorageResult<()> {
        let mut agents = self.agents.write().await;
        let stored = agents
            .get(&agent.id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {}", agent.id)))?;
        if stored.status != expected {
            return Err(StorageError::PreconditionFailed(format!(
                "agent {} is {:?}, expected {:?}",
                agent.id, stored.status, expected
            )));
        }
        agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn list_agents(&self) -> StorageResult<Vec<Agent>> {
        Ok(self.agents.read().await.values().cloned().collect())
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> StorageResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(StorageError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> StorageResult<Workflow> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("workflow {workflow_id}")))
    }

    async fn update_workflow(&self, workflow: &Workflow) -> StorageResult<()> {
        let mut workflows = self.workflows.write().await;
        if !workflows.contains_key(&workflow.id) {
            return Err(StorageError::NotFound(format!("workflow {}", workflow.id)));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn upsert_session(&self, session: &ConversationSession) -> StorageResult<()> {
        self.sessions.write().await.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<ConversationSession> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskSpec;
    use chrono::Utc;

    fn task(id: &str) -> Task {
        Task::from_spec(id.to_string(), TaskSpec::new("test"))
    }

    #[tokio::test]
    async fn test_task_insert_and_get() {
        let store = MemoryStateStore::new();
        store.insert_task(&task("task-1")).await.unwrap();

        let fetched = store.get_task("task-1").await.unwrap();
        assert_eq!(fetched.id, "task-1");

        assert!(matches!(
            store.insert_task(&task("task-1")).await,
            Err(StorageError::Conflict(_))
        ));
        assert!(matches!(store.get_task("missing").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transition_task_cas() {
        let store = MemoryStateStore::new();
        let mut t = task("task-1");
        store.insert_task(&t).await.unwrap();

        // Pending -> Running with the correct expectation succeeds
        t.begin("agent-1", Utc::now());
        store.transition_task(&t, TaskStatus::Pending).await.unwrap();

        // A second writer still expecting Pending loses the race
        let stale = task("task-1");
        assert!(matches!(
            store.transition_task(&stale, TaskStatus::Pending).await,
            Err(StorageError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_idempotency_key_lookup() {
        let store = MemoryStateStore::new();
        let t = Task::from_spec(
            "task-1".to_string(),
            TaskSpec::new("test").with_idempotency_key("key-1"),
        );
        store.insert_task(&t).await.unwrap();

        let found = store.find_task_by_idempotency_key("key-1").await.unwrap();
        assert_eq!(found.map(|t| t.id), Some("task-1".to_string()));
        assert!(store.find_task_by_idempotency_key("key-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_lookup_prefers_live_task() {
        let store = MemoryStateStore::new();
        let mut failed = Task::from_spec(
            "task-failed".to_string(),
            TaskSpec::new("test").with_idempotency_key("key-1"),
        );
        failed.begin("agent-1", Utc::now());
        failed.fail("boom".to_string(), Utc::now());
        store.insert_task(&failed).await.unwrap();

        let live = Task::from_spec(
            "task-live".to_string(),
            TaskSpec::new("test").with_idempotency_key("key-1"),
        );
        store.insert_task(&live).await.unwrap();

        // Whatever the map iteration order, the live task wins
        let found = store.find_task_by_idempotency_key("key-1").await.unwrap().unwrap();
        assert_eq!(found.id, "task-live");
    }

    #[tokio::test]
    async fn test_tasks_in_status() {
        let store = MemoryStateStore::new();
        let mut running = task("task-1");
        running.begin("agent-1", Utc::now());
        store.insert_task(&running).await.unwrap();
        store.insert_task(&task("task-2")).await.unwrap();

        let pending = store.tasks_in_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "task-2");
    }

    #[tokio::test]
    async fn test_agent_cas() {
        let store = MemoryStateStore::new();
        let mut agent = Agent::new("agent-1".to_string(), std::collections::BTreeSet::new());
        store.upsert_agent(&agent).await.unwrap();

        agent.assign("task-1");
        store.transition_agent(&agent, AgentStatus::Idle).await.unwrap();

        let stale = Agent::new("agent-1".to_string(), std::collections::BTreeSet::new());
        assert!(matches!(
            store.transition_agent(&stale, AgentStatus::Idle).await,
            Err(StorageError::PreconditionFailed(_))
        ));
    }
}
