//! Persistence contract for the orchestration core.
//!
//! The state store is the single source of truth for tasks, agents,
//! workflows, and sessions. In-memory structures held by the scheduler
//! (such as the admission queue) are rebuildable caches over this store.
//!
//! Status changes go through compare-and-swap transitions: a write is
//! applied only if the stored entity still has the expected status,
//! otherwise [`StorageError::PreconditionFailed`] is returned and the
//! caller re-reads.

mod memory;

pub use memory::MemoryStateStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    Agent, AgentStatus, ConversationSession, Task, TaskStatus, Workflow,
};

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by state store implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A compare-and-swap transition lost a race: the stored status no
    /// longer matches the expected one.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// An insert collided with an existing entity.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Entity could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Durable store for orchestration state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Inserts a new task.
    ///
    /// # Errors
    /// Returns `StorageError::Conflict` if a task with the same id exists.
    async fn insert_task(&self, task: &Task) -> StorageResult<()>;

    /// Fetches a task by id.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the task does not exist.
    async fn get_task(&self, task_id: &str) -> StorageResult<Task>;

    /// Overwrites a task unconditionally.
    ///
    /// Prefer [`StateStore::transition_task`] for status changes.
    async fn update_task(&self, task: &Task) -> StorageResult<()>;

    /// Writes a task only if its stored status still matches `expected`.
    ///
    /// # Arguments
    /// * `task` - The new task state to write
    /// * `expected` - The status the stored task must currently have
    ///
    /// # Errors
    /// Returns `StorageError::PreconditionFailed` if the stored status
    /// differs from `expected`.
    async fn transition_task(&self, task: &Task, expected: TaskStatus) -> StorageResult<()>;

    /// Looks up a task by its idempotency key.
    ///
    /// When several tasks carry the key, a non-failed match takes
    /// precedence: a terminally failed task frees its key for
    /// re-submission and must not shadow the live replacement.
    async fn find_task_by_idempotency_key(&self, key: &str) -> StorageResult<Option<Task>>;

    /// Lists all tasks currently in the given status.
    async fn tasks_in_status(&self, status: TaskStatus) -> StorageResult<Vec<Task>>;

    /// Inserts or replaces an agent record.
    async fn upsert_agent(&self, agent: &Agent) -> StorageResult<()>;

    /// Fetches an agent by id.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the agent does not exist.
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent>;

    /// Overwrites an agent unconditionally.
    async fn update_agent(&self, agent: &Agent) -> StorageResult<()>;

    /// Writes an agent only if its stored status still matches `expected`.
    ///
    /// # Errors
    /// Returns `StorageError::PreconditionFailed` if the stored status
    /// differs from `expected`.
    async fn transition_agent(&self, agent: &Agent, expected: AgentStatus) -> StorageResult<()>;

    /// Lists all registered agents, including retired ones.
    async fn list_agents(&self) -> StorageResult<Vec<Agent>>;

    /// Inserts a new workflow.
    ///
    /// # Errors
    /// Returns `StorageError::Conflict` if a workflow with the same id exists.
    async fn insert_workflow(&self, workflow: &Workflow) -> StorageResult<()>;

    /// Fetches a workflow by id.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the workflow does not exist.
    async fn get_workflow(&self, workflow_id: &str) -> StorageResult<Workflow>;

    /// Overwrites a workflow.
    async fn update_workflow(&self, workflow: &Workflow) -> StorageResult<()>;

    /// Inserts or replaces a conversation session.
    async fn upsert_session(&self, session: &ConversationSession) -> StorageResult<()>;

    /// Fetches a conversation session by id.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the session does not exist.
    async fn get_session(&self, session_id: &str) -> StorageResult<ConversationSession>;
}
