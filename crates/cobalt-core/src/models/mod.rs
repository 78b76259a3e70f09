//! Domain models for the orchestration core.

pub mod agent;
pub mod session;
pub mod task;
pub mod workflow;

pub use agent::{Agent, AgentStatus};
pub use session::{ChatMessage, ConversationSession, MessageRole};
pub use task::{
    Priority, StepRole, Task, TaskOrigin, TaskSpec, TaskStatus, WorkflowRef,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECONDS,
};
pub use workflow::{
    CompensationSpec, FailureKind, StepRequirement, StepSpec, StepState, StepStatus, Workflow,
    WorkflowFailure, WorkflowSpec, WorkflowStatus,
};
