//! Cobalt Core - Data model and contracts for agent orchestration.
//!
//! This crate provides the shared foundation for Cobalt, including:
//! - Domain models for tasks, agents, workflows, and sessions
//! - The state store contract and an in-memory implementation
//! - The message bus contract and an in-process implementation
//! - Configuration loading
//!
//! # Example
//!
//! ```rust
//! use cobalt_core::models::{Priority, TaskSpec};
//!
//! let spec = TaskSpec::new("summarize report")
//!     .with_capability("nlp")
//!     .with_priority(Priority::High);
//! assert!(spec.validate().is_ok());
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod storage;

pub use bus::{MemoryBus, MessageBus};
pub use config::{CallbackConfig, CobaltConfig, MonitorConfig, SchedulerConfig};
pub use error::{CobaltError, Result};
pub use events::{
    AssignmentEvent, CancellationSignal, CompletionReport, TaskOutcome, SUBJECT_TASK_ASSIGN,
    SUBJECT_TASK_CANCEL, SUBJECT_TASK_RESULTS,
};
pub use models::{
    Agent, AgentStatus, ChatMessage, CompensationSpec, ConversationSession, FailureKind,
    MessageRole, Priority, StepRequirement, StepRole, StepSpec, StepState, StepStatus, Task,
    TaskOrigin, TaskSpec, TaskStatus, Workflow, WorkflowFailure, WorkflowRef, WorkflowSpec,
    WorkflowStatus,
};
pub use storage::{MemoryStateStore, StateStore, StorageError, StorageResult};
