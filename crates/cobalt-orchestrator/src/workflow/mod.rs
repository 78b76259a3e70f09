//! Workflow execution: DAG validation, frontier scheduling, and saga
//! compensation.

pub mod dag;
pub mod engine;

pub use dag::{ready_steps, validate_acyclic};
pub use engine::WorkflowEngine;
