//! Workflow graph validation and frontier computation.
//!
//! Predecessor edges are the sole ordering authority. Validation rejects
//! cyclic graphs before a workflow is admitted; the frontier is the set of
//! pending steps whose predecessors have all completed.

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

use cobalt_core::error::{CobaltError, Result};
use cobalt_core::models::{StepStatus, Workflow, WorkflowSpec};

/// Verifies the step predecessor edges form a DAG.
///
/// # Errors
/// Returns `CobaltError::CyclicGraph` naming a step on the cycle.
pub fn validate_acyclic(spec: &WorkflowSpec) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();

    for step in &spec.steps {
        nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
    }
    for step in &spec.steps {
        let to = nodes[step.id.as_str()];
        for predecessor in &step.predecessors {
            if let Some(&from) = nodes.get(predecessor.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(CobaltError::CyclicGraph(format!(
            "step '{}' participates in a cycle",
            graph[cycle.node_id()]
        ))),
    }
}

/// Computes the frontier: pending steps whose predecessors all completed.
///
/// Roots (steps without predecessors) are on the frontier of a fresh
/// workflow. Independent frontier steps run in parallel.
#[must_use]
pub fn ready_steps(workflow: &Workflow) -> Vec<String> {
    workflow
        .steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| {
            step.spec.predecessors.iter().all(|p| {
                workflow.step(p).is_some_and(|pred| pred.status == StepStatus::Completed)
            })
        })
        .map(|step| step.spec.id.clone())
        .collect()
}
