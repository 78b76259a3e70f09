//! Agent data structures for the orchestration core.
//!
//! This module defines the agent record and its lifecycle state machine.
//! Agents are external workers; the core tracks their declared capabilities,
//! liveness, and current assignment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Agent is idle and available for assignment.
    #[default]
    Idle,
    /// Agent is executing its current task.
    Running,
    /// Agent failed or lost liveness; requires re-registration to recover.
    Error,
    /// Agent deregistered.
    Stopped,
}

impl AgentStatus {
    /// Checks if the agent can transition to the given status.
    ///
    /// # Arguments
    /// * `to` - The target status
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Idle: assignment, explicit failure, or deregistration
            (Self::Idle, Self::Running | Self::Error | Self::Stopped) => true,
            // From Running: task finished, failure, or deregistration
            (Self::Running, Self::Idle | Self::Error | Self::Stopped) => true,
            // From Error or Stopped: only explicit re-registration recovers
            (Self::Error | Self::Stopped, Self::Idle) => true,
            // Same status is always valid
            (a, b) if *a == b => true,
            // All other transitions are invalid
            _ => false,
        }
    }
}

/// A registered agent worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier for the agent.
    pub id: String,
    /// Capabilities the agent declared at registration. Opaque strings,
    /// matched by subset against task requirements.
    pub capabilities: BTreeSet<String>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// The task currently executing on this agent. `Some` iff `Running`.
    pub current_task_id: Option<String>,
    /// Last liveness ping received from the agent.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Instant the agent last became idle. Assignment prefers the agent
    /// idle longest.
    pub idle_since: Option<DateTime<Utc>>,
    /// Timestamp of (re-)registration.
    pub registered_at: DateTime<Utc>,
    /// Soft-retirement flag. Retired agents are never hard-deleted while
    /// historical tasks reference them.
    pub retired: bool,
    /// Number of tasks this agent completed successfully.
    pub tasks_completed: u64,
    /// Number of tasks this agent failed.
    pub tasks_failed: u64,
}

impl Agent {
    /// Creates a new idle agent with the given capabilities.
    ///
    /// # Arguments
    /// * `id` - Unique identifier for the agent
    /// * `capabilities` - The declared capability set
    #[must_use]
    pub fn new(id: String, capabilities: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            capabilities,
            status: AgentStatus::Idle,
            current_task_id: None,
            last_heartbeat: Some(now),
            idle_since: Some(now),
            registered_at: now,
            retired: false,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Returns whether the agent is available for a new assignment.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle && self.current_task_id.is_none() && !self.retired
    }

    /// Checks whether this agent declares every required capability.
    ///
    /// # Arguments
    /// * `required` - The task's required capability set
    #[must_use]
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Marks the agent as running the given task.
    pub fn assign(&mut self, task_id: &str) {
        self.status = AgentStatus::Running;
        self.current_task_id = Some(task_id.to_string());
        self.idle_since = None;
    }

    /// Frees the agent back to idle after its task reached a terminal status.
    ///
    /// # Arguments
    /// * `success` - Whether the task completed successfully
    /// * `now` - Timestamp the agent became idle
    pub fn release(&mut self, success: bool, now: DateTime<Utc>) {
        self.status = AgentStatus::Idle;
        self.current_task_id = None;
        self.idle_since = Some(now);
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
    }

    /// Marks the agent as failed. Its current assignment is cleared by the
    /// caller once the orphaned task has been reclaimed.
    pub fn mark_error(&mut self) {
        self.status = AgentStatus::Error;
        self.idle_since = None;
    }

    /// Returns whether the agent's heartbeat is older than the threshold.
    ///
    /// # Arguments
    /// * `now` - The current instant
    /// * `staleness` - Maximum tolerated heartbeat age
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => now.signed_duration_since(last) > staleness,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn caps(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_status_transitions() {
        // Idle transitions
        assert!(AgentStatus::Idle.can_transition_to(AgentStatus::Running));
        assert!(AgentStatus::Idle.can_transition_to(AgentStatus::Error));
        assert!(AgentStatus::Idle.can_transition_to(AgentStatus::Stopped));

        // Running transitions
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::Idle));
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::Error));
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::Stopped));

        // Recovery requires explicit re-registration
        assert!(AgentStatus::Error.can_transition_to(AgentStatus::Idle));
        assert!(AgentStatus::Stopped.can_transition_to(AgentStatus::Idle));
        assert!(!AgentStatus::Error.can_transition_to(AgentStatus::Running));
        assert!(!AgentStatus::Stopped.can_transition_to(AgentStatus::Running));
    }

    #[test]
    fn test_capability_subset() {
        let agent = Agent::new("agent-1".to_string(), caps(&["python", "analysis"]));
        assert!(agent.has_capabilities(&caps(&["python"])));
        assert!(agent.has_capabilities(&caps(&["python", "analysis"])));
        assert!(!agent.has_capabilities(&caps(&["python", "rust"])));
        assert!(agent.has_capabilities(&BTreeSet::new()));
    }

    #[test]
    fn test_assignment_invariant() {
        let mut agent = Agent::new("agent-1".to_string(), caps(&["python"]));
        assert!(agent.is_available());

        agent.assign("task-1");
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.current_task_id.as_deref(), Some("task-1"));
        assert!(!agent.is_available());

        agent.release(true, Utc::now());
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task_id.is_none());
        assert_eq!(agent.tasks_completed, 1);
        assert!(agent.is_available());
    }

    #[test]
    fn test_staleness() {
        let mut agent = Agent::new("agent-1".to_string(), caps(&["python"]));
        let now = Utc::now();

        agent.last_heartbeat = Some(now - Duration::seconds(10));
        assert!(!agent.is_stale(now, Duration::seconds(30)));

        agent.last_heartbeat = Some(now - Duration::seconds(31));
        assert!(agent.is_stale(now, Duration::seconds(30)));

        agent.last_heartbeat = None;
        assert!(agent.is_stale(now, Duration::seconds(30)));
    }

    #[test]
    fn test_retired_agent_unavailable() {
        let mut agent = Agent::new("agent-1".to_string(), caps(&["python"]));
        agent.retired = true;
        assert!(!agent.is_available());
    }
}
