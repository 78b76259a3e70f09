//! Agent registry.
//!
//! Registration, deregistration, heartbeats, and agent selection. The
//! registry is a thin layer over the state store: the store stays the
//! authority for agent records so a restarted scheduler sees the same
//! fleet.

use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use cobalt_core::error::{CobaltError, Result};
use cobalt_core::models::{Agent, AgentStatus, Task};
use cobalt_core::storage::{StateStore, StorageError};

/// Registry of agent workers.
pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry").finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Registers an agent, or re-registers an existing one.
    ///
    /// Re-registration is the only path out of `Error` or `Stopped`: the
    /// record is reset to idle with a fresh heartbeat and the declared
    /// capability set replaces the previous one.
    ///
    /// # Arguments
    /// * `agent_id` - Unique identifier for the agent
    /// * `capabilities` - The capabilities the agent declares
    ///
    /// # Errors
    /// Returns `CobaltError::Conflict` if the agent is currently running a
    /// task; a busy agent cannot re-register.
    pub async fn register(
        &self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
    ) -> Result<Agent> {
        match self.store.get_agent(agent_id).await {
            Ok(existing) => {
                if existing.status == AgentStatus::Running {
                    return Err(CobaltError::Conflict(format!(
                        "agent {agent_id} is running task {:?} and cannot re-register",
                        existing.current_task_id
                    )));
                }
                let agent = Agent::new(agent_id.to_string(), capabilities);
                self.store.upsert_agent(&agent).await?;
                info!(agent_id = %agent_id, previous = ?existing.status, "Agent re-registered");
                Ok(agent)
            }
            Err(StorageError::NotFound(_)) => {
                let agent = Agent::new(agent_id.to_string(), capabilities);
                self.store.upsert_agent(&agent).await?;
                info!(agent_id = %agent_id, capabilities = agent.capabilities.len(), "Agent registered");
                Ok(agent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deregisters an agent.
    ///
    /// The record is soft-retired, not deleted: historical tasks keep a
    /// valid reference to it.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the agent is unknown.
    pub async fn deregister(&self, agent_id: &str) -> Result<()> {
        let mut agent = self.get(agent_id).await?;
        agent.status = AgentStatus::Stopped;
        agent.retired = true;
        agent.idle_since = None;
        self.store.update_agent(&agent).await?;
        info!(agent_id = %agent_id, "Agent deregistered");
        Ok(())
    }

    /// Records a heartbeat from an agent.
    ///
    /// A heartbeat only refreshes liveness. It never heals an `Error` or
    /// `Stopped` agent; those require re-registration.
    ///
    /// # Returns
    /// The agent's current status, so late-heartbeating agents learn they
    /// have been marked lost.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the agent is unknown.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<AgentStatus> {
        let mut agent = self.get(agent_id).await?;
        agent.last_heartbeat = Some(Utc::now());
        self.store.update_agent(&agent).await?;
        if agent.status == AgentStatus::Error {
            warn!(agent_id = %agent_id, "Heartbeat from agent marked lost; re-registration required");
        }
        Ok(agent.status)
    }

    /// Fetches an agent by id.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the agent is unknown.
    pub async fn get(&self, agent_id: &str) -> Result<Agent> {
        match self.store.get_agent(agent_id).await {
            Ok(agent) => Ok(agent),
            Err(StorageError::NotFound(_)) => {
                Err(CobaltError::NotFound { kind: "agent", id: agent_id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all agents, including retired ones.
    ///
    /// # Errors
    /// Returns a storage error if the listing fails.
    pub async fn list(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents().await?)
    }

    /// Marks an agent as failed and clears its assignment.
    ///
    /// Used both for agent-reported fatal errors and by the heartbeat
    /// monitor when liveness is lost. The transition is a CAS against the
    /// agent's observed status; a lost race leaves the record untouched.
    ///
    /// # Returns
    /// The id of the task that was running on the agent, if any, so the
    /// caller can reclaim it. `None` if the agent was not idle or running,
    /// or if the transition raced.
    ///
    /// # Errors
    /// Returns `CobaltError::NotFound` if the agent is unknown.
    pub async fn report_error(&self, agent_id: &str) -> Result<Option<String>> {
        let agent = self.get(agent_id).await?;
        if !matches!(agent.status, AgentStatus::Idle | AgentStatus::Running) {
            return Ok(None);
        }

        let expected = agent.status;
        let orphaned = agent.current_task_id.clone();
        let mut updated = agent;
        updated.mark_error();
        updated.current_task_id = None;

        match self.store.transition_agent(&updated, expected).await {
            Ok(()) => {
                warn!(agent_id = %agent_id, "Agent marked failed");
                Ok(orphaned)
            }
            Err(StorageError::PreconditionFailed(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Selects an agent for a task.
    ///
    /// Pinned tasks only match their pinned agent; a pinned agent that has
    /// not registered yet is simply no candidate. Otherwise any available
    /// agent declaring a superset of the required capabilities is a
    /// candidate, and the one idle longest wins.
    ///
    /// # Returns
    /// `Some(Agent)` if a compatible idle agent exists, `None` otherwise.
    ///
    /// # Errors
    /// Returns a storage error if the agent listing fails.
    pub async fn select_for(&self, task: &Task) -> Result<Option<Agent>> {
        if let Some(pinned) = &task.pinned_agent_id {
            let agent = match self.store.get_agent(pinned).await {
                Ok(agent) => agent,
                Err(StorageError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if agent.is_available() {
                return Ok(Some(agent));
            }
            return Ok(None);
        }

        let candidates = self.store.list_agents().await?;
        let selected = candidates
            .into_iter()
            .filter(|a| a.is_available() && a.has_capabilities(&task.required_capabilities))
            .min_by_key(|a| a.idle_since);
        Ok(selected)
    }
}
