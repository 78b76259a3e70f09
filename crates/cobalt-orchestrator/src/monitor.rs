//! Heartbeat monitor.
//!
//! Periodically sweeps the agent fleet for stale heartbeats. A lost agent
//! is marked `Error` and its current task is reclaimed through the
//! scheduler's ordinary retry path. On startup, a reconciliation scan
//! catches running tasks whose agent disappeared while the process was
//! down.

use chrono::{Duration, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use cobalt_core::config::MonitorConfig;
use cobalt_core::error::{CobaltError, Result};
use cobalt_core::models::{AgentStatus, TaskStatus};
use cobalt_core::storage::{StateStore, StorageError};

use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;

/// Background service watching agent liveness.
pub struct HeartbeatMonitor {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    scheduler: Arc<Scheduler>,
    config: MonitorConfig,
    shutdown_tx: Mutex<Option<watch::Sender<()>>>,
}

impl fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatMonitor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    /// Creates a monitor over the given store, registry, and scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        scheduler: Arc<Scheduler>,
        config: MonitorConfig,
    ) -> Self {
        Self { store, registry, scheduler, config, shutdown_tx: Mutex::new(None) }
    }

    /// Runs one liveness sweep.
    ///
    /// Agents whose heartbeat is older than the staleness threshold are
    /// marked `Error`; their current task, if any, is reclaimed.
    ///
    /// # Returns
    /// The ids of the agents marked lost by this sweep.
    ///
    /// # Errors
    /// Returns a storage error if the fleet cannot be listed.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let staleness = Duration::seconds(self.config.staleness_seconds as i64);
        let mut lost = Vec::new();

        for agent in self.registry.list().await? {
            if !matches!(agent.status, AgentStatus::Idle | AgentStatus::Running) {
                continue;
            }
            if !agent.is_stale(now, staleness) {
                continue;
            }

            warn!(agent_id = %agent.id, "Agent heartbeat stale, marking lost");
            // A lost race means the agent changed status under us; it gets
            // re-examined next sweep
            if let Some(task_id) = self.registry.report_error(&agent.id).await? {
                self.scheduler.reclaim_from_lost_agent(&agent.id, &task_id).await?;
            }
            lost.push(agent.id);
        }
        Ok(lost)
    }

    /// Reconciles store state left behind by a previous process.
    ///
    /// Every running task whose agent is missing, not running, bound to a
    /// different task, or stale on heartbeat is reclaimed through the
    /// retry path, so recovery completes before assignments are served.
    ///
    /// # Returns
    /// The number of tasks reclaimed.
    ///
    /// # Errors
    /// Returns a storage error if the scan fails.
    pub async fn reconcile(&self) -> Result<usize> {
        let now = Utc::now();
        let staleness = Duration::seconds(self.config.staleness_seconds as i64);
        let mut reclaimed = 0;
        let mut running = self.store.tasks_in_status(TaskStatus::Running).await?;
        running.extend(self.store.tasks_in_status(TaskStatus::Cancelling).await?);

        for task in running {
            let Some(agent_id) = task.assigned_agent_id.clone() else {
                continue;
            };
            match self.store.get_agent(&agent_id).await {
                Ok(agent) => {
                    let bound = agent.status == AgentStatus::Running
                        && agent.current_task_id.as_deref() == Some(task.id.as_str());
                    if bound && !agent.is_stale(now, staleness) {
                        continue;
                    }
                    if bound {
                        // Correctly bound but silent since before the
                        // restart: mark it lost before reclaiming
                        self.registry.report_error(&agent_id).await?;
                    }
                }
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            warn!(task_id = %task.id, agent_id = %agent_id, "Reclaiming orphaned task");
            self.scheduler.reclaim_from_lost_agent(&agent_id, &task.id).await?;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            info!(reclaimed, "Startup reconciliation complete");
        }
        Ok(reclaimed)
    }

    /// Starts the periodic sweep in a background task.
    ///
    /// # Errors
    /// Returns `CobaltError::Conflict` if the monitor is already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let shutdown_rx = {
            let mut slot = self
                .shutdown_tx
                .lock()
                .map_err(|_| CobaltError::Bus("monitor shutdown lock poisoned".to_string()))?;
            if slot.is_some() {
                return Err(CobaltError::Conflict("heartbeat monitor is already running".to_string()));
            }
            let (tx, rx) = watch::channel(());
            *slot = Some(tx);
            rx
        };

        let monitor = Arc::clone(self);
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            let mut interval = time::interval(std::time::Duration::from_secs(
                monitor.config.sweep_interval_seconds,
            ));
            info!("Heartbeat monitor started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Heartbeat monitor shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = monitor.sweep().await {
                            error!(error = %e, "Liveness sweep failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Signals the background sweep to stop.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_core::bus::{MemoryBus, MessageBus};
    use cobalt_core::config::{CallbackConfig, SchedulerConfig};
    use cobalt_core::models::TaskSpec;
    use cobalt_core::storage::MemoryStateStore;
    use crate::registry::AgentRegistry;
    use std::collections::BTreeSet;

    fn setup() -> (Arc<dyn StateStore>, Arc<Scheduler>, Arc<AgentRegistry>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            bus,
            Arc::clone(&registry),
            SchedulerConfig::default(),
            CallbackConfig::default(),
        ));
        (store, scheduler, registry)
    }

    #[tokio::test]
    async fn test_sweep_marks_stale_agents_lost() {
        let (store, scheduler, registry) = setup();
        registry.register("fresh", BTreeSet::new()).await.unwrap();
        registry.register("stale", BTreeSet::new()).await.unwrap();

        let mut agent = store.get_agent("stale").await.unwrap();
        agent.last_heartbeat = Some(Utc::now() - Duration::seconds(120));
        store.update_agent(&agent).await.unwrap();

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            scheduler,
            MonitorConfig::default(),
        );
        let lost = monitor.sweep().await.unwrap();
        assert_eq!(lost, vec!["stale".to_string()]);

        assert_eq!(store.get_agent("stale").await.unwrap().status, AgentStatus::Error);
        assert_eq!(store.get_agent("fresh").await.unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_current_task() {
        let (store, scheduler, registry) = setup();
        registry.register("agent-1", BTreeSet::new()).await.unwrap();

        let task = scheduler.submit(TaskSpec::new("work")).await.unwrap();
        scheduler.run_scheduling_pass().await.unwrap();

        let mut agent = store.get_agent("agent-1").await.unwrap();
        agent.last_heartbeat = Some(Utc::now() - Duration::seconds(120));
        store.update_agent(&agent).await.unwrap();

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            MonitorConfig::default(),
        );
        monitor.sweep().await.unwrap();

        // The task went back to pending through the retry path
        let task = store.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.not_before.is_some());

        // The lost agent stays in error until it re-registers
        let agent = store.get_agent("agent-1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        assert!(agent.current_task_id.is_none());
    }

    #[tokio::test]
    async fn test_error_agents_not_reswept() {
        let (store, scheduler, registry) = setup();
        registry.register("agent-1", BTreeSet::new()).await.unwrap();

        let mut agent = store.get_agent("agent-1").await.unwrap();
        agent.mark_error();
        agent.last_heartbeat = Some(Utc::now() - Duration::seconds(120));
        store.update_agent(&agent).await.unwrap();

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            scheduler,
            MonitorConfig::default(),
        );
        assert!(monitor.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_orphaned_running_task() {
        let (store, scheduler, registry) = setup();

        // A running task referencing an agent that no longer exists
        let mut task =
            cobalt_core::models::Task::from_spec("task-ghost".to_string(), TaskSpec::new("orphan"));
        task.begin("ghost-agent", Utc::now());
        store.insert_task(&task).await.unwrap();

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            scheduler,
            MonitorConfig::default(),
        );
        assert_eq!(monitor.reconcile().await.unwrap(), 1);

        let task = store.get_task("task-ghost").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_reclaims_stale_bound_agent() {
        let (store, scheduler, registry) = setup();
        registry.register("agent-1", BTreeSet::new()).await.unwrap();
        registry.register("agent-2", BTreeSet::new()).await.unwrap();

        scheduler.submit(TaskSpec::new("one")).await.unwrap();
        scheduler.submit(TaskSpec::new("two")).await.unwrap();
        assert_eq!(scheduler.run_scheduling_pass().await.unwrap(), 2);

        // agent-1 is correctly bound to its task, but has been silent
        // since before the restart
        let mut agent = store.get_agent("agent-1").await.unwrap();
        agent.last_heartbeat = Some(Utc::now() - Duration::seconds(120));
        store.update_agent(&agent).await.unwrap();

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            MonitorConfig::default(),
        );
        assert_eq!(monitor.reconcile().await.unwrap(), 1);

        // Its task went back to pending and the agent is marked lost; the
        // fresh agent keeps running
        let pending = store.tasks_in_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(store.get_agent("agent-1").await.unwrap().status, AgentStatus::Error);
        assert_eq!(store.get_agent("agent-2").await.unwrap().status, AgentStatus::Running);
    }
}
