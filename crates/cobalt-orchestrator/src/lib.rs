//! Cobalt Orchestrator - Task scheduling, agent supervision, and workflow
//! execution.
//!
//! This crate provides the orchestration services on top of `cobalt-core`:
//! - Priority admission queue and task scheduler
//! - Agent registry with heartbeat-based liveness supervision
//! - DAG workflow engine with saga compensation
//! - Webhook callbacks for terminal task notifications
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cobalt_core::{CobaltConfig, MemoryBus, MemoryStateStore, TaskSpec};
//! use cobalt_orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> cobalt_core::Result<()> {
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(MemoryStateStore::new()),
//!         Arc::new(MemoryBus::new()),
//!         CobaltConfig::default(),
//!     )
//!     .await;
//!     orchestrator.start().await?;
//!
//!     let task = orchestrator.scheduler().submit(TaskSpec::new("summarize")).await?;
//!     println!("submitted {}", task.id);
//!     orchestrator.shutdown();
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod workflow;

pub use callback::{CallbackDispatcher, CallbackPayload};
pub use monitor::HeartbeatMonitor;
pub use queue::{AdmissionQueue, QueuedTask};
pub use registry::AgentRegistry;
pub use scheduler::{Scheduler, StepListener};
pub use workflow::{ready_steps, validate_acyclic, WorkflowEngine};

use std::sync::Arc;

use cobalt_core::bus::MessageBus;
use cobalt_core::config::CobaltConfig;
use cobalt_core::error::Result;
use cobalt_core::storage::StateStore;

/// Facade wiring the scheduler, registry, workflow engine, and heartbeat
/// monitor over a shared store and bus.
#[derive(Debug)]
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    scheduler: Arc<Scheduler>,
    engine: Arc<WorkflowEngine>,
    monitor: Arc<HeartbeatMonitor>,
}

impl Orchestrator {
    /// Creates and wires the orchestration services.
    ///
    /// # Arguments
    /// * `store` - The authoritative state store
    /// * `bus` - The message bus
    /// * `config` - Runtime configuration
    pub async fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        config: CobaltConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            bus,
            Arc::clone(&registry),
            config.scheduler,
            config.callback,
        ));
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&store), Arc::clone(&scheduler)));
        scheduler.set_step_listener(Arc::clone(&engine) as Arc<dyn StepListener>).await;
        let monitor = Arc::new(HeartbeatMonitor::new(
            store,
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            config.monitor,
        ));

        Arc::new(Self { registry, scheduler, engine, monitor })
    }

    /// Starts the background services.
    ///
    /// Rebuilds the admission queue from the store, reconciles orphaned
    /// running tasks, then launches the scheduling loop and liveness
    /// sweep.
    ///
    /// # Errors
    /// Returns `CobaltError::Conflict` if already started.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.rebuild_queue().await?;
        self.monitor.reconcile().await?;
        self.scheduler.start().await?;
        self.monitor.start()?;
        Ok(())
    }

    /// Signals the background services to stop.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.monitor.stop();
    }

    /// The task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The workflow engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// The agent registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The heartbeat monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }
}
