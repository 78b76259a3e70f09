//! Priority admission queue.
//!
//! Pending tasks wait here between admission and assignment. Ordering is
//! strict priority, FIFO within a tier by admission sequence. The queue is
//! a rebuildable cache over the state store: dropping it loses no tasks,
//! since every entry can be reconstructed from the store's pending set.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use tracing::debug;

use cobalt_core::models::{Priority, Task};

/// A queued reference to a pending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    /// The pending task's id.
    pub task_id: String,
    /// Priority tier at admission.
    pub base_priority: Priority,
    /// Priority tier after aging. Never below `base_priority`.
    pub effective_priority: Priority,
    /// Admission sequence number; lower means admitted earlier.
    pub seq: u64,
    /// Instant the task entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Backoff eligibility: the entry is not assignable before this.
    pub not_before: Option<DateTime<Utc>>,
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher tier wins, then earlier admission
        self.effective_priority
            .cmp(&other.effective_priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    /// Lazily removed entries, dropped when they surface at the top.
    removed: HashSet<String>,
    next_seq: u64,
}

/// Admission queue ordering pending tasks for assignment.
#[derive(Default)]
pub struct AdmissionQueue {
    state: tokio::sync::Mutex<QueueState>,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue").finish_non_exhaustive()
    }
}

impl AdmissionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a task into the queue.
    ///
    /// # Arguments
    /// * `task` - The pending task to admit
    pub async fn push(&self, task: &Task) {
        let mut state = self.state.lock().await;
        state.removed.remove(&task.id);
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(task_id = %task.id, priority = task.priority.ordinal(), seq, "Task admitted");
        state.heap.push(QueuedTask {
            task_id: task.id.clone(),
            base_priority: task.priority,
            effective_priority: task.priority,
            seq,
            enqueued_at: Utc::now(),
            not_before: task.not_before,
        });
    }

    /// Pops the highest-priority entry eligible at `now`.
    ///
    /// Entries still inside their backoff window are skipped and retained.
    ///
    /// # Returns
    /// `Some(QueuedTask)` if an eligible entry exists, `None` otherwise.
    pub async fn pop_eligible(&self, now: DateTime<Utc>) -> Option<QueuedTask> {
        let mut state = self.state.lock().await;
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = state.heap.pop() {
            if state.removed.remove(&entry.task_id) {
                continue;
            }
            if entry.not_before.is_some_and(|t| t > now) {
                deferred.push(entry);
                continue;
            }
            found = Some(entry);
            break;
        }

        for entry in deferred {
            state.heap.push(entry);
        }
        found
    }

    /// Puts an entry back at its original position after a failed assignment
    /// attempt, preserving its sequence number.
    pub async fn requeue(&self, entry: QueuedTask) {
        let mut state = self.state.lock().await;
        state.removed.remove(&entry.task_id);
        state.heap.push(entry);
    }

    /// Removes a task from the queue (synchronous cancellation of a pending
    /// task). Removal is lazy; the entry is dropped when it surfaces.
    ///
    /// A task not currently queued (already popped by a racing pass) leaves
    /// no marker behind, so the tombstone set cannot grow unbounded.
    pub async fn remove(&self, task_id: &str) {
        let mut state = self.state.lock().await;
        if state.heap.iter().any(|e| e.task_id == task_id) {
            state.removed.insert(task_id.to_string());
        }
    }

    /// Promotes entries pending longer than `threshold` by one tier past
    /// their admitted priority, saturating at the top tier.
    ///
    /// # Returns
    /// The ids of the entries promoted by this pass.
    pub async fn apply_aging(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut state = self.state.lock().await;
        let mut promoted = Vec::new();

        let entries: Vec<QueuedTask> = state.heap.drain().collect();
        for mut entry in entries {
            if state.removed.remove(&entry.task_id) {
                continue;
            }
            let aged = now.signed_duration_since(entry.enqueued_at) > threshold;
            let target = entry.base_priority.promoted();
            if aged && entry.effective_priority < target {
                entry.effective_priority = target;
                promoted.push(entry.task_id.clone());
            }
            state.heap.push(entry);
        }

        if !promoted.is_empty() {
            debug!(count = promoted.len(), "Aged tasks promoted one tier");
        }
        promoted
    }

    /// Returns the number of live entries.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.heap.len() - state.removed.len().min(state.heap.len())
    }

    /// Returns whether the queue holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
