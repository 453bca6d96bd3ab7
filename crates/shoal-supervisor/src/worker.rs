//! Worker registry.
//!
//! Tracks every live worker in spawn order. Registration happens on spawn,
//! removal when the worker's exit is observed. Only the control task holds a
//! [`Registry`]; everyone else sees [`WorkerInfo`] snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::forker::WorkerHandle;
use crate::timer::Timer;

/// Supervisor-assigned worker handle.
///
/// Ids are handed out in increasing order and never reused, so ordering by
/// id is spawn order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a worker.
///
/// Only moves forward: Spawning → Ready → Disconnecting → Exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Process started, not yet ready
    Spawning,
    /// Announced readiness
    Ready,
    /// Channel closing, by either side
    Disconnecting,
    /// Process gone
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Spawning => write!(f, "spawning"),
            WorkerState::Ready => write!(f, "ready"),
            WorkerState::Disconnecting => write!(f, "disconnecting"),
            WorkerState::Exited => write!(f, "exited"),
        }
    }
}

/// Read-only projection of a worker for the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Supervisor-assigned id
    pub id: WorkerId,
    /// OS process id, if the spawn succeeded
    pub pid: Option<u32>,
    /// Lifecycle state
    pub state: WorkerState,
    /// Time since spawn
    pub age: Duration,
    /// Whether the worker's channel is still open
    pub connected: bool,
    /// Wall-clock spawn time
    pub born_at: DateTime<Utc>,
}

/// A live worker as seen by the control task.
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) pid: Option<u32>,
    pub(crate) birth: Instant,
    pub(crate) born_at: DateTime<Utc>,
    pub(crate) state: WorkerState,
    /// Worker-side channel open and process not exited.
    pub(crate) connected: bool,
    /// Master initiated removal, or the worker announced its own disconnect.
    pub(crate) exited_after_disconnect: bool,
    pub(crate) handle: Box<dyn WorkerHandle>,
    /// Pending "shutdown sent, close channel if still connected" timer.
    pub(crate) linger_timer: Option<Timer>,
    /// Pending "kill if still connected" timer from graceful removal.
    pub(crate) kill_timer: Option<Timer>,
    /// Pending "kill unless exited" timer armed by a disconnect event.
    pub(crate) disconnect_timer: Option<Timer>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, handle: Box<dyn WorkerHandle>) -> Self {
        Self {
            id,
            pid: handle.pid(),
            birth: Instant::now(),
            born_at: Utc::now(),
            state: WorkerState::Spawning,
            connected: true,
            exited_after_disconnect: false,
            handle,
            linger_timer: None,
            kill_timer: None,
            disconnect_timer: None,
        }
    }

    /// Time since spawn.
    pub(crate) fn age(&self) -> Duration {
        self.birth.elapsed()
    }

    /// Move the state forward. Backward moves are ignored.
    pub(crate) fn advance(&mut self, next: WorkerState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            pid: self.pid,
            state: self.state,
            age: self.age(),
            connected: self.connected,
            born_at: self.born_at,
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

/// Live workers keyed by id, iterated in spawn order.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    workers: BTreeMap<WorkerId, Worker>,
    next_id: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve the next worker id.
    pub(crate) fn allocate_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, worker: Worker) {
        let previous = self.workers.insert(worker.id, worker);
        debug_assert!(previous.is_none(), "worker ids are never reused");
    }

    pub(crate) fn remove(&mut self, id: WorkerId) -> Option<Worker> {
        self.workers.remove(&id)
    }

    pub(crate) fn get(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_connected(&self, id: WorkerId) -> bool {
        self.workers.get(&id).is_some_and(|w| w.connected)
    }

    /// All live ids in spawn order.
    pub(crate) fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    /// The `count` most recently spawned workers, newest last.
    pub(crate) fn newest(&self, count: usize) -> Vec<WorkerId> {
        let skip = self.workers.len().saturating_sub(count);
        self.workers.keys().skip(skip).copied().collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.values_mut()
    }

    pub(crate) fn infos(&self) -> Vec<WorkerInfo> {
        self.workers.values().map(Worker::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forker::tests::NullHandle;

    fn registry_with(count: usize) -> Registry {
        let mut registry = Registry::new();
        for _ in 0..count {
            let id = registry.allocate_id();
            registry.insert(Worker::new(id, Box::new(NullHandle::default())));
        }
        registry
    }

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let mut registry = registry_with(3);
        assert_eq!(
            registry.ids(),
            vec![WorkerId::new(0), WorkerId::new(1), WorkerId::new(2)]
        );

        registry.remove(WorkerId::new(1));
        let id = registry.allocate_id();
        assert_eq!(id, WorkerId::new(3));
    }

    #[test]
    fn test_newest_selects_most_recent() {
        let registry = registry_with(5);
        assert_eq!(registry.newest(2), vec![WorkerId::new(3), WorkerId::new(4)]);
        assert_eq!(registry.newest(0), Vec::<WorkerId>::new());
        assert_eq!(registry.newest(9).len(), 5);
    }

    #[test]
    fn test_state_only_moves_forward() {
        let mut worker = Worker::new(WorkerId::new(0), Box::new(NullHandle::default()));
        assert_eq!(worker.state, WorkerState::Spawning);
        assert!(worker.advance(WorkerState::Ready));
        assert!(worker.advance(WorkerState::Disconnecting));
        assert!(!worker.advance(WorkerState::Ready));
        assert_eq!(worker.state, WorkerState::Disconnecting);
        assert!(worker.advance(WorkerState::Exited));
    }

    #[test]
    fn test_info_projection() {
        let registry = registry_with(1);
        let info = &registry.infos()[0];
        assert_eq!(info.id, WorkerId::new(0));
        assert_eq!(info.pid, Some(4242));
        assert_eq!(info.state, WorkerState::Spawning);
        assert!(info.connected);
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(WorkerState::Disconnecting.to_string(), "disconnecting");
        assert_eq!(
            serde_json::to_string(&WorkerState::Ready).unwrap(),
            "\"ready\""
        );
        assert_eq!(serde_json::to_string(&WorkerId::new(9)).unwrap(), "9");
    }
}
