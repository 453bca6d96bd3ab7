//! Test utilities for supervisor testing.
//!
//! Provides a scripted in-memory [`ProcessForker`] whose fake workers boot,
//! crash, linger or ignore the master according to a [`Behavior`], and
//! records everything the supervisor does to them.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde_json::json;
use shoal_supervisor::{
    MasterMessage, ProcessForker, SpawnRequest, Supervisor, SupervisorConfig, SupervisorError,
    SupervisorExit, SupervisorHandle, TerminationReason, WorkerEvent, WorkerEvents, WorkerHandle,
    WorkerId,
};
use tokio::task::JoinHandle;

/// Time a fake worker takes to report ready.
pub const BOOT: Duration = Duration::from_millis(10);

/// Time a fake worker takes to leave once asked.
pub const LEAVE: Duration = Duration::from_millis(5);

/// How a fake worker behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    /// Ready after [`BOOT`], leaves promptly on disconnect or shutdown notice.
    Healthy,
    /// Exits with status 1 before ever reporting ready.
    CrashOnBoot,
    /// Ready after [`BOOT`], then exits with status 1 after the delay.
    CrashAfter(Duration),
    /// Ready after [`BOOT`], ignores disconnects and shutdown notices.
    Stubborn,
    /// Never reports ready; leaves when disconnected.
    Silent,
    /// Ready after [`BOOT`], then announces its own disconnect and exits.
    Leaves(Duration),
    /// Ready after [`BOOT`], then sends one application message.
    Chatty,
    /// The forker fails to start the process.
    SpawnFails,
}

#[derive(Debug)]
struct State {
    script: VecDeque<Behavior>,
    fallback: Behavior,
    spawned: Vec<WorkerId>,
    envs: Vec<BTreeMap<String, String>>,
    killed: Vec<WorkerId>,
    disconnected: Vec<WorkerId>,
    shutdowns: Vec<WorkerId>,
    alive: HashSet<WorkerId>,
    /// Most workers ever alive at once.
    peak: usize,
    /// Fewest workers alive at once since [`FakeCluster::track_floor`].
    floor: Option<usize>,
}

/// Shared record of every fake worker.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                script: VecDeque::new(),
                fallback: Behavior::Healthy,
                spawned: Vec::new(),
                envs: Vec::new(),
                killed: Vec::new(),
                disconnected: Vec::new(),
                shutdowns: Vec::new(),
                alive: HashSet::new(),
                peak: 0,
                floor: None,
            })),
        }
    }

    /// Behaviors for the next spawns, in order.
    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.state.lock().unwrap().script.extend(behaviors);
    }

    /// Behavior once the script runs out.
    pub fn fallback(&self, behavior: Behavior) {
        self.state.lock().unwrap().fallback = behavior;
    }

    pub fn forker(&self) -> FakeForker {
        FakeForker {
            cluster: self.clone(),
        }
    }

    pub fn spawned(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn envs(&self) -> Vec<BTreeMap<String, String>> {
        self.state.lock().unwrap().envs.clone()
    }

    pub fn killed(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn disconnected(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().disconnected.clone()
    }

    pub fn shutdowns(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().shutdowns.clone()
    }

    pub fn alive(&self) -> usize {
        self.state.lock().unwrap().alive.len()
    }

    pub fn peak(&self) -> usize {
        self.state.lock().unwrap().peak
    }

    /// Start recording the fewest workers alive, from the current count.
    pub fn track_floor(&self) {
        let mut state = self.state.lock().unwrap();
        state.floor = Some(state.alive.len());
    }

    pub fn floor(&self) -> Option<usize> {
        self.state.lock().unwrap().floor
    }

    fn is_alive(&self, id: WorkerId) -> bool {
        self.state.lock().unwrap().alive.contains(&id)
    }

    /// End a fake worker's process, once.
    fn exit(&self, events: &WorkerEvents, reason: TerminationReason) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state.alive.remove(&events.id());
            let alive = state.alive.len();
            if let Some(floor) = state.floor.as_mut() {
                *floor = (*floor).min(alive);
            }
            removed
        };
        if removed {
            events.disconnected();
            events.exited(reason);
        }
    }

    fn exit_after(&self, events: &WorkerEvents, delay: Duration, reason: TerminationReason) {
        let cluster = self.clone();
        let events = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cluster.exit(&events, reason);
        });
    }

    fn boot(&self, events: &WorkerEvents, behavior: Behavior) {
        let cluster = self.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if behavior == Behavior::CrashOnBoot {
                tokio::time::sleep(LEAVE).await;
                cluster.exit(&events, TerminationReason::Exited(1));
                return;
            }
            if behavior == Behavior::Silent {
                return;
            }

            tokio::time::sleep(BOOT).await;
            if !cluster.is_alive(events.id()) {
                return;
            }
            events.ready();

            match behavior {
                Behavior::CrashAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    cluster.exit(&events, TerminationReason::Exited(1));
                }
                Behavior::Leaves(delay) => {
                    tokio::time::sleep(delay).await;
                    events.emit(WorkerEvent::Disconnecting);
                    tokio::time::sleep(LEAVE).await;
                    cluster.exit(&events, TerminationReason::Exited(0));
                }
                Behavior::Chatty => {
                    events.emit(WorkerEvent::Message(json!({ "hello": events.id().get() })));
                }
                _ => {}
            }
        });
    }
}

/// Forker producing fake workers.
pub struct FakeForker {
    cluster: FakeCluster,
}

impl ProcessForker for FakeForker {
    fn spawn(
        &mut self,
        request: SpawnRequest,
        events: WorkerEvents,
    ) -> shoal_supervisor::Result<Box<dyn WorkerHandle>> {
        let behavior = {
            let mut state = self.cluster.state.lock().unwrap();
            let behavior = state.script.pop_front().unwrap_or(state.fallback);
            state.spawned.push(request.id);
            state.envs.push(request.env.clone());
            if behavior == Behavior::SpawnFails {
                return Err(SupervisorError::spawn(request.id, "no such file"));
            }
            state.alive.insert(request.id);
            state.peak = state.peak.max(state.alive.len());
            behavior
        };

        self.cluster.boot(&events, behavior);
        Ok(Box::new(FakeWorker {
            cluster: self.cluster.clone(),
            events,
            behavior,
        }))
    }
}

struct FakeWorker {
    cluster: FakeCluster,
    events: WorkerEvents,
    behavior: Behavior,
}

impl WorkerHandle for FakeWorker {
    fn pid(&self) -> Option<u32> {
        Some(10_000 + self.events.id().get() as u32)
    }

    fn send(&mut self, message: MasterMessage) -> shoal_supervisor::Result<()> {
        if message == MasterMessage::Shutdown {
            self.cluster
                .state
                .lock()
                .unwrap()
                .shutdowns
                .push(self.events.id());
            if self.behavior != Behavior::Stubborn {
                self.cluster
                    .exit_after(&self.events, LEAVE, TerminationReason::Exited(0));
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.cluster
            .state
            .lock()
            .unwrap()
            .disconnected
            .push(self.events.id());
        if self.behavior != Behavior::Stubborn {
            self.cluster
                .exit_after(&self.events, LEAVE, TerminationReason::Exited(0));
        }
    }

    fn kill(&mut self) -> shoal_supervisor::Result<()> {
        self.cluster
            .state
            .lock()
            .unwrap()
            .killed
            .push(self.events.id());
        self.cluster
            .exit(&self.events, TerminationReason::Signaled(Signal::SIGKILL));
        Ok(())
    }
}

/// Configuration for fake workers with signal wiring off.
pub fn config(size: usize) -> SupervisorConfig {
    SupervisorConfig::new("/opt/fake/worker")
        .with_size(size)
        .with_signals(false)
}

/// Start a supervisor over `cluster`.
pub fn start(
    cluster: &FakeCluster,
    config: SupervisorConfig,
) -> (SupervisorHandle, JoinHandle<SupervisorExit>) {
    let (supervisor, handle) = Supervisor::new(config, cluster.forker()).unwrap();
    (handle, tokio::spawn(supervisor.run()))
}

/// Ids of the live workers, in spawn order.
pub async fn live_ids(handle: &SupervisorHandle) -> Vec<WorkerId> {
    handle
        .snapshot()
        .await
        .unwrap()
        .workers
        .iter()
        .map(|w| w.id)
        .collect()
}

pub fn ids(raw: &[u64]) -> Vec<WorkerId> {
    raw.iter().copied().map(WorkerId::new).collect()
}
