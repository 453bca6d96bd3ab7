//! Control surface for operators, signal handlers and consoles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::Command;
use crate::broadcast::{Broadcaster, SinkSubscription};
use crate::error::{Result, SupervisorError};
use crate::worker::WorkerInfo;

/// State shared between the control task and its handles.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) broadcaster: Broadcaster,
    /// Attached console sessions.
    consoles: Arc<AtomicUsize>,
}

/// Read-only view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    /// Desired worker count
    pub target: usize,
    /// Live workers in spawn order
    pub workers: Vec<WorkerInfo>,
    /// Shutdown in progress
    pub quitting: bool,
    /// Rolling restart in flight
    pub restarting: bool,
    /// Reconciliation in flight
    pub resizing: bool,
    /// Recent fast crash or failed reconciliation
    pub danger: bool,
}

/// Cloneable handle to a running [`Supervisor`](super::Supervisor).
///
/// Every operation is a message to the control task; nothing here touches
/// pool state directly.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    pub(super) shared: Arc<Shared>,
}

impl SupervisorHandle {
    pub(super) fn new(commands: mpsc::UnboundedSender<Command>, shared: Arc<Shared>) -> Self {
        Self { commands, shared }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SupervisorError::Stopped)
    }

    /// Converge the pool to `target` workers, or to the current target when
    /// `None`. Resolves once the pool has converged.
    pub async fn resize(&self, target: Option<usize>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resize { target, reply })?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Replace every worker, one at a time. Resolves when the rollout ends.
    ///
    /// Fails with [`SupervisorError::AlreadyRestarting`] if a restart is in
    /// flight and with [`SupervisorError::RestartAborted`] if the first
    /// replacement dies before it is confirmed.
    pub async fn restart(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Restart { reply })?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Shut down gracefully; a second call kills every worker.
    pub fn quit(&self) -> Result<()> {
        self.send(Command::Quit)
    }

    /// Kill every worker and stop.
    pub fn quit_hard(&self) -> Result<()> {
        self.send(Command::QuitHard)
    }

    /// Current pool state.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Log a line and send it to every attached sink.
    pub fn broadcast(&self, message: impl AsRef<str>) {
        self.shared.broadcaster.broadcast(message);
    }

    /// Attach a broadcast sink.
    pub fn subscribe(&self) -> SinkSubscription {
        self.shared.broadcaster.subscribe()
    }

    /// Count a console session for as long as the guard lives.
    pub fn console_guard(&self) -> ConsoleGuard {
        self.shared.consoles.fetch_add(1, Ordering::SeqCst);
        ConsoleGuard {
            counter: Arc::clone(&self.shared.consoles),
        }
    }

    /// Number of attached console sessions.
    pub fn console_connections(&self) -> usize {
        self.shared.consoles.load(Ordering::SeqCst)
    }
}

/// Counts one attached console session. Decrements on drop.
#[derive(Debug)]
pub struct ConsoleGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConsoleGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
