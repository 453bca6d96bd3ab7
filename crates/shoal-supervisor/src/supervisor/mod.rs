//! The control task.
//!
//! [`Supervisor`] owns the registry, the pool flags and every timer. It
//! runs as one task that reacts to worker lifecycle events, timer expiries
//! and commands from [`SupervisorHandle`]s, one at a time. Follow-up work
//! triggered while handling an event is queued as an [`Action`] and run
//! after the handler returns, so handlers never re-enter each other.
//!
//! The behaviour lives in submodules:
//! - `resize`: reconciliation of the live count toward the target
//! - `restart`: the rolling restart with its first-position crash guard
//! - `shutdown`: graceful and forceful quit
//! - `removal`: graceful worker removal and the kill backstops
//! - `danger`: exit classification and crash-loop backoff

mod danger;
mod handle;
mod removal;
mod resize;
mod restart;
mod shutdown;

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::forker::{
    ProcessForker, SpawnRequest, StillbornHandle, TerminationReason, WorkerEvent, WorkerEvents,
};
use crate::protocol::WORKER_ID_ENV;
use crate::timer::{Timer, TimerKind, TimerQueue};
use crate::worker::{Registry, Worker, WorkerId, WorkerState};

pub use handle::{ConsoleGuard, PoolSnapshot, SupervisorHandle};

use handle::Shared;
use resize::{ResizeRound, ResizeWaiter};
use restart::{Rollout, RolloutCompletion};

/// Callback for application messages from workers.
pub type MessageHandler = Box<dyn FnMut(WorkerId, Value) + Send>;

/// How the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Every worker left gracefully after `quit()`.
    Graceful,
    /// Workers were killed by a second `quit()` or `quit_hard()`.
    Forced,
    /// The pool could not converge while shutting down.
    Fatal,
}

impl SupervisorExit {
    /// Process exit status for this outcome.
    pub fn code(self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::Forced | Self::Fatal => 1,
        }
    }
}

/// Input to the control task from workers and timers.
#[derive(Debug)]
pub(crate) enum Event {
    /// Lifecycle event for one worker
    Worker(WorkerId, WorkerEvent),
    /// A timer expired
    Timer { ticket: u64, kind: TimerKind },
}

/// Input to the control task from handles.
#[derive(Debug)]
pub(crate) enum Command {
    Resize {
        target: Option<usize>,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        reply: oneshot::Sender<Result<()>>,
    },
    Quit,
    QuitHard,
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
}

/// Follow-up work queued by event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Start a reconciliation round toward the current target.
    Reconcile,
    /// The in-flight round's barrier is settled.
    FinishResize,
    /// Move the rollout to its next position.
    AdvanceRollout,
    /// Start the graceful shutdown rollout deferred behind a restart.
    BeginQuitRollout,
}

/// Supervisor of a pool of identical worker processes.
pub struct Supervisor<F: ProcessForker> {
    config: SupervisorConfig,
    forker: F,
    registry: Registry,

    /// Desired worker count.
    target: usize,
    quitting: bool,
    danger: bool,

    /// In-flight reconciliation, if any.
    resize: Option<ResizeRound>,
    resize_waiters: VecDeque<ResizeWaiter>,
    /// In-flight rollout, if any.
    restart: Option<Rollout>,
    /// `quit()` arrived while a restart was running.
    quit_pending: bool,

    danger_retry: Option<Timer>,
    mismatch_retry: Option<Timer>,
    quit_grace: Option<Timer>,
    timers: TimerQueue,

    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedReceiver<Command>,
    actions: VecDeque<Action>,

    shared: Arc<Shared>,
    on_message: Option<MessageHandler>,
    /// Handed to the signal task when signal wiring is enabled.
    signal_handle: Option<SupervisorHandle>,
    exit: Option<SupervisorExit>,
}

impl<F: ProcessForker> Supervisor<F> {
    /// Create a supervisor and the handle that controls it.
    ///
    /// Nothing is spawned until [`run`](Self::run) is awaited.
    pub fn new(config: SupervisorConfig, forker: F) -> Result<(Self, SupervisorHandle)> {
        config.validate()?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let handle = SupervisorHandle::new(commands_tx, shared);
        let supervisor = Self {
            target: config.size,
            signal_handle: config.signals.then(|| handle.clone()),
            config,
            forker,
            registry: Registry::new(),
            quitting: false,
            danger: false,
            resize: None,
            resize_waiters: VecDeque::new(),
            restart: None,
            quit_pending: false,
            danger_retry: None,
            mismatch_retry: None,
            quit_grace: None,
            timers: TimerQueue::new(events_tx.clone()),
            events_tx,
            events,
            commands,
            actions: VecDeque::new(),
            shared: Arc::clone(&handle.shared),
            on_message: None,
            exit: None,
        };
        Ok((supervisor, handle))
    }

    /// Deliver application messages from workers to `handler`.
    pub fn with_message_handler(
        mut self,
        handler: impl FnMut(WorkerId, Value) + Send + 'static,
    ) -> Self {
        self.on_message = Some(Box::new(handler));
        self
    }

    /// The broadcaster shared with every handle.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.shared.broadcaster
    }

    /// Bring the pool to its configured size and supervise it until it is
    /// shut down.
    ///
    /// If every handle is dropped the pool keeps running; only `quit()`,
    /// `quit_hard()` or an unrecoverable mismatch end it.
    pub async fn run(mut self) -> SupervisorExit {
        info!(
            exec = %self.config.exec.display(),
            size = self.target,
            "Starting worker pool"
        );
        let signals = self
            .signal_handle
            .take()
            .map(|handle| tokio::spawn(crate::signals::forward_signals(handle)));

        let exit = self.supervise().await;
        if let Some(task) = signals {
            task.abort();
        }
        info!(?exit, code = exit.code(), "Supervisor stopped");
        exit
    }

    async fn supervise(&mut self) -> SupervisorExit {
        self.start_resize(None, None);
        self.drain_actions();

        let mut commands_open = true;
        loop {
            if let Some(exit) = self.exit {
                return exit;
            }

            let step = tokio::select! {
                event = self.events.recv() => Step::Event(event),
                command = self.commands.recv(), if commands_open => Step::Command(command),
            };

            match step {
                Step::Event(Some(event)) => self.handle_event(event),
                // Unreachable while `events_tx` lives in `self`.
                Step::Event(None) => {
                    error!("Event channel closed");
                    self.kill_all();
                    return SupervisorExit::Fatal;
                }
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Command(None) => {
                    debug!("All handles dropped");
                    commands_open = false;
                }
            }
            self.drain_actions();
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Worker(id, event) => self.handle_worker_event(id, event),
            Event::Timer { ticket, kind } => self.handle_timer(ticket, kind),
        }
    }

    fn handle_worker_event(&mut self, id: WorkerId, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready => self.on_ready(id),
            WorkerEvent::Disconnecting => {
                if let Some(worker) = self.registry.get_mut(id) {
                    debug!(worker_id = %id, "Worker announced disconnect");
                    worker.exited_after_disconnect = true;
                    worker.advance(WorkerState::Disconnecting);
                }
            }
            WorkerEvent::Message(payload) => match self.on_message.as_mut() {
                Some(handler) => handler(id, payload),
                None => debug!(worker_id = %id, %payload, "Unhandled worker message"),
            },
            WorkerEvent::Disconnected => self.on_disconnected(id),
            WorkerEvent::Exited(reason) => self.on_exit(id, reason),
        }
    }

    fn on_ready(&mut self, id: WorkerId) {
        let Some(worker) = self.registry.get_mut(id) else {
            return;
        };
        worker.advance(WorkerState::Ready);
        info!(worker_id = %id, pid = ?worker.pid, "Worker ready");

        self.resize_on_ready(id);
        self.rollout_on_ready(id);
    }

    fn handle_timer(&mut self, ticket: u64, kind: TimerKind) {
        match kind {
            TimerKind::Linger(id) => self.on_linger_expired(id, ticket),
            TimerKind::KillCheck(id) => self.on_kill_check(id, ticket),
            TimerKind::DisconnectBackstop(id) => self.on_disconnect_backstop(id, ticket),
            TimerKind::DangerRetry => self.on_danger_retry(ticket),
            TimerKind::MismatchRetry => self.on_mismatch_retry(ticket),
            TimerKind::RestartConfirm => self.on_restart_confirmed(ticket),
            TimerKind::QuitGrace => {
                if crate::timer::claim(&mut self.quit_grace, ticket) {
                    self.exit = Some(SupervisorExit::Graceful);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Resize { target, reply } => {
                if self.quitting && target.is_some() {
                    warn!(?target, "Ignoring resize while shutting down");
                    let _ = reply.send(Err(SupervisorError::Quitting));
                    return;
                }
                self.start_resize(target, Some(ResizeWaiter::Caller(reply)));
            }
            Command::Restart { reply } => self.restart(reply),
            Command::Quit => self.quit(),
            Command::QuitHard => self.quit_hard(),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn drain_actions(&mut self) {
        while let Some(action) = self.actions.pop_front() {
            if self.exit.is_some() {
                self.actions.clear();
                return;
            }
            match action {
                Action::Reconcile => self.start_resize(None, None),
                Action::FinishResize => self.finish_resize(),
                Action::AdvanceRollout => self.advance_rollout(),
                Action::BeginQuitRollout => self.begin_rollout(RolloutCompletion::Quit),
            }
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            target: self.target,
            workers: self.registry.infos(),
            quitting: self.quitting,
            restarting: self.restart.is_some(),
            resizing: self.resize.is_some(),
            danger: self.danger,
        }
    }

    /// Start one worker and register it.
    ///
    /// A failed spawn still registers a placeholder worker and reports its
    /// exit, so the failure flows through crash handling like any other.
    fn spawn_worker(&mut self) -> WorkerId {
        let id = self.registry.allocate_id();
        let mut env = self.config.env.clone();
        env.insert(WORKER_ID_ENV.to_string(), id.to_string());

        let events = WorkerEvents::new(id, self.events_tx.clone());
        let handle = match self
            .forker
            .spawn(SpawnRequest { id, env }, events.clone())
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(worker_id = %id, error = %e, "Failed to spawn worker");
                events.exited(TerminationReason::Unknown);
                Box::new(StillbornHandle)
            }
        };

        let worker = Worker::new(id, handle);
        debug!(worker_id = %id, pid = ?worker.pid, "Worker setting up");
        self.registry.insert(worker);
        id
    }

    fn kill_all(&mut self) {
        for worker in self.registry.iter_mut() {
            if let Err(e) = worker.handle.kill() {
                warn!(worker_id = %worker.id, error = %e, "Failed to kill worker");
            }
        }
    }
}

impl<F: ProcessForker> Drop for Supervisor<F> {
    fn drop(&mut self) {
        if !self.quitting && self.registry.len() > 0 {
            warn!(
                live = self.registry.len(),
                "Supervisor dropped before shutdown, killing workers"
            );
            self.kill_all();
        }
    }
}

enum Step {
    Event(Option<Event>),
    Command(Option<Command>),
}
