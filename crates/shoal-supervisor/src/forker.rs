//! Worker process spawning.
//!
//! The supervisor never starts processes itself. It asks a [`ProcessForker`]
//! for a [`WorkerHandle`] and hears about the worker's lifecycle through the
//! [`WorkerEvents`] sender it hands over at spawn time.
//!
//! [`CommandForker`] is the production forker: it starts the configured
//! executable with piped stdin/stdout and runs the line protocol from
//! [`crate::protocol`] on top of them.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::protocol::{MasterMessage, WorkerMessage, WORKER_ID_ENV};
use crate::supervisor::Event;
use crate::worker::WorkerId;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Unknown termination reason (wait failed, spawn never happened).
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<ExitStatus> for TerminationReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        status
            .signal()
            .and_then(|raw| Signal::try_from(raw).ok())
            .map_or(Self::Unknown, Self::Signaled)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Lifecycle event reported for one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker announced readiness.
    Ready,
    /// Worker announced it is leaving on its own.
    Disconnecting,
    /// Application payload from the worker.
    Message(Value),
    /// Worker's channel closed.
    Disconnected,
    /// Worker process is gone.
    Exited(TerminationReason),
}

/// Event sender bound to one worker.
///
/// Handed to the forker at spawn time; the forker (or the tasks it starts)
/// reports the worker's lifecycle through it. Sends after the supervisor has
/// stopped are dropped.
#[derive(Debug, Clone)]
pub struct WorkerEvents {
    id: WorkerId,
    tx: mpsc::UnboundedSender<Event>,
}

impl WorkerEvents {
    pub(crate) fn new(id: WorkerId, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { id, tx }
    }

    /// The worker these events belong to.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Report an event.
    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(Event::Worker(self.id, event));
    }

    /// Report readiness.
    pub fn ready(&self) {
        self.emit(WorkerEvent::Ready);
    }

    /// Report a closed channel.
    pub fn disconnected(&self) {
        self.emit(WorkerEvent::Disconnected);
    }

    /// Report process exit.
    pub fn exited(&self, reason: TerminationReason) {
        self.emit(WorkerEvent::Exited(reason));
    }
}

/// Everything a forker needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Id assigned to the new worker
    pub id: WorkerId,
    /// Environment overrides for this worker, including [`WORKER_ID_ENV`]
    pub env: BTreeMap<String, String>,
}

/// Control over one spawned worker.
pub trait WorkerHandle: Send {
    /// OS process id, if there is a process.
    fn pid(&self) -> Option<u32>;

    /// Send a message over the worker's channel.
    fn send(&mut self, message: MasterMessage) -> Result<()>;

    /// Close the master side of the channel. Idempotent.
    fn disconnect(&mut self);

    /// Terminate the process unconditionally.
    fn kill(&mut self) -> Result<()>;
}

/// Starts worker processes on behalf of the supervisor.
pub trait ProcessForker: Send + 'static {
    /// Start a worker. Lifecycle events must be reported through `events`,
    /// including an `Exited` event once the process is gone.
    fn spawn(&mut self, request: SpawnRequest, events: WorkerEvents)
        -> Result<Box<dyn WorkerHandle>>;
}

/// Handle for a worker whose spawn failed. Does nothing.
#[derive(Debug, Default)]
pub(crate) struct StillbornHandle;

impl WorkerHandle for StillbornHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&mut self, _message: MasterMessage) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forker that runs the configured executable as a child process.
#[derive(Debug, Clone)]
pub struct CommandForker {
    exec: PathBuf,
    args: Vec<String>,
    silent: bool,
}

impl CommandForker {
    /// Create a forker for the executable and arguments in `config`.
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            args: config.args.clone(),
            silent: config.silent,
        }
    }
}

impl ProcessForker for CommandForker {
    fn spawn(
        &mut self,
        request: SpawnRequest,
        events: WorkerEvents,
    ) -> Result<Box<dyn WorkerHandle>> {
        let mut cmd = Command::new(&self.exec);
        cmd.args(&self.args)
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.silent {
                Stdio::null()
            } else {
                Stdio::inherit()
            });

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::spawn(request.id, e.to_string()))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::spawn(request.id, "child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::spawn(request.id, "child stdout not captured"))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_channel(request.id, stdin, outbound_rx));
        let reader = tokio::spawn(read_channel(stdout, events.clone()));
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => TerminationReason::from(status),
                Err(e) => {
                    warn!(worker_id = %events.id(), error = %e, "waitpid failed");
                    TerminationReason::Unknown
                }
            };
            // Every line the worker wrote, and the disconnect, precede the exit.
            if let Err(e) = reader.await {
                warn!(worker_id = %events.id(), error = %e, "Worker stdout reader failed");
            }
            events.exited(reason);
        });

        debug!(worker_id = %request.id, pid = ?pid, exe = %self.exec.display(), "Spawned worker process");

        Ok(Box::new(ChildWorker {
            id: request.id,
            pid,
            outbound: Some(outbound),
        }))
    }
}

/// Handle to a worker child process.
struct ChildWorker {
    id: WorkerId,
    pid: Option<u32>,
    /// Dropping the sender ends the writer task, which closes stdin.
    outbound: Option<mpsc::UnboundedSender<MasterMessage>>,
}

impl WorkerHandle for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&mut self, message: MasterMessage) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or_else(|| {
            SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("worker {} channel already closed", self.id),
            ))
        })?;
        outbound.send(message).map_err(|_| {
            SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("worker {} channel closed", self.id),
            ))
        })
    }

    fn disconnect(&mut self) {
        self.outbound.take();
    }

    fn kill(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            // Already reaped.
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Forward outbound messages to the worker's stdin until the handle
/// disconnects or the pipe breaks.
async fn write_channel(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<MasterMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Dropping unserializable message");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(worker_id = %id, error = %e, "Worker stdin closed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!(worker_id = %id, error = %e, "Worker stdin closed");
            return;
        }
    }
    trace!(worker_id = %id, "Closing worker stdin");
}

/// Turn the worker's stdout into lifecycle events.
///
/// Lines are decoded lossily so stray bytes from a worker never close the
/// channel; only EOF or a failed read does.
async fn read_channel(stdout: ChildStdout, events: WorkerEvents) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                match WorkerMessage::from_line_lossy(&line) {
                    WorkerMessage::Ready => events.ready(),
                    WorkerMessage::Disconnect => events.emit(WorkerEvent::Disconnecting),
                    WorkerMessage::Message { payload } => {
                        events.emit(WorkerEvent::Message(payload))
                    }
                }
            }
            Err(e) => {
                debug!(worker_id = %events.id(), error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    events.disconnected();
}
