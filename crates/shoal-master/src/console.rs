//! Operator console over a Unix domain socket.
//!
//! Each connection is a line-oriented shell. A session counts toward the
//! attached-connections figure and receives every broadcast line for as
//! long as it stays open. Commands only go through the [`SupervisorHandle`];
//! the console never touches pool state itself.
//!
//! ```text
//! $ socat - UNIX-CONNECT:shoal-master.sock
//! shoal> resize 4
//! Resizing to 4 workers
//! shoal> workers
//! id=0 pid=41230 state=ready age=12.4s
//! ```

use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use shoal_supervisor::{PoolSnapshot, SupervisorHandle};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROMPT: &str = "shoal> ";

const GREETING: &str = "shoal master console. Type 'help' for commands.\n";

const HELP: &str = "\
help              show this text
resize N          converge the pool to N workers (also resize(N))
restart           replace every worker, one at a time
stop              shut down gracefully; a second stop kills the workers
kill              kill every worker and stop
size              target and live worker count
connections       attached console sessions
workers           one line per live worker
pids              worker id and process id
ages              worker id and age
states            worker id and lifecycle state
debug <text>      send text to every console and the log
exit              close this session";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command '{0}', type 'help' for the list")]
    Unknown(String),

    #[error("'{command}' needs an argument: {usage}")]
    MissingArgument {
        command: &'static str,
        usage: &'static str,
    },

    #[error("invalid argument for '{command}': {message}")]
    InvalidArgument {
        command: &'static str,
        message: String,
    },
}

/// One console command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Resize(usize),
    Restart,
    /// Graceful quit
    Stop,
    /// Forceful quit
    Kill,
    Size,
    Connections,
    Workers,
    Pids,
    Ages,
    States,
    Debug(String),
    Exit,
}

impl FromStr for ConsoleCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();

        // resize(4)
        if let Some(inner) = line
            .strip_prefix("resize(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return parse_size(inner).map(ConsoleCommand::Resize);
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "help" => Ok(ConsoleCommand::Help),
            "resize" if rest.is_empty() => Err(ParseError::MissingArgument {
                command: "resize",
                usage: "resize N",
            }),
            "resize" => parse_size(rest).map(ConsoleCommand::Resize),
            "restart" => Ok(ConsoleCommand::Restart),
            "stop" | "quit" => Ok(ConsoleCommand::Stop),
            "kill" => Ok(ConsoleCommand::Kill),
            "size" => Ok(ConsoleCommand::Size),
            "connections" => Ok(ConsoleCommand::Connections),
            "workers" => Ok(ConsoleCommand::Workers),
            "pids" => Ok(ConsoleCommand::Pids),
            "ages" => Ok(ConsoleCommand::Ages),
            "states" => Ok(ConsoleCommand::States),
            "debug" if rest.is_empty() => Err(ParseError::MissingArgument {
                command: "debug",
                usage: "debug <text>",
            }),
            "debug" => Ok(ConsoleCommand::Debug(rest.to_string())),
            "exit" | ".exit" => Ok(ConsoleCommand::Exit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn parse_size(raw: &str) -> Result<usize, ParseError> {
    raw.trim()
        .parse()
        .map_err(|_| ParseError::InvalidArgument {
            command: "resize",
            message: format!("expected a worker count, got '{}'", raw.trim()),
        })
}

/// What a session does after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Nothing,
    Close,
}

/// Run one command against the supervisor.
///
/// Resize and restart return at once; their outcome is broadcast to every
/// console when it is known.
pub async fn execute(handle: &SupervisorHandle, command: ConsoleCommand) -> Reply {
    match command {
        ConsoleCommand::Help => Reply::Text(HELP.to_string()),
        ConsoleCommand::Resize(target) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.resize(Some(target)).await {
                    Ok(()) => handle.broadcast(format!("Resized to {target} workers")),
                    Err(e) => handle.broadcast(format!("Resize to {target} failed: {e}")),
                }
            });
            Reply::Text(format!("Resizing to {target} workers"))
        }
        ConsoleCommand::Restart => {
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.restart().await {
                    Ok(()) => handle.broadcast("Restart complete"),
                    Err(e) => handle.broadcast(format!("Restart failed: {e}")),
                }
            });
            Reply::Text("Restarting workers".to_string())
        }
        ConsoleCommand::Stop => match handle.quit() {
            Ok(()) => Reply::Text("Stopping".to_string()),
            Err(e) => Reply::Text(format!("error: {e}")),
        },
        ConsoleCommand::Kill => match handle.quit_hard() {
            Ok(()) => Reply::Text("Killing workers".to_string()),
            Err(e) => Reply::Text(format!("error: {e}")),
        },
        ConsoleCommand::Connections => Reply::Text(handle.console_connections().to_string()),
        ConsoleCommand::Debug(text) => {
            handle.broadcast(text);
            Reply::Nothing
        }
        ConsoleCommand::Exit => Reply::Close,
        view => match handle.snapshot().await {
            Ok(snapshot) => Reply::Text(render(&view, &snapshot)),
            Err(e) => Reply::Text(format!("error: {e}")),
        },
    }
}

/// Format a read-only view of the pool.
pub fn render(view: &ConsoleCommand, snapshot: &PoolSnapshot) -> String {
    let mut out = String::new();
    match view {
        ConsoleCommand::Size => {
            let _ = write!(
                out,
                "target={} live={}",
                snapshot.target,
                snapshot.workers.len()
            );
            if snapshot.danger {
                out.push_str(" danger");
            }
            if snapshot.quitting {
                out.push_str(" quitting");
            }
        }
        ConsoleCommand::Workers => {
            for worker in &snapshot.workers {
                let _ = writeln!(
                    out,
                    "id={} pid={} state={} age={:.1}s",
                    worker.id,
                    pid_label(worker.pid),
                    worker.state,
                    worker.age.as_secs_f64()
                );
            }
        }
        ConsoleCommand::Pids => {
            for worker in &snapshot.workers {
                let _ = writeln!(out, "{}: {}", worker.id, pid_label(worker.pid));
            }
        }
        ConsoleCommand::Ages => {
            for worker in &snapshot.workers {
                let _ = writeln!(out, "{}: {:.1}s", worker.id, worker.age.as_secs_f64());
            }
        }
        ConsoleCommand::States => {
            for worker in &snapshot.workers {
                let _ = writeln!(out, "{}: {}", worker.id, worker.state);
            }
        }
        _ => {}
    }
    if snapshot.workers.is_empty() && !matches!(view, ConsoleCommand::Size) {
        out.push_str("no workers");
    }
    out.trim_end().to_string()
}

fn pid_label(pid: Option<u32>) -> String {
    pid.map_or_else(|| "-".to_string(), |pid| pid.to_string())
}

/// Serve one console session until the peer leaves, sends `exit`, or
/// `shutdown` fires.
pub async fn serve_session<R, W>(
    reader: R,
    mut writer: W,
    handle: SupervisorHandle,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _guard = handle.console_guard();
    let mut sink = handle.subscribe();
    let mut lines = BufReader::new(reader).lines();
    debug!(
        connections = handle.console_connections(),
        "Console session opened"
    );

    writer.write_all(GREETING.as_bytes()).await?;
    writer.write_all(PROMPT.as_bytes()).await?;
    writer.flush().await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(message) = sink.recv() => {
                writer.write_all(message.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if !line.is_empty() {
                    let reply = match line.parse::<ConsoleCommand>() {
                        Ok(command) => execute(&handle, command).await,
                        Err(e) => Reply::Text(format!("error: {e}")),
                    };
                    match reply {
                        Reply::Close => break,
                        Reply::Nothing => {}
                        Reply::Text(text) => {
                            writer.write_all(text.as_bytes()).await?;
                            writer.write_all(b"\n").await?;
                        }
                    }
                }
                writer.write_all(PROMPT.as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }

    debug!("Console session closed");
    Ok(())
}

/// The bound console socket. The socket file is removed on drop.
pub struct Console {
    listener: UnixListener,
    path: PathBuf,
}

impl Console {
    /// Bind at `path`, replacing a stale socket file.
    pub fn bind(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale console socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to remove stale console socket {}", path.display())
                })
            }
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind console socket {}", path.display()))?;
        info!(path = %path.display(), "Console listening");

        Ok(Self { listener, path })
    }

    /// Accept sessions until `shutdown` fires.
    pub async fn serve(self, handle: SupervisorHandle, shutdown: CancellationToken) {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept console connection");
                        continue;
                    }
                },
            };

            let handle = handle.clone();
            let shutdown = shutdown.child_token();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = serve_session(reader, writer, handle, shutdown).await {
                    debug!(error = %e, "Console session ended with error");
                }
            });
        }
        debug!("Console stopped accepting");
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove console socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use shoal_supervisor::{
        CommandForker, Supervisor, SupervisorConfig, SupervisorExit, WorkerId, WorkerInfo,
        WorkerState,
    };
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    fn worker(id: u64, pid: Option<u32>, age_ms: u64) -> WorkerInfo {
        WorkerInfo {
            id: WorkerId::new(id),
            pid,
            state: WorkerState::Ready,
            age: Duration::from_millis(age_ms),
            connected: true,
            born_at: chrono::Utc::now(),
        }
    }

    fn snapshot(workers: Vec<WorkerInfo>) -> PoolSnapshot {
        PoolSnapshot {
            target: 2,
            workers,
            quitting: false,
            restarting: false,
            resizing: false,
            danger: false,
        }
    }

    /// A supervisor with an empty pool.
    fn empty_pool() -> (SupervisorHandle, JoinHandle<SupervisorExit>) {
        let config = SupervisorConfig::new("/bin/sh")
            .with_size(0)
            .with_signals(false);
        let (supervisor, handle) =
            Supervisor::new(config.clone(), CommandForker::new(&config)).unwrap();
        (handle, tokio::spawn(supervisor.run()))
    }

    async fn read_until(stream: &mut DuplexStream, seen: &mut String, needle: &str) {
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            let n = timeout(DEFAULT_TIMEOUT, stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "session closed before {needle:?}, got {seen:?}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("help".parse(), Ok(ConsoleCommand::Help));
        assert_eq!("resize 4".parse(), Ok(ConsoleCommand::Resize(4)));
        assert_eq!("  resize(3) ".parse(), Ok(ConsoleCommand::Resize(3)));
        assert_eq!("restart".parse(), Ok(ConsoleCommand::Restart));
        assert_eq!("stop".parse(), Ok(ConsoleCommand::Stop));
        assert_eq!("kill".parse(), Ok(ConsoleCommand::Kill));
        assert_eq!("size".parse(), Ok(ConsoleCommand::Size));
        assert_eq!("connections".parse(), Ok(ConsoleCommand::Connections));
        assert_eq!("workers".parse(), Ok(ConsoleCommand::Workers));
        assert_eq!("pids".parse(), Ok(ConsoleCommand::Pids));
        assert_eq!("ages".parse(), Ok(ConsoleCommand::Ages));
        assert_eq!("states".parse(), Ok(ConsoleCommand::States));
        assert_eq!(
            "debug worker 3 looks slow".parse(),
            Ok(ConsoleCommand::Debug("worker 3 looks slow".to_string()))
        );
        assert_eq!("exit".parse(), Ok(ConsoleCommand::Exit));
        assert_eq!(".exit".parse(), Ok(ConsoleCommand::Exit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "frobnicate".parse::<ConsoleCommand>(),
            Err(ParseError::Unknown("frobnicate".to_string()))
        );
        assert!(matches!(
            "resize".parse::<ConsoleCommand>(),
            Err(ParseError::MissingArgument { .. })
        ));
        assert!(matches!(
            "resize many".parse::<ConsoleCommand>(),
            Err(ParseError::InvalidArgument { .. })
        ));
        assert!(matches!(
            "resize(-1)".parse::<ConsoleCommand>(),
            Err(ParseError::InvalidArgument { .. })
        ));
        assert!(matches!(
            "debug".parse::<ConsoleCommand>(),
            Err(ParseError::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_render_views() {
        let pool = snapshot(vec![worker(0, Some(100), 1500), worker(3, None, 300)]);

        assert_eq!(render(&ConsoleCommand::Size, &pool), "target=2 live=2");
        assert_eq!(
            render(&ConsoleCommand::Workers, &pool),
            "id=0 pid=100 state=ready age=1.5s\nid=3 pid=- state=ready age=0.3s"
        );
        assert_eq!(render(&ConsoleCommand::Pids, &pool), "0: 100\n3: -");
        assert_eq!(render(&ConsoleCommand::Ages, &pool), "0: 1.5s\n3: 0.3s");
        assert_eq!(render(&ConsoleCommand::States, &pool), "0: ready\n3: ready");
    }

    #[test]
    fn test_render_empty_and_flags() {
        let mut pool = snapshot(Vec::new());
        pool.danger = true;
        pool.quitting = true;
        assert_eq!(
            render(&ConsoleCommand::Size, &pool),
            "target=2 live=0 danger quitting"
        );
        assert_eq!(render(&ConsoleCommand::Workers, &pool), "no workers");
    }

    #[tokio::test]
    async fn test_session_commands_and_broadcasts() {
        let (handle, task) = empty_pool();
        let (mut client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let session = tokio::spawn(serve_session(
            reader,
            writer,
            handle.clone(),
            CancellationToken::new(),
        ));

        let mut seen = String::new();
        read_until(&mut client, &mut seen, PROMPT).await;
        assert_eq!(handle.console_connections(), 1);

        client.write_all(b"size\n").await.unwrap();
        read_until(&mut client, &mut seen, "target=0 live=0").await;

        client.write_all(b"connections\n").await.unwrap();
        read_until(&mut client, &mut seen, "1\n").await;

        client.write_all(b"debug hello consoles\n").await.unwrap();
        read_until(&mut client, &mut seen, "hello consoles\n").await;

        client.write_all(b"nonsense\n").await.unwrap();
        read_until(&mut client, &mut seen, "error: unknown command 'nonsense'").await;

        client.write_all(b"exit\n").await.unwrap();
        timeout(DEFAULT_TIMEOUT, session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.console_connections(), 0);

        handle.quit().unwrap();
        let exit = timeout(DEFAULT_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(exit, SupervisorExit::Graceful);
    }

    #[tokio::test]
    async fn test_session_stop_command_quits_supervisor() {
        let (handle, task) = empty_pool();
        let (mut client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(serve_session(reader, writer, handle, shutdown.clone()));

        let mut seen = String::new();
        read_until(&mut client, &mut seen, PROMPT).await;
        client.write_all(b"stop\n").await.unwrap();
        read_until(&mut client, &mut seen, "Stopping").await;

        let exit = timeout(DEFAULT_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(exit, SupervisorExit::Graceful);

        shutdown.cancel();
        timeout(DEFAULT_TIMEOUT, session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"stale").unwrap();

        let console = Console::bind(&path).unwrap();
        assert!(path.exists());

        let (handle, task) = empty_pool();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(console.serve(handle.clone(), shutdown.clone()));

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut buf = [0u8; 256];
        let n = timeout(DEFAULT_TIMEOUT, stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("shoal master console"));

        shutdown.cancel();
        timeout(DEFAULT_TIMEOUT, server).await.unwrap().unwrap();
        assert!(!path.exists());

        handle.quit().unwrap();
        timeout(DEFAULT_TIMEOUT, task).await.unwrap().unwrap();
    }
}
