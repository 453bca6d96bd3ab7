//! Shoal master: keeps a pool of identical worker processes at a target
//! size, rolls them on SIGHUP and shuts them down on SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use shoal_supervisor::{CommandForker, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod console;
mod telemetry;

use config::{ConfigOverrides, LogFormat, MasterConfig};
use console::Console;

/// Shoal master - supervise a pool of identical worker processes
#[derive(Parser, Debug)]
#[command(name = "shoal-master")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Worker executable
    #[arg(short, long, value_name = "PATH")]
    exec: Option<PathBuf>,

    /// Target worker count (default: number of CPUs)
    #[arg(short = 'n', long)]
    size: Option<usize>,

    /// Do not open the control console
    #[arg(long, conflicts_with = "console")]
    no_console: bool,

    /// Control console socket path (default: shoal-master.sock)
    #[arg(long, value_name = "PATH")]
    console: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Arguments passed to every worker
    #[arg(last = true, value_name = "WORKER_ARGS")]
    worker_args: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            exec: self.exec.clone(),
            args: (!self.worker_args.is_empty()).then(|| self.worker_args.clone()),
            size: self.size,
            log_level: self.log_level.clone(),
            log_format: self.json.then_some(LogFormat::Json),
            console: if self.no_console {
                Some(false)
            } else {
                self.console.as_ref().map(|_| true)
            },
            console_path: self.console.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MasterConfig::load(cli.config.as_deref(), cli.overrides())
        .context("Failed to load configuration")?;

    telemetry::init(&config.logging.level, config.logging.format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Shoal master starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let supervisor_config = config.to_supervisor_config();
    let forker = CommandForker::new(&supervisor_config);
    let (supervisor, handle) =
        Supervisor::new(supervisor_config, forker).context("Failed to create supervisor")?;
    let supervisor = supervisor.with_message_handler(|worker_id, payload| {
        info!(%worker_id, %payload, "Worker message");
    });

    let shutdown = CancellationToken::new();
    let console_task = if config.console.enabled {
        let console = Console::bind(&config.console.path)?;
        Some(tokio::spawn(console.serve(handle.clone(), shutdown.clone())))
    } else {
        None
    };

    let exit = supervisor.run().await;

    shutdown.cancel();
    if let Some(task) = console_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Console task failed");
        }
    }

    info!(?exit, code = exit.code(), "Shoal master stopped");
    std::process::exit(exit.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "shoal-master",
            "--exec",
            "/srv/app",
            "-n",
            "3",
            "--console",
            "/tmp/ctl.sock",
            "--json",
            "--",
            "--port",
            "8080",
        ]);
        let overrides = cli.overrides();
        assert_eq!(overrides.exec, Some(PathBuf::from("/srv/app")));
        assert_eq!(overrides.size, Some(3));
        assert_eq!(overrides.console, Some(true));
        assert_eq!(overrides.console_path, Some(PathBuf::from("/tmp/ctl.sock")));
        assert_eq!(overrides.log_format, Some(LogFormat::Json));
        assert_eq!(
            overrides.args,
            Some(vec!["--port".to_string(), "8080".to_string()])
        );
    }

    #[test]
    fn test_cli_defaults_leave_config_alone() {
        let overrides = Cli::parse_from(["shoal-master"]).overrides();
        assert!(overrides.exec.is_none());
        assert!(overrides.args.is_none());
        assert!(overrides.size.is_none());
        assert!(overrides.console.is_none());
        assert!(overrides.log_format.is_none());
    }

    #[test]
    fn test_no_console() {
        let overrides = Cli::parse_from(["shoal-master", "--no-console"]).overrides();
        assert_eq!(overrides.console, Some(false));
        assert!(Cli::try_parse_from(["shoal-master", "--no-console", "--console", "x"]).is_err());
    }
}
