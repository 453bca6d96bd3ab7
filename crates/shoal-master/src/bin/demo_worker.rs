//! Demonstration worker for the shoal master.
//!
//! Announces ready, sends a heartbeat message on an interval, echoes any
//! payload the master sends, and leaves on a shutdown notice or when the
//! master closes the channel. `--crash-after-ms` exits with status 1 after
//! the given delay, which is handy for watching danger mode kick in.
//!
//! ```text
//! shoal-master --exec target/debug/shoal-demo-worker -n 2 -- --heartbeat-ms 2000
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use shoal_supervisor::{MasterMessage, WorkerLink};
use tracing::{info, warn};

/// Shoal demo worker
#[derive(Parser, Debug)]
#[command(name = "shoal-demo-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interval between heartbeat messages
    #[arg(long, default_value_t = 5000)]
    heartbeat_ms: u64,

    /// Exit with status 1 after this many milliseconds
    #[arg(long)]
    crash_after_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut link = WorkerLink::from_env();
    let worker = link.id().map_or_else(|| "?".to_string(), |id| id.to_string());
    info!(%worker, pid = std::process::id(), "Demo worker starting");

    link.ready().await.context("Failed to announce ready")?;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(args.heartbeat_ms.max(1)));
    heartbeat.tick().await;
    let crash = async {
        match args.crash_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(crash);

    let mut beats: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut crash => {
                warn!(%worker, "Simulated crash");
                std::process::exit(1);
            }
            _ = heartbeat.tick() => {
                beats += 1;
                link.send(json!({ "worker": worker, "heartbeat": beats }))
                    .await
                    .context("Failed to send heartbeat")?;
            }
            message = link.next() => match message? {
                Some(MasterMessage::Shutdown) => {
                    info!(%worker, "Shutdown notice received, leaving");
                    break;
                }
                Some(MasterMessage::Message { payload }) => {
                    link.send(json!({ "worker": worker, "echo": payload }))
                        .await
                        .context("Failed to echo message")?;
                }
                None => {
                    info!(%worker, "Master closed the channel, leaving");
                    break;
                }
            },
        }
    }

    Ok(())
}
