//! OS signal wiring.
//!
//! - `SIGHUP` → rolling restart
//! - `SIGINT`, `SIGTERM` → quit (a second delivery forces it)
//!
//! Registration is best effort: a signal that cannot be registered is
//! skipped.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

use crate::supervisor::SupervisorHandle;

/// Action a signal maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// SIGHUP: rolling restart.
    Restart,
    /// SIGINT / SIGTERM: graceful quit, forceful on repeat.
    Quit,
}

fn register(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            debug!(signal = name, error = %e, "Signal not available, skipping");
            None
        }
    }
}

async fn recv(stream: &mut Option<Signal>) {
    match stream {
        Some(stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Wait for the next signal the supervisor reacts to.
///
/// Never resolves when no signal could be registered.
pub async fn next_signal(
    sighup: &mut Option<Signal>,
    sigint: &mut Option<Signal>,
    sigterm: &mut Option<Signal>,
) -> SignalAction {
    tokio::select! {
        _ = recv(sighup) => {
            info!("Received SIGHUP, restarting workers");
            SignalAction::Restart
        }
        _ = recv(sigint) => {
            info!("Received SIGINT, shutting down");
            SignalAction::Quit
        }
        _ = recv(sigterm) => {
            info!("Received SIGTERM, shutting down");
            SignalAction::Quit
        }
    }
}

/// Drive the supervisor from OS signals until it stops.
pub async fn forward_signals(handle: SupervisorHandle) {
    let mut sighup = register(SignalKind::hangup(), "SIGHUP");
    let mut sigint = register(SignalKind::interrupt(), "SIGINT");
    let mut sigterm = register(SignalKind::terminate(), "SIGTERM");

    loop {
        let sent = match next_signal(&mut sighup, &mut sigint, &mut sigterm).await {
            SignalAction::Restart => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.restart().await {
                        warn!(error = %e, "Restart from SIGHUP failed");
                    }
                });
                Ok(())
            }
            SignalAction::Quit => handle.quit(),
        };
        if sent.is_err() {
            debug!("Supervisor stopped, no longer forwarding signals");
            return;
        }
    }
}
