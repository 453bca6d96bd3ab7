//! # shoal-supervisor
//!
//! Supervision of a pool of identical worker processes for a long-running
//! service.
//!
//! ## Overview
//!
//! A single control task owns all pool state and reacts to discrete events:
//! worker spawned, ready, disconnected, exited, and timer expiries. On top of
//! that event loop it provides:
//! 1. Reconciliation of the live worker count toward a target size
//! 2. Zero-downtime rolling restarts, guarded by a crash check on the first
//!    replacement
//! 3. A graceful-then-forceful shutdown ladder
//! 4. Crash-loop ("danger") detection with fixed-delay retries
//!
//! Operators and signal handlers drive the pool through a cloneable
//! [`SupervisorHandle`]; they never touch pool state directly.
//!
//! ## Worker Protocol
//!
//! Workers speak newline-delimited JSON over stdin/stdout (see [`protocol`]).
//! A worker announces `{"type":"ready"}` once it can take traffic. Closing
//! the worker's stdin is the master-side disconnect.
//!
//! ## Environment Variables
//!
//! - `SHOAL_WORKER_ID`: set for every worker, the supervisor-assigned id
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("shoal-supervisor requires a Unix platform (Linux or macOS)");

pub mod broadcast;
pub mod child;
pub mod config;
pub mod forker;
pub mod protocol;
pub mod signals;
pub mod supervisor;
pub mod worker;

mod error;
mod timer;

pub use broadcast::{Broadcaster, SinkSubscription};
pub use child::WorkerLink;
pub use config::SupervisorConfig;
pub use error::{Result, SupervisorError};
pub use forker::{
    CommandForker, ProcessForker, SpawnRequest, TerminationReason, WorkerEvent, WorkerEvents,
    WorkerHandle,
};
pub use protocol::{MasterMessage, WorkerMessage, WORKER_ID_ENV};
pub use supervisor::{
    ConsoleGuard, MessageHandler, PoolSnapshot, Supervisor, SupervisorExit, SupervisorHandle,
};
pub use worker::{WorkerId, WorkerInfo, WorkerState};
