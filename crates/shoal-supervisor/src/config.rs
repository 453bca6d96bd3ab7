//! Supervisor configuration.
//!
//! Every recognized option is a field with a documented default. The
//! configuration is checked once, when the supervisor is constructed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Default age under which an abnormal exit counts as a crash loop.
pub const DEFAULT_MIN_RESTART_AGE: Duration = Duration::from_millis(2000);
/// Default grace before an unresponsive worker is killed.
pub const DEFAULT_DELAY_BEFORE_KILL: Duration = Duration::from_millis(2000);
/// Default backoff before respawning after a fast crash.
pub const DEFAULT_DELAY_BEFORE_RESTART_WHEN_MIN_RESTART_AGE: Duration =
    Duration::from_millis(2000);
/// Default confirmation window for the first replacement of a restart.
pub const DEFAULT_DELAY_FOR_RESTART_CHECKING: Duration = Duration::from_millis(2000);

/// Configuration for a [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker executable. Required.
    pub exec: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
    /// Initial target worker count.
    pub size: usize,
    /// Environment overrides applied to every worker.
    pub env: BTreeMap<String, String>,
    /// Discard worker stderr instead of inheriting it.
    pub silent: bool,
    /// Abnormal exits younger than this put the pool in danger mode.
    pub min_restart_age: Duration,
    /// How long a disconnected worker may linger before it is killed.
    pub delay_before_kill: Duration,
    /// Backoff before the single retry scheduled after a fast crash.
    pub delay_before_restart_when_min_restart_age: Duration,
    /// When set, workers get a `shutdown` notice and this long to leave on
    /// their own before the channel is closed.
    pub delay_between_shutdown_and_disconnect: Option<Duration>,
    /// How long the first restart replacement must stay up after ready.
    pub delay_for_restart_checking: Duration,
    /// Wire SIGHUP/SIGINT/SIGTERM to restart and quit.
    pub signals: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::new(),
            args: Vec::new(),
            size: default_size(),
            env: BTreeMap::new(),
            silent: false,
            min_restart_age: DEFAULT_MIN_RESTART_AGE,
            delay_before_kill: DEFAULT_DELAY_BEFORE_KILL,
            delay_before_restart_when_min_restart_age:
                DEFAULT_DELAY_BEFORE_RESTART_WHEN_MIN_RESTART_AGE,
            delay_between_shutdown_and_disconnect: None,
            delay_for_restart_checking: DEFAULT_DELAY_FOR_RESTART_CHECKING,
            signals: true,
        }
    }
}

impl SupervisorConfig {
    /// Create a configuration for the given worker executable with defaults
    /// for everything else.
    pub fn new(exec: impl Into<PathBuf>) -> Self {
        Self {
            exec: exec.into(),
            ..Self::default()
        }
    }

    /// Set the target worker count.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Append worker arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Enable or disable signal wiring.
    pub fn with_signals(mut self, signals: bool) -> Self {
        self.signals = signals;
        self
    }

    /// The linger delay, treating zero as disabled.
    pub fn linger(&self) -> Option<Duration> {
        self.delay_between_shutdown_and_disconnect
            .filter(|delay| !delay.is_zero())
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.exec.as_os_str().is_empty() {
            return Err(SupervisorError::invalid_config(
                "Must define an 'exec' worker executable",
            ));
        }
        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(SupervisorError::invalid_config(
                "environment override names must be non-empty and must not contain '='",
            ));
        }
        Ok(())
    }
}

/// Host logical CPU count, or 1 when it cannot be determined.
pub fn default_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
