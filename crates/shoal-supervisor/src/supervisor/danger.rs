//! Exit handling and crash-loop detection.
//!
//! An exit is abnormal unless the master was removing the worker or the
//! worker announced its own disconnect. An abnormal exit of a worker younger
//! than `min_restart_age` puts the pool in danger mode: instead of
//! respawning right away, a single retry is scheduled after
//! `delay_before_restart_when_min_restart_age`.

use std::time::Duration;

use tracing::{info, warn};

use super::{Action, Supervisor};
use crate::forker::{ProcessForker, TerminationReason};
use crate::timer::{self, TimerKind};
use crate::worker::WorkerId;

/// Whether an exit should be treated as a fast crash.
pub(super) fn is_fast_crash(voluntary: bool, age: Duration, min_restart_age: Duration) -> bool {
    !voluntary && age < min_restart_age
}

impl<F: ProcessForker> Supervisor<F> {
    pub(super) fn on_exit(&mut self, id: WorkerId, reason: TerminationReason) {
        let Some(worker) = self.registry.remove(id) else {
            return;
        };
        let age = worker.age();
        let voluntary = worker.exited_after_disconnect;
        // Pending timers for this worker are cancelled here.
        drop(worker);
        // An aborting rollout clears itself below; it still counts as in flight.
        let restarting = self.restart.is_some();

        self.resize_on_exit(id);
        self.rollout_on_exit(id);

        if voluntary {
            info!(worker_id = %id, %reason, "Worker exited");
        } else {
            warn!(worker_id = %id, %reason, age_ms = age.as_millis() as u64, "Worker exited abnormally");
            if is_fast_crash(voluntary, age, self.config.min_restart_age) {
                warn!(worker_id = %id, "Worker died too quickly, danger");
                self.danger = true;
                if self.danger_retry.is_none() && !restarting {
                    self.danger_retry = Some(self.timers.schedule(
                        self.config.delay_before_restart_when_min_restart_age,
                        TimerKind::DangerRetry,
                    ));
                }
                return;
            }
        }

        if self.registry.len() < self.target && self.resize.is_none() && !self.quitting {
            self.actions.push_back(Action::Reconcile);
        }
    }

    pub(super) fn on_danger_retry(&mut self, ticket: u64) {
        if timer::claim(&mut self.danger_retry, ticket) {
            info!("Retrying after fast crash");
            self.start_resize(None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_crash_classification() {
        let min = Duration::from_millis(2000);
        assert!(is_fast_crash(false, Duration::from_millis(10), min));
        assert!(!is_fast_crash(true, Duration::from_millis(10), min));
        assert!(!is_fast_crash(false, Duration::from_millis(2000), min));
        assert!(!is_fast_crash(false, Duration::from_secs(60), min));
    }
}
