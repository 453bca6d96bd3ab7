//! Graceful worker removal and the kill backstops.
//!
//! Removal closes the worker's channel (after a `shutdown` notice and the
//! linger delay, when one is configured) and gives the worker
//! `delay_before_kill` to go away. Separately, any worker whose channel
//! closes but whose process does not exit within `delay_before_kill` is
//! killed.

use tracing::{debug, warn};

use super::Supervisor;
use crate::forker::ProcessForker;
use crate::protocol::MasterMessage;
use crate::timer::{self, TimerKind};
use crate::worker::{WorkerId, WorkerState};

impl<F: ProcessForker> Supervisor<F> {
    /// Start graceful removal of a worker.
    pub(super) fn remove_worker(&mut self, id: WorkerId) {
        let linger = self.config.linger();
        let Some(worker) = self.registry.get_mut(id) else {
            return;
        };
        if worker.linger_timer.is_some() || worker.kill_timer.is_some() {
            debug!(worker_id = %id, "Removal already in progress");
            return;
        }
        worker.exited_after_disconnect = true;
        worker.advance(WorkerState::Disconnecting);

        match linger {
            Some(delay) => {
                debug!(worker_id = %id, "Sending shutdown signal");
                if let Err(e) = worker.handle.send(MasterMessage::Shutdown) {
                    debug!(worker_id = %id, error = %e, "Shutdown notice not delivered");
                }
                worker.linger_timer = Some(self.timers.schedule(delay, TimerKind::Linger(id)));
            }
            None => {
                debug!(worker_id = %id, "Disconnecting worker");
                worker.handle.disconnect();
                worker.kill_timer = Some(
                    self.timers
                        .schedule(self.config.delay_before_kill, TimerKind::KillCheck(id)),
                );
            }
        }
    }

    pub(super) fn on_linger_expired(&mut self, id: WorkerId, ticket: u64) {
        let Some(worker) = self.registry.get_mut(id) else {
            return;
        };
        if !timer::claim(&mut worker.linger_timer, ticket) || !worker.connected {
            return;
        }
        debug!(worker_id = %id, "Linger expired, disconnecting worker");
        worker.handle.disconnect();
        worker.kill_timer = Some(
            self.timers
                .schedule(self.config.delay_before_kill, TimerKind::KillCheck(id)),
        );
    }

    pub(super) fn on_kill_check(&mut self, id: WorkerId, ticket: u64) {
        let Some(worker) = self.registry.get_mut(id) else {
            return;
        };
        if !timer::claim(&mut worker.kill_timer, ticket) || !worker.connected {
            return;
        }
        warn!(worker_id = %id, pid = ?worker.pid, "Worker does not disconnect, forcefully killing");
        if let Err(e) = worker.handle.kill() {
            warn!(worker_id = %id, error = %e, "Failed to kill worker");
        }
    }

    /// The worker's channel closed.
    pub(super) fn on_disconnected(&mut self, id: WorkerId) {
        let Some(worker) = self.registry.get_mut(id) else {
            return;
        };
        debug!(worker_id = %id, "Worker disconnect");
        worker.connected = false;
        worker.advance(WorkerState::Disconnecting);
        worker.disconnect_timer = Some(self.timers.schedule(
            self.config.delay_before_kill,
            TimerKind::DisconnectBackstop(id),
        ));
    }

    /// A disconnected worker is still registered, so it has not exited.
    pub(super) fn on_disconnect_backstop(&mut self, id: WorkerId, ticket: u64) {
        let Some(worker) = self.registry.get_mut(id) else {
            return;
        };
        if !timer::claim(&mut worker.disconnect_timer, ticket) {
            return;
        }
        warn!(worker_id = %id, pid = ?worker.pid, "Worker did not exit after disconnect, forcefully killing");
        if let Err(e) = worker.handle.kill() {
            warn!(worker_id = %id, error = %e, "Failed to kill worker");
        }
    }
}
