//! Reconciliation of the live worker count toward the target.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{Action, Supervisor, SupervisorExit};
use crate::error::Result;
use crate::forker::ProcessForker;
use crate::timer::TimerKind;
use crate::worker::WorkerId;

/// Delay before reconciling again after a round ended at the wrong size.
pub(crate) const MISMATCH_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Which way a round moves the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Direction {
    /// Waiting for new workers to report ready.
    Grow,
    /// Waiting for removed workers to exit.
    Shrink,
}

/// The in-flight reconciliation round.
#[derive(Debug)]
pub(super) struct ResizeRound {
    /// Target the round was started for.
    pub(super) target: usize,
    pub(super) direction: Direction,
    /// Workers the round's barrier still waits on.
    pub(super) pending: HashSet<WorkerId>,
}

/// Someone waiting for the pool to converge.
#[derive(Debug)]
pub(super) enum ResizeWaiter {
    /// A handle caller.
    Caller(oneshot::Sender<Result<()>>),
    /// The rollout, converging before it walks its snapshot.
    Rollout,
}

/// Outcome of checking the pool size after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Verdict {
    Converged,
    Retry,
    Fatal,
}

/// Decide what a finished round means for the pool.
pub(super) fn verdict(live: usize, target: usize, danger: bool) -> Verdict {
    if live == target {
        Verdict::Converged
    } else if danger && target == 0 {
        Verdict::Fatal
    } else {
        Verdict::Retry
    }
}

impl<F: ProcessForker> Supervisor<F> {
    /// Converge toward `target` (or the current target).
    ///
    /// When a round is already in flight the waiter is queued and the new
    /// target, if any, is picked up by a follow-up round.
    pub(super) fn start_resize(&mut self, target: Option<usize>, waiter: Option<ResizeWaiter>) {
        if let Some(target) = target {
            self.target = target;
        }
        if let Some(waiter) = waiter {
            self.resize_waiters.push_back(waiter);
        }
        if self.resize.is_some() {
            debug!(target = self.target, "Resize already in flight, queued");
            return;
        }
        self.begin_round();
    }

    fn begin_round(&mut self) {
        let live = self.registry.len();
        let target = self.target;

        if live == target {
            self.resize = Some(ResizeRound {
                target,
                direction: Direction::Grow,
                pending: HashSet::new(),
            });
            self.actions.push_back(Action::FinishResize);
            return;
        }

        let mut pending = HashSet::new();
        let direction = if live < target {
            info!(live, target, change = target - live, "Resizing up");
            for _ in live..target {
                pending.insert(self.spawn_worker());
            }
            Direction::Grow
        } else {
            info!(live, target, change = live - target, "Resizing down");
            for id in self.registry.newest(live - target) {
                debug!(worker_id = %id, "Resizing down");
                pending.insert(id);
                if self.registry.is_connected(id) {
                    self.remove_worker(id);
                }
            }
            Direction::Shrink
        };

        self.resize = Some(ResizeRound {
            target,
            direction,
            pending,
        });
    }

    /// Count a ready worker toward a growing round.
    pub(super) fn resize_on_ready(&mut self, id: WorkerId) {
        let growing = self
            .resize
            .as_ref()
            .is_some_and(|round| round.direction == Direction::Grow);
        if growing {
            self.settle(id);
        }
    }

    /// Count an exited worker toward the round, whichever way it moves.
    ///
    /// A new worker that dies before reporting ready settles its slot so
    /// the round cannot wedge; the size check afterwards sees the gap.
    pub(super) fn resize_on_exit(&mut self, id: WorkerId) {
        self.settle(id);
    }

    fn settle(&mut self, id: WorkerId) {
        let Some(round) = self.resize.as_mut() else {
            return;
        };
        if round.pending.remove(&id) && round.pending.is_empty() {
            self.actions.push_back(Action::FinishResize);
        }
    }

    pub(super) fn finish_resize(&mut self) {
        let Some(round) = self.resize.take() else {
            return;
        };

        if round.target != self.target {
            debug!(
                reached = round.target,
                target = self.target,
                "Target changed during resize, reconciling again"
            );
            self.begin_round();
            return;
        }

        info!(target = round.target, "Done resizing");
        for waiter in self.resize_waiters.drain(..) {
            match waiter {
                ResizeWaiter::Caller(reply) => {
                    let _ = reply.send(Ok(()));
                }
                ResizeWaiter::Rollout => self.actions.push_back(Action::AdvanceRollout),
            }
        }

        let live = self.registry.len();
        match verdict(live, self.target, self.danger) {
            Verdict::Converged => self.danger = false,
            Verdict::Retry => {
                warn!(live, target = self.target, "DANGER! wrong number of workers");
                self.danger = true;
                self.mismatch_retry = Some(
                    self.timers
                        .schedule(MISMATCH_RETRY_DELAY, TimerKind::MismatchRetry),
                );
            }
            Verdict::Fatal => {
                error!(live, "DANGER! cannot bring the pool down, giving up");
                self.kill_all();
                self.exit = Some(SupervisorExit::Fatal);
            }
        }
    }

    pub(super) fn on_mismatch_retry(&mut self, ticket: u64) {
        if crate::timer::claim(&mut self.mismatch_retry, ticket) {
            self.start_resize(None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict() {
        assert_eq!(verdict(3, 3, false), Verdict::Converged);
        assert_eq!(verdict(3, 3, true), Verdict::Converged);
        assert_eq!(verdict(2, 3, false), Verdict::Retry);
        assert_eq!(verdict(2, 3, true), Verdict::Retry);
        assert_eq!(verdict(1, 0, false), Verdict::Retry);
        assert_eq!(verdict(1, 0, true), Verdict::Fatal);
    }
}
