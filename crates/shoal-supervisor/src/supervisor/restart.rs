//! Rolling restart.
//!
//! Live workers are replaced one position at a time. The first replacement
//! is guarded: it must report ready and then survive
//! `delay_for_restart_checking` before its predecessor is removed, and if
//! it dies in that window the whole rollout is abandoned. Later positions
//! retire their predecessor as soon as the replacement is ready.
//!
//! While quitting the same walk only removes workers and spawns nothing.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::resize::ResizeWaiter;
use super::{Action, Supervisor};
use crate::error::{Result, SupervisorError};
use crate::forker::ProcessForker;
use crate::timer::{self, Timer, TimerKind};
use crate::worker::WorkerId;

/// Pause between the end of a graceful shutdown and the supervisor exit.
pub(crate) const QUIT_GRACE: Duration = Duration::from_millis(20);

/// Who is told when the rollout ends.
#[derive(Debug)]
pub(super) enum RolloutCompletion {
    /// A `restart()` caller.
    Caller(oneshot::Sender<Result<()>>),
    /// The graceful shutdown; ends the supervisor.
    Quit,
}

/// Where the rollout is between positions.
#[derive(Debug)]
pub(super) enum Phase {
    /// Converging the pool before the walk starts.
    Converging,
    /// Ready to process the next position.
    Idle,
    /// First replacement on probation.
    Guarded {
        replacement: WorkerId,
        replacing: WorkerId,
        confirm: Option<Timer>,
    },
    /// Later replacement waiting for ready.
    Replacing {
        replacement: WorkerId,
        replacing: WorkerId,
    },
}

/// What a replacement's ready event means for the rollout.
#[derive(Debug, PartialEq, Eq)]
enum OnReady {
    ArmConfirm,
    Retire(WorkerId),
    Ignore,
}

/// What a worker's exit means for the rollout.
#[derive(Debug, PartialEq, Eq)]
enum OnExit {
    Abort,
    Advance,
    Ignore,
}

/// The in-flight rollout.
#[derive(Debug)]
pub(super) struct Rollout {
    /// Ids live when the rollout began, in spawn order.
    snapshot: Vec<WorkerId>,
    position: usize,
    /// The next replacement spawned is the guarded one.
    guard_next: bool,
    completion: RolloutCompletion,
    phase: Phase,
}

impl Rollout {
    fn new(snapshot: Vec<WorkerId>, completion: RolloutCompletion, converging: bool) -> Self {
        Self {
            snapshot,
            position: 0,
            guard_next: true,
            completion,
            phase: if converging {
                Phase::Converging
            } else {
                Phase::Idle
            },
        }
    }

    /// Take the next snapshot position, if the rollout is between positions.
    fn next_position(&mut self) -> Option<Option<WorkerId>> {
        if !matches!(self.phase, Phase::Idle | Phase::Converging) {
            return None;
        }
        self.phase = Phase::Idle;
        let next = self.snapshot.get(self.position).copied();
        if next.is_some() {
            self.position += 1;
        }
        Some(next)
    }

    fn replacing(&mut self, replacement: WorkerId, replacing: WorkerId) {
        self.phase = if self.guard_next {
            self.guard_next = false;
            Phase::Guarded {
                replacement,
                replacing,
                confirm: None,
            }
        } else {
            Phase::Replacing {
                replacement,
                replacing,
            }
        };
    }

    fn on_ready(&mut self, id: WorkerId) -> OnReady {
        match self.phase {
            Phase::Guarded {
                replacement,
                confirm: None,
                ..
            } if replacement == id => OnReady::ArmConfirm,
            Phase::Replacing {
                replacement,
                replacing,
            } if replacement == id => {
                self.phase = Phase::Idle;
                OnReady::Retire(replacing)
            }
            _ => OnReady::Ignore,
        }
    }

    fn arm_confirm(&mut self, timer: Timer) {
        if let Phase::Guarded { confirm, .. } = &mut self.phase {
            *confirm = Some(timer);
        }
    }

    fn on_exit(&mut self, id: WorkerId) -> OnExit {
        match self.phase {
            Phase::Guarded { replacement, .. } if replacement == id => OnExit::Abort,
            Phase::Replacing { replacement, .. } if replacement == id => {
                self.phase = Phase::Idle;
                OnExit::Advance
            }
            _ => OnExit::Ignore,
        }
    }

    /// The confirmation timer fired; returns the worker to retire.
    fn on_confirm(&mut self, ticket: u64) -> Option<WorkerId> {
        let Phase::Guarded {
            replacing, confirm, ..
        } = &mut self.phase
        else {
            return None;
        };
        if !timer::claim(confirm, ticket) {
            return None;
        }
        let replacing = *replacing;
        self.phase = Phase::Idle;
        Some(replacing)
    }
}

impl<F: ProcessForker> Supervisor<F> {
    /// Handle a `restart()` request.
    pub(super) fn restart(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.restart.is_some() {
            warn!("Already restarting. Cannot restart yet.");
            let _ = reply.send(Err(SupervisorError::AlreadyRestarting));
            return;
        }
        self.begin_rollout(RolloutCompletion::Caller(reply));
    }

    pub(super) fn begin_rollout(&mut self, completion: RolloutCompletion) {
        if !self.quitting {
            info!("Restarting all workers");
        }

        let snapshot = self.registry.ids();
        let converging = snapshot.len() != self.target;
        self.restart = Some(Rollout::new(snapshot, completion, converging));

        if converging {
            info!(
                live = self.registry.len(),
                target = self.target,
                "Resizing before rollout"
            );
            self.start_resize(None, Some(ResizeWaiter::Rollout));
        } else {
            self.actions.push_back(Action::AdvanceRollout);
        }
    }

    pub(super) fn advance_rollout(&mut self) {
        loop {
            let Some(rollout) = self.restart.as_mut() else {
                return;
            };
            let Some(next) = rollout.next_position() else {
                return;
            };
            let Some(old) = next else {
                self.finish_rollout();
                return;
            };
            debug!(
                worker_id = %old,
                position = rollout.position,
                of = rollout.snapshot.len(),
                "Rollout position"
            );

            if self.quitting {
                if self.registry.is_connected(old) {
                    self.remove_worker(old);
                }
                continue;
            }
            if self.registry.get(old).is_none() {
                debug!(worker_id = %old, "Worker already gone, skipping");
                continue;
            }

            let replacement = self.spawn_worker();
            if let Some(rollout) = self.restart.as_mut() {
                rollout.replacing(replacement, old);
            }
            return;
        }
    }

    pub(super) fn rollout_on_ready(&mut self, id: WorkerId) {
        let Some(rollout) = self.restart.as_mut() else {
            return;
        };
        match rollout.on_ready(id) {
            OnReady::ArmConfirm => {
                debug!(worker_id = %id, "First replacement ready, confirming");
                let timer = self.timers.schedule(
                    self.config.delay_for_restart_checking,
                    TimerKind::RestartConfirm,
                );
                rollout.arm_confirm(timer);
            }
            OnReady::Retire(old) => {
                self.retire(old);
                self.actions.push_back(Action::AdvanceRollout);
            }
            OnReady::Ignore => {}
        }
    }

    pub(super) fn rollout_on_exit(&mut self, id: WorkerId) {
        let Some(rollout) = self.restart.as_mut() else {
            return;
        };
        match rollout.on_exit(id) {
            OnExit::Abort => {
                warn!(worker_id = %id, "New worker died quickly. Aborting restart.");
                if let Some(rollout) = self.restart.take() {
                    if let RolloutCompletion::Caller(reply) = rollout.completion {
                        let _ = reply.send(Err(SupervisorError::RestartAborted { worker_id: id }));
                    }
                }
                self.resume_pending_quit();
            }
            OnExit::Advance => {
                warn!(worker_id = %id, "Replacement died, keeping the worker it replaced");
                self.actions.push_back(Action::AdvanceRollout);
            }
            OnExit::Ignore => {}
        }
    }

    pub(super) fn on_restart_confirmed(&mut self, ticket: u64) {
        let Some(old) = self.restart.as_mut().and_then(|r| r.on_confirm(ticket)) else {
            return;
        };
        info!("First worker ok, continuing restart");
        self.retire(old);
        self.actions.push_back(Action::AdvanceRollout);
    }

    fn retire(&mut self, old: WorkerId) {
        if self.registry.is_connected(old) {
            self.remove_worker(old);
        }
    }

    fn finish_rollout(&mut self) {
        let Some(rollout) = self.restart.take() else {
            return;
        };
        match rollout.completion {
            RolloutCompletion::Caller(reply) => {
                info!("Restart complete");
                let _ = reply.send(Ok(()));
            }
            RolloutCompletion::Quit => {
                info!("Graceful shutdown successful");
                self.quit_grace = Some(self.timers.schedule(QUIT_GRACE, TimerKind::QuitGrace));
            }
        }
        self.resume_pending_quit();
    }

    fn resume_pending_quit(&mut self) {
        if self.quit_pending {
            self.quit_pending = false;
            self.actions.push_back(Action::BeginQuitRollout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<WorkerId> {
        raw.iter().copied().map(WorkerId::new).collect()
    }

    #[test]
    fn test_only_first_replacement_is_guarded() {
        let (tx, _rx) = oneshot::channel();
        let mut rollout = Rollout::new(ids(&[0, 1]), RolloutCompletion::Caller(tx), false);

        assert_eq!(rollout.next_position(), Some(Some(WorkerId::new(0))));
        rollout.replacing(WorkerId::new(2), WorkerId::new(0));
        assert!(matches!(rollout.phase, Phase::Guarded { .. }));
        // Busy until the guarded replacement is confirmed.
        assert_eq!(rollout.next_position(), None);
        rollout.phase = Phase::Idle;

        assert_eq!(rollout.next_position(), Some(Some(WorkerId::new(1))));
        rollout.replacing(WorkerId::new(3), WorkerId::new(1));
        assert!(matches!(rollout.phase, Phase::Replacing { .. }));
        assert_eq!(
            rollout.on_ready(WorkerId::new(3)),
            OnReady::Retire(WorkerId::new(1))
        );
        assert_eq!(rollout.next_position(), Some(None));
    }

    #[test]
    fn test_guarded_exit_aborts_and_others_are_ignored() {
        let mut rollout = Rollout::new(ids(&[0]), RolloutCompletion::Quit, false);
        rollout.next_position();
        rollout.replacing(WorkerId::new(1), WorkerId::new(0));

        assert_eq!(rollout.on_exit(WorkerId::new(0)), OnExit::Ignore);
        assert_eq!(rollout.on_ready(WorkerId::new(0)), OnReady::Ignore);
        assert_eq!(rollout.on_ready(WorkerId::new(1)), OnReady::ArmConfirm);
        assert_eq!(rollout.on_exit(WorkerId::new(1)), OnExit::Abort);
    }

    #[test]
    fn test_unguarded_exit_advances() {
        let mut rollout = Rollout::new(ids(&[0, 1]), RolloutCompletion::Quit, true);
        assert!(matches!(rollout.phase, Phase::Converging));
        rollout.guard_next = false;
        rollout.next_position();
        rollout.replacing(WorkerId::new(5), WorkerId::new(0));

        assert_eq!(rollout.on_exit(WorkerId::new(5)), OnExit::Advance);
        assert!(matches!(rollout.phase, Phase::Idle));
    }
}
