//! Graceful and forceful shutdown.
//!
//! The first `quit()` drives the target to zero and runs the rollout
//! machinery with `quitting` set, which removes every worker and spawns
//! none. Any `quit()` after that kills every worker outright.

use tracing::{info, warn};

use super::restart::RolloutCompletion;
use super::{Supervisor, SupervisorExit};
use crate::forker::ProcessForker;

impl<F: ProcessForker> Supervisor<F> {
    pub(super) fn quit(&mut self) {
        self.danger_retry = None;

        if self.quitting {
            warn!(live = self.registry.len(), "Forceful shutdown");
            self.kill_all();
            self.exit = Some(SupervisorExit::Forced);
            return;
        }

        info!(live = self.registry.len(), "Graceful shutdown...");
        self.target = 0;
        self.quitting = true;

        if self.restart.is_some() {
            // Remaining positions of the running rollout already degrade to
            // removals; the shutdown rollout follows once it ends.
            self.quit_pending = true;
        } else {
            self.begin_rollout(RolloutCompletion::Quit);
        }
    }

    pub(super) fn quit_hard(&mut self) {
        self.quitting = true;
        self.quit();
    }
}
