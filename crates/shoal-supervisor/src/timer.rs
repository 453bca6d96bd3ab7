//! Cancellable timers feeding the control task.
//!
//! A timer is a sleeping task that posts an [`Event::Timer`] when it
//! expires. Dropping the [`Timer`] aborts the task. Because an expiry can
//! already be queued when the timer is cancelled, every expiry carries a
//! ticket and is only acted on if the slot still holds that ticket.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::supervisor::Event;
use crate::worker::WorkerId;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Shutdown notice sent; close the channel if the worker is still connected.
    Linger(WorkerId),
    /// Graceful removal grace expired; kill if still connected.
    KillCheck(WorkerId),
    /// Worker disconnected but has not exited; kill it.
    DisconnectBackstop(WorkerId),
    /// Backoff after a fast crash.
    DangerRetry,
    /// Backoff after a reconciliation ended with the wrong count.
    MismatchRetry,
    /// First restart replacement stayed up long enough.
    RestartConfirm,
    /// Grace period between graceful shutdown and master exit.
    QuitGrace,
}

/// A scheduled timer. Dropping it cancels it.
#[derive(Debug)]
pub(crate) struct Timer {
    ticket: u64,
    abort: AbortHandle,
}

impl Timer {
    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Take the timer out of `slot` if it is the one that fired.
pub(crate) fn claim(slot: &mut Option<Timer>, ticket: u64) -> bool {
    if slot.as_ref().is_some_and(|t| t.ticket() == ticket) {
        // Already expired; dropping only aborts a finished task.
        slot.take();
        true
    } else {
        false
    }
}

/// Schedules timers onto the control task's event channel.
#[derive(Debug)]
pub(crate) struct TimerQueue {
    events: mpsc::UnboundedSender<Event>,
    next_ticket: u64,
}

impl TimerQueue {
    pub(crate) fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            next_ticket: 0,
        }
    }

    pub(crate) fn schedule(&mut self, delay: Duration, kind: TimerKind) -> Timer {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Timer { ticket, kind });
        });

        Timer {
            ticket,
            abort: task.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_with_ticket() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TimerQueue::new(tx);

        let mut slot = Some(queue.schedule(Duration::from_millis(100), TimerKind::QuitGrace));
        match rx.recv().await {
            Some(Event::Timer { ticket, kind }) => {
                assert_eq!(kind, TimerKind::QuitGrace);
                assert!(claim(&mut slot, ticket));
                assert!(slot.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TimerQueue::new(tx);

        let timer = queue.schedule(Duration::from_millis(100), TimerKind::DangerRetry);
        drop(timer);
        let _keep = queue.schedule(Duration::from_millis(500), TimerKind::MismatchRetry);

        match rx.recv().await {
            Some(Event::Timer { kind, .. }) => assert_eq!(kind, TimerKind::MismatchRetry),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_is_not_claimed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = TimerQueue::new(tx);

        let first = queue.schedule(Duration::from_millis(10), TimerKind::RestartConfirm);
        let stale = first.ticket();
        let mut slot = Some(queue.schedule(Duration::from_millis(10), TimerKind::RestartConfirm));
        drop(first);

        assert!(!claim(&mut slot, stale));
        assert!(slot.is_some());
    }
}
