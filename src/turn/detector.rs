//! # Silence Timer
//!
//! Single-slot debounce timer: every fragment reschedules the flush, and only
//! the most recently scheduled flush is ever allowed to run.
//!
//! ## Supersession:
//! Scheduling aborts the previous task, but an abort can lose the race with a
//! task that already woke up. Each schedule therefore carries a `TimerTicket`,
//! and the callback must `claim` its ticket (under the same lock that guards
//! the timer) before acting. A superseded or cancelled ticket never claims.

use std::time::Duration;
use tokio::task::JoinHandle;

/// Identifies one scheduled flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTicket(u64);

#[derive(Debug)]
struct PendingFlush {
    ticket: TimerTicket,
    handle: JoinHandle<()>,
}

/// The scheduled-task handle owned by a session's turn state.
#[derive(Debug, Default)]
pub struct SilenceTimer {
    pending: Option<PendingFlush>,
    next_ticket: u64,
}

impl SilenceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever is pending and schedule `on_fire` after `window`.
    ///
    /// `on_fire` receives the ticket it was scheduled with. Must be called
    /// from inside a tokio runtime.
    pub fn schedule<F>(&mut self, window: Duration, on_fire: F) -> TimerTicket
    where
        F: FnOnce(TimerTicket) + Send + 'static,
    {
        self.cancel();

        self.next_ticket += 1;
        let ticket = TimerTicket(self.next_ticket);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            on_fire(ticket);
        });

        self.pending = Some(PendingFlush { ticket, handle });
        ticket
    }

    /// Abort the pending flush, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Take ownership of the slot for a firing timer.
    ///
    /// Returns true only if `ticket` is the live schedule; the slot is then empty.
    pub fn claim(&mut self, ticket: TimerTicket) -> bool {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
