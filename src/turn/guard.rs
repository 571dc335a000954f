//! # Turn Processing Guard
//!
//! Single-flight gate: at most one transcribe -> complete -> synthesize run per
//! session. The busy flag is taken with an atomic compare-and-set, so two
//! triggers racing on different worker threads can never both win.
//!
//! The permit resets the flag when dropped. That covers normal completion,
//! early returns, collaborator errors and a panicking pipeline task alike.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TurnGuard {
    busy: Arc<AtomicBool>,
}

impl TurnGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to mark the session busy. `None` means another turn is in flight.
    pub fn try_acquire(&self) -> Option<BusyPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of holding the session's busy flag. Releases it on drop.
#[derive(Debug)]
pub struct BusyPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
