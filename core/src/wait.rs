//! # Wait Channels
//!
//! Minimal wait channel shared by requests, trackers and the pool. Waiters
//! poll their own predicate and relax between checks; [`WaitQueue::wake_all`]
//! bumps a generation counter so sleepers notice activity promptly. Wakes
//! may be spurious -- every caller re-checks its predicate (and its abort
//! flag) after waking, per the cancellation contract of this core.

use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::time::Clock;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate was satisfied.
    Satisfied,
    /// The deadline passed first.
    TimedOut,
}

/// A wake-counted wait channel.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: AtomicU64,
}

impl WaitQueue {
    /// Create an idle wait channel.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Wake every current waiter.
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Number of wakes issued so far.
    pub fn wakes(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wait until `done()` returns true or `deadline_ns` passes.
    ///
    /// `done` is re-evaluated after every wake and periodically regardless,
    /// so a missed wake delays but never strands a waiter.
    pub fn wait_deadline<F>(&self, mut done: F, clock: &dyn Clock, deadline_ns: u64) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let mut seen = self.generation.load(Ordering::Acquire);
        loop {
            if done() {
                return WaitOutcome::Satisfied;
            }
            if clock.now_ns() >= deadline_ns {
                // Final re-check: a wake racing the deadline still counts.
                if done() {
                    return WaitOutcome::Satisfied;
                }
                return WaitOutcome::TimedOut;
            }
            let cur = self.generation.load(Ordering::Acquire);
            if cur == seen {
                hint::spin_loop();
            } else {
                seen = cur;
            }
        }
    }
}
