//! # Time Sources
//!
//! The core is freestanding and never reads a hardware clock directly; the
//! embedder injects a monotonic [`Clock`] at context creation. A kernel
//! port wires this to its timer hardware, tests use a host clock.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Monotonic nanosecond time source.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin. Must never go backwards.
    fn now_ns(&self) -> u64;
}

/// Manually advanced clock.
///
/// Useful for embedders without a calibrated timer during early bring-up,
/// and for deterministic tests.
#[derive(Debug, Default)]
pub struct TickClock {
    ns: AtomicU64,
}

impl TickClock {
    /// Create a clock starting at zero.
    pub const fn new() -> Self {
        Self {
            ns: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `delta` nanoseconds.
    pub fn advance(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::Release);
    }
}

impl Clock for TickClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Acquire)
    }
}

/// Token-window rate limiter for diagnostic output.
///
/// Allows up to `burst` events per `interval_ns` window and counts how many
/// were suppressed in between.
#[derive(Debug)]
pub struct RateLimit {
    interval_ns: u64,
    burst: u32,
    state: Mutex<RateLimitState>,
}

#[derive(Debug, Default)]
struct RateLimitState {
    window_start_ns: u64,
    emitted: u32,
    suppressed: u64,
}

impl RateLimit {
    /// Create a limiter allowing `burst` events per `interval_ns`.
    pub const fn new(interval_ns: u64, burst: u32) -> Self {
        Self {
            interval_ns,
            burst,
            state: Mutex::new(RateLimitState {
                window_start_ns: 0,
                emitted: 0,
                suppressed: 0,
            }),
        }
    }

    /// Whether an event at time `now_ns` may be emitted.
    pub fn allow(&self, now_ns: u64) -> bool {
        let mut st = self.state.lock();
        if now_ns.saturating_sub(st.window_start_ns) >= self.interval_ns {
            if st.suppressed > 0 {
                log::debug!("ratelimit: {} events suppressed", st.suppressed);
            }
            st.window_start_ns = now_ns;
            st.emitted = 0;
            st.suppressed = 0;
        }
        if st.emitted < self.burst {
            st.emitted += 1;
            true
        } else {
            st.suppressed += 1;
            false
        }
    }

    /// Events suppressed in the current window.
    pub fn suppressed(&self) -> u64 {
        self.state.lock().suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_clock_advances() {
        let clock = TickClock::new();
        assert_eq!(clock.now_ns(), 0);
        clock.advance(500);
        clock.advance(250);
        assert_eq!(clock.now_ns(), 750);
    }

    #[test]
    fn ratelimit_burst_then_suppress() {
        let rl = RateLimit::new(1_000, 2);
        assert!(rl.allow(0));
        assert!(rl.allow(1));
        assert!(!rl.allow(2));
        assert!(!rl.allow(3));
        assert_eq!(rl.suppressed(), 2);
        // New window resets the budget.
        assert!(rl.allow(1_000));
        assert_eq!(rl.suppressed(), 0);
    }
}
