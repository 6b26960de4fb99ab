//! # Benchmark Aggregator
//!
//! Lock-guarded running averages of per-state request latencies, with a
//! rate-limited report. Strictly diagnostic: nothing here may affect the
//! correctness or ordering of the state machine, and the whole path is
//! inert unless [`DebugFlags::BENCHMARK`](crate::DebugFlags) is set.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::req::{ReqState, STATE_COUNT};
use crate::time::RateLimit;

/// Per-request stamp array: the time each state was entered.
///
/// Written by whichever context performs the transition. A per-state
/// validity bit marks which states were actually entered, so a genuine
/// stamp at time zero is still a sample and states a request skipped
/// (abort shortcut) do not contribute.
#[derive(Debug, Default)]
pub struct StageStamps {
    ns: [AtomicU64; STATE_COUNT],
    set: AtomicU8,
}

impl StageStamps {
    /// Fresh stamps, all states unentered.
    pub const fn new() -> Self {
        // AtomicU64 lacks a const array constructor; spell it out.
        Self {
            ns: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            set: AtomicU8::new(0),
        }
    }

    /// Record entry into `state` at `now_ns`.
    pub fn stamp(&self, state: ReqState, now_ns: u64) {
        self.ns[state as usize].store(now_ns, Ordering::Relaxed);
        self.set.fetch_or(1 << state as u8, Ordering::Relaxed);
    }

    /// Stamp for `state`, `None` if never entered.
    pub fn get(&self, state: ReqState) -> Option<u64> {
        if self.set.load(Ordering::Relaxed) & (1 << state as u8) == 0 {
            return None;
        }
        Some(self.ns[state as usize].load(Ordering::Relaxed))
    }
}

struct BenchInner {
    count: u64,
    mean_ns: [i64; STATE_COUNT],
}

/// Aggregated per-state latency means for one subsystem instance.
pub struct Benchmark {
    inner: Mutex<BenchInner>,
    ratelimit: RateLimit,
}

/// Point-in-time copy of the aggregate, for tests and dump formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchSnapshot {
    /// Requests folded in so far.
    pub count: u64,
    /// Running mean latency from INIT to each state, in nanoseconds.
    pub mean_ns: [i64; STATE_COUNT],
}

impl Benchmark {
    /// Create an empty aggregate reporting at most once per
    /// `report_interval_ns`.
    pub const fn new(report_interval_ns: u64) -> Self {
        Self {
            inner: Mutex::new(BenchInner {
                count: 0,
                mean_ns: [0; STATE_COUNT],
            }),
            ratelimit: RateLimit::new(report_interval_ns, 1),
        }
    }

    /// Fold one retired request's stamps into the running means.
    ///
    /// For every non-initial state the sample is the elapsed time since the
    /// INIT stamp: `mean' = mean + (sample - mean) / (count + 1)`.
    pub fn fold(&self, stamps: &StageStamps) {
        let init = stamps.get(ReqState::Init).unwrap_or(0);
        let mut inner = self.inner.lock();
        let div = (inner.count + 1) as i64;
        for state in ReqState::NON_INITIAL {
            let at = match stamps.get(state) {
                Some(at) => at,
                // State skipped via abort shortcut.
                None => continue,
            };
            let sample = at.saturating_sub(init) as i64;
            let mean = inner.mean_ns[state as usize];
            inner.mean_ns[state as usize] = mean + (sample - mean) / div;
        }
        inner.count += 1;
    }

    /// Copy out the current aggregate.
    pub fn snapshot(&self) -> BenchSnapshot {
        let inner = self.inner.lock();
        BenchSnapshot {
            count: inner.count,
            mean_ns: inner.mean_ns,
        }
    }

    /// Emit the aggregate under rate-limiting. Returns whether a line was
    /// logged.
    pub fn maybe_report(&self, now_ns: u64) -> bool {
        if !self.ratelimit.allow(now_ns) {
            return false;
        }
        let snap = self.snapshot();
        log::info!(
            "benchmark req{{pending:{} processing:{} submitted:{} finishing:{} freed:{}}} cnt:{}",
            snap.mean_ns[ReqState::Pending as usize],
            snap.mean_ns[ReqState::Processing as usize],
            snap.mean_ns[ReqState::Submitted as usize],
            snap.mean_ns[ReqState::Finishing as usize],
            snap.mean_ns[ReqState::Unallocated as usize],
            snap.count,
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamps_with_latency(lat: u64) -> StageStamps {
        let stamps = StageStamps::new();
        stamps.stamp(ReqState::Init, 1_000);
        for state in ReqState::NON_INITIAL {
            stamps.stamp(state, 1_000 + lat);
        }
        stamps
    }

    #[test]
    fn mean_of_identical_samples_is_the_sample() {
        let bench = Benchmark::new(0);
        for _ in 0..10 {
            bench.fold(&stamps_with_latency(5_000));
        }
        let snap = bench.snapshot();
        assert_eq!(snap.count, 10);
        for state in ReqState::NON_INITIAL {
            assert_eq!(snap.mean_ns[state as usize], 5_000);
        }
    }

    #[test]
    fn mean_converges_between_two_values() {
        let bench = Benchmark::new(0);
        bench.fold(&stamps_with_latency(1_000));
        bench.fold(&stamps_with_latency(3_000));
        let snap = bench.snapshot();
        // Integer running mean: 1000 + (3000-1000)/2 = 2000.
        assert_eq!(snap.mean_ns[ReqState::Pending as usize], 2_000);
    }

    #[test]
    fn skipped_states_do_not_contribute() {
        let bench = Benchmark::new(0);
        let stamps = StageStamps::new();
        stamps.stamp(ReqState::Init, 100);
        stamps.stamp(ReqState::Pending, 600);
        stamps.stamp(ReqState::Unallocated, 1_100);
        bench.fold(&stamps);
        let snap = bench.snapshot();
        assert_eq!(snap.mean_ns[ReqState::Pending as usize], 500);
        assert_eq!(snap.mean_ns[ReqState::Processing as usize], 0);
        assert_eq!(snap.mean_ns[ReqState::Unallocated as usize], 1_000);
    }

    #[test]
    fn samples_stamped_at_time_zero_are_folded() {
        let bench = Benchmark::new(0);
        let first = StageStamps::new();
        first.stamp(ReqState::Init, 1_000);
        first.stamp(ReqState::Pending, 2_000);
        bench.fold(&first);
        // A request stamped at the clock origin is a real sample, not a
        // skipped state.
        let at_origin = StageStamps::new();
        at_origin.stamp(ReqState::Init, 0);
        at_origin.stamp(ReqState::Pending, 0);
        bench.fold(&at_origin);
        let snap = bench.snapshot();
        assert_eq!(snap.count, 2);
        // 1000 + (0 - 1000)/2 = 500; skipping the sample would leave 1000.
        assert_eq!(snap.mean_ns[ReqState::Pending as usize], 500);
    }

    #[test]
    fn report_is_rate_limited() {
        let bench = Benchmark::new(1_000_000);
        assert!(bench.maybe_report(0));
        assert!(!bench.maybe_report(10));
        assert!(bench.maybe_report(1_000_010));
    }
}
