//! # Process Trackers
//!
//! Per-participating-process owner of the three request queues. A tracker
//! is shared (`Arc`) between the context's process map and every live
//! request; the `outstanding` counter tracks live requests only -- the
//! original design's existence self-reference is subsumed by the map's
//! `Arc`, so quiescence is simply `outstanding == 0`.
//!
//! Abort is monotonic: once [`signal_abort`](ProcTracker::signal_abort) has
//! run, no new request may be enqueued and every queued request has been
//! marked and woken. Whichever path last observes "aborted and quiescent"
//! wins the `detached` compare-and-set and unlinks the tracker from the
//! context map; the `Arc` count then reclaims the memory.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::pool::PageBuf;
use crate::req::Request;
use crate::time::Clock;
use crate::wait::{WaitOutcome, WaitQueue};
use crate::{DdError, DdResult, Pid, Tgid};

/// Upper bound on control pages a tracker may pin for its user-space
/// counterpart.
pub const MAX_CONTROL_PAGES: usize = 4;

/// Buffers shared with the cooperating user-space crypto process.
///
/// In the kernel these are memory-mapped regions; here they are plain
/// pool pages the offload path copies through.
#[derive(Debug, Default)]
pub struct ExchangeArea {
    /// Bounded control/handshake pages.
    pub control: ArrayVec<PageBuf, MAX_CONTROL_PAGES>,
    /// Crypto metadata exchange page.
    pub metadata: Option<PageBuf>,
    /// Plaintext staging page.
    pub plaintext: Option<PageBuf>,
    /// Ciphertext staging page.
    pub ciphertext: Option<PageBuf>,
}

/// Which of the three sequences a request currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Awaiting a worker.
    Pending,
    /// Owned by a worker performing crypto.
    Processing,
    /// Handed to the block layer, awaiting completion.
    Submitted,
}

#[derive(Default)]
pub(crate) struct Queues {
    pending: VecDeque<Arc<Request>>,
    processing: VecDeque<Arc<Request>>,
    submitted: VecDeque<Arc<Request>>,
}

impl Queues {
    fn of(&mut self, kind: QueueKind) -> &mut VecDeque<Arc<Request>> {
        match kind {
            QueueKind::Pending => &mut self.pending,
            QueueKind::Processing => &mut self.processing,
            QueueKind::Submitted => &mut self.submitted,
        }
    }
}

/// Per-process owner of queued requests and offload exchange buffers.
pub struct ProcTracker {
    /// Owning process id.
    pub pid: Pid,
    /// Owning thread-group id.
    pub tgid: Tgid,

    queues: Mutex<Queues>,
    outstanding: AtomicUsize,
    abort: AtomicBool,
    detached: AtomicBool,
    pub(crate) waitq: WaitQueue,
    exchange: Mutex<Option<ExchangeArea>>,
}

impl ProcTracker {
    /// Fresh tracker for `pid`/`tgid`.
    pub fn new(pid: Pid, tgid: Tgid) -> Self {
        Self {
            pid,
            tgid,
            queues: Mutex::new(Queues::default()),
            outstanding: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            waitq: WaitQueue::new(),
            exchange: Mutex::new(None),
        }
    }

    /// Live requests currently owned by this tracker.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Whether abort has been signalled. Monotonic.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Queue a freshly created request on the pending sequence.
    ///
    /// The abort flag is re-checked under the queue lock, so a request can
    /// never slip in behind a concurrent [`signal_abort`](Self::signal_abort)
    /// -- quiescence stays reachable.
    pub(crate) fn enqueue_pending(&self, req: Arc<Request>) -> DdResult<()> {
        let mut queues = self.queues.lock();
        if self.is_aborted() {
            return Err(DdError::Aborted);
        }
        queues.pending.push_back(req);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// FIFO-move the oldest pending request to the processing sequence.
    pub(crate) fn take_next_pending(&self) -> Option<Arc<Request>> {
        let mut queues = self.queues.lock();
        let req = queues.pending.pop_front()?;
        queues.processing.push_back(Arc::clone(&req));
        Some(req)
    }

    /// Move `req` from the processing to the submitted sequence.
    pub(crate) fn move_to_submitted(&self, req: &Arc<Request>) {
        let mut queues = self.queues.lock();
        let pos = queues
            .processing
            .iter()
            .position(|r| Arc::ptr_eq(r, req));
        if let Some(moved) = pos.and_then(|p| queues.processing.remove(p)) {
            queues.submitted.push_back(moved);
        }
    }

    /// Unlink `req` from whatever sequence holds it and drop the live
    /// count, as one atomic step under the queue lock.
    ///
    /// Only the retirement path calls this (guarded by the request's
    /// release claim), so the decrement happens exactly once per request.
    pub(crate) fn unlink_and_drop(&self, req: &Arc<Request>) {
        let mut queues = self.queues.lock();
        for kind in [QueueKind::Pending, QueueKind::Processing, QueueKind::Submitted] {
            let q = queues.of(kind);
            if let Some(pos) = q.iter().position(|r| Arc::ptr_eq(r, req)) {
                q.remove(pos);
                break;
            }
        }
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "outstanding underflow");
        drop(queues);
        self.waitq.wake_all();
    }

    /// Set the abort flag, mark and wake every queued request, and return a
    /// snapshot of the pending ones for the caller to retire (they have no
    /// worker that would do it).
    pub(crate) fn signal_abort(&self) -> Vec<Arc<Request>> {
        self.abort.store(true, Ordering::Release);
        let queues = self.queues.lock();
        let mut orphaned = Vec::with_capacity(queues.pending.len());
        for req in queues
            .pending
            .iter()
            .chain(queues.processing.iter())
            .chain(queues.submitted.iter())
        {
            req.mark_abort();
        }
        for req in queues.pending.iter() {
            orphaned.push(Arc::clone(req));
        }
        drop(queues);
        self.waitq.wake_all();
        orphaned
    }

    /// Block until no live request remains, or `deadline_ns` passes.
    pub fn wait_quiescent(&self, clock: &dyn Clock, deadline_ns: u64) -> DdResult<()> {
        let out = self
            .waitq
            .wait_deadline(|| self.outstanding() == 0, clock, deadline_ns);
        match out {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::TimedOut => Err(DdError::Timeout),
        }
    }

    /// One-shot claim of map removal: true for exactly one caller once the
    /// tracker is aborted and quiescent.
    pub(crate) fn try_detach(&self) -> bool {
        if !self.is_aborted() || self.outstanding() != 0 {
            return false;
        }
        self.detached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Install the offload exchange buffers for this process.
    pub fn attach_exchange(&self, area: ExchangeArea) -> DdResult<()> {
        let mut exchange = self.exchange.lock();
        if exchange.is_some() {
            return Err(DdError::InvalidState);
        }
        *exchange = Some(area);
        Ok(())
    }

    /// Run `f` over the attached exchange area.
    pub fn with_exchange<R>(&self, f: impl FnOnce(&mut ExchangeArea) -> R) -> DdResult<R> {
        let mut exchange = self.exchange.lock();
        match exchange.as_mut() {
            Some(area) => Ok(f(area)),
            None => Err(DdError::InvalidState),
        }
    }

    /// Take the exchange buffers back (teardown path).
    pub(crate) fn detach_exchange(&self) -> Option<ExchangeArea> {
        self.exchange.lock().take()
    }

    /// Length of one sequence; diagnostics and tests.
    pub fn queue_len(&self, kind: QueueKind) -> usize {
        let mut queues = self.queues.lock();
        queues.of(kind).len()
    }

    /// How many sequences currently contain `req`. The membership invariant
    /// says this is 0 or 1 at every observation point.
    pub fn membership(&self, req: &Arc<Request>) -> usize {
        let mut queues = self.queues.lock();
        let mut n = 0;
        for kind in [QueueKind::Pending, QueueKind::Processing, QueueKind::Submitted] {
            if queues.of(kind).iter().any(|r| Arc::ptr_eq(r, req)) {
                n += 1;
            }
        }
        n
    }

    /// Find a processing request by id (offload completer upcall).
    pub(crate) fn find_processing(&self, req_id: u64) -> Option<Arc<Request>> {
        let queues = self.queues.lock();
        queues
            .processing
            .iter()
            .find(|r| r.id == req_id)
            .map(Arc::clone)
    }
}

impl core::fmt::Debug for ProcTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcTracker")
            .field("pid", &self.pid)
            .field("tgid", &self.tgid)
            .field("outstanding", &self.outstanding())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Direction;
    use crate::pool::PageBuf;
    use crate::req::Payload;
    use crate::test_util::HostClock;
    use std::thread;

    fn tracker() -> Arc<ProcTracker> {
        Arc::new(ProcTracker::new(7, 7))
    }

    fn req_on(tracker: &Arc<ProcTracker>, id: u64) -> Arc<Request> {
        Arc::new(Request::new(
            id,
            Direction::Encrypt,
            false,
            tracker.pid,
            tracker.tgid,
            1,
            0,
            Arc::clone(tracker),
            Payload::Page {
                src: PageBuf::zeroed(),
                dst: PageBuf::zeroed(),
            },
            false,
        ))
    }

    #[test]
    fn fifo_within_pending() {
        let t = tracker();
        let r1 = req_on(&t, 1);
        let r2 = req_on(&t, 2);
        t.enqueue_pending(Arc::clone(&r1)).unwrap();
        t.enqueue_pending(Arc::clone(&r2)).unwrap();
        assert_eq!(t.take_next_pending().unwrap().id, 1);
        assert_eq!(t.take_next_pending().unwrap().id, 2);
        assert!(t.take_next_pending().is_none());
    }

    #[test]
    fn membership_is_exactly_one_queue() {
        let t = tracker();
        let r = req_on(&t, 1);
        assert_eq!(t.membership(&r), 0);
        t.enqueue_pending(Arc::clone(&r)).unwrap();
        assert_eq!(t.membership(&r), 1);
        let taken = t.take_next_pending().unwrap();
        assert_eq!(t.membership(&taken), 1);
        t.move_to_submitted(&taken);
        assert_eq!(t.membership(&taken), 1);
        assert_eq!(t.queue_len(QueueKind::Submitted), 1);
        t.unlink_and_drop(&taken);
        assert_eq!(t.membership(&taken), 0);
        assert_eq!(t.outstanding(), 0);
    }

    #[test]
    fn enqueue_after_abort_fails() {
        let t = tracker();
        t.signal_abort();
        let r = req_on(&t, 1);
        assert_eq!(t.enqueue_pending(r), Err(DdError::Aborted));
        assert_eq!(t.outstanding(), 0);
    }

    #[test]
    fn abort_marks_and_snapshots_pending() {
        let t = tracker();
        let r1 = req_on(&t, 1);
        let r2 = req_on(&t, 2);
        t.enqueue_pending(Arc::clone(&r1)).unwrap();
        t.enqueue_pending(Arc::clone(&r2)).unwrap();
        let orphaned = t.signal_abort();
        assert_eq!(orphaned.len(), 2);
        assert!(r1.is_aborted());
        assert!(r2.is_aborted());
        // Snapshot does not unlink; counts are untouched until retirement.
        assert_eq!(t.outstanding(), 2);
    }

    #[test]
    fn detach_claim_requires_aborted_and_quiescent() {
        let t = tracker();
        let r = req_on(&t, 1);
        t.enqueue_pending(Arc::clone(&r)).unwrap();
        t.signal_abort();
        assert!(!t.try_detach()); // still one outstanding
        t.unlink_and_drop(&r);
        assert!(t.try_detach());
        assert!(!t.try_detach()); // single-shot
    }

    #[test]
    fn quiescence_wait_wakes_on_last_unlink() {
        let t = tracker();
        let r = req_on(&t, 1);
        t.enqueue_pending(Arc::clone(&r)).unwrap();

        let t2 = Arc::clone(&t);
        let worker = thread::spawn(move || {
            t2.unlink_and_drop(&r);
        });

        let clock = HostClock::new();
        let deadline = clock.now_ns() + 1_000_000_000;
        assert!(t.wait_quiescent(&clock, deadline).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn exchange_attach_is_single() {
        let t = tracker();
        t.attach_exchange(ExchangeArea::default()).unwrap();
        assert_eq!(
            t.attach_exchange(ExchangeArea::default()),
            Err(DdError::InvalidState)
        );
        assert!(t.with_exchange(|_| ()).is_ok());
        assert!(t.detach_exchange().is_some());
        assert!(t.with_exchange(|_| ()).is_err());
    }
}
