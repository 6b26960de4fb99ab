//! # Requests
//!
//! One in-flight encrypt/decrypt operation. A request is created against a
//! process tracker, sits in exactly one of the tracker's three queues while
//! live, and advances through the state machine:
//!
//! ```text
//! INIT -> PENDING -> PROCESSING -> SUBMITTED -> FINISHING -> UNALLOCATED
//! ```
//!
//! The state only moves forward; abort (or an offload timeout) jumps
//! straight to teardown. Retirement is guarded by a compare-and-set so the
//! abort path and the completion path racing to retire the same request can
//! never release it twice.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::bench::StageStamps;
use crate::crypto::Direction;
use crate::pool::{IoDesc, PageBuf, ResourcePool};
use crate::proc::ProcTracker;
use crate::wait::WaitQueue;
use crate::{DdError, DdResult, Ino, Pid, Tgid};

/// Request lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReqState {
    /// Just allocated; payload fixed but untouched.
    Init        = 0,
    /// Queued on the tracker's pending sequence.
    Pending     = 1,
    /// Crypto in progress (in-kernel or offloaded).
    Processing  = 2,
    /// Crypto done; descriptor handed to the block layer.
    Submitted   = 3,
    /// Completion fired; deferred delivery/teardown running.
    Finishing   = 4,
    /// Terminal: resources released, eligible for reuse.
    Unallocated = 5,
}

/// Number of states, sizing the per-state stamp and mean arrays.
pub const STATE_COUNT: usize = 6;
const_assert_eq!(ReqState::Unallocated as usize + 1, STATE_COUNT);

impl ReqState {
    /// Every state a latency sample exists for (all but INIT).
    pub const NON_INITIAL: [ReqState; 5] = [
        ReqState::Pending,
        ReqState::Processing,
        ReqState::Submitted,
        ReqState::Finishing,
        ReqState::Unallocated,
    ];

    fn from_u8(raw: u8) -> ReqState {
        match raw {
            0 => ReqState::Init,
            1 => ReqState::Pending,
            2 => ReqState::Processing,
            3 => ReqState::Submitted,
            4 => ReqState::Finishing,
            _ => ReqState::Unallocated,
        }
    }
}

/// Terminal result of a request, surfaced to whoever waits on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Outcome {
    /// Crypto and I/O completed.
    Success  = 1,
    /// Torn down by process exit or explicit abort.
    Aborted  = 2,
    /// The user-space crypto actor did not respond in time.
    TimedOut = 3,
    /// Crypto primitive or I/O failure.
    Failed   = 4,
}

impl Outcome {
    fn from_u8(raw: u8) -> Option<Outcome> {
        match raw {
            1 => Some(Outcome::Success),
            2 => Some(Outcome::Aborted),
            3 => Some(Outcome::TimedOut),
            4 => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// Offload handshake state with the user-space crypto actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OffloadStatus {
    /// No segment staged.
    Idle    = 0,
    /// Segment staged in the exchange area, awaiting the completer.
    Pending = 1,
    /// Completer reported success.
    Done    = 2,
    /// Completer reported failure.
    Failed  = 3,
}

impl OffloadStatus {
    fn from_u8(raw: u8) -> OffloadStatus {
        match raw {
            1 => OffloadStatus::Pending,
            2 => OffloadStatus::Done,
            3 => OffloadStatus::Failed,
            _ => OffloadStatus::Idle,
        }
    }
}

/// Typed payload, fixed at creation and matching the operation code.
pub enum Payload {
    /// Metadata-preparation page.
    Prepare {
        /// Page the prepared crypto metadata is written into.
        metadata: PageBuf,
    },
    /// Single-page transform.
    Page {
        /// Source page (caller-provided).
        src: PageBuf,
        /// Destination page (pool-drawn).
        dst: PageBuf,
    },
    /// Whole-descriptor transform.
    Bio {
        /// Original descriptor from the intercepted I/O.
        orig: IoDesc,
        /// Pool-drawn clone the transform writes into.
        clone: IoDesc,
    },
}

impl Payload {
    /// Short operation name for log lines.
    pub fn op_name(&self) -> &'static str {
        match self {
            Payload::Prepare { .. } => "prepare",
            Payload::Page { .. } => "page",
            Payload::Bio { .. } => "bio",
        }
    }

    /// Return the pool-drawn objects in this payload. Caller-provided
    /// buffers (`src`, `orig`) were never drawn from the pool and are
    /// dropped instead, scrubbed on drop, so the pool only ever re-absorbs
    /// its own objects.
    pub(crate) fn release_to(self, pool: &ResourcePool) {
        match self {
            Payload::Prepare { metadata } => pool.release_page(metadata),
            Payload::Page { src: _, dst } => pool.release_page(dst),
            Payload::Bio { orig: _, clone } => pool.release_desc(clone),
        }
    }
}

/// One tracked encrypt/decrypt operation.
pub struct Request {
    /// Unique id from the context counter.
    pub id: u64,
    /// Transform direction.
    pub dir: Direction,
    /// Whether crypto is offloaded to the cooperating user-space process.
    pub offload: bool,
    /// Owning process.
    pub pid: Pid,
    /// Owning thread group.
    pub tgid: Tgid,
    /// Inode of the protected file.
    pub ino: Ino,
    /// User the master key is looked up for.
    pub user_id: u32,

    pub(crate) proc: Arc<ProcTracker>,
    pub(crate) payload: Mutex<Option<Payload>>,
    pub(crate) waitq: WaitQueue,
    pub(crate) stamps: StageStamps,
    /// Whether per-state stamping is active for this request (captured from
    /// the context's debug flags at creation).
    pub(crate) bench: bool,
    /// Metadata write-back marker, consumed at FINISHING.
    pub(crate) need_xattr_flush: AtomicBool,

    state: AtomicU8,
    abort: AtomicBool,
    released: AtomicBool,
    outcome: AtomicU8,
    offload_status: AtomicU8,
}

impl Request {
    pub(crate) fn new(
        id: u64,
        dir: Direction,
        offload: bool,
        pid: Pid,
        tgid: Tgid,
        ino: Ino,
        user_id: u32,
        proc: Arc<ProcTracker>,
        payload: Payload,
        bench: bool,
    ) -> Self {
        Self {
            id,
            dir,
            offload,
            pid,
            tgid,
            ino,
            user_id,
            proc,
            payload: Mutex::new(Some(payload)),
            waitq: WaitQueue::new(),
            stamps: StageStamps::new(),
            bench,
            need_xattr_flush: AtomicBool::new(false),
            state: AtomicU8::new(ReqState::Init as u8),
            abort: AtomicBool::new(false),
            released: AtomicBool::new(false),
            outcome: AtomicU8::new(0),
            offload_status: AtomicU8::new(OffloadStatus::Idle as u8),
        }
    }

    /// Current state.
    pub fn state(&self) -> ReqState {
        ReqState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance to `to`, stamping the transition if benchmarking is on.
    ///
    /// The state machine never regresses: an attempt to move backwards is
    /// rejected with [`DdError::InvalidState`]. Jumping forward over skipped
    /// states is the abort shortcut and is allowed.
    pub(crate) fn transition(&self, to: ReqState, now_ns: u64) -> DdResult<()> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if to as u8 <= cur {
                return Err(DdError::InvalidState);
            }
            match self.state.compare_exchange_weak(
                cur,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if self.bench {
            self.stamps.stamp(to, now_ns);
        }
        Ok(())
    }

    /// Stamp the INIT state (called once, right after creation).
    pub(crate) fn stamp_init(&self, now_ns: u64) {
        if self.bench {
            self.stamps.stamp(ReqState::Init, now_ns);
        }
    }

    /// Monotonic abort mark; wakes any waiter so it observes the flag.
    pub fn mark_abort(&self) {
        self.abort.store(true, Ordering::Release);
        self.waitq.wake_all();
    }

    /// Whether this request has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// One-shot claim of the release path. The single caller that wins this
    /// performs the actual teardown; everyone else backs off.
    pub(crate) fn claim_release(&self) -> bool {
        self.released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// First writer wins; later outcomes are ignored.
    pub(crate) fn set_outcome(&self, outcome: Outcome) {
        let _ = self.outcome.compare_exchange(
            0,
            outcome as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Terminal outcome, once retired.
    pub fn outcome(&self) -> Option<Outcome> {
        Outcome::from_u8(self.outcome.load(Ordering::Acquire))
    }

    pub(crate) fn set_offload_status(&self, status: OffloadStatus) {
        self.offload_status.store(status as u8, Ordering::Release);
        self.waitq.wake_all();
    }

    /// Offload handshake state, polled by the user-space completer side.
    pub fn offload_status(&self) -> OffloadStatus {
        OffloadStatus::from_u8(self.offload_status.load(Ordering::Acquire))
    }

    /// The owning tracker.
    pub fn tracker(&self) -> &Arc<ProcTracker> {
        &self.proc
    }

    /// Mark that FINISHING must flush extended attributes.
    pub fn set_need_xattr_flush(&self) {
        self.need_xattr_flush.store(true, Ordering::Release);
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("dir", &self.dir)
            .field("state", &self.state())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
