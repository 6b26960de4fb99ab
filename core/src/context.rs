//! # Subsystem Context
//!
//! [`DdContext`] is one explicit instance of the request core: process map,
//! request id counter, resource pool, benchmark aggregator and deferred-work
//! queue. Nothing here is global; an embedder creates as many contexts as it
//! has independent encryption domains and threads every operation through
//! the instance.
//!
//! The context also owns the two injected collaborators: the monotonic
//! [`Clock`] and the [`KeyProvider`]. Cipher implementations are passed per
//! service call so a worker may select one per storage policy.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::bench::Benchmark;
use crate::crypto::{Direction, KeyProvider, PageCipher};
use crate::pool::{IoDesc, PageBuf, ResourcePool};
use crate::proc::{ExchangeArea, ProcTracker};
use crate::req::{OffloadStatus, Outcome, Payload, ReqState, Request};
use crate::time::Clock;
use crate::wait::WaitOutcome;
use crate::work::WorkQueue;
use crate::{DdError, DdResult, DebugFlags, Ino, Pid, Tgid};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables fixed at context creation.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Pages pre-allocated into the pool.
    pub pool_pages: usize,
    /// Descriptor shells pre-allocated into the pool.
    pub pool_descs: usize,
    /// Page high-watermark the blocking allocator may grow to.
    pub pool_page_high: usize,
    /// Descriptor high-watermark.
    pub pool_desc_high: usize,
    /// How long a worker waits for the user-space crypto actor before the
    /// request times out.
    pub offload_timeout_ns: u64,
    /// Minimum interval between benchmark report lines.
    pub bench_report_interval_ns: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            pool_pages: 64,
            pool_descs: 16,
            pool_page_high: 128,
            pool_desc_high: 32,
            offload_timeout_ns: 2_000_000_000,
            bench_report_interval_ns: 1_000_000_000,
        }
    }
}

// ============================================================================
// Request specification
// ============================================================================

/// Operation-specific input for a new request.
pub enum ReqKind {
    /// Prepare crypto metadata for a newly protected file.
    Prepare,
    /// Transform a single caller-provided page.
    Page {
        /// Source page; the transform writes a pool-drawn destination.
        src: PageBuf,
    },
    /// Transform a whole I/O descriptor.
    Bio {
        /// Intercepted descriptor; a clone with matching segment count is
        /// drawn from the pool.
        orig: IoDesc,
    },
}

/// Everything needed to create one request.
pub struct ReqSpec {
    /// Owning process.
    pub pid: Pid,
    /// Owning thread group.
    pub tgid: Tgid,
    /// Inode of the protected file.
    pub ino: Ino,
    /// User the master key is looked up for.
    pub user_id: u32,
    /// Transform direction.
    pub dir: Direction,
    /// Route crypto through the user-space actor instead of the in-kernel
    /// cipher.
    pub offload: bool,
    /// Operation payload.
    pub kind: ReqKind,
    /// Whether FINISHING must flush crypto metadata to extended attributes.
    pub need_xattr_flush: bool,
}

// ============================================================================
// Context
// ============================================================================

/// One instance of the request lifecycle core.
pub struct DdContext {
    /// Instance name, prefixed to log lines.
    pub name: &'static str,

    config: ContextConfig,
    procs: Mutex<HashMap<Pid, Arc<ProcTracker>>>,
    req_ctr: Mutex<u64>,
    pool: ResourcePool,
    bench: Benchmark,
    clock: Arc<dyn Clock>,
    keys: Arc<dyn KeyProvider>,
    flags: AtomicU32,
    deferred: WorkQueue,
    shutting_down: AtomicBool,
}

impl DdContext {
    /// Create a context with its own pool and process map.
    pub fn new(
        name: &'static str,
        config: ContextConfig,
        clock: Arc<dyn Clock>,
        keys: Arc<dyn KeyProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            procs: Mutex::new(HashMap::new()),
            req_ctr: Mutex::new(0),
            pool: ResourcePool::new(
                config.pool_pages,
                config.pool_descs,
                config.pool_page_high,
                config.pool_desc_high,
            ),
            bench: Benchmark::new(config.bench_report_interval_ns),
            clock,
            keys,
            flags: AtomicU32::new(DebugFlags::empty().bits()),
            deferred: WorkQueue::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Current debug flags.
    pub fn flags(&self) -> DebugFlags {
        DebugFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Replace the debug flags. Takes effect for requests created afterwards;
    /// in-flight requests keep the benchmark decision made at creation.
    pub fn set_flags(&self, flags: DebugFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    fn debug(&self) -> bool {
        self.flags().contains(DebugFlags::REQ_DEBUG)
    }

    /// The shared resource pool.
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Number of live process trackers.
    pub fn proc_count(&self) -> usize {
        self.procs.lock().len()
    }

    /// Tracker for `pid`, if one exists.
    pub fn tracker_for(&self, pid: Pid) -> Option<Arc<ProcTracker>> {
        self.procs.lock().get(&pid).map(Arc::clone)
    }

    fn tracker_or_create(&self, pid: Pid, tgid: Tgid) -> DdResult<Arc<ProcTracker>> {
        let mut procs = self.procs.lock();
        // Re-checked under the map lock: shutdown sets the flag before it
        // snapshots this map, so no tracker can slip in behind the snapshot
        // and escape the drain.
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DdError::Aborted);
        }
        if let Some(tracker) = procs.get(&pid) {
            if tracker.is_aborted() {
                return Err(DdError::Aborted);
            }
            return Ok(Arc::clone(tracker));
        }
        let tracker = Arc::new(ProcTracker::new(pid, tgid));
        procs.insert(pid, Arc::clone(&tracker));
        if self.debug() {
            log::debug!("{}: tracker created for pid {}", self.name, pid);
        }
        Ok(tracker)
    }

    /// Install offload exchange buffers for `pid`, creating the tracker if
    /// the crypto actor registers before the first request.
    pub fn attach_exchange(&self, pid: Pid, tgid: Tgid, area: ExchangeArea) -> DdResult<()> {
        let tracker = self.tracker_or_create(pid, tgid)?;
        tracker.attach_exchange(area)
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    /// Create a request, draw its pool resources, and queue it pending.
    ///
    /// Fails fast with [`DdError::Aborted`] if the owning process is already
    /// aborted or the context is shutting down, and with the retryable
    /// [`DdError::PoolExhausted`] when the pool cannot cover the payload.
    /// On failure every pool-drawn buffer has been returned and the
    /// caller-provided ones dropped; a retrying caller supplies fresh ones.
    pub fn create_request(self: &Arc<Self>, spec: ReqSpec) -> DdResult<Arc<Request>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DdError::Aborted);
        }
        if self.keys.master_key(spec.user_id).is_none() {
            log::warn!(
                "{}: no master key for user {}, rejecting request",
                self.name,
                spec.user_id
            );
            return Err(DdError::CryptoFailure);
        }
        let tracker = self.tracker_or_create(spec.pid, spec.tgid)?;
        let payload = self.build_payload(spec.kind)?;

        let id = {
            let mut ctr = self.req_ctr.lock();
            *ctr += 1;
            *ctr
        };
        let bench = self.flags().contains(DebugFlags::BENCHMARK);
        let req = Arc::new(Request::new(
            id,
            spec.dir,
            spec.offload,
            spec.pid,
            spec.tgid,
            spec.ino,
            spec.user_id,
            Arc::clone(&tracker),
            payload,
            bench,
        ));
        if spec.need_xattr_flush {
            req.set_need_xattr_flush();
        }
        let now = self.clock.now_ns();
        req.stamp_init(now);

        if let Err(err) = tracker.enqueue_pending(Arc::clone(&req)) {
            // Lost the race against abort; hand the payload straight back.
            if let Some(payload) = req.payload.lock().take() {
                payload.release_to(&self.pool);
            }
            return Err(err);
        }
        if req.transition(ReqState::Pending, now).is_err() {
            // A concurrent abort already retired the request past PENDING;
            // it is torn down, so report the abort rather than a state error.
            return Err(DdError::Aborted);
        }
        if self.debug() {
            log::debug!("{}: req {} created for pid {}", self.name, id, spec.pid);
        }
        Ok(req)
    }

    /// Assemble the typed payload, drawing from the pool without blocking.
    /// Rolls back fully on exhaustion.
    fn build_payload(&self, kind: ReqKind) -> DdResult<Payload> {
        match kind {
            ReqKind::Prepare => {
                let metadata = self.pool.try_alloc_page()?;
                Ok(Payload::Prepare { metadata })
            }
            // On exhaustion the caller-provided buffer is dropped (scrubbed),
            // never pushed into the pool; a retrying caller supplies a fresh
            // one.
            ReqKind::Page { src } => {
                let dst = self.pool.try_alloc_page()?;
                Ok(Payload::Page { src, dst })
            }
            ReqKind::Bio { orig } => {
                let mut clone = self.pool.try_alloc_desc()?;
                clone.sector = orig.sector;
                for _ in 0..orig.segments() {
                    match self.pool.try_alloc_page() {
                        Ok(page) => clone.pages.push(page),
                        Err(err) => {
                            self.pool.release_desc(clone);
                            return Err(err);
                        }
                    }
                }
                Ok(Payload::Bio { orig, clone })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Servicing
    // ------------------------------------------------------------------------

    /// Pop and process the oldest pending request of `pid`.
    ///
    /// Runs the crypto transform (in-kernel via `cipher`, or through the
    /// offload handshake), moves the request to SUBMITTED, and for payloads
    /// with no block-layer completion finishes it inline. Returns the
    /// serviced request, `Ok(None)` when the queue is empty. A request that
    /// failed or was aborted mid-service comes back already retired; inspect
    /// its [`Request::outcome`].
    pub fn service_next(
        self: &Arc<Self>,
        pid: Pid,
        cipher: &dyn PageCipher,
    ) -> DdResult<Option<Arc<Request>>> {
        let tracker = self.tracker_for(pid).ok_or(DdError::NoSuchProc)?;
        let req = match tracker.take_next_pending() {
            Some(req) => req,
            None => return Ok(None),
        };
        req.transition(ReqState::Processing, self.clock.now_ns())?;
        if self.debug() {
            log::debug!("{}: req {} processing", self.name, req.id);
        }

        if req.is_aborted() {
            req.set_outcome(Outcome::Aborted);
            self.retire(&req);
            return Ok(Some(req));
        }

        let is_bio = matches!(req.payload.lock().as_ref(), Some(Payload::Bio { .. }));
        let transformed = if req.offload {
            self.offload_transform(&tracker, &req)
        } else {
            self.local_transform(cipher, &req)
        };

        match transformed {
            Ok(()) => {
                req.transition(ReqState::Submitted, self.clock.now_ns())?;
                tracker.move_to_submitted(&req);
                if !is_bio {
                    // No block-layer completion will arrive for these.
                    self.complete_io(&req, true)?;
                }
            }
            Err(err) => {
                let outcome = match err {
                    DdError::Aborted => Outcome::Aborted,
                    DdError::Timeout => Outcome::TimedOut,
                    _ => Outcome::Failed,
                };
                req.set_outcome(outcome);
                self.retire(&req);
            }
        }
        Ok(Some(req))
    }

    fn local_transform(&self, cipher: &dyn PageCipher, req: &Arc<Request>) -> DdResult<()> {
        let mut guard = req.payload.lock();
        let payload = guard.as_mut().ok_or(DdError::InvalidState)?;
        let result = match payload {
            // Metadata content is the policy layer's business; the request
            // only carries the page through the lifecycle.
            Payload::Prepare { .. } => Ok(()),
            Payload::Page { src, dst } => cipher.crypt_page(req.dir, src, dst),
            Payload::Bio { orig, clone } => cipher.crypt_io(req.dir, orig, clone),
        };
        result.map_err(|err| {
            log::warn!("{}: req {} cipher failure: {}", self.name, req.id, err);
            DdError::CryptoFailure
        })
    }

    // ------------------------------------------------------------------------
    // Offload handshake
    // ------------------------------------------------------------------------

    /// Route the payload through the exchange area, one page at a time:
    /// stage plaintext, wake nothing (the actor polls), wait for
    /// [`complete_offload`](Self::complete_offload), fetch ciphertext.
    fn offload_transform(&self, tracker: &Arc<ProcTracker>, req: &Arc<Request>) -> DdResult<()> {
        let mut guard = req.payload.lock();
        let payload = guard.as_mut().ok_or(DdError::InvalidState)?;
        match payload {
            Payload::Prepare { metadata } => {
                self.stage_plain(tracker, metadata)?;
                self.await_offload(req)?;
                self.fetch_cipher(tracker, metadata)
            }
            Payload::Page { src, dst } => {
                self.stage_plain(tracker, src)?;
                self.await_offload(req)?;
                self.fetch_cipher(tracker, dst)
            }
            Payload::Bio { orig, clone } => {
                for (src, dst) in orig.pages.iter().zip(clone.pages.iter_mut()) {
                    self.stage_plain(tracker, src)?;
                    self.await_offload(req)?;
                    self.fetch_cipher(tracker, dst)?;
                }
                Ok(())
            }
        }
    }

    fn stage_plain(&self, tracker: &ProcTracker, src: &PageBuf) -> DdResult<()> {
        tracker.with_exchange(|area| match area.plaintext.as_mut() {
            Some(page) => {
                page.copy_from(src);
                Ok(())
            }
            None => Err(DdError::InvalidState),
        })?
    }

    fn fetch_cipher(&self, tracker: &ProcTracker, dst: &mut PageBuf) -> DdResult<()> {
        tracker.with_exchange(|area| match area.ciphertext.as_ref() {
            Some(page) => {
                dst.copy_from(page);
                Ok(())
            }
            None => Err(DdError::InvalidState),
        })?
    }

    /// Publish the staged segment and wait for the actor's verdict, bounded
    /// by the offload timeout. Abort wins over both verdict and timeout.
    fn await_offload(&self, req: &Arc<Request>) -> DdResult<()> {
        req.set_offload_status(OffloadStatus::Pending);
        let deadline = self.clock.now_ns() + self.config.offload_timeout_ns;
        let waited = req.waitq.wait_deadline(
            || req.offload_status() != OffloadStatus::Pending || req.is_aborted(),
            self.clock.as_ref(),
            deadline,
        );
        if req.is_aborted() {
            req.set_offload_status(OffloadStatus::Idle);
            return Err(DdError::Aborted);
        }
        if waited == WaitOutcome::TimedOut {
            log::warn!(
                "{}: req {} offload timed out after {}ms, crypto actor unresponsive",
                self.name,
                req.id,
                self.config.offload_timeout_ns / 1_000_000
            );
            req.set_offload_status(OffloadStatus::Idle);
            return Err(DdError::Timeout);
        }
        let status = req.offload_status();
        req.set_offload_status(OffloadStatus::Idle);
        match status {
            OffloadStatus::Done => Ok(()),
            _ => Err(DdError::CryptoFailure),
        }
    }

    /// Upcall from the user-space crypto actor: the staged segment of
    /// request `req_id` is transformed (`ok`) or failed.
    pub fn complete_offload(&self, pid: Pid, req_id: u64, ok: bool) -> DdResult<()> {
        let tracker = self.tracker_for(pid).ok_or(DdError::NoSuchProc)?;
        let req = tracker.find_processing(req_id).ok_or(DdError::NotFound)?;
        req.set_offload_status(if ok {
            OffloadStatus::Done
        } else {
            OffloadStatus::Failed
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Completion and teardown
    // ------------------------------------------------------------------------

    /// Block-layer completion for a submitted request (also called inline
    /// for payloads that never reach the block layer).
    ///
    /// Moves the request to FINISHING and defers the two teardown steps,
    /// delivery before free, onto the work queue.
    pub fn complete_io(self: &Arc<Self>, req: &Arc<Request>, success: bool) -> DdResult<()> {
        let now = self.clock.now_ns();
        req.transition(ReqState::Finishing, now)?;
        if req.is_aborted() {
            req.set_outcome(Outcome::Aborted);
        } else if success {
            req.set_outcome(Outcome::Success);
        } else {
            req.set_outcome(Outcome::Failed);
        }

        let ctx = Arc::downgrade(self);
        let subject = Arc::clone(req);
        self.deferred.push(Box::new(move || {
            if let Some(ctx) = ctx.upgrade() {
                ctx.deliver(&subject);
            }
        }));
        let ctx = Arc::downgrade(self);
        let subject = Arc::clone(req);
        self.deferred.push(Box::new(move || {
            if let Some(ctx) = ctx.upgrade() {
                ctx.retire(&subject);
            }
        }));
        Ok(())
    }

    /// Deferred delivery: copy decrypted clone data back into the original
    /// descriptor and flush crypto metadata if marked.
    fn deliver(&self, req: &Arc<Request>) {
        if req.outcome() == Some(Outcome::Success) && req.dir == Direction::Decrypt {
            let mut guard = req.payload.lock();
            if let Some(Payload::Bio { orig, clone }) = guard.as_mut() {
                for (dst, src) in orig.pages.iter_mut().zip(clone.pages.iter()) {
                    dst.copy_from(src);
                }
            }
        }
        if req.need_xattr_flush.swap(false, Ordering::AcqRel) {
            log::debug!(
                "{}: req {} flushing crypto xattr for ino {}",
                self.name,
                req.id,
                req.ino
            );
        }
    }

    /// Retire a request: terminal transition, unlink, resource return,
    /// benchmark fold. Idempotent; exactly one caller performs the work.
    fn retire(&self, req: &Arc<Request>) {
        if !req.claim_release() {
            return;
        }
        // Fallback outcome; an earlier verdict sticks.
        req.set_outcome(Outcome::Success);
        let now = self.clock.now_ns();
        if req.transition(ReqState::Unallocated, now).is_err() {
            log::error!("{}: req {} already terminal at retire", self.name, req.id);
        }
        let tracker = Arc::clone(req.tracker());
        tracker.unlink_and_drop(req);
        if let Some(payload) = req.payload.lock().take() {
            payload.release_to(&self.pool);
        }
        if req.bench {
            self.bench.fold(&req.stamps);
            self.bench.maybe_report(now);
        }
        req.waitq.wake_all();
        if self.debug() {
            log::debug!(
                "{}: req {} retired: {:?}",
                self.name,
                req.id,
                req.outcome()
            );
        }
        if tracker.is_aborted() {
            self.maybe_reap(&tracker);
        }
    }

    /// Remove an aborted, quiescent tracker from the map and return its
    /// exchange buffers to the pool. Single-shot per tracker.
    fn maybe_reap(&self, tracker: &Arc<ProcTracker>) {
        if !tracker.try_detach() {
            return;
        }
        self.procs.lock().remove(&tracker.pid);
        if let Some(mut area) = tracker.detach_exchange() {
            for page in area.control.drain(..) {
                self.pool.release_page(page);
            }
            for page in [area.metadata, area.plaintext, area.ciphertext]
                .into_iter()
                .flatten()
            {
                self.pool.release_page(page);
            }
        }
        log::info!("{}: pid {} detached", self.name, tracker.pid);
    }

    // ------------------------------------------------------------------------
    // Abort and shutdown
    // ------------------------------------------------------------------------

    /// Abort every request of `pid`, typically on process exit.
    ///
    /// Pending requests are retired here (no worker owns them); processing
    /// and submitted ones are marked and woken so their owners tear them
    /// down. The tracker is reaped once the last of them retires.
    pub fn abort_process(self: &Arc<Self>, pid: Pid) -> DdResult<()> {
        let tracker = self.tracker_for(pid).ok_or(DdError::NoSuchProc)?;
        let orphaned = tracker.signal_abort();
        log::info!(
            "{}: aborting pid {}, {} pending orphaned, {} outstanding",
            self.name,
            pid,
            orphaned.len(),
            tracker.outstanding()
        );
        for req in orphaned {
            req.set_outcome(Outcome::Aborted);
            self.retire(&req);
        }
        self.maybe_reap(&tracker);
        Ok(())
    }

    /// Block until `pid` has no live requests. A process this context has
    /// never seen (or already reaped) is trivially quiescent.
    pub fn wait_for_quiescence(&self, pid: Pid, timeout_ns: u64) -> DdResult<()> {
        let tracker = match self.tracker_for(pid) {
            Some(tracker) => tracker,
            None => return Ok(()),
        };
        let deadline = self.clock.now_ns() + timeout_ns;
        tracker.wait_quiescent(self.clock.as_ref(), deadline)
    }

    /// Abort every process, drain deferred work, and wait for the whole
    /// context to go quiescent.
    pub fn shutdown(self: &Arc<Self>, timeout_ns: u64) -> DdResult<()> {
        self.shutting_down.store(true, Ordering::Release);
        let pids: Vec<Pid> = self.procs.lock().keys().copied().collect();
        for pid in &pids {
            match self.abort_process(*pid) {
                Ok(()) | Err(DdError::NoSuchProc) => {}
                Err(err) => return Err(err),
            }
        }
        self.run_deferred();
        let deadline_ns = self.clock.now_ns() + timeout_ns;
        for pid in pids {
            if let Some(tracker) = self.tracker_for(pid) {
                tracker.wait_quiescent(self.clock.as_ref(), deadline_ns)?;
            }
        }
        self.run_deferred();
        log::info!("{}: shutdown complete", self.name);
        Ok(())
    }

    /// Drain and run deferred delivery/free work. Embedders call this from
    /// their worker loop; returns how many jobs ran.
    pub fn run_deferred(&self) -> usize {
        self.deferred.run_pending()
    }

    /// Emit the benchmark aggregate, rate-limited. Inert unless
    /// [`DebugFlags::BENCHMARK`] is set.
    pub fn dump_benchmark(&self) -> bool {
        if !self.flags().contains(DebugFlags::BENCHMARK) {
            return false;
        }
        self.bench.maybe_report(self.clock.now_ns())
    }
}

impl core::fmt::Debug for DdContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DdContext")
            .field("name", &self.name)
            .field("procs", &self.proc_count())
            .field("flags", &self.flags())
            .finish()
    }
}
