//! # Resource Pool
//!
//! Bounded allocator for the two object kinds in-flight crypto needs:
//! page-sized buffers ([`PageBuf`]) and I/O descriptors ([`IoDesc`]).
//!
//! Discipline:
//!
//! - `try_alloc_*` never blocks and never grows the pool; exhaustion is the
//!   retryable [`DdError::PoolExhausted`]
//! - `alloc_*` may wait (and may grow the pool up to a high-watermark) and
//!   must therefore only be called from blockable contexts -- a
//!   caller-discipline contract, not enforced here
//! - `release_*` is non-blocking, safe from any context, and wakes waiters;
//!   the idle set never exceeds its pre-allocated size, so objects the pool
//!   did not hand out (and grown objects draining back) are dropped, not
//!   absorbed

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::time::Clock;
use crate::wait::{WaitOutcome, WaitQueue};
use crate::{DdError, DdResult};

/// Size of one crypto buffer.
pub const PAGE_SIZE: usize = 4096;

/// A page-sized crypto buffer owned by the pool while idle.
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuf {
    /// Allocate a zeroed buffer.
    pub fn zeroed() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Read access to the full page.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    /// Write access to the full page.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Overwrite this page with the contents of `other`.
    pub fn copy_from(&mut self, other: &PageBuf) {
        self.data.copy_from_slice(&other.data[..]);
    }

    /// Zero the page. Buffers are scrubbed before returning to the pool so
    /// plaintext never lingers in idle pool memory.
    pub fn scrub(&mut self) {
        self.data.fill(0);
    }
}

impl core::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Never dump buffer contents.
        write!(f, "PageBuf({} bytes)", PAGE_SIZE)
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        // Plaintext must not linger in freed memory.
        self.data.fill(0);
    }
}

/// An I/O descriptor: an ordered run of page segments against a sector.
///
/// Stands in for the block layer's own descriptor type; the core only needs
/// the backing pages and the target placement.
#[derive(Debug)]
pub struct IoDesc {
    /// Backing page segments, in I/O order.
    pub pages: Vec<PageBuf>,
    /// First device sector this descriptor targets.
    pub sector: u64,
}

impl IoDesc {
    /// An empty descriptor shell, as recycled by the pool.
    pub fn empty() -> Self {
        Self {
            pages: Vec::new(),
            sector: 0,
        }
    }

    /// Number of page segments.
    pub fn segments(&self) -> usize {
        self.pages.len()
    }
}

struct PoolInner {
    pages: Vec<PageBuf>,
    descs: Vec<IoDesc>,
    pages_out: usize,
    descs_out: usize,
}

/// Bounded, mutex-guarded allocator shared by the whole subsystem instance.
pub struct ResourcePool {
    inner: Mutex<PoolInner>,
    page_cap: usize,
    desc_cap: usize,
    page_high: usize,
    desc_high: usize,
    waitq: WaitQueue,
}

impl ResourcePool {
    /// Pre-allocate `pages` buffers and `descs` descriptor shells, growable
    /// up to `page_high` / `desc_high`.
    pub fn new(pages: usize, descs: usize, page_high: usize, desc_high: usize) -> Self {
        let mut page_vec = Vec::with_capacity(pages);
        for _ in 0..pages {
            page_vec.push(PageBuf::zeroed());
        }
        let mut desc_vec = Vec::with_capacity(descs);
        for _ in 0..descs {
            desc_vec.push(IoDesc::empty());
        }
        Self {
            inner: Mutex::new(PoolInner {
                pages: page_vec,
                descs: desc_vec,
                pages_out: 0,
                descs_out: 0,
            }),
            page_cap: pages,
            desc_cap: descs,
            page_high: page_high.max(pages),
            desc_high: desc_high.max(descs),
            waitq: WaitQueue::new(),
        }
    }

    /// Non-blocking page allocation. Never grows the pool.
    pub fn try_alloc_page(&self) -> DdResult<PageBuf> {
        let mut inner = self.inner.lock();
        match inner.pages.pop() {
            Some(page) => {
                inner.pages_out += 1;
                Ok(page)
            }
            None => Err(DdError::PoolExhausted),
        }
    }

    /// Non-blocking descriptor allocation. Never grows the pool.
    pub fn try_alloc_desc(&self) -> DdResult<IoDesc> {
        let mut inner = self.inner.lock();
        match inner.descs.pop() {
            Some(desc) => {
                inner.descs_out += 1;
                Ok(desc)
            }
            None => Err(DdError::PoolExhausted),
        }
    }

    /// Blocking page allocation: grows below the high-watermark, otherwise
    /// waits for a release until `deadline_ns`.
    ///
    /// Must only be called from a context that may block.
    pub fn alloc_page(&self, clock: &dyn Clock, deadline_ns: u64) -> DdResult<PageBuf> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(page) = inner.pages.pop() {
                    inner.pages_out += 1;
                    return Ok(page);
                }
                if inner.pages_out < self.page_high {
                    inner.pages_out += 1;
                    drop(inner);
                    // Fresh buffer allocated outside the lock.
                    return Ok(PageBuf::zeroed());
                }
            }
            let freed = self
                .waitq
                .wait_deadline(|| !self.inner.lock().pages.is_empty(), clock, deadline_ns);
            if freed == WaitOutcome::TimedOut {
                log::warn!("pool: page allocation timed out under backpressure");
                return Err(DdError::PoolExhausted);
            }
        }
    }

    /// Blocking descriptor allocation; see [`alloc_page`](Self::alloc_page).
    pub fn alloc_desc(&self, clock: &dyn Clock, deadline_ns: u64) -> DdResult<IoDesc> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(desc) = inner.descs.pop() {
                    inner.descs_out += 1;
                    return Ok(desc);
                }
                if inner.descs_out < self.desc_high {
                    inner.descs_out += 1;
                    drop(inner);
                    return Ok(IoDesc::empty());
                }
            }
            let freed = self
                .waitq
                .wait_deadline(|| !self.inner.lock().descs.is_empty(), clock, deadline_ns);
            if freed == WaitOutcome::TimedOut {
                log::warn!("pool: descriptor allocation timed out under backpressure");
                return Err(DdError::PoolExhausted);
            }
        }
    }

    /// Return a page to the pool. Non-blocking, callable from any context.
    ///
    /// The idle set is capped at the pre-allocated size; a page arriving
    /// past the cap (a grown page draining back, or one the pool never
    /// handed out) is dropped outside the lock instead of retained.
    pub fn release_page(&self, mut page: PageBuf) {
        page.scrub();
        let overflow = {
            let mut inner = self.inner.lock();
            if inner.pages_out > 0 {
                inner.pages_out -= 1;
            }
            if inner.pages.len() < self.page_cap {
                inner.pages.push(page);
                None
            } else {
                Some(page)
            }
        };
        drop(overflow);
        self.waitq.wake_all();
    }

    /// Return a descriptor to the pool, releasing its pages first. Capped
    /// like [`release_page`](Self::release_page).
    pub fn release_desc(&self, mut desc: IoDesc) {
        for page in desc.pages.drain(..) {
            self.release_page(page);
        }
        desc.sector = 0;
        let overflow = {
            let mut inner = self.inner.lock();
            if inner.descs_out > 0 {
                inner.descs_out -= 1;
            }
            if inner.descs.len() < self.desc_cap {
                inner.descs.push(desc);
                None
            } else {
                Some(desc)
            }
        };
        drop(overflow);
        self.waitq.wake_all();
    }

    /// Idle pages currently in the pool.
    pub fn free_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Pages currently handed out.
    pub fn pages_outstanding(&self) -> usize {
        self.inner.lock().pages_out
    }

    /// Idle descriptors currently in the pool.
    pub fn free_descs(&self) -> usize {
        self.inner.lock().descs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::HostClock;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn try_alloc_exhausts_then_recovers() {
        let pool = ResourcePool::new(2, 0, 2, 0);
        let a = pool.try_alloc_page().unwrap();
        let b = pool.try_alloc_page().unwrap();
        assert_eq!(pool.try_alloc_page().err(), Some(DdError::PoolExhausted));
        pool.release_page(a);
        assert!(pool.try_alloc_page().is_ok());
        pool.release_page(b);
    }

    #[test]
    fn blocking_alloc_grows_below_watermark() {
        let pool = ResourcePool::new(1, 0, 3, 0);
        let clock = HostClock::new();
        let deadline = clock.now_ns() + 1_000_000;
        let _a = pool.alloc_page(&clock, deadline).unwrap();
        let _b = pool.alloc_page(&clock, deadline).unwrap();
        let _c = pool.alloc_page(&clock, deadline).unwrap();
        assert_eq!(pool.pages_outstanding(), 3);
        // At the watermark with nothing free: times out as retryable.
        let deadline = clock.now_ns() + 2_000_000;
        assert_eq!(
            pool.alloc_page(&clock, deadline).err(),
            Some(DdError::PoolExhausted)
        );
    }

    #[test]
    fn blocking_alloc_woken_by_release() {
        let pool = Arc::new(ResourcePool::new(1, 0, 1, 0));
        let clock = HostClock::new();
        let page = pool.try_alloc_page().unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.release_page(page);
            })
        };

        let deadline = clock.now_ns() + 1_000_000_000;
        let got = pool.alloc_page(&clock, deadline);
        releaser.join().unwrap();
        assert!(got.is_ok());
        assert_eq!(pool.pages_outstanding(), 1);
    }

    #[test]
    fn desc_release_returns_pages_too() {
        let pool = ResourcePool::new(2, 1, 2, 1);
        let mut desc = pool.try_alloc_desc().unwrap();
        desc.pages.push(pool.try_alloc_page().unwrap());
        desc.pages.push(pool.try_alloc_page().unwrap());
        pool.release_desc(desc);
        assert_eq!(pool.free_pages(), 2);
        assert_eq!(pool.free_descs(), 1);
        assert_eq!(pool.pages_outstanding(), 0);
    }

    #[test]
    fn foreign_objects_do_not_grow_the_pool() {
        let pool = ResourcePool::new(2, 1, 4, 2);
        for _ in 0..10 {
            pool.release_page(PageBuf::zeroed());
        }
        let mut stray = IoDesc::empty();
        stray.pages.push(PageBuf::zeroed());
        pool.release_desc(stray);
        assert_eq!(pool.free_pages(), 2);
        assert_eq!(pool.free_descs(), 1);
        assert_eq!(pool.pages_outstanding(), 0);
    }

    #[test]
    fn grown_pages_drain_back_to_preallocation() {
        let pool = ResourcePool::new(1, 0, 3, 0);
        let clock = HostClock::new();
        let deadline = clock.now_ns() + 1_000_000;
        let a = pool.alloc_page(&clock, deadline).unwrap();
        let b = pool.alloc_page(&clock, deadline).unwrap();
        let c = pool.alloc_page(&clock, deadline).unwrap();
        pool.release_page(a);
        pool.release_page(b);
        pool.release_page(c);
        assert_eq!(pool.free_pages(), 1);
        assert_eq!(pool.pages_outstanding(), 0);
    }

    #[test]
    fn released_pages_are_scrubbed() {
        let pool = ResourcePool::new(1, 0, 1, 0);
        let mut page = pool.try_alloc_page().unwrap();
        page.as_mut_slice()[0] = 0xFF;
        pool.release_page(page);
        let page = pool.try_alloc_page().unwrap();
        assert_eq!(page.as_slice()[0], 0);
    }
}
