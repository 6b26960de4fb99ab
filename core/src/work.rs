//! # Deferred Work
//!
//! FIFO queue of boxed closures for the two post-I/O steps that must not
//! run in the completion context itself: decrypted-data delivery and
//! delayed resource free. Ordering matters -- delivery for a request is
//! always queued before its free, and the drain preserves that order.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// One unit of deferred work.
pub type Work = Box<dyn FnOnce() + Send>;

/// Mutex-guarded FIFO of deferred closures.
pub struct WorkQueue {
    jobs: Mutex<VecDeque<Work>>,
    queued: AtomicU64,
    completed: AtomicU64,
}

impl WorkQueue {
    /// Empty queue.
    pub const fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            queued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Append one job.
    pub fn push(&self, job: Work) {
        self.jobs.lock().push_back(job);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop and run the oldest job, if any.
    ///
    /// The job runs outside the queue lock, so it may itself push follow-up
    /// work without deadlocking.
    pub fn run_one(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                self.completed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drain and run every queued job in FIFO order. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Jobs currently waiting.
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Total jobs ever queued.
    pub fn total_queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Total jobs ever completed.
    pub fn total_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex as SpinMutex;

    #[test]
    fn drains_in_fifo_order() {
        let queue = WorkQueue::new();
        let order = Arc::new(SpinMutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.push(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*order.lock(), alloc::vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.total_completed(), 3);
    }

    #[test]
    fn jobs_may_requeue() {
        let queue = Arc::new(WorkQueue::new());
        let hit = Arc::new(SpinMutex::new(0u32));
        {
            let queue2 = Arc::clone(&queue);
            let hit2 = Arc::clone(&hit);
            queue.push(Box::new(move || {
                let hit3 = Arc::clone(&hit2);
                queue2.push(Box::new(move || *hit3.lock() += 10));
                *hit2.lock() += 1;
            }));
        }
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(*hit.lock(), 11);
    }

    #[test]
    fn empty_drain_is_noop() {
        let queue = WorkQueue::new();
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(queue.total_queued(), 0);
    }
}
