//! General-case counting semaphore used by [`crate::pool::Pool`].
//!
//! Typical Dijkstra semaphore algorithm over atomics, wait and notify
//! functions. The `atomic-wait` crate provides the atomic wait/wake
//! functionality that exists in C++20's `std::atomic<T>::wait`/`notify_all`
//! but is not yet stable in Rust.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

struct AtomicSemaphoreBase {
    /// `u32` because that is the atomic width `atomic-wait` builds futex
    /// primitives on top of.
    a: AtomicU32,
}

impl AtomicSemaphoreBase {
    const fn new(count: u32) -> Self {
        Self {
            a: AtomicU32::new(count),
        }
    }

    #[inline]
    fn release_impl(&self, update: u32) {
        let old = self.a.fetch_add(update, Ordering::Release);
        debug_assert!(
            update <= u32::MAX - old,
            "update is greater than the expected value"
        );
        if old == 0u32 {
            atomic_wait::wake_all(&self.a);
        }
    }

    fn release(&self) {
        self.release_impl(1);
    }

    #[inline]
    fn try_acquire_impl(&self, old: u32, ask: u32) -> bool {
        old >= ask
            && self
                .a
                .compare_exchange_weak(old, old - ask, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    fn acquire(&self) {
        loop {
            atomic_wait::wait(&self.a, 0);
            let old = self.a.load(Ordering::Relaxed);
            if self.try_acquire_impl(old, 1) {
                break;
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let old = self.a.load(Ordering::Acquire);
        self.try_acquire_impl(old, 1)
    }
}

/// Counting semaphore. `release()` called more times than `acquire()` does
/// not panic; it just grows the available-permit count.
pub(crate) struct Semaphore {
    max: u32,
    base: AtomicSemaphoreBase,
}

impl Semaphore {
    pub(crate) const fn new(count: u32) -> Self {
        debug_assert!(count > 0, "Semaphore must allow for at least one permit");
        Self {
            max: count,
            base: AtomicSemaphoreBase::new(count),
        }
    }

    pub(crate) fn max(&self) -> u32 {
        self.max
    }

    pub(crate) fn release(&self) {
        self.base.release();
    }

    pub(crate) fn acquire(&self) {
        self.base.acquire();
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.base.try_acquire()
    }

    /// Blocks until a permit is available or `deadline` passes; returns
    /// `false` on timeout without consuming a permit.
    pub(crate) fn acquire_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Bounded spin/park: atomic-wait has no timed wait, so fall back
            // to a short sleep between attempts rather than busy-spinning.
            std::thread::sleep(remaining.min(std::time::Duration::from_millis(1)));
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("max", &self.max)
            .field("available", &self.base.a.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn basic_acquire_release() {
        let semaphore = Semaphore::new(2);
        assert_eq!(semaphore.max(), 2);
        semaphore.acquire();
        semaphore.acquire();
        assert!(!semaphore.try_acquire());
        semaphore.release();
        assert!(semaphore.try_acquire());
    }

    #[test]
    fn concurrent_access_is_bounded() {
        let semaphore = Arc::new(Semaphore::new(2));
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..6 {
            let sem = semaphore.clone();
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            handles.push(thread::spawn(move || {
                sem.acquire();
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                counter.fetch_sub(1, Ordering::SeqCst);
                sem.release();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn acquire_timeout_reports_failure_without_consuming_a_permit() {
        let semaphore = Semaphore::new(1);
        semaphore.acquire();
        assert!(!semaphore.acquire_timeout(Duration::from_millis(20)));
        semaphore.release();
        assert!(semaphore.acquire_timeout(Duration::from_millis(20)));
    }

    #[test]
    #[should_panic]
    fn zero_permits_is_rejected() {
        let _ = Semaphore::new(0);
    }
}
