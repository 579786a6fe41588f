//! Bounded resource pool used for concurrent readers.
//!
//! Grounded on the same acquire/release shape as [`crate::semaphore`], with
//! an additional slot array so items (not just permits) are reused. A
//! counting semaphore bounds concurrent borrowers; a `parking_lot::Mutex`
//! guards the slot vector itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, PoolError};
use crate::semaphore::Semaphore;

struct Slot<T> {
    item: Option<T>,
}

struct Inner<T> {
    slots: Mutex<Vec<Slot<T>>>,
    semaphore: Semaphore,
    factory: Box<dyn Fn() -> Result<T, Error> + Send + Sync>,
    max: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    closed: std::sync::atomic::AtomicBool,
}

/// A bounded, reusable pool of `T` (typically read-only connections).
///
/// Invariant: at most `maximum_count` items, at most `maximum_count`
/// concurrent borrowers; every [`Pool::get`] is paired with a release on
/// every exit path, including panics, via [`PoolGuard`]'s `Drop` impl.
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(
        maximum_count: usize,
        factory: impl Fn() -> Result<T, Error> + Send + Sync + 'static,
    ) -> Pool<T> {
        let maximum_count = maximum_count.max(1);
        let mut slots = Vec::with_capacity(maximum_count);
        for _ in 0..maximum_count {
            slots.push(Slot { item: None });
        }
        Pool {
            inner: Arc::new(Inner {
                slots: Mutex::new(slots),
                semaphore: Semaphore::new(maximum_count as u32),
                factory: Box::new(factory),
                max: maximum_count,
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn maximum_count(&self) -> usize {
        self.inner.max
    }

    fn take_or_build(&self) -> Result<T, Error> {
        let mut slots = self.inner.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(item) = slot.item.take() {
                return Ok(item);
            }
        }
        drop(slots);
        (self.inner.factory)()
    }

    /// Blocks until a slot is available, returning a guard that returns the
    /// item to the pool when dropped.
    pub fn get(&self) -> Result<PoolGuard<T>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Pool(PoolError::Closed));
        }
        self.inner.semaphore.acquire();
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        let item = match self.take_or_build() {
            Ok(item) => item,
            Err(e) => {
                self.inner.semaphore.release();
                self.inner.acquired.fetch_sub(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        Ok(PoolGuard {
            pool: self.clone(),
            item: Some(item),
        })
    }

    /// Blocks until a slot is available or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<PoolGuard<T>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Pool(PoolError::Closed));
        }
        if !self.inner.semaphore.acquire_timeout(timeout) {
            tracing::warn!(waited_ms = timeout.as_millis() as u64, "pool acquire timed out");
            return Err(Error::Pool(PoolError::Timeout));
        }
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        let item = match self.take_or_build() {
            Ok(item) => item,
            Err(e) => {
                self.inner.semaphore.release();
                self.inner.acquired.fetch_sub(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        Ok(PoolGuard {
            pool: self.clone(),
            item: Some(item),
        })
    }

    /// Scoped acquire: `body` receives the item and the slot is released on
    /// every exit path, including a panic unwinding through `body`.
    pub fn get_with<R>(&self, body: impl FnOnce(&mut T) -> R) -> Result<R, Error> {
        let mut guard = self.get()?;
        Ok(body(&mut guard))
    }

    /// Iterates every currently idle item in an unspecified order. Does not
    /// acquire exclusivity: items borrowed by other callers are skipped.
    pub fn for_each(&self, mut body: impl FnMut(&T)) {
        let slots = self.inner.slots.lock();
        for slot in slots.iter() {
            if let Some(item) = &slot.item {
                body(item);
            }
        }
    }

    /// Drops every idle item. Items currently checked out remain valid for
    /// their borrower but are not returned to the pool on release.
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock();
        for slot in slots.iter_mut() {
            slot.item = None;
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// `acquired == released` at steady state (no outstanding borrows); a
    /// mismatch in debug builds indicates a leaked [`PoolGuard`].
    pub fn debug_assert_balanced(&self) {
        debug_assert_eq!(
            self.inner.acquired.load(Ordering::SeqCst),
            self.inner.released.load(Ordering::SeqCst),
            "pool has outstanding borrows: a PoolGuard was leaked"
        );
    }

    fn return_item(&self, item: T) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.item.is_none()) {
            slot.item = Some(item);
        }
        // If every slot is occupied (can happen after a `clear()` raced
        // with a release), the item is simply dropped.
        drop(slots);
        self.inner.released.fetch_add(1, Ordering::Relaxed);
        self.inner.semaphore.release();
    }
}

/// A borrowed pool item. Returns the item to the pool when dropped,
/// releasing the semaphore permit on every exit path.
pub struct PoolGuard<T: Send + 'static> {
    pool: Pool<T>,
    item: Option<T>,
}

impl<T: Send + 'static> std::ops::Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("PoolGuard used after release")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("PoolGuard used after release")
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.return_item(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pool_never_exceeds_maximum_count() {
        let counter = Arc::new(AtomicU32::new(0));
        let c2 = counter.clone();
        let pool: Pool<u32> = Pool::new(3, move || {
            Ok(c2.fetch_add(1, Ordering::SeqCst))
        });

        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..6 {
            let pool = pool.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(thread::spawn(move || {
                let guard = pool.get().unwrap();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                concurrent.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        pool.debug_assert_balanced();
    }

    #[test]
    fn get_timeout_fails_without_holding_a_slot() {
        let pool: Pool<u32> = Pool::new(1, || Ok(0));
        let guard = pool.get().unwrap();
        let err = pool.get_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Timeout)));
        drop(guard);
        assert!(pool.get_timeout(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn clear_drops_idle_items_but_keeps_borrowed_ones_valid() {
        let pool: Pool<u32> = Pool::new(2, || Ok(7));
        let guard = pool.get().unwrap();
        pool.clear();
        assert_eq!(*guard, 7);
    }
}
