//! Per-call waiter state and the per-client free list.
//!
//! A [`Waiter`] carries one in-flight call: its sequence number, the
//! reusable buffer holding first the outbound frame and later the inbound
//! body, and the completion signal the caller suspends on. Waiters are
//! pooled per client up to the high-water mark; calls beyond that run on
//! freshly allocated waiters that are dropped after use.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::MuxwireError;

/// High-water mark: bounded size of the writer queue and the waiter
/// free list.
pub(crate) const HIGH_WATER: usize = 32;

/// Initial capacity of a pooled waiter's buffer.
const BUF_CAPACITY: usize = 256;

/// Carrier for one in-flight call.
///
/// A waiter is in exactly one of three states: idle in the free list,
/// registered in the pending map with `done` unsignalled, or held by its
/// caller after being signalled and removed from the map.
pub(crate) struct Waiter {
    /// Assigned sequence number; unique per client for its lifetime.
    seq: AtomicU64,
    /// Reusable buffer: outbound frame + body, then the inbound body.
    pub buf: tokio::sync::Mutex<Vec<u8>>,
    /// Completion signal; signalled exactly once per registration.
    pub done: Notify,
    /// Terminal error, set by whoever signals `done`.
    err: parking_lot::Mutex<Option<MuxwireError>>,
    /// Mark bit consumed by the timeout scavenger.
    pub reap: AtomicBool,
    /// Set while the waiter sits in the writing queue; cleared by the
    /// writer on dequeue. A queued waiter must not return to the pool.
    pub queued: AtomicBool,
    /// Whether this waiter belongs to the statically sized free list.
    is_static: bool,
}

impl Waiter {
    fn new(is_static: bool) -> Self {
        Self {
            seq: AtomicU64::new(0),
            buf: tokio::sync::Mutex::new(Vec::with_capacity(BUF_CAPACITY)),
            done: Notify::new(),
            err: parking_lot::Mutex::new(None),
            reap: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            is_static,
        }
    }

    /// Prepare the waiter for submission under `seq`.
    pub fn arm(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
        self.reap.store(false, Ordering::Release);
        self.queued.store(true, Ordering::Release);
        *self.err.lock() = None;
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Wake the caller with a successful response in `buf`.
    pub fn complete(&self) {
        *self.err.lock() = None;
        self.done.notify_one();
    }

    /// Wake the caller with a terminal error.
    pub fn fail(&self, err: MuxwireError) {
        *self.err.lock() = Some(err);
        self.done.notify_one();
    }

    /// Take the terminal error, if any.
    pub fn take_err(&self) -> Option<MuxwireError> {
        self.err.lock().take()
    }
}

/// Per-client free list of pre-allocated waiters.
pub(crate) struct WaiterPool {
    free: parking_lot::Mutex<Vec<Arc<Waiter>>>,
}

impl WaiterPool {
    /// Create a pool pre-filled with `HIGH_WATER` static waiters.
    pub fn new() -> Self {
        Self {
            free: parking_lot::Mutex::new(
                (0..HIGH_WATER).map(|_| Arc::new(Waiter::new(true))).collect(),
            ),
        }
    }

    /// Take a waiter from the free list, or allocate a fresh one when the
    /// list is empty.
    pub fn pop(&self) -> Arc<Waiter> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(Waiter::new(false)))
    }

    /// Return a waiter to the free list.
    ///
    /// Non-static waiters are dropped. A waiter still sitting in the
    /// writing queue (its caller was reaped before the writer reached it)
    /// is also dropped so it can never be re-armed while queued.
    pub fn push(&self, w: Arc<Waiter>) {
        if !w.is_static || w.queued.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut buf) = w.buf.try_lock() {
            buf.clear();
        }
        *w.err.lock() = None;
        w.reap.store(false, Ordering::Release);

        let mut free = self.free.lock();
        if free.len() < HIGH_WATER {
            free.push(w);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_starts_at_high_water() {
        let pool = WaiterPool::new();
        assert_eq!(pool.len(), HIGH_WATER);
    }

    #[test]
    fn test_pop_push_recycles_static_waiters() {
        let pool = WaiterPool::new();
        let w = pool.pop();
        assert_eq!(pool.len(), HIGH_WATER - 1);
        pool.push(w);
        assert_eq!(pool.len(), HIGH_WATER);
    }

    #[test]
    fn test_pop_beyond_high_water_allocates_fresh() {
        let pool = WaiterPool::new();
        let statics: Vec<_> = (0..HIGH_WATER).map(|_| pool.pop()).collect();
        assert_eq!(pool.len(), 0);

        // Fresh waiters are not pooled on push.
        let fresh = pool.pop();
        pool.push(fresh);
        assert_eq!(pool.len(), 0);

        for w in statics {
            pool.push(w);
        }
        assert_eq!(pool.len(), HIGH_WATER);
    }

    #[test]
    fn test_push_refuses_queued_waiter() {
        let pool = WaiterPool::new();
        let w = pool.pop();
        w.arm(1);
        // Still marked queued: the writer never dequeued it.
        pool.push(w);
        assert_eq!(pool.len(), HIGH_WATER - 1);
    }

    #[test]
    fn test_arm_clears_previous_state() {
        let pool = WaiterPool::new();
        let w = pool.pop();
        w.fail(MuxwireError::Timeout);
        w.reap.store(true, Ordering::Release);

        w.arm(7);
        assert_eq!(w.seq(), 7);
        assert!(!w.reap.load(Ordering::Acquire));
        assert!(w.take_err().is_none());
    }

    #[tokio::test]
    async fn test_fail_then_notified_wakes_immediately() {
        let pool = WaiterPool::new();
        let w = pool.pop();
        w.arm(1);
        w.fail(MuxwireError::Timeout);

        // The stored permit wakes a later waiter without blocking.
        tokio::time::timeout(std::time::Duration::from_millis(100), w.done.notified())
            .await
            .expect("notify permit should be stored");
        assert!(matches!(w.take_err(), Some(MuxwireError::Timeout)));
    }

    #[test]
    fn test_push_clears_buffer() {
        let pool = WaiterPool::new();
        let w = pool.pop();
        w.buf.try_lock().unwrap().extend_from_slice(b"leftover");
        let again = w.clone();
        drop(w);
        pool.push(again);

        let w = pool.pop();
        assert!(w.buf.try_lock().unwrap().is_empty());
    }
}
