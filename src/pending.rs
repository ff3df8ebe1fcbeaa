//! Mapping of sequence number to waiter, with timeout reaping.
//!
//! The pending map is the one structure touched by callers (insert), the
//! reader (remove), the scavenger (reap), and shutdown (flush). Removal
//! and reaping of the same sequence are mutually exclusive: whichever
//! observes the waiter first takes it out of the map and signals it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::MuxwireError;
use crate::waiter::Waiter;

pub(crate) struct PendingMap {
    map: parking_lot::Mutex<HashMap<u64, Arc<Waiter>>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self {
            map: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter under its sequence number.
    pub fn insert(&self, w: Arc<Waiter>) {
        let prev = self.map.lock().insert(w.seq(), w);
        // sequence numbers are unique per client; a collision is a bug
        debug_assert!(prev.is_none());
    }

    /// Atomically look up and delete the waiter for `seq`.
    pub fn remove(&self, seq: u64) -> Option<Arc<Waiter>> {
        self.map.lock().remove(&seq)
    }

    /// Two-pass scavenge: entries already marked are removed and failed
    /// with [`MuxwireError::Timeout`]; the rest are marked for the next
    /// pass. This bounds a caller's wait to twice the scavenger period.
    pub fn reap(&self) {
        let mut reaped = Vec::new();
        {
            let mut map = self.map.lock();
            map.retain(|_, w| {
                if w.reap.swap(true, Ordering::AcqRel) {
                    reaped.push(w.clone());
                    false
                } else {
                    true
                }
            });
        }
        for w in reaped {
            w.fail(MuxwireError::Timeout);
        }
    }

    /// Remove and fail every entry. Invoked on fatal transport errors.
    pub fn flush<F>(&self, mk_err: F)
    where
        F: Fn() -> MuxwireError,
    {
        let drained: Vec<Arc<Waiter>> = {
            let mut map = self.map.lock();
            map.drain().map(|(_, w)| w).collect()
        };
        for w in drained {
            w.fail(mk_err());
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}
