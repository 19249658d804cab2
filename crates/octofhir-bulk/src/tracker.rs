//! Out-of-order completion watermark.
//!
//! Units of work are registered in order with [`CheckpointTracker::track`] and
//! may finish in any order. The checkpoint only moves past a unit once it and
//! every unit registered before it are done, so it is always a safe resume
//! point and never moves backwards.
//!
//! ```
//! use octofhir_bulk::tracker::CheckpointTracker;
//!
//! let tracker = CheckpointTracker::new();
//! let first = tracker.track(1u32, 1);
//! let second = tracker.track(2u32, 1);
//!
//! second.complete();
//! assert_eq!(tracker.checkpoint(), None);
//!
//! first.complete();
//! assert_eq!(tracker.checkpoint(), Some(2));
//! assert!(tracker.is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

struct Entry<K> {
    key: K,
    remaining: u32,
}

struct Inner<K> {
    pending: VecDeque<Entry<K>>,
    /// Sequence number of `pending[0]`.
    head_seq: u64,
    next_seq: u64,
    checkpoint: Option<K>,
}

impl<K: Clone> Inner<K> {
    fn drain_done(&mut self) {
        while self.pending.front().is_some_and(|e| e.remaining == 0) {
            if let Some(entry) = self.pending.pop_front() {
                self.checkpoint = Some(entry.key);
                self.head_seq += 1;
            }
        }
    }
}

/// Shared watermark over units of work that complete out of order.
///
/// Cloning is cheap; clones observe the same queue. All operations take a
/// single short-lived lock.
pub struct CheckpointTracker<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for CheckpointTracker<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Clone> Default for CheckpointTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone> CheckpointTracker<K> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: VecDeque::new(),
                head_seq: 0,
                next_seq: 0,
                checkpoint: None,
            })),
        }
    }

    /// Tracker whose checkpoint starts at a previously reported value.
    pub fn resume_from(checkpoint: Option<K>) -> Self {
        let tracker = Self::new();
        tracker.inner.lock().checkpoint = checkpoint;
        tracker
    }

    /// Register a unit at the tail of the queue.
    ///
    /// `required_completions` is the number of [`Ticket::complete`] calls the
    /// unit needs before it counts as done; zero is treated as one.
    pub fn track(&self, key: K, required_completions: u32) -> Ticket<K> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push_back(Entry {
            key,
            remaining: required_completions.max(1),
        });
        Ticket {
            inner: Arc::clone(&self.inner),
            seq,
        }
    }

    /// Key of the last unit of the longest fully completed prefix.
    pub fn checkpoint(&self) -> Option<K> {
        self.inner.lock().checkpoint.clone()
    }

    /// True when no registered unit is still pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Number of units registered but not yet drained.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// Handle for one tracked unit.
///
/// Clones refer to the same unit, which lets separate stages (for example
/// "read finished" and "upload finished") each signal their own completion.
pub struct Ticket<K> {
    inner: Arc<Mutex<Inner<K>>>,
    seq: u64,
}

impl<K> Clone for Ticket<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            seq: self.seq,
        }
    }
}

impl<K: Clone> Ticket<K> {
    /// Record one completion signal for this unit.
    ///
    /// Extra calls after the unit is done are ignored.
    pub fn complete(&self) {
        let mut inner = self.inner.lock();
        if self.seq < inner.head_seq {
            return;
        }
        let idx = (self.seq - inner.head_seq) as usize;
        if let Some(entry) = inner.pending.get_mut(idx) {
            if entry.remaining == 0 {
                return;
            }
            entry.remaining -= 1;
        }
        inner.drain_done();
    }

    /// Whether this unit has received all of its completions.
    pub fn is_done(&self) -> bool {
        let inner = self.inner.lock();
        if self.seq < inner.head_seq {
            return true;
        }
        let idx = (self.seq - inner.head_seq) as usize;
        inner.pending.get(idx).is_none_or(|e| e.remaining == 0)
    }
}
