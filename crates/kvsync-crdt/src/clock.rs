//! Monotonic clock for LWW timestamps (component C2).
//!
//! One instance lives per [`crate::kvlog::KvLog`] — a process-wide clock
//! would let unrelated documents share the same skew, which a per-document
//! clock avoids.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Produces strictly increasing millisecond timestamps for local writes and
/// absorbs timestamps observed from remote replicas.
///
/// `last` is an `AtomicU64` even though the concurrency model (§5) is
/// single-threaded-cooperative per document: it costs nothing and documents
/// the thread-safety boundary explicitly at a seam that might later be
/// shared across tasks.
#[derive(Debug)]
pub struct Clock {
    last: AtomicU64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Create a clock with no prior observations.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Create a clock pre-seeded with a known starting point, e.g. after
    /// replaying a persisted log during KVLog initialization.
    pub fn with_last(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    fn wall_clock_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Returns `max(wall_clock_ms, last + 1)` and advances `last` to the
    /// returned value.
    ///
    /// Two same-millisecond local writes get distinct, ordered timestamps.
    /// Does not correct for clock skew beyond "take the max" — a replica
    /// whose clock is far in the future dominates until wall-clock catches
    /// up. Accepted limitation, not a bug.
    pub fn next(&self) -> u64 {
        let wall = Self::wall_clock_ms();
        let mut prev = self.last.load(AtomicOrdering::Relaxed);
        loop {
            let candidate = wall.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Folds an observed remote timestamp into `last` so that a peer whose
    /// clock was ahead is never beaten by stale local timestamps afterward.
    pub fn observe(&self, ts: u64) {
        self.last.fetch_max(ts, AtomicOrdering::Relaxed);
    }

    /// The most recent timestamp returned or observed.
    pub fn last(&self) -> u64 {
        self.last.load(AtomicOrdering::Relaxed)
    }
}
