//! Timestamp sources for trace records.
//!
//! Every channel of a buffer is stamped from one shared [`ClockSource`]. The
//! merge relies on a single property of that source: a reading taken after
//! another reading (on any thread) is never smaller. Cross-channel ordering
//! and the empty-channel floors are both derived from it.
//!
//! # Sources
//!
//! - [`MonotonicClock`]: nanoseconds since the clock was created, backed by
//!   [`std::time::Instant`]. Readings are made strictly increasing so two
//!   calls never return the same value.
//! - [`ManualClock`]: a counter that only moves when told to. Used by tests
//!   that need exact timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonically non-decreasing 64-bit time counter.
///
/// Implementations must be callable from any thread, must never block and
/// must never go backwards.
pub trait ClockSource: Send + Sync {
    /// Current time in clock units (nanoseconds for the provided clocks).
    fn now(&self) -> u64;
}

// =============================================================================
// Monotonic Clock
// =============================================================================

/// Wall-independent nanosecond clock.
///
/// The raw `Instant` reading is folded through `last` so the sequence of
/// values handed out is strictly increasing even when two threads read the
/// clock within the same nanosecond.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    #[inline]
    fn now(&self) -> u64 {
        let raw = self.origin.elapsed().as_nanos() as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = raw.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => prev = current,
            }
        }
    }
}

// =============================================================================
// Manual Clock
// =============================================================================

/// A clock driven explicitly by its owner.
///
/// `set` refuses to move backwards, so the clock stays monotonic no matter
/// how a test drives it.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock to `ts`. Earlier values are ignored.
    pub fn set(&self, ts: u64) {
        self.now.fetch_max(ts, Ordering::AcqRel);
    }

    /// Move the clock forward by `delta` units and return the new time.
    pub fn advance(&self, delta: u64) -> u64 {
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

impl ClockSource for ManualClock {
    #[inline]
    fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
