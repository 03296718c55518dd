//! Reader parking and cancellation.
//!
//! The consumer is the only thread that ever sleeps. It parks on a condition
//! variable; producers wake it after appending, and a [`CancelHandle`] wakes
//! it with a cancellation.
//!
//! Producers only touch the condition variable's mutex while a reader is
//! actually parked, so the common write path is one fence and one relaxed
//! load. The parked flag and the channel contents form a Dekker pair: the
//! reader publishes `parked` then re-checks the channels, the producer
//! publishes its record then checks `parked`, with a full fence on both
//! sides. At least one of them sees the other, so a wakeup cannot be lost.
//!
//! # Cancellation
//!
//! Every read runs under a [`ReadTicket`] carrying a sequence number: odd
//! while the read is in flight, bumped to even when it ends. A cancel records
//! the sequence it observed, and only the read holding that sequence reacts
//! to it. A cancel that lands after a read started but before it parked is
//! still seen at the park; a cancel with no read in flight matches nothing.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::TraceError;

pub(crate) struct WakeSignal {
    parked: AtomicBool,
    /// Read sequence; odd while a read is in flight.
    reads: AtomicU64,
    /// Sequence of the most recently cancelled read.
    cancelled: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WakeSignal {
    pub(crate) fn new() -> Self {
        Self {
            parked: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer side: wake a parked reader, if there is one.
    #[inline]
    pub(crate) fn notify(&self) {
        fence(Ordering::SeqCst);
        if self.parked.load(Ordering::Relaxed) {
            let _guard = self.guard();
            self.cond.notify_all();
        }
    }

    /// Start a read. Only one read may be in flight at a time; the caller
    /// serializes reads.
    pub(crate) fn begin_read(&self) -> ReadTicket<'_> {
        let seq = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(seq % 2 == 1, "overlapping reads");
        ReadTicket { signal: self, seq }
    }

    /// Cancel the read currently in flight. Returns `false` if there was
    /// none, in which case nothing happens.
    pub(crate) fn cancel(&self) -> bool {
        let seq = self.reads.load(Ordering::SeqCst);
        if seq % 2 == 0 {
            return false;
        }
        self.cancelled.fetch_max(seq, Ordering::SeqCst);
        let _guard = self.guard();
        self.cond.notify_all();
        true
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Relaxed)
    }
}

/// A read in flight. Ends the read when dropped.
pub(crate) struct ReadTicket<'a> {
    signal: &'a WakeSignal,
    seq: u64,
}

impl ReadTicket<'_> {
    fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::SeqCst) == self.seq
    }

    /// Park until `ready` holds, a producer or canceller wakes us, or
    /// `timeout` elapses. Returns `Interrupted` once this read has been
    /// cancelled, whether before or during the park.
    ///
    /// Wakeups may be spurious: callers re-evaluate their condition.
    pub(crate) fn park_until(
        &self,
        timeout: Duration,
        ready: impl FnOnce() -> bool,
    ) -> Result<(), TraceError> {
        let signal = self.signal;
        let guard = signal.guard();
        signal.parked.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let result = if self.is_cancelled() {
            Err(TraceError::Interrupted)
        } else if ready() {
            Ok(())
        } else {
            let (_guard, _timeout) = signal
                .cond
                .wait_timeout(guard, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            if self.is_cancelled() {
                Err(TraceError::Interrupted)
            } else {
                Ok(())
            }
        };

        signal.parked.store(false, Ordering::SeqCst);
        result
    }
}

impl Drop for ReadTicket<'_> {
    fn drop(&mut self) {
        self.signal.reads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cancels blocking reads of a [`TraceBuffer`](crate::TraceBuffer) from
/// another thread.
///
/// A cancel applies to the read in flight when it is issued, which then
/// returns [`TraceError::Interrupted`] at its next wait. It is not
/// remembered: with no read in flight, `cancel` does nothing and later reads
/// are unaffected.
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<WakeSignal>,
}

impl CancelHandle {
    pub(crate) fn new(signal: Arc<WakeSignal>) -> Self {
        Self { signal }
    }

    /// Interrupt the read in flight. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        let hit = self.signal.cancel();
        log::debug!("trace read cancellation requested (read in flight: {})", hit);
        hit
    }
}
