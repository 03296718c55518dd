//! The trace buffer facade: N channels plus one ordered merger.
//!
//! ```text
//!  producer 0 ──write──► [Channel 0] ──┐
//!  producer 1 ──write──► [Channel 1] ──┼──► OrderedMerger ──read_oldest──► consumer
//!  producer N ──write──► [Channel N] ──┘
//! ```
//!
//! Producers share the buffer through `&TraceBuffer` (typically inside an
//! `Arc`) and only ever lock their own channel. The merger sits behind a
//! reader lock that the single consumer holds for the duration of a read,
//! including any waiting. `reset` and `resize` only try that lock, so they
//! fail with [`TraceError::Busy`] instead of pulling state out from under a
//! blocked reader.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::channel::{Channel, OverflowPolicy, Ring};
use crate::config::{validate_capacity, TraceConfig};
use crate::error::TraceError;
use crate::merger::OrderedMerger;
use crate::record::Record;
use crate::stats::TraceStats;
use crate::timestamp::{ClockSource, MonotonicClock};
use crate::wait::{CancelHandle, WakeSignal};

/// What `reset` does with the lost-record counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostCounter {
    /// Keep counting from the current value.
    Preserve,
    /// Start again from zero.
    Clear,
}

pub struct TraceBuffer {
    channels: Vec<Channel>,
    merger: Mutex<OrderedMerger>,
    signal: Arc<WakeSignal>,
    clock: Arc<dyn ClockSource>,
    policy: OverflowPolicy,
    capacity: AtomicUsize,
    generation: AtomicU64,
}

impl TraceBuffer {
    /// Create a buffer stamped by a fresh [`MonotonicClock`].
    pub fn new(config: &TraceConfig) -> Result<Self, TraceError> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: &TraceConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, TraceError> {
        config.validate()?;

        let channels = (0..config.channels)
            .map(|id| Channel::new(id, config.capacity, config.policy, Arc::clone(&clock)))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "trace buffer: {} channels x {} bytes, {:?} on overflow",
            config.channels,
            config.capacity,
            config.policy
        );

        Ok(Self {
            channels,
            merger: Mutex::new(OrderedMerger::new(
                config.channels,
                config.poll_interval(),
                config.empty_wait(),
            )),
            signal: Arc::new(WakeSignal::new()),
            clock,
            policy: config.policy,
            capacity: AtomicUsize::new(config.capacity),
            generation: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Append `payload` to `channel`, stamped with the current time.
    ///
    /// Never blocks on other channels and never fails for lack of space: a
    /// record that does not fit is accounted in [`lost_count`](Self::lost_count).
    /// Wakes a reader parked in [`read_oldest`](Self::read_oldest).
    pub fn write(&self, channel: usize, payload: &[u8]) -> Result<(), TraceError> {
        let target = self
            .channels
            .get(channel)
            .ok_or(TraceError::InvalidChannel {
                channel,
                channels: self.channels.len(),
            })?;
        if target.append_now(payload) {
            self.signal.notify();
        }
        Ok(())
    }

    // =========================================================================
    // Consumer side
    // =========================================================================

    fn reader(&self) -> MutexGuard<'_, OrderedMerger> {
        self.merger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reader lock for exclusive operations, or `Busy` if a read is running.
    fn quiesce(&self) -> Result<MutexGuard<'_, OrderedMerger>, TraceError> {
        match self.merger.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(TraceError::Busy),
        }
    }

    /// Remove and return the oldest record across all channels.
    ///
    /// With `blocking == false`, returns [`TraceError::Empty`] when no record
    /// can be delivered yet. With `blocking == true`, waits for one, or
    /// returns [`TraceError::Interrupted`] once a [`CancelHandle`] fires.
    pub fn read_oldest(&self, blocking: bool) -> Result<Record, TraceError> {
        self.reader().next(&self.channels, &self.signal, blocking)
    }

    /// `read_oldest` plus the generation the record belongs to, sampled
    /// under the reader lock so no reset can slip in between.
    pub(crate) fn read_tagged(&self, blocking: bool) -> Result<(Record, u64), TraceError> {
        let mut merger = self.reader();
        let record = merger.next(&self.channels, &self.signal, blocking)?;
        Ok((record, self.generation()))
    }

    /// Handle that interrupts blocking reads from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.signal))
    }

    /// Whether a reader is currently parked inside `read_oldest`.
    pub fn reader_waiting(&self) -> bool {
        self.signal.is_parked()
    }

    /// Whether a read is likely to make progress without waiting for a
    /// producer: some channel holds data or the merger holds a record.
    pub fn poll_readable(&self) -> bool {
        if self.channels.iter().any(|channel| !channel.is_empty()) {
            return true;
        }
        match self.merger.try_lock() {
            Ok(merger) => merger.cursors().iter().any(|cursor| cursor.is_pending()),
            Err(_) => false,
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Discard all buffered records and merge state.
    pub fn reset(&self, lost: LostCounter) -> Result<(), TraceError> {
        let mut merger = self.quiesce()?;

        for channel in &self.channels {
            channel.clear(lost == LostCounter::Clear);
        }
        merger.reset();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        log::info!("trace buffer reset (generation {}, {:?})", generation, lost);
        Ok(())
    }

    /// Replace every channel's storage with `capacity` bytes.
    ///
    /// All new storage is reserved before anything is touched; on
    /// [`TraceError::Alloc`] the buffer keeps its previous storage and
    /// content. On success buffered records are discarded; lost counters
    /// are kept.
    pub fn resize(&self, capacity: usize) -> Result<(), TraceError> {
        validate_capacity(capacity)?;
        let mut merger = self.quiesce()?;

        let storage = self
            .channels
            .iter()
            .map(|_| Ring::with_capacity(capacity))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                log::warn!("trace buffer resize to {} bytes failed: {}", capacity, err);
                err
            })?;

        for (channel, ring) in self.channels.iter().zip(storage) {
            channel.install(ring);
        }
        merger.reset();
        self.capacity.store(capacity, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        log::info!(
            "trace buffer resized to {} bytes per channel (generation {})",
            capacity,
            generation
        );
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Records lost to capacity, summed over all channels.
    pub fn lost_count(&self) -> u64 {
        self.channels.iter().map(Channel::overruns).sum()
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Storage per channel in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    /// Incremented by every successful `reset` and `resize`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            generation: self.generation(),
            channels: self.channels.iter().map(Channel::stats).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FRAME_HEADER_SIZE;
    use crate::timestamp::ManualClock;
    use std::thread;
    use std::time::{Duration, Instant};

    fn buffer(channels: usize, capacity: usize, policy: OverflowPolicy) -> (TraceBuffer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = TraceConfig::default()
            .with_channels(channels)
            .with_capacity(capacity)
            .with_policy(policy);
        (TraceBuffer::with_clock(&config, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn write_rejects_unknown_channel() {
        let (buf, _) = buffer(2, 1024, OverflowPolicy::Overwrite);
        assert_eq!(
            buf.write(2, b"x"),
            Err(TraceError::InvalidChannel {
                channel: 2,
                channels: 2
            })
        );
    }

    #[test]
    fn read_returns_copied_record() {
        let (buf, clock) = buffer(1, 1024, OverflowPolicy::Overwrite);
        clock.set(5);
        buf.write(0, b"hello").unwrap();
        clock.set(6);
        let record = buf.read_oldest(false).unwrap();
        assert_eq!(record.payload(), b"hello");
        assert_eq!(record.timestamp, 5);
        assert_eq!(record.channel, 0);
        assert_eq!(buf.read_oldest(false), Err(TraceError::Empty));
    }

    #[test]
    fn reset_preserves_or_clears_lost() {
        let (buf, clock) = buffer(1, FRAME_HEADER_SIZE + 1, OverflowPolicy::Drop);
        buf.write(0, b"a").unwrap();
        buf.write(0, b"b").unwrap();
        assert_eq!(buf.lost_count(), 1);

        buf.reset(LostCounter::Preserve).unwrap();
        assert_eq!(buf.lost_count(), 1);
        assert_eq!(buf.generation(), 1);
        clock.set(1);
        assert_eq!(buf.read_oldest(false), Err(TraceError::Empty));

        buf.reset(LostCounter::Clear).unwrap();
        assert_eq!(buf.lost_count(), 0);
        assert_eq!(buf.generation(), 2);
    }

    #[test]
    fn resize_discards_content() {
        let (buf, clock) = buffer(2, 256, OverflowPolicy::Overwrite);
        buf.write(0, b"gone").unwrap();
        buf.resize(512).unwrap();
        assert_eq!(buf.capacity(), 512);
        assert_eq!(buf.generation(), 1);
        clock.set(10);
        assert_eq!(buf.read_oldest(false), Err(TraceError::Empty));

        buf.write(1, b"new").unwrap();
        clock.set(11);
        assert_eq!(buf.read_oldest(false).unwrap().payload(), b"new");
    }

    #[test]
    fn resize_rejects_tiny_capacity_and_keeps_state() {
        let (buf, clock) = buffer(1, 256, OverflowPolicy::Overwrite);
        buf.write(0, b"kept").unwrap();
        assert!(matches!(buf.resize(1), Err(TraceError::InvalidConfig(_))));
        assert_eq!(buf.capacity(), 256);
        clock.set(1);
        assert_eq!(buf.read_oldest(false).unwrap().payload(), b"kept");
    }

    #[test]
    fn resize_failing_allocation_keeps_state() {
        let (buf, clock) = buffer(1, 256, OverflowPolicy::Overwrite);
        buf.write(0, b"kept").unwrap();
        assert!(matches!(
            buf.resize(usize::MAX),
            Err(TraceError::Alloc { .. })
        ));
        assert_eq!(buf.capacity(), 256);
        assert_eq!(buf.generation(), 0);
        clock.set(1);
        assert_eq!(buf.read_oldest(false).unwrap().payload(), b"kept");
    }

    #[test]
    fn control_operations_busy_while_reader_blocked() {
        let (buf, clock) = buffer(2, 1024, OverflowPolicy::Overwrite);
        let buf = Arc::new(buf);

        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.read_oldest(true))
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !buf.reader_waiting() {
            assert!(Instant::now() < deadline, "reader never parked");
            thread::yield_now();
        }

        assert_eq!(buf.resize(4096), Err(TraceError::Busy));
        assert_eq!(buf.reset(LostCounter::Clear), Err(TraceError::Busy));
        assert_eq!(buf.capacity(), 1024);

        clock.set(3);
        buf.write(1, b"wake").unwrap();
        clock.set(4);
        assert_eq!(reader.join().unwrap().unwrap().payload(), b"wake");

        buf.resize(4096).unwrap();
    }

    #[test]
    fn stats_track_channels() {
        let (buf, _) = buffer(2, 1024, OverflowPolicy::Overwrite);
        buf.write(0, b"a").unwrap();
        buf.write(1, b"b").unwrap();
        buf.write(1, b"c").unwrap();
        let stats = buf.stats();
        assert_eq!(stats.channels.len(), 2);
        assert_eq!(stats.buffered(), 3);
        assert_eq!(stats.appends(), 3);
        assert_eq!(stats.lost(), 0);
        assert!(buf.poll_readable());
    }
}
