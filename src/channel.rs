//! Per-producer circular buffer of framed trace records.
//!
//! Each producer owns exactly one [`Channel`]. The channel stores records as
//! length-prefixed frames in a fixed byte array, so variable-length payloads
//! share one pre-reserved allocation and appends never allocate.
//!
//! # Design
//!
//! - Fixed capacity reserved at creation (or resize), never grown
//! - Single writer (the owning producer), single reader (the merger)
//! - A per-channel spinlock guards the indices; it is only ever contended
//!   between one producer and the consumer, never across channels
//! - The consumer holds it only for index updates and the payload copy:
//!   payload storage is reserved and the clock read with the lock released
//! - Overwrite mode evicts the oldest frames, drop mode discards the newest;
//!   both count the loss in `overruns`
//!
//! # Frame Layout
//!
//! ```text
//! +-------------+--------------------+---------------------+
//! | len (u32le) | timestamp (u64le)  | payload (len bytes) |
//! +-------------+--------------------+---------------------+
//! ```
//!
//! Frames wrap around the end of the byte array; header and payload may be
//! split across the boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::error::TraceError;
use crate::record::Record;
use crate::stats::ChannelStats;
use crate::timestamp::ClockSource;

// =============================================================================
// Configuration
// =============================================================================

/// Bytes of framing stored in front of every payload.
pub const FRAME_HEADER_SIZE: usize = 4 + 8;

/// What a full channel does with a record that does not fit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Evict the oldest unread records until the new one fits.
    #[default]
    Overwrite,
    /// Keep the buffered records and discard the new one.
    Drop,
}

// =============================================================================
// Byte Ring
// =============================================================================

/// Raw storage and indices of one channel. Always accessed under the lock.
pub(crate) struct Ring {
    data: Box<[u8]>,
    /// Offset of the oldest frame.
    head: usize,
    /// Bytes currently occupied by frames.
    used: usize,
    /// Number of frames currently stored.
    records: usize,
    /// Timestamp of the newest frame ever appended.
    last_ts: u64,
    /// Highest time at which the channel was seen empty.
    observed_ts: u64,
}

impl Ring {
    /// Reserve `capacity` bytes, reporting allocation failure instead of
    /// aborting.
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self, TraceError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| TraceError::Alloc {
                requested: capacity,
            })?;
        data.resize(capacity, 0);

        Ok(Self {
            data: data.into_boxed_slice(),
            head: 0,
            used: 0,
            records: 0,
            last_ts: 0,
            observed_ts: 0,
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn free(&self) -> usize {
        self.capacity() - self.used
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        let cap = self.capacity();
        let start = offset % cap;
        let first = bytes.len().min(cap - start);
        self.data[start..start + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    }

    fn read_at(&self, offset: usize, out: &mut [u8]) {
        let cap = self.capacity();
        let start = offset % cap;
        let first = out.len().min(cap - start);
        out[..first].copy_from_slice(&self.data[start..start + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&self.data[..rest]);
    }

    /// Length and timestamp of the oldest frame.
    fn head_header(&self) -> Option<(usize, u64)> {
        if self.records == 0 {
            return None;
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.read_at(self.head, &mut header);
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&header[4..]);
        Some((len, u64::from_le_bytes(ts)))
    }

    fn push_back(&mut self, payload: &[u8], ts: u64) {
        let tail = self.head + self.used;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[4..].copy_from_slice(&ts.to_le_bytes());

        self.write_at(tail, &header);
        self.write_at(tail + FRAME_HEADER_SIZE, payload);

        self.used += FRAME_HEADER_SIZE + payload.len();
        self.records += 1;
        self.last_ts = ts;
    }

    fn advance_head(&mut self, frame_len: usize) {
        self.head = (self.head + frame_len) % self.capacity();
        self.used -= frame_len;
        self.records -= 1;
        if self.records == 0 {
            self.head = 0;
        }
    }

    /// Drop the oldest frame without copying it out.
    fn discard_front(&mut self) -> bool {
        match self.head_header() {
            Some((len, _)) => {
                self.advance_head(FRAME_HEADER_SIZE + len);
                true
            }
            None => false,
        }
    }

    /// Copy the oldest payload into `out` and drop its frame. `out` must be
    /// exactly the length announced by [`head_header`](Self::head_header).
    fn take_front(&mut self, out: &mut [u8]) {
        self.read_at(self.head + FRAME_HEADER_SIZE, out);
        self.advance_head(FRAME_HEADER_SIZE + out.len());
    }

    fn clear(&mut self) {
        self.head = 0;
        self.used = 0;
        self.records = 0;
    }

    /// Carry the time bookkeeping of `old` over so floors never regress.
    fn inherit_time(&mut self, old: &Ring) {
        self.last_ts = self.last_ts.max(old.last_ts);
        self.observed_ts = self.observed_ts.max(old.observed_ts);
    }
}

// =============================================================================
// Channel
// =============================================================================

/// One producer's private trace buffer.
///
/// # Thread Safety
///
/// - **Single writer**: only the owning producer appends
/// - **Single reader**: only the merger consumes
/// - Counters are atomics and may be read from anywhere
pub struct Channel {
    id: usize,
    policy: OverflowPolicy,
    ring: Mutex<Ring>,
    /// Records lost to capacity (evicted or dropped).
    overruns: AtomicU64,
    /// Append attempts, successful or not.
    appends: AtomicU64,
    clock: Arc<dyn ClockSource>,
}

impl Channel {
    pub fn new(
        id: usize,
        capacity: usize,
        policy: OverflowPolicy,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, TraceError> {
        if capacity == 0 {
            return Err(TraceError::InvalidConfig("channel capacity must be non-zero"));
        }
        Ok(Self {
            id,
            policy,
            ring: Mutex::new(Ring::with_capacity(capacity)?),
            overruns: AtomicU64::new(0),
            appends: AtomicU64::new(0),
            clock,
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Store a framed copy of `payload` stamped with `ts`.
    ///
    /// Timestamps lower than the newest one already appended are raised to it
    /// so the channel stays in FIFO = timestamp order. Returns whether the
    /// record was stored; a record that could not be stored is counted as an
    /// overrun.
    pub fn append(&self, payload: &[u8], ts: u64) -> bool {
        let mut ring = self.ring.lock();
        self.push_locked(&mut ring, payload, ts)
    }

    /// Like [`append`](Self::append), reading the timestamp from the
    /// channel's clock while the channel is locked.
    ///
    /// Stamping under the lock means a floor published by
    /// [`current_time_floor`](Self::current_time_floor) can never be
    /// undercut by a record that was stamped earlier but stored later.
    pub fn append_now(&self, payload: &[u8]) -> bool {
        let mut ring = self.ring.lock();
        let ts = self.clock.now();
        self.push_locked(&mut ring, payload, ts)
    }

    fn push_locked(&self, ring: &mut Ring, payload: &[u8], ts: u64) -> bool {
        self.appends.fetch_add(1, Ordering::Relaxed);

        let needed = FRAME_HEADER_SIZE + payload.len();
        if payload.len() > u32::MAX as usize || needed > ring.capacity() {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if needed > ring.free() {
            match self.policy {
                OverflowPolicy::Drop => {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                OverflowPolicy::Overwrite => {
                    let mut evicted = 0;
                    while needed > ring.free() && ring.discard_front() {
                        evicted += 1;
                    }
                    self.overruns.fetch_add(evicted, Ordering::Relaxed);
                }
            }
        }

        let ts = ts.max(ring.last_ts);
        ring.push_back(payload, ts);
        true
    }

    /// Remove and return the oldest buffered record.
    ///
    /// `hint_ts` does not filter anything; when the channel turns out to be
    /// empty it raises the channel's observed time.
    ///
    /// The payload copy is reserved with the lock released, so the producer
    /// never waits on the allocator. An overwriting producer may replace the
    /// head frame in the meantime; the length is re-checked and the
    /// reservation grown until it fits.
    pub fn try_consume(&self, hint_ts: Option<u64>) -> Option<Record> {
        let mut payload = Vec::new();
        loop {
            let mut ring = self.ring.lock();
            let Some((len, ts)) = ring.head_header() else {
                if let Some(hint) = hint_ts {
                    ring.observed_ts = ring.observed_ts.max(hint);
                }
                return None;
            };
            if len <= payload.capacity() {
                payload.resize(len, 0);
                ring.take_front(&mut payload);
                drop(ring);
                return Some(Record::new(self.id, ts, payload));
            }
            drop(ring);
            payload.reserve_exact(len);
        }
    }

    /// Lower bound on the timestamp of every record not yet consumed.
    ///
    /// For an empty channel this is the current clock reading (never below
    /// anything appended or observed before); otherwise it is the timestamp
    /// of the oldest buffered record.
    pub fn current_time_floor(&self) -> u64 {
        // Sampled before locking. A write stamped below `now` read the clock
        // while holding the lock, so it is stored by the time we acquire it.
        let now = self.clock.now();
        let mut ring = self.ring.lock();
        if let Some((_, ts)) = ring.head_header() {
            return ts;
        }
        ring.observed_ts = ring.observed_ts.max(ring.last_ts).max(now);
        ring.observed_ts
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().records == 0
    }

    /// Total records lost to capacity since the last counter reset.
    #[inline]
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Discard every buffered record; optionally zero the counters.
    pub(crate) fn clear(&self, clear_counters: bool) {
        self.ring.lock().clear();
        if clear_counters {
            self.overruns.store(0, Ordering::Relaxed);
            self.appends.store(0, Ordering::Relaxed);
        }
    }

    /// Swap in freshly reserved storage, discarding buffered records.
    pub(crate) fn install(&self, mut storage: Ring) {
        let mut ring = self.ring.lock();
        storage.inherit_time(&ring);
        *ring = storage;
    }

    pub fn stats(&self) -> ChannelStats {
        let ring = self.ring.lock();
        ChannelStats {
            channel: self.id,
            capacity: ring.capacity(),
            used_bytes: ring.used,
            buffered: ring.records,
            appends: self.appends.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}
