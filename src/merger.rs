//! Single-consumer merge of per-channel streams into global timestamp order.
//!
//! Every channel is FIFO in timestamp order on its own, so the globally
//! oldest record is always the head of some channel. The difficulty is an
//! *empty* channel: it might still receive a record older than every head
//! currently visible. The merger keeps one [`ChannelCursor`] per channel and
//! only delivers a record once every empty channel has proven, through its
//! floor, that nothing earlier can still show up there.
//!
//! # Algorithm
//!
//! ```text
//!   probe empty cursors ──► all empty? ──yes──► park until a write
//!          ▲                    │no
//!          │                    ▼
//!          │        oldest pending (ts, lowest channel id)
//!          │                    │
//!          │        min floor of empty cursors > ts ? ──yes──► deliver
//!          │                    │no
//!          └── re-probe blockers ◄── sleep one poll interval
//! ```
//!
//! A delivered record leaves its cursor `KnownEmptyAsOf(record.timestamp)`,
//! which is a valid floor for that channel and forces a re-probe on the
//! next call.

use std::time::Duration;

use crate::channel::Channel;
use crate::error::TraceError;
use crate::record::Record;
use crate::wait::WakeSignal;

/// Most recently observed state of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCursor {
    /// A record pulled out of the channel and not yet delivered.
    Pending(Record),
    /// The channel was empty; no future record on it can be older than this.
    KnownEmptyAsOf(u64),
}

impl ChannelCursor {
    pub fn floor(&self) -> Option<u64> {
        match self {
            ChannelCursor::KnownEmptyAsOf(ts) => Some(*ts),
            ChannelCursor::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ChannelCursor::Pending(_))
    }
}

/// Outcome of comparing the cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// No cursor holds a record.
    AllEmpty,
    /// This channel's pending record is the global oldest.
    Deliver(usize),
    /// An empty channel's floor does not exceed the oldest pending record.
    Undecided { oldest_ts: u64 },
}

pub(crate) struct OrderedMerger {
    cursors: Vec<ChannelCursor>,
    poll_interval: Duration,
    empty_wait: Duration,
}

impl OrderedMerger {
    pub(crate) fn new(channels: usize, poll_interval: Duration, empty_wait: Duration) -> Self {
        Self {
            cursors: vec![ChannelCursor::KnownEmptyAsOf(0); channels],
            poll_interval,
            empty_wait,
        }
    }

    pub(crate) fn cursors(&self) -> &[ChannelCursor] {
        &self.cursors
    }

    /// Forget every pending record and floor.
    pub(crate) fn reset(&mut self) {
        for cursor in &mut self.cursors {
            *cursor = ChannelCursor::KnownEmptyAsOf(0);
        }
    }

    /// Re-check one empty channel.
    fn probe(&mut self, channels: &[Channel], idx: usize) {
        let ChannelCursor::KnownEmptyAsOf(floor) = self.cursors[idx] else {
            return;
        };
        let channel = &channels[idx];
        self.cursors[idx] = match channel.try_consume(Some(floor)) {
            Some(record) => ChannelCursor::Pending(record),
            None => ChannelCursor::KnownEmptyAsOf(channel.current_time_floor().max(floor)),
        };
    }

    /// Re-probe empty cursors, or only those whose floor is `<= below`.
    fn refresh(&mut self, channels: &[Channel], below: Option<u64>) {
        for idx in 0..self.cursors.len() {
            match (self.cursors[idx].floor(), below) {
                (Some(floor), Some(limit)) if floor > limit => {}
                (Some(_), _) => self.probe(channels, idx),
                (None, _) => {}
            }
        }
    }

    fn decide(&self) -> Decision {
        let mut oldest: Option<(u64, usize)> = None;
        let mut floor_min: Option<u64> = None;

        for (idx, cursor) in self.cursors.iter().enumerate() {
            match cursor {
                // Ascending scan with strict `<` keeps the lowest id on ties.
                ChannelCursor::Pending(record) => {
                    if oldest.map_or(true, |(ts, _)| record.timestamp < ts) {
                        oldest = Some((record.timestamp, idx));
                    }
                }
                ChannelCursor::KnownEmptyAsOf(floor) => {
                    floor_min = Some(floor_min.map_or(*floor, |min| min.min(*floor)));
                }
            }
        }

        match (oldest, floor_min) {
            (None, _) => Decision::AllEmpty,
            (Some((_, idx)), None) => Decision::Deliver(idx),
            (Some((ts, idx)), Some(floor)) if floor > ts => Decision::Deliver(idx),
            (Some((ts, _)), Some(_)) => Decision::Undecided { oldest_ts: ts },
        }
    }

    fn take(&mut self, idx: usize) -> Record {
        let cursor = &mut self.cursors[idx];
        match std::mem::replace(cursor, ChannelCursor::KnownEmptyAsOf(0)) {
            ChannelCursor::Pending(record) => {
                *cursor = ChannelCursor::KnownEmptyAsOf(record.timestamp);
                record
            }
            ChannelCursor::KnownEmptyAsOf(_) => unreachable!("delivering from an empty cursor"),
        }
    }

    /// Channels whose emptiness currently blocks delivery of `oldest_ts`.
    fn blockers(&self, oldest_ts: u64) -> Vec<usize> {
        self.cursors
            .iter()
            .enumerate()
            .filter(|(_, cursor)| cursor.floor().is_some_and(|floor| floor <= oldest_ts))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Deliver the globally oldest record.
    ///
    /// Non-blocking calls return [`TraceError::Empty`] when nothing can be
    /// delivered yet. Blocking calls wait, and return
    /// [`TraceError::Interrupted`] if cancelled while waiting.
    pub(crate) fn next(
        &mut self,
        channels: &[Channel],
        signal: &WakeSignal,
        blocking: bool,
    ) -> Result<Record, TraceError> {
        let ticket = signal.begin_read();
        self.refresh(channels, None);

        loop {
            match self.decide() {
                Decision::Deliver(idx) => return Ok(self.take(idx)),
                Decision::AllEmpty => {
                    if !blocking {
                        return Err(TraceError::Empty);
                    }
                    log::trace!("all channels empty, parking reader");
                    ticket.park_until(self.empty_wait, || {
                        channels.iter().any(|channel| !channel.is_empty())
                    })?;
                    self.refresh(channels, None);
                }
                Decision::Undecided { oldest_ts } => {
                    if !blocking {
                        return Err(TraceError::Empty);
                    }
                    let blockers = self.blockers(oldest_ts);
                    log::trace!(
                        "record at {} waits on floors of channels {:?}",
                        oldest_ts,
                        blockers
                    );
                    ticket.park_until(self.poll_interval, || {
                        blockers.iter().any(|&idx| !channels[idx].is_empty())
                    })?;
                    self.refresh(channels, Some(oldest_ts));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OverflowPolicy;
    use crate::timestamp::ManualClock;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn setup(n: usize) -> (Vec<Channel>, Arc<ManualClock>, OrderedMerger, WakeSignal) {
        let clock = Arc::new(ManualClock::new(0));
        let channels = (0..n)
            .map(|id| Channel::new(id, 4096, OverflowPolicy::Overwrite, clock.clone()).unwrap())
            .collect();
        let merger = OrderedMerger::new(n, Duration::from_millis(1), Duration::from_millis(50));
        (channels, clock, merger, WakeSignal::new())
    }

    fn write(channels: &[Channel], clock: &ManualClock, ch: usize, ts: u64, msg: &str) {
        clock.set(ts);
        assert!(channels[ch].append_now(msg.as_bytes()));
    }

    #[test]
    fn delivers_in_timestamp_order() {
        let (channels, clock, mut merger, signal) = setup(2);
        write(&channels, &clock, 0, 1, "A");
        write(&channels, &clock, 1, 2, "B");
        write(&channels, &clock, 0, 3, "C");
        clock.set(4);

        for expected in ["A", "B", "C"] {
            let record = merger.next(&channels, &signal, false).unwrap();
            assert_eq!(record.payload(), expected.as_bytes());
        }
        assert_eq!(merger.next(&channels, &signal, false), Err(TraceError::Empty));
    }

    #[test]
    fn ties_go_to_lowest_channel() {
        let (channels, clock, mut merger, signal) = setup(3);
        write(&channels, &clock, 2, 5, "two");
        write(&channels, &clock, 0, 5, "zero");
        write(&channels, &clock, 1, 5, "one");
        clock.set(6);

        let order: Vec<usize> = (0..3)
            .map(|_| merger.next(&channels, &signal, false).unwrap().channel)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn empty_channel_floor_withholds_delivery() {
        let (channels, clock, mut merger, signal) = setup(2);
        write(&channels, &clock, 1, 10, "B");

        // Channel 0 is empty and its floor is 10: a record at 10 could still
        // arrive there and would sort first.
        assert_eq!(merger.next(&channels, &signal, false), Err(TraceError::Empty));
        assert!(merger.cursors()[1].is_pending());
        assert_eq!(merger.cursors()[0].floor(), Some(10));

        clock.set(11);
        let record = merger.next(&channels, &signal, false).unwrap();
        assert_eq!(record.payload(), b"B");
    }

    #[test]
    fn record_on_idle_channel_resolves_ambiguity() {
        let (channels, clock, mut merger, signal) = setup(2);
        write(&channels, &clock, 1, 10, "late");
        assert_eq!(merger.next(&channels, &signal, false), Err(TraceError::Empty));

        // Channel 0 catches up with a record stamped at the same time.
        assert!(channels[0].append(b"early", 10));
        let first = merger.next(&channels, &signal, false).unwrap();
        assert_eq!(first.payload(), b"early");
    }

    #[test]
    fn blocking_read_resolves_when_floor_advances() {
        let (channels, clock, mut merger, signal) = setup(2);
        write(&channels, &clock, 1, 10, "B");

        let ticker = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                clock.set(11);
            })
        };

        let record = merger.next(&channels, &signal, true).unwrap();
        assert_eq!(record.payload(), b"B");
        ticker.join().unwrap();
    }

    #[test]
    fn blocking_read_interrupted_while_undecided() {
        let (channels, clock, mut merger, signal) = setup(2);
        write(&channels, &clock, 1, 10, "B");
        let channels = Arc::new(channels);
        let signal = Arc::new(signal);

        // The clock stays at 10, so channel 0's floor never passes "B".
        let reader = {
            let channels = Arc::clone(&channels);
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let result = merger.next(&channels, &signal, true);
                (result, merger)
            })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !signal.is_parked() {
            assert!(Instant::now() < deadline, "reader never parked");
            thread::yield_now();
        }
        let cancelled_at = Instant::now();
        assert!(signal.cancel());

        let (result, mut merger) = reader.join().unwrap();
        assert_eq!(result, Err(TraceError::Interrupted));
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert!(merger.cursors()[1].is_pending());

        // The pending record survives the interruption.
        clock.set(11);
        assert_eq!(merger.next(&channels, &signal, false).unwrap().payload(), b"B");
    }

    #[test]
    fn delivered_cursor_is_reprobed() {
        let (channels, clock, mut merger, signal) = setup(1);
        write(&channels, &clock, 0, 1, "x");
        merger.next(&channels, &signal, false).unwrap();
        assert_eq!(merger.cursors()[0], ChannelCursor::KnownEmptyAsOf(1));

        write(&channels, &clock, 0, 2, "y");
        assert_eq!(merger.next(&channels, &signal, false).unwrap().payload(), b"y");
    }

    #[test]
    fn reset_forgets_pending_records() {
        let (channels, clock, mut merger, signal) = setup(2);
        write(&channels, &clock, 1, 10, "B");
        let _ = merger.next(&channels, &signal, false);
        assert!(merger.cursors()[1].is_pending());

        merger.reset();
        assert!(merger.cursors().iter().all(|c| !c.is_pending()));
        assert_eq!(merger.next(&channels, &signal, false), Err(TraceError::Empty));
    }
}
