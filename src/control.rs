//! File-like control surface around a [`TraceBuffer`].
//!
//! Exposes the buffer the way a small control directory would:
//!
//! | Entry           | Operation                                          |
//! |-----------------|----------------------------------------------------|
//! | `trace`         | [`TraceControl::open_trace`] → `io::Read` of lines |
//! | `reset`         | [`TraceControl::reset`]                            |
//! | `buffer_size`   | [`TraceControl::buffer_size`] / [`TraceControl::set_buffer_size`] |
//! | `lost_messages` | [`TraceControl::lost_messages`]                    |
//! | `counters`      | [`TraceControl::counters`]                         |
//!
//! Text entries end with a newline; numbers written to `buffer_size` follow
//! C `strtoul` base detection (`0x` hex, leading `0` octal, else decimal).

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::buffer::{LostCounter, TraceBuffer};
use crate::error::TraceError;
use crate::output::{render_stats, DefaultFormatter, RecordFormatter};

/// How reads of the `trace` entry behave when no record is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait for a record (`ErrorKind::Interrupted` on cancel).
    Blocking,
    /// Fail with `ErrorKind::WouldBlock`.
    NonBlocking,
}

impl From<TraceError> for io::Error {
    fn from(err: TraceError) -> Self {
        let kind = match err {
            TraceError::Empty => io::ErrorKind::WouldBlock,
            TraceError::Interrupted => io::ErrorKind::Interrupted,
            TraceError::InvalidChannel { .. } | TraceError::InvalidConfig(_) => {
                io::ErrorKind::InvalidInput
            }
            TraceError::Alloc { .. } => io::ErrorKind::OutOfMemory,
            TraceError::Busy => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub struct TraceControl {
    buffer: Arc<TraceBuffer>,
}

impl TraceControl {
    pub fn new(buffer: Arc<TraceBuffer>) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &Arc<TraceBuffer> {
        &self.buffer
    }

    /// Open the `trace` entry with the default line format.
    pub fn open_trace(&self, mode: ReadMode) -> TraceFile<DefaultFormatter> {
        self.open_trace_with(mode, DefaultFormatter)
    }

    pub fn open_trace_with<F: RecordFormatter>(&self, mode: ReadMode, formatter: F) -> TraceFile<F> {
        TraceFile {
            buffer: Arc::clone(&self.buffer),
            formatter,
            mode,
            line: Vec::new(),
            pos: 0,
            generation: self.buffer.generation(),
        }
    }

    /// Write every record that is ready, in order, without waiting.
    /// Returns the number of records written.
    pub fn dump<W: Write, F: RecordFormatter>(&self, out: &mut W, formatter: &F) -> io::Result<usize> {
        let mut count = 0;
        loop {
            match self.buffer.read_oldest(false) {
                Ok(record) => {
                    out.write_all(formatter.format_record(&record).as_bytes())?;
                    count += 1;
                }
                Err(TraceError::Empty) => return Ok(count),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Discard the trace and zero the lost counter.
    pub fn reset(&self) -> io::Result<()> {
        self.buffer.reset(LostCounter::Clear)?;
        Ok(())
    }

    /// Content of `buffer_size`: per-channel capacity in bytes.
    pub fn buffer_size(&self) -> String {
        format!("{}\n", self.buffer.capacity())
    }

    /// Write to `buffer_size`: parse a capacity and resize the buffer.
    ///
    /// Returns the number of input bytes consumed (all of them).
    pub fn set_buffer_size(&self, input: &[u8]) -> io::Result<usize> {
        if input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty size"));
        }
        let text = std::str::from_utf8(input)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let size = parse_ulong(text).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid buffer size {:?}", text.trim()),
            )
        })?;
        self.buffer.resize(size)?;
        Ok(input.len())
    }

    /// Content of `lost_messages`.
    pub fn lost_messages(&self) -> String {
        format!("{}\n", self.buffer.lost_count())
    }

    /// Content of `counters`.
    pub fn counters(&self) -> String {
        render_stats(&self.buffer.stats())
    }
}

/// Parse an unsigned integer with `strtoul(s, NULL, 0)` base rules.
pub fn parse_ulong(text: &str) -> Option<usize> {
    let text = text.trim();
    let text = text.strip_prefix('+').unwrap_or(text);
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    usize::from_str_radix(digits, radix).ok()
}

/// Reader of the `trace` entry.
///
/// Each record is rendered to one line; reads hand the line out in pieces of
/// whatever size the caller asks for. A line rendered before a reset or
/// resize is dropped rather than delivered after it.
///
/// `ErrorKind::Interrupted` is retried by helpers such as
/// `read_to_end`; call [`read`](Read::read) directly to observe
/// cancellation.
pub struct TraceFile<F> {
    buffer: Arc<TraceBuffer>,
    formatter: F,
    mode: ReadMode,
    line: Vec<u8>,
    pos: usize,
    generation: u64,
}

impl<F: RecordFormatter> TraceFile<F> {
    /// Whether a read would return data without waiting on a producer.
    pub fn poll_readable(&self) -> bool {
        (self.pos < self.line.len() && self.generation == self.buffer.generation())
            || self.buffer.poll_readable()
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    fn discard_stale(&mut self) {
        let current = self.buffer.generation();
        if current != self.generation {
            self.line.clear();
            self.pos = 0;
            self.generation = current;
        }
    }
}

impl<F: RecordFormatter> Read for TraceFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.discard_stale();

        while self.pos == self.line.len() {
            let (record, generation) = self
                .buffer
                .read_tagged(self.mode == ReadMode::Blocking)?;
            self.line = self.formatter.format_record(&record).into_bytes();
            self.pos = 0;
            self.generation = generation;
        }

        let n = buf.len().min(self.line.len() - self.pos);
        buf[..n].copy_from_slice(&self.line[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceConfig;
    use crate::timestamp::ManualClock;

    fn control(channels: usize) -> (TraceControl, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = TraceConfig::default()
            .with_channels(channels)
            .with_capacity(4096);
        let buffer = TraceBuffer::with_clock(&config, clock.clone()).unwrap();
        (TraceControl::new(Arc::new(buffer)), clock)
    }

    #[test]
    fn parse_ulong_bases() {
        assert_eq!(parse_ulong("4096"), Some(4096));
        assert_eq!(parse_ulong(" 4096\n"), Some(4096));
        assert_eq!(parse_ulong("0x1000"), Some(4096));
        assert_eq!(parse_ulong("010000"), Some(4096));
        assert_eq!(parse_ulong("0"), Some(0));
        assert_eq!(parse_ulong("+12"), Some(12));
        assert_eq!(parse_ulong("0x"), None);
        assert_eq!(parse_ulong("09"), None);
        assert_eq!(parse_ulong("-1"), None);
        assert_eq!(parse_ulong("12kb"), None);
        assert_eq!(parse_ulong(""), None);
    }

    #[test]
    fn trace_file_reads_lines_in_pieces() {
        let (ctl, clock) = control(2);
        clock.set(1_000);
        ctl.buffer().write(1, b"first").unwrap();
        clock.set(2_000_000_000);
        ctl.buffer().write(0, b"second").unwrap();
        clock.set(3_000_000_000);

        let mut file = ctl.open_trace(ReadMode::NonBlocking);
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            match file.read(&mut chunk) {
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[001]\t000000.000001:\tfirst\n[000]\t000002.000000:\tsecond\n"
        );
    }

    #[test]
    fn reset_drops_partially_read_line() {
        let (ctl, clock) = control(1);
        ctl.buffer().write(0, b"stale line").unwrap();
        clock.set(10);

        let mut file = ctl.open_trace(ReadMode::NonBlocking);
        let mut head = [0u8; 3];
        assert_eq!(file.read(&mut head).unwrap(), 3);

        ctl.reset().unwrap();
        let mut rest = [0u8; 64];
        let err = file.read(&mut rest).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn buffer_size_entry_round_trips() {
        let (ctl, _) = control(1);
        assert_eq!(ctl.buffer_size(), "4096\n");
        assert_eq!(ctl.set_buffer_size(b"0x2000\n").unwrap(), 7);
        assert_eq!(ctl.buffer_size(), "8192\n");

        assert_eq!(
            ctl.set_buffer_size(b"").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            ctl.set_buffer_size(b"lots").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            ctl.set_buffer_size(b"0").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(ctl.buffer_size(), "8192\n");
    }

    #[test]
    fn lost_messages_entry_and_reset() {
        let clock = Arc::new(ManualClock::new(0));
        let config = TraceConfig::default()
            .with_channels(1)
            .with_capacity(crate::channel::FRAME_HEADER_SIZE + 4)
            .with_policy(crate::channel::OverflowPolicy::Drop);
        let ctl = TraceControl::new(Arc::new(TraceBuffer::with_clock(&config, clock).unwrap()));

        ctl.buffer().write(0, b"fits").unwrap();
        ctl.buffer().write(0, b"lost").unwrap();
        ctl.buffer().write(0, b"lost").unwrap();
        assert_eq!(ctl.lost_messages(), "2\n");

        ctl.reset().unwrap();
        assert_eq!(ctl.lost_messages(), "0\n");
    }

    #[test]
    fn dump_writes_ready_records() {
        let (ctl, clock) = control(2);
        clock.set(1);
        ctl.buffer().write(0, b"a").unwrap();
        clock.set(2);
        ctl.buffer().write(1, b"b").unwrap();
        clock.set(3);

        let mut out = Vec::new();
        let fmt = |p: &[u8], c: usize, t: u64| format!("{c}:{t}:{}\n", String::from_utf8_lossy(p));
        assert_eq!(ctl.dump(&mut out, &fmt).unwrap(), 2);
        assert_eq!(out, b"0:1:a\n1:2:b\n");
    }

    #[test]
    fn counters_entry_lists_channels() {
        let (ctl, _) = control(2);
        let text = ctl.counters();
        assert!(text.contains("channel 0:"));
        assert!(text.contains("channel 1:"));
        assert!(text.contains("total:"));
    }
}
