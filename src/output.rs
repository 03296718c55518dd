//! Rendering records and counters as text.
//!
//! # Record Format
//!
//! [`DefaultFormatter`] renders one line per record, tab separated:
//!
//! ```text
//! [000]	000000.000001:	A
//! [001]	000012.345678:	worker started
//! ```
//!
//! Channel id zero-padded to three digits, timestamp split into seconds and
//! microseconds (timestamps are nanoseconds), both zero-padded to six digits,
//! payload as text up to the first NUL byte.
//!
//! # Counter Format
//!
//! ```text
//! # generation 2
//! channel 0: capacity=65536 used=120 buffered=3 appends=10 overruns=0
//! total: buffered=3 appends=10 lost=0
//! ```

use core::fmt::Write;

use crate::record::Record;
use crate::stats::TraceStats;

/// Turns one record into display text.
///
/// Implemented for any `Fn(&[u8], usize, u64) -> String`, so closures can be
/// passed wherever a formatter is expected.
pub trait RecordFormatter {
    fn format(&self, payload: &[u8], channel: usize, timestamp: u64) -> String;

    fn format_record(&self, record: &Record) -> String {
        self.format(record.payload(), record.channel, record.timestamp)
    }
}

impl<F> RecordFormatter for F
where
    F: Fn(&[u8], usize, u64) -> String,
{
    fn format(&self, payload: &[u8], channel: usize, timestamp: u64) -> String {
        self(payload, channel, timestamp)
    }
}

/// `[CCC]\tSSSSSS.UUUUUU:\tmessage\n`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFormatter;

impl RecordFormatter for DefaultFormatter {
    fn format(&self, payload: &[u8], channel: usize, timestamp: u64) -> String {
        let secs = timestamp / 1_000_000_000;
        let micros = (timestamp % 1_000_000_000) / 1_000;
        format!(
            "[{:03}]\t{:06}.{:06}:\t{}\n",
            channel,
            secs,
            micros,
            payload_text(payload)
        )
    }
}

/// Payload as text: cut at the first NUL, invalid UTF-8 replaced.
pub fn payload_text(payload: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end])
}

/// Render buffer counters in the line format documented above.
pub fn render_stats(stats: &TraceStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# generation {}", stats.generation);
    for ch in &stats.channels {
        let _ = writeln!(
            out,
            "channel {}: capacity={} used={} buffered={} appends={} overruns={}",
            ch.channel, ch.capacity, ch.used_bytes, ch.buffered, ch.appends, ch.overruns
        );
    }
    let _ = writeln!(
        out,
        "total: buffered={} appends={} lost={}",
        stats.buffered(),
        stats.appends(),
        stats.lost()
    );
    out
}
