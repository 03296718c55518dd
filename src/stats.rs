//! Point-in-time counters for a trace buffer and its channels.

use serde::Serialize;

/// Counters of a single channel.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub channel: usize,
    /// Storage size in bytes.
    pub capacity: usize,
    /// Bytes occupied by buffered frames (headers included).
    pub used_bytes: usize,
    /// Records currently buffered and not yet consumed.
    pub buffered: usize,
    /// Append attempts since the last counter reset.
    pub appends: u64,
    /// Records lost to capacity since the last counter reset.
    pub overruns: u64,
}

/// Counters of a whole buffer.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceStats {
    /// Bumped by every reset and resize.
    pub generation: u64,
    pub channels: Vec<ChannelStats>,
}

impl TraceStats {
    /// Sum of the per-channel overrun counters.
    pub fn lost(&self) -> u64 {
        self.channels.iter().map(|c| c.overruns).sum()
    }

    pub fn buffered(&self) -> usize {
        self.channels.iter().map(|c| c.buffered).sum()
    }

    pub fn appends(&self) -> u64 {
        self.channels.iter().map(|c| c.appends).sum()
    }
}
