//! Buffer configuration.
//!
//! All fields have defaults, so a configuration file only needs to name what
//! it changes:
//!
//! ```json
//! { "channels": 4, "capacity": 131072, "policy": "drop" }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{OverflowPolicy, FRAME_HEADER_SIZE};
use crate::error::TraceError;

/// Default per-channel storage size in bytes.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Default sleep between re-probes of an empty channel whose floor is not
/// yet past the oldest pending record.
pub const DEFAULT_POLL_INTERVAL_US: u64 = 1_000;

/// Default upper bound on one park while every channel is empty.
pub const DEFAULT_EMPTY_WAIT_MS: u64 = 500;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// Number of channels (producers).
    pub channels: usize,
    /// Storage per channel in bytes.
    pub capacity: usize,
    pub policy: OverflowPolicy,
    /// Floor re-probe interval while ordering is undecided, in microseconds.
    pub poll_interval_us: u64,
    /// Longest single park while all channels are empty, in milliseconds.
    /// Producers wake the reader earlier; this only bounds missed wakeups.
    pub empty_wait_ms: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            channels: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            capacity: DEFAULT_CAPACITY,
            policy: OverflowPolicy::default(),
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            empty_wait_ms: DEFAULT_EMPTY_WAIT_MS,
        }
    }
}

impl TraceConfig {
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_us = interval.as_micros() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn empty_wait(&self) -> Duration {
        Duration::from_millis(self.empty_wait_ms)
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        if self.channels == 0 {
            return Err(TraceError::InvalidConfig("at least one channel is required"));
        }
        validate_capacity(self.capacity)?;
        if self.poll_interval_us == 0 {
            return Err(TraceError::InvalidConfig("poll interval must be non-zero"));
        }
        if self.empty_wait_ms == 0 {
            return Err(TraceError::InvalidConfig("empty wait must be non-zero"));
        }
        Ok(())
    }
}

/// A channel must hold at least one empty record.
pub(crate) fn validate_capacity(capacity: usize) -> Result<(), TraceError> {
    if capacity < FRAME_HEADER_SIZE {
        return Err(TraceError::InvalidConfig(
            "capacity is smaller than one record header",
        ));
    }
    Ok(())
}
