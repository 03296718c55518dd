//! Error type shared by every trace buffer operation.
//!
//! Running out of channel space is not an error: it becomes an overrun on
//! the channel and never reaches the writer.

use thiserror::Error;

/// Errors returned by [`TraceBuffer`](crate::TraceBuffer) and its parts.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    /// A non-blocking read found no record that could be delivered yet.
    ///
    /// This is a normal outcome, not a failure.
    #[error("no record ready")]
    Empty,

    /// A blocking read was cancelled before a record became available.
    #[error("read interrupted")]
    Interrupted,

    /// A write named a channel the buffer does not have.
    #[error("invalid channel {channel} (buffer has {channels} channels)")]
    InvalidChannel { channel: usize, channels: usize },

    /// Reset or resize was attempted while a reader held the buffer.
    #[error("buffer busy: a reader is active")]
    Busy,

    /// Storage for a resize could not be reserved; the buffer is unchanged.
    #[error("cannot allocate {requested} bytes of channel storage")]
    Alloc { requested: usize },

    /// The configuration cannot describe a working buffer.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
