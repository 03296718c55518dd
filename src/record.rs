//! The unit handed from producers to the consumer.

use core::fmt;

/// One timestamped event payload.
///
/// A `Record` is an owned copy: once it leaves its channel the slot it came
/// from may be overwritten immediately.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    /// Clock reading taken when the producer appended the record.
    pub timestamp: u64,
    /// Index of the channel (producer) that wrote the record.
    pub channel: usize,
    payload: Box<[u8]>,
}

impl Record {
    pub fn new(channel: usize, timestamp: u64, payload: impl Into<Box<[u8]>>) -> Self {
        Self {
            timestamp,
            channel,
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Box<[u8]> {
        self.payload
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("timestamp", &self.timestamp)
            .field("channel", &self.channel)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish()
    }
}
