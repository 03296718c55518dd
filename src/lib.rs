//! Per-channel trace buffers merged into global timestamp order.
//!
//! Producers running in parallel (one per CPU or worker thread) each append
//! timestamped records to a private [`Channel`]. A single consumer reads them
//! back through [`TraceBuffer::read_oldest`] in one total order, as if every
//! producer had written into a shared log, without producers ever touching a
//! shared lock.
//!
//! # Design Principles
//!
//! 1. **No cross-channel locking on writes**: a producer only locks its own
//!    channel, contended at most by the consumer
//! 2. **Bounded memory**: every channel reserves its capacity up front;
//!    overflow evicts or drops and is counted, never allocates
//! 3. **Exact ordering**: an idle channel holds back delivery until its
//!    time floor proves nothing older can still arrive
//! 4. **Explicit lifecycle**: no global buffer; whoever builds a
//!    [`TraceBuffer`] owns it and hands it to adapters such as
//!    [`TraceControl`]
//!
//! # Architecture
//!
//! ```text
//! +-----------+   +-----------+        +-----------+
//! | Channel 0 |   | Channel 1 |  ...   | Channel N |   per-producer rings
//! +-----+-----+   +-----+-----+        +-----+-----+
//!       |               |                    |
//!       v               v                    v
//! +------------------------------------------------+
//! |  OrderedMerger: one cursor per channel         |
//! |  Pending(record) | KnownEmptyAsOf(floor)       |
//! +------------------------------------------------+
//!                        |
//!                        v
//!          TraceBuffer::read_oldest / TraceControl
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use tracebuf::{TraceBuffer, TraceConfig, TraceError};
//!
//! let buffer = Arc::new(TraceBuffer::new(&TraceConfig::default().with_channels(2))?);
//!
//! let producer = {
//!     let buffer = Arc::clone(&buffer);
//!     std::thread::spawn(move || buffer.write(1, b"from producer 1"))
//! };
//! buffer.write(0, b"from producer 0")?;
//! producer.join().unwrap()?;
//!
//! let first = buffer.read_oldest(true)?;
//! let second = buffer.read_oldest(true)?;
//! assert!(first.timestamp <= second.timestamp);
//! assert_eq!(buffer.read_oldest(false), Err(TraceError::Empty));
//! # Ok::<(), TraceError>(())
//! ```

mod buffer;
pub mod channel;
pub mod config;
pub mod control;
mod error;
pub mod merger;
pub mod output;
mod record;
pub mod stats;
pub mod timestamp;
mod wait;

pub use self::buffer::{LostCounter, TraceBuffer};
pub use self::channel::{Channel, OverflowPolicy, FRAME_HEADER_SIZE};
pub use self::config::TraceConfig;
pub use self::control::{ReadMode, TraceControl, TraceFile};
pub use self::error::TraceError;
pub use self::merger::ChannelCursor;
pub use self::output::{DefaultFormatter, RecordFormatter};
pub use self::record::Record;
pub use self::stats::{ChannelStats, TraceStats};
pub use self::timestamp::{ClockSource, ManualClock, MonotonicClock};
pub use self::wait::CancelHandle;
