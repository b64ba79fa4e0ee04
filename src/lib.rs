//! # SPMC broadcast message queue over POSIX shared memory
//!
//! A lock-free **single-producer / multi-consumer** message queue for
//! cross-process, low-latency delivery. One producer publishes typed,
//! variable-payload messages into a fixed-capacity circular slot array
//! inside a named, memory-mapped shared segment; each of N independent
//! consumers receives every message exactly once, in publication order, at
//! its own pace.
//!
//! # Features
//!
//! * **Lock-free** broadcast: one writer cursor, one tail per consumer,
//!   no kernel synchronization on the fast path
//! * **Backpressure, never loss**: the writer is bounded by the slowest
//!   consumer and refuses to overwrite unread slots
//! * **Framed messages**: type tag, payload size, monotonic nanosecond
//!   timestamp and per-session sequence number in every slot
//! * **Cache-friendly** layout: the head and every consumer tail sit on
//!   their own cache line
//! * **Safe attach**: write-once segment geometry with a compatibility
//!   check against mismatched parameters
//! * Works **between processes** or between threads of one process
//! * Zero allocations on the publish path after construction
//!
//! # Polling behavior
//!
//! Neither side ever blocks: a full queue makes [`MessageQueue::produce`]
//! return `Ok(false)` and an empty queue makes [`MessageQueue::consume`]
//! return `Ok(false)`. Retry, backoff, or sleep policy belongs to the
//! caller. Busy-polling consumers get the lowest latency at the price of a
//! core each; there is no built-in wakeup mechanism.
//!
//! # Quick example
//!
//! ```no_run
//! use shmq::{Frame, MessageQueue, MessageType, QueueOptions};
//!
//! let queue = MessageQueue::new("/market_data", QueueOptions::new(1024, 256, 2))?;
//! queue.produce(MessageType::MarketData, b"tick")?;
//!
//! let mut buf = vec![0u8; queue.slot_size() as usize];
//! if queue.consume(0, &mut buf)? {
//!     let frame = Frame::decode(&buf)?;
//!     println!("seq {} payload {:?}", frame.sequence(), frame.payload());
//! }
//! # Ok::<(), shmq::Error>(())
//! ```
//!
//! # Design overview
//!
//! The shared segment holds a header line (`head` plus the write-once
//! geometry), one cache line per consumer tail, and then `capacity` fixed
//! slots of `slot_size` bytes:
//!
//! ```text
//! [ head | capacity | slot_size | num_consumers ]   one line
//! [ tail 0 ]                                        one line each
//! [ tail ... ]
//! [ slot 0 | slot 1 | ... | slot capacity-1 ]
//! ```
//!
//! The producer copies a frame into slot `head` and publishes it with a
//! Release store of the advanced head; consumers load `head` with Acquire,
//! copy the slot out, and release it back with their tail store. The queue
//! is full when advancing `head` would land on the slowest consumer's tail,
//! so `capacity - 1` messages can be in flight.
//!
//! Roles are a calling convention: exactly one handle may produce at a
//! time, and each consumer id may be driven by one handle at a time.
//! Handles are `Send` but not `Sync`: attach once per role.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

mod clock;
mod error;
pub mod queue;
pub mod ring;
pub mod shm;
pub mod stats;

pub use clock::monotonic_ns;
pub use error::{Error, Result};
pub use queue::{Frame, FrameHeader, MessageQueue, MessageType, QueueOptions, FRAME_HEADER_BYTES};
pub use shm::{probe_header, OpenMode, SegmentInfo};
pub use stats::Percentiles;
