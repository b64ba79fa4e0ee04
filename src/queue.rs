//! Message framing over the SPMC ring: types, sequence numbers, timestamps.
//!
//! A queue slot is a fixed-width frame: a 24-byte header (type, payload
//! size, monotonic timestamp, sequence number) followed by up to
//! `max_payload` raw payload bytes. The layer owns a [`RingBuffer`] and only
//! ever hands it whole slots.

use crate::clock::monotonic_ns;
use crate::error::{Error, Result};
use crate::ring::RingBuffer;
use crate::shm::{self, header_bytes, OpenMode, SharedSegment};
use std::cell::{Cell, RefCell};

/// Domain message tags. The wire value is the `u32` discriminant; 0 is the
/// reserved unknown tag, which unrecognized values decode to.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Unknown = 0,
    MarketData = 1,
    OrderUpdate = 2,
    Heartbeat = 3,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => MessageType::MarketData,
            2 => MessageType::OrderUpdate,
            3 => MessageType::Heartbeat,
            _ => MessageType::Unknown,
        }
    }
}

/// Size of the frame header preceding the payload in every slot.
///
/// The four fields are packed at explicit offsets (below) in host byte
/// order, so every process on the host agrees on the layout regardless of
/// toolchain. The fields are naturally aligned at 4, 4, 8, 8, so there is
/// no padding.
pub const FRAME_HEADER_BYTES: usize = 24;

const OFF_TYPE: usize = 0;
const OFF_PAYLOAD_SIZE: usize = 4;
const OFF_TIMESTAMP: usize = 8;
const OFF_SEQUENCE: usize = 16;

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub payload_size: u32,
    pub timestamp_ns: u64,
    pub sequence: u64,
}

/// A decoded view over one consumed slot: the header plus the significant
/// payload bytes. Borrows the caller's receive buffer.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    header: FrameHeader,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decodes the frame at the start of `slot` (a buffer previously filled
    /// by [`MessageQueue::consume`]).
    pub fn decode(slot: &'a [u8]) -> Result<Self> {
        if slot.len() < FRAME_HEADER_BYTES {
            return Err(Error::InvalidArgument(format!(
                "{} bytes is too short for a frame header ({} needed)",
                slot.len(),
                FRAME_HEADER_BYTES
            )));
        }
        let header = FrameHeader {
            message_type: MessageType::from_u32(read_u32(slot, OFF_TYPE)),
            payload_size: read_u32(slot, OFF_PAYLOAD_SIZE),
            timestamp_ns: read_u64(slot, OFF_TIMESTAMP),
            sequence: read_u64(slot, OFF_SEQUENCE),
        };
        let end = FRAME_HEADER_BYTES + header.payload_size as usize;
        if end > slot.len() {
            return Err(Error::InvalidArgument(format!(
                "frame claims {} payload bytes but the slot holds only {}",
                header.payload_size,
                slot.len() - FRAME_HEADER_BYTES
            )));
        }
        Ok(Self {
            header,
            payload: &slot[FRAME_HEADER_BYTES..end],
        })
    }

    #[inline]
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    #[inline]
    pub fn payload_size(&self) -> u32 {
        self.header.payload_size
    }

    #[inline]
    pub fn timestamp_ns(&self) -> u64 {
        self.header.timestamp_ns
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Construction parameters for [`MessageQueue::new`].
///
/// `capacity` counts messages (the queue holds at most `capacity - 1`
/// unconsumed ones), `max_payload` bounds the payload bytes per message, and
/// `num_consumers` fixes how many independent readers the segment carries.
/// All three are write-once properties of the segment; every attacher must
/// pass the same values.
#[derive(Clone, Copy, Debug)]
pub struct QueueOptions {
    pub capacity: u32,
    pub max_payload: u32,
    pub num_consumers: u32,
    /// Unlink any prior segment with this name and start fresh.
    pub force_recreate: bool,
    /// Attach only; fail with `NotFound` instead of creating.
    pub open_existing_only: bool,
}

impl QueueOptions {
    pub fn new(capacity: u32, max_payload: u32, num_consumers: u32) -> Self {
        Self {
            capacity,
            max_payload,
            num_consumers,
            force_recreate: false,
            open_existing_only: false,
        }
    }
}

/// SPMC broadcast message queue over a named shared segment.
///
/// Every handle is a full view of the queue; roles are a calling convention,
/// not a type distinction. At most one handle may `produce` at a time, and
/// each consumer id may be driven by at most one handle at a time. Handles
/// are `Send` but not `Sync`; a process that wants a producer thread and a
/// consumer thread attaches twice.
///
/// Dropping a handle unmaps the segment and nothing more; the queue and its
/// contents survive until some process calls [`MessageQueue::unlink`].
#[derive(Debug)]
pub struct MessageQueue {
    ring: RingBuffer,
    max_payload: u32,
    slot_size: u32,
    next_sequence: Cell<u64>,
    staging: RefCell<Vec<u8>>,
}

impl MessageQueue {
    /// Creates or attaches the named queue.
    ///
    /// Unless `force_recreate` is set, an existing segment's header must
    /// match `options` exactly or the attach fails with
    /// [`Error::Incompatible`] before the segment is touched in any way.
    /// See [`QueueOptions`] for the parameter contract.
    pub fn new(name: &str, options: QueueOptions) -> Result<Self> {
        let QueueOptions {
            capacity,
            max_payload,
            num_consumers,
            force_recreate,
            open_existing_only,
        } = options;

        if force_recreate && open_existing_only {
            return Err(Error::InvalidArgument(
                "force_recreate and open_existing_only are mutually exclusive".into(),
            ));
        }
        if max_payload == 0 {
            return Err(Error::InvalidArgument("max_payload must be non-zero".into()));
        }
        if capacity < 2 {
            return Err(Error::InvalidArgument(format!(
                "capacity must be at least 2, got {}",
                capacity
            )));
        }
        if num_consumers == 0 {
            return Err(Error::InvalidArgument(
                "num_consumers must be non-zero".into(),
            ));
        }

        let slot_size = slot_size_for(max_payload)?;
        let total_bytes = total_bytes_for(capacity, slot_size, num_consumers)?;

        let mode = if force_recreate {
            OpenMode::ForceRecreate
        } else if open_existing_only {
            OpenMode::OpenExistingOnly
        } else {
            OpenMode::OpenOrCreate
        };

        // Both attaching modes verify an existing segment before touching
        // it; only a forced recreate may proceed against a mismatch.
        if mode != OpenMode::ForceRecreate
            && shm::probe_header(name).is_some()
            && !Self::is_header_compatible(name, capacity, max_payload, num_consumers)
        {
            return Err(Error::Incompatible(format!(
                "segment {} exists with a different geometry than \
                 (capacity {}, max_payload {}, num_consumers {})",
                name, capacity, max_payload, num_consumers
            )));
        }

        let segment = SharedSegment::open_or_create(name, total_bytes, mode)?;
        let ring = RingBuffer::attach(segment, capacity, slot_size, num_consumers)?;

        Ok(Self {
            ring,
            max_payload,
            slot_size,
            next_sequence: Cell::new(0),
            staging: RefCell::new(vec![0u8; slot_size as usize]),
        })
    }

    /// Checks whether an existing segment matches the given parameters.
    ///
    /// Compares the total byte size and the three write-once header fields.
    /// Returns `false` when the segment does not exist.
    pub fn is_header_compatible(
        name: &str,
        capacity: u32,
        max_payload: u32,
        num_consumers: u32,
    ) -> bool {
        let Ok(slot_size) = slot_size_for(max_payload) else {
            return false;
        };
        let Ok(expected_bytes) = total_bytes_for(capacity, slot_size, num_consumers) else {
            return false;
        };
        match shm::probe_header(name) {
            Some(info) => {
                info.byte_size == expected_bytes as u64
                    && info.capacity == capacity
                    && info.slot_size == slot_size
                    && info.num_consumers == num_consumers
            }
            None => false,
        }
    }

    /// Removes the queue's name binding. Live handles keep their mappings;
    /// which component calls this is a deployment decision.
    pub fn unlink(name: &str) -> Result<()> {
        shm::unlink(name)
    }

    /// Frames `payload` and publishes it to every consumer.
    ///
    /// Returns `Ok(false)` when the queue is full: the frame is not sent
    /// and no sequence number is consumed, so a later retry publishes with
    /// the next number in line and consumers never observe a gap.
    pub fn produce(&self, message_type: MessageType, payload: &[u8]) -> Result<bool> {
        if payload.len() > self.max_payload as usize {
            return Err(Error::PayloadTooLarge {
                len: payload.len() as u32,
                max: self.max_payload,
            });
        }

        let sequence = self.next_sequence.get();
        let mut staging = self.staging.borrow_mut();
        staging[OFF_TYPE..OFF_TYPE + 4].copy_from_slice(&(message_type as u32).to_ne_bytes());
        staging[OFF_PAYLOAD_SIZE..OFF_PAYLOAD_SIZE + 4]
            .copy_from_slice(&(payload.len() as u32).to_ne_bytes());
        staging[OFF_TIMESTAMP..OFF_TIMESTAMP + 8].copy_from_slice(&monotonic_ns().to_ne_bytes());
        staging[OFF_SEQUENCE..OFF_SEQUENCE + 8].copy_from_slice(&sequence.to_ne_bytes());
        staging[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + payload.len()].copy_from_slice(payload);
        // Bytes past the payload keep whatever the previous frame left there;
        // consumers honor payload_size.

        if !self.ring.push(&staging) {
            return Ok(false);
        }
        self.next_sequence.set(sequence + 1);
        Ok(true)
    }

    /// Copies the next unread frame for `consumer_id` into `buf`.
    ///
    /// `buf` must hold at least [`Self::slot_size`] bytes. Returns
    /// `Ok(false)` when the queue is empty for this consumer. Decode the
    /// filled buffer with [`Frame::decode`].
    pub fn consume(&self, consumer_id: u32, buf: &mut [u8]) -> Result<bool> {
        if buf.len() < self.slot_size as usize {
            return Err(Error::InvalidArgument(format!(
                "receive buffer of {} bytes is smaller than the slot size {}",
                buf.len(),
                self.slot_size
            )));
        }
        self.ring.pop(consumer_id, &mut buf[..self.slot_size as usize])
    }

    /// Total slot count; the queue holds at most `capacity() - 1` messages.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    /// Messages published but not yet read by `consumer_id`.
    #[inline]
    pub fn len(&self, consumer_id: u32) -> Result<u32> {
        self.ring.len(consumer_id)
    }

    #[inline]
    pub fn is_empty(&self, consumer_id: u32) -> Result<bool> {
        self.ring.is_empty(consumer_id)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    #[inline]
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Bytes per slot: frame header plus `max_payload`. Receive buffers must
    /// be at least this large.
    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[inline]
    pub fn num_consumers(&self) -> u32 {
        self.ring.num_consumers()
    }
}

fn slot_size_for(max_payload: u32) -> Result<u32> {
    (FRAME_HEADER_BYTES as u32)
        .checked_add(max_payload)
        .ok_or_else(|| {
            Error::InvalidArgument(format!("max_payload {} overflows the slot size", max_payload))
        })
}

fn total_bytes_for(capacity: u32, slot_size: u32, num_consumers: u32) -> Result<usize> {
    (capacity as usize)
        .checked_mul(slot_size as usize)
        .and_then(|slots| slots.checked_add(header_bytes(num_consumers)))
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "segment of {} slots of {} bytes exceeds the addressable size",
                capacity, slot_size
            ))
        })
}
