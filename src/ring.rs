//! Lock-free SPMC circular slot array over a shared segment.
//!
//! One writer advances `head`; each of `num_consumers` readers advances its
//! own tail. The writer is bounded by the slowest reader: it never advances
//! `head` onto any tail, so one slot always separates the two and the
//! effective capacity is `capacity - 1`.
//!
//! The synchronizes-with edges are fixed:
//!
//! - the producer reads every tail with Acquire before writing a slot,
//!   pairing with each consumer's Release tail store;
//! - the producer stores `head` with Release after the slot bytes, pairing
//!   with the consumer's Acquire `head` load, which makes the slot bytes
//!   visible before the index that announces them.
//!
//! Reads of one's own cursor are Relaxed: only its owner ever stores it.

use crate::error::{Error, Result};
use crate::shm::{header_bytes, FixedHeader, SharedSegment, TailLine, LINE};
use std::ptr;
use std::sync::atomic::Ordering;

/// The SPMC broadcast ring mapped over a [`SharedSegment`].
///
/// The handle itself holds no cursor state; everything lives in the shared
/// header so any process mapping the same segment observes the same queue.
/// Slot payloads are opaque fixed-width byte blocks; framing is the message
/// layer's business.
#[derive(Debug)]
pub struct RingBuffer {
    segment: SharedSegment,
    capacity: u32,
    slot_size: u32,
    num_consumers: u32,
    data_offset: usize,
}

impl RingBuffer {
    /// Attaches the ring to a mapped segment, initializing the shared header
    /// if this is the first attach.
    ///
    /// A stored `capacity` of 0 marks an uninitialized header; the first
    /// attacher (or both racing first attachers) write the cursors and the
    /// write-once geometry. The race is benign because all attachers pass
    /// identical parameters by contract; disagreement between *simultaneous*
    /// first attachers is caller misuse that nothing here detects. A segment
    /// that is already initialized with different geometry is rejected.
    pub fn attach(
        segment: SharedSegment,
        capacity: u32,
        slot_size: u32,
        num_consumers: u32,
    ) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::InvalidArgument(format!(
                "ring capacity must be at least 2, got {}",
                capacity
            )));
        }
        if slot_size == 0 || num_consumers == 0 {
            return Err(Error::InvalidArgument(
                "slot_size and num_consumers must be non-zero".into(),
            ));
        }

        let data_offset = header_bytes(num_consumers);
        let expected = data_offset + capacity as usize * slot_size as usize;
        if segment.len() != expected {
            // An attach-only segment is mapped at whatever size it already
            // had, so this is a real geometry disagreement, not a sizing bug.
            return Err(Error::Incompatible(format!(
                "segment {} is {} bytes, ring geometry needs {}",
                segment.name(),
                segment.len(),
                expected
            )));
        }

        let ring = Self {
            segment,
            capacity,
            slot_size,
            num_consumers,
            data_offset,
        };

        let stored = ring.header().capacity.load(Ordering::Relaxed);
        if stored == 0 {
            ring.initialize_header();
        } else {
            let h = ring.header();
            let (ss, nc) = (
                h.slot_size.load(Ordering::Relaxed),
                h.num_consumers.load(Ordering::Relaxed),
            );
            if (stored, ss, nc) != (capacity, slot_size, num_consumers) {
                return Err(Error::Incompatible(format!(
                    "segment {} holds (capacity {}, slot_size {}, num_consumers {}), \
                     requested ({}, {}, {})",
                    ring.segment.name(),
                    stored,
                    ss,
                    nc,
                    capacity,
                    slot_size,
                    num_consumers
                )));
            }
        }

        Ok(ring)
    }

    /// First-attach initialization: cursors to zero, then the write-once
    /// geometry. All stores Relaxed: racing first attachers store identical
    /// values, so any interleaving converges on the same header.
    fn initialize_header(&self) {
        let header = self.header();
        header.head.store(0, Ordering::Relaxed);
        for cid in 0..self.num_consumers {
            self.tail(cid).store(0, Ordering::Relaxed);
        }
        header.slot_size.store(self.slot_size, Ordering::Relaxed);
        header
            .num_consumers
            .store(self.num_consumers, Ordering::Relaxed);
        // capacity last: it doubles as the initialized marker.
        header.capacity.store(self.capacity, Ordering::Relaxed);
        log::debug!(
            "initialized ring on {} (capacity {}, slot_size {}, num_consumers {})",
            self.segment.name(),
            self.capacity,
            self.slot_size,
            self.num_consumers
        );
    }

    #[inline]
    fn header(&self) -> &FixedHeader {
        // SAFETY: the mapping is page-aligned and at least one LINE long
        // (checked in attach), so a FixedHeader lives at offset 0.
        unsafe { &*(self.segment.as_ptr() as *const FixedHeader) }
    }

    #[inline]
    fn tail(&self, consumer_id: u32) -> &TailLine {
        debug_assert!(consumer_id < self.num_consumers);
        // SAFETY: tail line `consumer_id` starts at LINE * (1 + id), which is
        // in bounds (id < num_consumers, length checked in attach) and
        // LINE-aligned relative to the page-aligned base.
        unsafe {
            let line = self
                .segment
                .as_ptr()
                .add(LINE * (1 + consumer_id as usize));
            &*(line as *const TailLine)
        }
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity, so the slot lies within the mapped slot
        // region (length checked in attach).
        unsafe {
            self.segment
                .as_ptr()
                .add(self.data_offset + index as usize * self.slot_size as usize)
        }
    }

    #[inline]
    fn advance(&self, index: u32) -> u32 {
        let next = index + 1;
        if next == self.capacity {
            0
        } else {
            next
        }
    }

    /// Copies one slot's worth of bytes into the ring and publishes it.
    ///
    /// Returns `false` without touching shared memory when the queue is full,
    /// i.e. when advancing `head` would land it on the slowest consumer's
    /// tail. Not safe to call from more than one writer at a time.
    pub fn push(&self, src: &[u8]) -> bool {
        debug_assert_eq!(src.len(), self.slot_size as usize);
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        let next = self.advance(head);

        // The min-tail rule in its modular form: the queue is full exactly
        // when the next head position coincides with some consumer's tail.
        // Comparing against the numerically smallest tail misfires once the
        // tails straddle the wrap point.
        for cid in 0..self.num_consumers {
            if self.tail(cid).load(Ordering::Acquire) == next {
                return false;
            }
        }

        // SAFETY: slot `head` is in bounds and, by the gap rule just
        // enforced, not being read by any consumer. src length matches
        // slot_size (debug-asserted, guaranteed by the message layer).
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.slot_ptr(head), self.slot_size as usize);
        }

        // Publishes the slot bytes: consumers load head with Acquire.
        header.head.store(next, Ordering::Release);
        true
    }

    /// Copies the next unread slot for `consumer_id` into `dst` and advances
    /// that consumer's tail.
    ///
    /// Returns `Ok(false)` when the queue is empty for this consumer. Each
    /// consumer id must be driven by at most one reader at a time; distinct
    /// ids are fully independent.
    pub fn pop(&self, consumer_id: u32, dst: &mut [u8]) -> Result<bool> {
        if consumer_id >= self.num_consumers {
            return Err(Error::OutOfRange {
                consumer_id,
                num_consumers: self.num_consumers,
            });
        }
        debug_assert_eq!(dst.len(), self.slot_size as usize);

        let tail_slot = self.tail(consumer_id);
        let tail = tail_slot.load(Ordering::Relaxed);
        let head = self.header().head.load(Ordering::Acquire);
        if tail == head {
            return Ok(false);
        }

        // SAFETY: tail != head, so slot `tail` holds a fully written frame
        // published by the producer's Release store of head. dst length
        // matches slot_size.
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(tail), dst.as_mut_ptr(), self.slot_size as usize);
        }

        // Releases the slot back to the producer, pairing with its Acquire
        // tail scan.
        tail_slot.store(self.advance(tail), Ordering::Release);
        Ok(true)
    }

    /// Whether the next push would be refused.
    pub fn is_full(&self) -> bool {
        let next = self.advance(self.header().head.load(Ordering::Relaxed));
        (0..self.num_consumers).any(|cid| self.tail(cid).load(Ordering::Acquire) == next)
    }

    /// Whether `consumer_id` has nothing left to read.
    pub fn is_empty(&self, consumer_id: u32) -> Result<bool> {
        self.check_consumer(consumer_id)?;
        Ok(self.tail(consumer_id).load(Ordering::Acquire)
            == self.header().head.load(Ordering::Acquire))
    }

    /// Number of messages published but not yet read by `consumer_id`.
    pub fn len(&self, consumer_id: u32) -> Result<u32> {
        self.check_consumer(consumer_id)?;
        let head = self.header().head.load(Ordering::Acquire);
        let tail = self.tail(consumer_id).load(Ordering::Acquire);
        Ok(if head >= tail {
            head - tail
        } else {
            self.capacity - tail + head
        })
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[inline]
    pub fn num_consumers(&self) -> u32 {
        self.num_consumers
    }

    /// Bad ids in introspection calls are argument errors, unlike `pop`,
    /// which reports them as `OutOfRange`.
    fn check_consumer(&self, consumer_id: u32) -> Result<()> {
        if consumer_id >= self.num_consumers {
            return Err(Error::InvalidArgument(format!(
                "consumer id {} out of range (num_consumers = {})",
                consumer_id, self.num_consumers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::tests::{unique_name, Cleanup};
    use crate::shm::OpenMode;

    const SLOT: u32 = 32;

    fn ring(name: &str, capacity: u32, num_consumers: u32) -> RingBuffer {
        let total = header_bytes(num_consumers) + capacity as usize * SLOT as usize;
        let seg = SharedSegment::open_or_create(name, total, OpenMode::OpenOrCreate).unwrap();
        RingBuffer::attach(seg, capacity, SLOT, num_consumers).unwrap()
    }

    fn slot_bytes(fill: u8) -> Vec<u8> {
        vec![fill; SLOT as usize]
    }

    #[test]
    fn fresh_ring_is_empty_for_every_consumer() {
        let name = unique_name("ring-fresh");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 8, 3);
        for cid in 0..3 {
            assert!(r.is_empty(cid).unwrap());
            assert_eq!(r.len(cid).unwrap(), 0);
        }
        assert!(!r.is_full());
    }

    #[test]
    fn push_pop_roundtrip() {
        let name = unique_name("ring-rt");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 8, 1);

        assert!(r.push(&slot_bytes(0x5A)));
        assert_eq!(r.len(0).unwrap(), 1);

        let mut out = slot_bytes(0);
        assert!(r.pop(0, &mut out).unwrap());
        assert_eq!(out, slot_bytes(0x5A));
        assert!(r.is_empty(0).unwrap());
    }

    #[test]
    fn pop_on_empty_returns_false_without_moving_tail() {
        let name = unique_name("ring-empty");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 8, 1);
        let mut out = slot_bytes(0);
        assert!(!r.pop(0, &mut out).unwrap());
        assert_eq!(r.len(0).unwrap(), 0);
    }

    #[test]
    fn holds_exactly_capacity_minus_one() {
        let name = unique_name("ring-full");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 4, 1);

        for i in 0..3 {
            assert!(r.push(&slot_bytes(i)), "push {} should fit", i);
        }
        assert!(r.is_full());
        assert!(!r.push(&slot_bytes(0xFF)));

        let mut out = slot_bytes(0);
        assert!(r.pop(0, &mut out).unwrap());
        assert!(!r.is_full());
        assert!(r.push(&slot_bytes(3)));
    }

    #[test]
    fn slowest_consumer_gates_the_producer() {
        let name = unique_name("ring-gate");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 4, 2);

        for i in 0..3 {
            assert!(r.push(&slot_bytes(i)));
        }
        // Consumer 0 drains fully; consumer 1 reads nothing.
        let mut out = slot_bytes(0);
        while r.pop(0, &mut out).unwrap() {}

        assert!(r.is_full(), "consumer 1 still pins the oldest slot");
        assert!(!r.push(&slot_bytes(0xFF)));

        assert!(r.pop(1, &mut out).unwrap());
        assert!(r.push(&slot_bytes(0xFF)));
    }

    #[test]
    fn each_consumer_sees_every_message() {
        let name = unique_name("ring-bcast");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 8, 2);

        for i in 0..5 {
            assert!(r.push(&slot_bytes(i)));
        }
        for cid in 0..2 {
            let mut out = slot_bytes(0);
            for i in 0..5 {
                assert!(r.pop(cid, &mut out).unwrap());
                assert_eq!(out[0], i, "consumer {} message {}", cid, i);
            }
            assert!(!r.pop(cid, &mut out).unwrap());
        }
    }

    #[test]
    fn survives_many_wraps() {
        let name = unique_name("ring-wrap");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 4, 1);
        let mut out = slot_bytes(0);

        for lap in 0u32..100 {
            let fill = (lap % 251) as u8;
            assert!(r.push(&slot_bytes(fill)));
            assert!(r.pop(0, &mut out).unwrap());
            assert_eq!(out[0], fill);
        }
        assert!(r.is_empty(0).unwrap());
    }

    // Regression for the wrap hazard: with tails on both sides of the wrap
    // point, the numerically smallest tail is not the slowest consumer. The
    // push gate must track the modular gap, or head lands exactly on the
    // lagging tail and its unread backlog reads as empty.
    #[test]
    fn full_check_is_modular_not_numeric() {
        let name = unique_name("ring-modular");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 8, 2);
        let mut out = slot_bytes(0);

        // Producer writes 7 (the maximum); consumer 0 drains all, consumer 1
        // reads one. Tails: 7 and 1, head 7.
        for i in 0..7 {
            assert!(r.push(&slot_bytes(i)));
        }
        for _ in 0..7 {
            assert!(r.pop(0, &mut out).unwrap());
        }
        assert!(r.pop(1, &mut out).unwrap());

        // One more write wraps head to 0; consumer 0 follows. Tails: 0 and 1.
        assert!(r.push(&slot_bytes(7)));
        assert!(r.pop(0, &mut out).unwrap());

        // Consumer 1 now has 7 unread; the queue is full even though the
        // numeric minimum of the tails (0) does not equal next_head (1).
        assert_eq!(r.len(1).unwrap(), 7);
        assert!(r.is_full());
        assert!(!r.push(&slot_bytes(0xFF)));

        // Consumer 1 still recovers its entire backlog in order.
        for i in 1..8 {
            assert!(r.pop(1, &mut out).unwrap());
            assert_eq!(out[0], i);
        }
    }

    #[test]
    fn reattach_preserves_cursors_and_data() {
        let name = unique_name("ring-reattach");
        let _cleanup = Cleanup(name.clone());
        {
            let r = ring(&name, 8, 1);
            assert!(r.push(&slot_bytes(0x11)));
            assert!(r.push(&slot_bytes(0x22)));
        }
        let r = ring(&name, 8, 1);
        assert_eq!(r.len(0).unwrap(), 2);
        let mut out = slot_bytes(0);
        assert!(r.pop(0, &mut out).unwrap());
        assert_eq!(out, slot_bytes(0x11));
        assert!(r.pop(0, &mut out).unwrap());
        assert_eq!(out, slot_bytes(0x22));
    }

    #[test]
    fn attach_rejects_mismatched_geometry() {
        let name = unique_name("ring-geom");
        let _cleanup = Cleanup(name.clone());
        let _first = ring(&name, 8, 1);

        // Same byte size, different slot carving.
        let total = header_bytes(1) + 8 * SLOT as usize;
        let seg = SharedSegment::open_or_create(&name, total, OpenMode::OpenOrCreate).unwrap();
        assert!(matches!(
            RingBuffer::attach(seg, 4, SLOT * 2, 1),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn attach_rejects_wrong_segment_length() {
        let name = unique_name("ring-len");
        let _cleanup = Cleanup(name.clone());
        let seg = SharedSegment::open_or_create(&name, 4096, OpenMode::OpenOrCreate).unwrap();
        assert!(matches!(
            RingBuffer::attach(seg, 8, SLOT, 1),
            Err(Error::Incompatible(_))
        ));
    }

    // Attach-only maps the segment as found, so a mismatched expectation
    // must surface as a length disagreement instead of resizing a segment
    // other processes may still have mapped.
    #[test]
    fn attach_only_sees_the_true_length_of_a_mismatched_segment() {
        let name = unique_name("ring-noresize");
        let _cleanup = Cleanup(name.clone());
        let _first = ring(&name, 8, 1);

        let wrong_total = header_bytes(1) + 16 * SLOT as usize;
        let seg =
            SharedSegment::open_or_create(&name, wrong_total, OpenMode::OpenExistingOnly).unwrap();
        assert_eq!(seg.len(), header_bytes(1) + 8 * SLOT as usize);
        assert!(matches!(
            RingBuffer::attach(seg, 16, SLOT, 1),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn pop_with_bad_id_is_out_of_range() {
        let name = unique_name("ring-oob");
        let _cleanup = Cleanup(name.clone());
        let r = ring(&name, 8, 2);
        let mut out = slot_bytes(0);
        match r.pop(2, &mut out) {
            Err(Error::OutOfRange {
                consumer_id,
                num_consumers,
            }) => {
                assert_eq!(consumer_id, 2);
                assert_eq!(num_consumers, 2);
            }
            other => panic!("expected OutOfRange, got {:?}", other),
        }
        // Introspection flags the same misuse differently.
        assert!(matches!(r.is_empty(2), Err(Error::InvalidArgument(_))));
        assert!(matches!(r.len(2), Err(Error::InvalidArgument(_))));
    }
}
