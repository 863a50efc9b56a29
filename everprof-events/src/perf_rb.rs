use std::slice;
use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::records::align8;
use crate::ring_buffer::RingBuffer;

/// Single-producer writer for the perf ring-buffer variant.
///
/// Construction snapshots `data_tail` with acquire ordering; the producer is
/// the only writer of `data_head`, which is published with release on commit
/// or drop.
pub struct PerfRingBufferWriter<'a> {
    rb: &'a RingBuffer,
    head: u64,
    available: u64,
}

impl<'a> PerfRingBufferWriter<'a> {
    pub fn new(rb: &'a RingBuffer) -> Self {
        let tail = rb.perf_tail().load(Ordering::Acquire);
        let head = rb.perf_head().load(Ordering::Relaxed);
        debug_assert!(tail <= head);
        PerfRingBufferWriter {
            rb,
            head,
            available: rb.data_size() - (head - tail),
        }
    }

    pub fn available_size(&self) -> usize {
        self.available as usize
    }

    /// Reserve `n` bytes rounded up to the 8-byte record granularity.
    /// Returns an empty slice when the buffer has no room.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        let n = align8(n);
        if n as u64 > self.available {
            return &mut [];
        }
        let offset = (self.head & self.rb.mask()) as usize;
        self.head += n as u64;
        self.available -= n as u64;
        // The double mapping makes the span contiguous even across the wrap.
        unsafe { slice::from_raw_parts_mut(self.rb.data_ptr().add(offset), n) }
    }

    /// Reserve, copy, and stamp the record's `header.size` with the rounded
    /// reservation length. `record` must start with a perf event header.
    pub fn write(&mut self, record: &[u8]) -> bool {
        let rounded = align8(record.len());
        let dest = self.reserve(record.len());
        if dest.is_empty() {
            return false;
        }
        dest[..record.len()].copy_from_slice(record);
        LittleEndian::write_u16(&mut dest[6..8], rounded as u16);
        true
    }

    pub fn commit(&mut self) {
        self.rb.perf_head().store(self.head, Ordering::Release);
    }
}

impl Drop for PerfRingBufferWriter<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

/// Single-consumer reader for the perf ring-buffer variant.
///
/// Construction snapshots `data_head` with acquire ordering; the consumer is
/// the only writer of `data_tail`.
pub struct PerfRingBufferReader<'a> {
    rb: &'a RingBuffer,
    head: u64,
    tail: u64,
}

impl<'a> PerfRingBufferReader<'a> {
    pub fn new(rb: &'a RingBuffer) -> Self {
        let head = rb.perf_head().load(Ordering::Acquire);
        let tail = rb.perf_tail().load(Ordering::Relaxed);
        debug_assert!(tail <= head);
        PerfRingBufferReader { rb, head, tail }
    }

    pub fn available_size(&self) -> usize {
        (self.head - self.tail) as usize
    }

    /// Everything committed and not yet consumed, as one contiguous span.
    /// The span stays valid until `advance` or destruction.
    pub fn read_all_available(&self) -> &[u8] {
        let offset = (self.tail & self.rb.mask()) as usize;
        let len = (self.head - self.tail) as usize;
        unsafe { slice::from_raw_parts(self.rb.data_ptr().add(offset), len) }
    }

    /// Mark `n` bytes as consumed and publish the new tail to the producer.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n as u64 <= self.head - self.tail);
        self.tail += n as u64;
        self.rb.perf_tail().store(self.tail, Ordering::Release);
    }
}

impl Drop for PerfRingBufferReader<'_> {
    fn drop(&mut self) {
        self.rb.perf_tail().store(self.tail, Ordering::Release);
    }
}
