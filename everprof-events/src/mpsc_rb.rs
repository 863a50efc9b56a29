use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::records::align8;
use crate::ring_buffer::RingBuffer;
use crate::spinlock::{SpinLock, SpinLockGuard};

/// How long a producer spins on the reservation lock before declaring it
/// stale. Long enough to rule out ordinary contention, short enough to
/// detect a producer that died while holding the lock.
pub const RESERVE_TIMEOUT: Duration = Duration::from_micros(200);

/// Length-word size preceding every committed record.
const LENGTH_WORD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// The spinlock could not be acquired before the deadline.
    StaleLock,
    /// The buffer has no room for the record plus its terminator word.
    Full,
}

/// Multi-producer writer. Each reservation holds the spinlock from `reserve`
/// until commit or abort, so committed records are contiguous from the
/// consumer's point of view.
pub struct MpscRingBufferWriter<'a> {
    rb: &'a RingBuffer,
}

impl<'a> MpscRingBufferWriter<'a> {
    pub fn new(rb: &'a RingBuffer) -> Self {
        MpscRingBufferWriter { rb }
    }

    pub fn reserve(
        &self,
        n: usize,
        timeout: Duration,
    ) -> Result<MpscReservation<'a>, ReserveError> {
        let guard = SpinLock::new(self.rb.mpsc_spinlock())
            .try_lock(timeout)
            .ok_or(ReserveError::StaleLock)?;

        let head = self.rb.mpsc_head().load(Ordering::Relaxed);
        let tail = self.rb.mpsc_tail().load(Ordering::Acquire);
        let need = align8(LENGTH_WORD + n);
        // Keep space for the zero length word terminating the scan.
        if self.rb.data_size() - (head - tail) < (need + LENGTH_WORD) as u64 {
            return Err(ReserveError::Full);
        }

        Ok(MpscReservation {
            rb: self.rb,
            _guard: guard,
            head,
            len: n,
        })
    }
}

/// An uncommitted record. Dropping it without [`MpscReservation::commit`]
/// abandons the reservation; nothing becomes visible to the consumer.
pub struct MpscReservation<'a> {
    rb: &'a RingBuffer,
    _guard: SpinLockGuard<'a>,
    head: u64,
    len: usize,
}

impl MpscReservation<'_> {
    pub fn bytes(&mut self) -> &mut [u8] {
        let offset = (self.head & self.rb.mask()) as usize + LENGTH_WORD;
        unsafe { slice::from_raw_parts_mut(self.rb.data_ptr().add(offset), self.len) }
    }

    pub fn commit(self) {
        let need = align8(LENGTH_WORD + self.len);
        let mask = self.rb.mask();

        // Zero the next length word so the consumer's scan terminates there.
        unsafe {
            let next = self.rb.data_ptr().add(((self.head + need as u64) & mask) as usize);
            AtomicU32::from_ptr(next as *mut u32).store(0, Ordering::Relaxed);
        }

        self.rb
            .mpsc_head()
            .store(self.head + need as u64, Ordering::Release);

        // The length word is the commit point: once the consumer observes it
        // non-zero with acquire ordering, the payload and the new head are
        // visible too.
        unsafe {
            let length_ptr = self.rb.data_ptr().add((self.head & mask) as usize);
            AtomicU32::from_ptr(length_ptr as *mut u32)
                .store(self.len as u32, Ordering::Release);
        }
        // The guard drops here, releasing the spinlock.
    }
}

#[derive(Debug, thiserror::Error)]
#[error("corrupt MPSC record: length {length} exceeds the committed region ({available} bytes)")]
pub struct CorruptRecord {
    pub length: u32,
    pub available: u64,
}

/// Single consumer. Reads without taking the spinlock; the per-record length
/// word delimits the committed region.
pub struct MpscRingBufferReader<'a> {
    rb: &'a RingBuffer,
    tail: u64,
}

impl<'a> MpscRingBufferReader<'a> {
    pub fn new(rb: &'a RingBuffer) -> Self {
        let tail = rb.mpsc_tail().load(Ordering::Relaxed);
        MpscRingBufferReader { rb, tail }
    }

    /// The next committed record's payload, or `Ok(None)` when the scan
    /// reaches the zero length word. A length that runs past the producers'
    /// head is corruption and the buffer must be abandoned.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>, CorruptRecord> {
        let mask = self.rb.mask();
        let length_ptr = unsafe { self.rb.data_ptr().add((self.tail & mask) as usize) };
        let length =
            unsafe { AtomicU32::from_ptr(length_ptr as *mut u32) }.load(Ordering::Acquire);
        if length == 0 {
            return Ok(None);
        }

        let head = self.rb.mpsc_head().load(Ordering::Acquire);
        let available = head - self.tail;
        let total = align8(LENGTH_WORD + length as usize);
        if total as u64 > available {
            return Err(CorruptRecord { length, available });
        }

        let offset = (self.tail & mask) as usize + LENGTH_WORD;
        let payload =
            unsafe { slice::from_raw_parts(self.rb.data_ptr().add(offset), length as usize) };
        self.tail += total as u64;
        Ok(Some(payload))
    }

    /// Publish consumption to the producers.
    pub fn advance(&mut self) {
        self.rb.mpsc_tail().store(self.tail, Ordering::Release);
    }
}

impl Drop for MpscRingBufferReader<'_> {
    fn drop(&mut self) {
        self.advance();
    }
}
