//! Shared wire format between the everprof profiler and its in-process agent.
//!
//! Everything in here is consumed from both sides of a process boundary: the
//! record layouts written by the agent must parse with the profiler's perf
//! record reader, and the ring buffers are mapped into both address spaces.

mod ipc;
mod mpsc_rb;
mod perf_rb;
mod records;
mod ring_buffer;
mod spinlock;

pub use ipc::{
    recv_reply, recv_request, send_reply, send_request, set_timeouts, IpcError, ReplyMessage,
    RequestMessage, DEFAULT_SOCKET_TIMEOUT, REQUEST_RING_BUFFER,
};
pub use mpsc_rb::{
    CorruptRecord, MpscReservation, MpscRingBufferReader, MpscRingBufferWriter, ReserveError,
    RESERVE_TIMEOUT,
};
pub use perf_rb::{PerfRingBufferReader, PerfRingBufferWriter};
pub use records::*;
pub use ring_buffer::{
    MpscMetadataPage, PerfEventMmapPage, RingBuffer, RingBufferError, RingBufferInfo,
    RingBufferKind, PAGE_SIZE,
};
pub use spinlock::{SpinLock, SpinLockGuard};
