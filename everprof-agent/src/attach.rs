//! Handshake client: ask the profiler for the allocation ring buffer over a
//! Unix datagram socket and map it.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use nix::sys::socket::{bind, connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use everprof_events::{
    recv_reply, send_request, set_timeouts, IpcError, RequestMessage, RingBuffer, RingBufferError,
    RingBufferKind, REQUEST_RING_BUFFER,
};

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("socket setup failed: {0}")]
    Socket(#[from] nix::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] IpcError),
    #[error("profiler sent an unusable ring buffer: {0}")]
    RingBuffer(#[from] RingBufferError),
    #[error("profiler sent unknown ring buffer type {0}")]
    BadKind(u32),
}

/// Returns the mapped ring buffer and the profiler-chosen sampling interval.
pub fn attach_to_profiler(
    socket_path: &Path,
    timeout: Duration,
) -> Result<(RingBuffer, u64), AttachError> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    set_timeouts(&fd, timeout)?;
    // Datagram replies need a return address; bind an abstract one unique
    // to this process before connecting.
    let pid = unsafe { libc::getpid() };
    let local = UnixAddr::new_abstract(format!("everprof-agent-{pid}").as_bytes())?;
    bind(fd.as_raw_fd(), &local)?;
    connect(fd.as_raw_fd(), &UnixAddr::new(socket_path)?)?;

    send_request(
        &fd,
        &RequestMessage {
            request: REQUEST_RING_BUFFER,
        },
    )?;
    let (reply, ring_fd, event_fd) = recv_reply(&fd)?;

    let info = reply.ring_buffer_info;
    let kind = RingBufferKind::from_u32(info.ring_buffer_type)
        .ok_or(AttachError::BadKind(info.ring_buffer_type))?;
    let rb = RingBuffer::attach(ring_fd, event_fd, info.mem_size as usize, kind)?;
    Ok((rb, info.allocation_interval))
}
