//! Handshake server: agents in target processes request the allocation ring
//! buffer over a Unix datagram socket and get the reply plus two file
//! descriptors back.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::sys::socket::{bind, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use everprof_events::{
    recv_request, send_reply, set_timeouts, ReplyMessage, RingBuffer, DEFAULT_SOCKET_TIMEOUT,
    REQUEST_RING_BUFFER,
};

use crate::error::{ErrorKind, ProfilerError, Result};

pub struct HandshakeServer {
    socket: OwnedFd,
    path: PathBuf,
}

impl HandshakeServer {
    pub fn bind(path: &Path) -> Result<Self> {
        // A previous run may have left the socket node behind.
        let _ = std::fs::remove_file(path);
        let socket = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| ProfilerError::error(ErrorKind::Io(e.into())))?;
        let addr =
            UnixAddr::new(path).map_err(|e| ProfilerError::error(ErrorKind::Io(e.into())))?;
        bind(socket.as_raw_fd(), &addr)
            .map_err(|e| ProfilerError::error(ErrorKind::Io(e.into())))?;
        set_timeouts(&socket, DEFAULT_SOCKET_TIMEOUT)?;
        log::info!("agent handshake socket at {}", path.display());
        Ok(HandshakeServer {
            socket,
            path: path.to_owned(),
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Answer one pending request with the allocation ring buffer's fds.
    pub fn handle_request(&self, ring_buffer: &RingBuffer, allocation_interval: u64) -> Result<()> {
        let (request, peer) = recv_request(&self.socket)?;
        if request.request != REQUEST_RING_BUFFER {
            log::warn!("ignoring unknown agent request {}", request.request);
            return Ok(());
        }
        let reply = ReplyMessage {
            request: request.request,
            pid: std::process::id() as i32,
            ring_buffer_info: ring_buffer.info(allocation_interval),
        };
        send_reply(
            &self.socket,
            &reply,
            ring_buffer.ring_fd().as_raw_fd(),
            ring_buffer.event_fd().as_raw_fd(),
            peer.as_ref(),
        )?;
        Ok(())
    }
}

impl Drop for HandshakeServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
