use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::sys::time::TimeVal;

use crate::ring_buffer::RingBufferInfo;

/// Applied to both send and receive on both sides of the handshake.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

/// The only request the agent currently makes: hand me the allocation ring
/// buffer.
pub const REQUEST_RING_BUFFER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMessage {
    pub request: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyMessage {
    pub request: u32,
    pub pid: i32,
    pub ring_buffer_info: RingBufferInfo,
}

const REQUEST_SIZE: usize = 4;
const REPLY_SIZE: usize = 4 + 4 + 8 + 4 + 8;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("socket error: {0}")]
    Socket(#[from] nix::Error),
    #[error("short message: got {got} bytes, expected {expected}")]
    ShortMessage { got: usize, expected: usize },
    #[error("reply did not carry the two ring buffer file descriptors")]
    MissingFds,
}

pub fn set_timeouts<F: AsFd>(fd: &F, timeout: Duration) -> Result<(), IpcError> {
    let tv = TimeVal::new(
        timeout.as_secs() as _,
        timeout.subsec_micros() as _,
    );
    setsockopt(fd, sockopt::ReceiveTimeout, &tv)?;
    setsockopt(fd, sockopt::SendTimeout, &tv)?;
    Ok(())
}

pub fn send_request<F: AsFd>(fd: &F, msg: &RequestMessage) -> Result<(), IpcError> {
    let buf = msg.request.to_le_bytes();
    let iov = [IoSlice::new(&buf)];
    sendmsg::<UnixAddr>(fd.as_fd().as_raw_fd(), &iov, &[], MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive a request; also returns the sender's (auto-bound) address so a
/// datagram server can address its reply.
pub fn recv_request<F: AsFd>(fd: &F) -> Result<(RequestMessage, Option<UnixAddr>), IpcError> {
    let mut buf = [0u8; REQUEST_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg = recvmsg::<UnixAddr>(
        fd.as_fd().as_raw_fd(),
        &mut iov,
        None,
        MsgFlags::empty(),
    )?;
    let peer = msg.address;
    if msg.bytes < REQUEST_SIZE {
        return Err(IpcError::ShortMessage {
            got: msg.bytes,
            expected: REQUEST_SIZE,
        });
    }
    Ok((
        RequestMessage {
            request: u32::from_le_bytes(buf),
        },
        peer,
    ))
}

fn encode_reply(msg: &ReplyMessage) -> [u8; REPLY_SIZE] {
    let mut buf = [0u8; REPLY_SIZE];
    buf[0..4].copy_from_slice(&msg.request.to_le_bytes());
    buf[4..8].copy_from_slice(&msg.pid.to_le_bytes());
    buf[8..16].copy_from_slice(&msg.ring_buffer_info.mem_size.to_le_bytes());
    buf[16..20].copy_from_slice(&msg.ring_buffer_info.ring_buffer_type.to_le_bytes());
    buf[20..28].copy_from_slice(&msg.ring_buffer_info.allocation_interval.to_le_bytes());
    buf
}

fn decode_reply(buf: &[u8; REPLY_SIZE]) -> ReplyMessage {
    ReplyMessage {
        request: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        pid: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        ring_buffer_info: RingBufferInfo {
            mem_size: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            ring_buffer_type: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            allocation_interval: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        },
    }
}

/// Send the reply plus the ring buffer's memfd and eventfd via `SCM_RIGHTS`.
/// `to` addresses an unconnected datagram peer; pass `None` on a connected
/// socket.
pub fn send_reply<F: AsFd>(
    fd: &F,
    msg: &ReplyMessage,
    ring_fd: RawFd,
    event_fd: RawFd,
    to: Option<&UnixAddr>,
) -> Result<(), IpcError> {
    let buf = encode_reply(msg);
    let iov = [IoSlice::new(&buf)];
    let fds = [ring_fd, event_fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(fd.as_fd().as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), to)?;
    Ok(())
}

/// Receive the reply and the two ancillary file descriptors.
pub fn recv_reply<F: AsFd>(fd: &F) -> Result<(ReplyMessage, OwnedFd, OwnedFd), IpcError> {
    let mut buf = [0u8; REPLY_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);
    let msg = recvmsg::<UnixAddr>(
        fd.as_fd().as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;
    if msg.bytes < REPLY_SIZE {
        return Err(IpcError::ShortMessage {
            got: msg.bytes,
            expected: REPLY_SIZE,
        });
    }

    let mut received = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                received.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    if received.len() != 2 {
        return Err(IpcError::MissingFds);
    }
    let event_fd = received.pop().unwrap();
    let ring_fd = received.pop().unwrap();
    Ok((decode_reply(&buf), ring_fd, event_fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_encoding_round_trip() {
        let msg = ReplyMessage {
            request: REQUEST_RING_BUFFER,
            pid: 4242,
            ring_buffer_info: RingBufferInfo {
                mem_size: 4096 * 257,
                ring_buffer_type: 1,
                allocation_interval: 524288,
            },
        };
        assert_eq!(decode_reply(&encode_reply(&msg)), msg);
    }
}
