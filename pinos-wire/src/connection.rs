// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `SOCK_STREAM` framing with `SCM_RIGHTS` out-of-band file descriptor
//! passing: the socket gives no message boundaries, so each
//! [`Connection`] keeps a growable accumulation buffer and reassembles
//! as many complete `{target_id, opcode, size}`-framed messages as a
//! single `recvmsg` happens to deliver, matching
//! `original_source/pinos/client/context.c:564`'s `grow_connection_data`
//! reassembly loop rather than assuming one read equals one message.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::socket::{
    self, ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg, UnixAddr,
};

use crate::error::{Error, ProtocolError};

/// Size of each individual `recvmsg` read into the accumulation buffer.
/// The buffer itself is unbounded (a plain `Vec`, which already grows
/// geometrically); this just bounds how much a single syscall copies.
const READ_CHUNK: usize = 1 << 16;

/// Maximum file descriptors a single message may carry. Mirrors the
/// kernel's practical `SCM_MAX_FD` ceiling.
pub const MAX_FDS_PER_MESSAGE: usize = 28;

/// A decoded incoming message: the target/opcode header, the raw POD
/// payload bytes, and any fds that rode along via `SCM_RIGHTS`.
pub struct Message {
    pub target_id: u32,
    pub opcode: u8,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Packs the 8-byte frame header. `payload_len` is the body length alone;
/// the wire `size` field carries `payload_len + 8` (size *including* the
/// header, per the external wire format).
fn pack_header(target_id: u32, opcode: u8, payload_len: usize) -> Result<[u8; 8], Error> {
    let size = payload_len + 8;
    if size > 0x00FF_FFFF {
        return Err(Error::Protocol(ProtocolError::Decode));
    }
    let word = ((opcode as u32) << 24) | (size as u32 & 0x00FF_FFFF);
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&target_id.to_le_bytes());
    out[4..8].copy_from_slice(&word.to_le_bytes());
    Ok(out)
}

/// Unpacks the header, returning `(target_id, opcode, payload_len)` with
/// the header's own 8 bytes already subtracted out of `payload_len`.
fn unpack_header(buf: &[u8]) -> Result<(u32, u8, usize), Error> {
    if buf.len() < 8 {
        return Err(Error::Protocol(ProtocolError::Truncated));
    }
    let target_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let word = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let opcode = (word >> 24) as u8;
    let size = (word & 0x00FF_FFFF) as usize;
    let payload_len = size
        .checked_sub(8)
        .ok_or(Error::Protocol(ProtocolError::Truncated))?;
    Ok((target_id, opcode, payload_len))
}

/// A queued outgoing message waiting for [`Connection::flush`].
struct Outgoing {
    bytes: Vec<u8>,
    fds: Vec<RawFd>,
    // Keeps the fds alive until the sendmsg() actually happens.
    _owned: Vec<OwnedFd>,
}

/// One end of a connected `SOCK_STREAM` socket, buffering writes until
/// [`flush`](Self::flush) and reassembling incoming messages out of the
/// raw byte stream, returned one at a time via
/// [`poll_recv`](Self::poll_recv).
pub struct Connection {
    fd: OwnedFd,
    pending: Vec<Outgoing>,
    build_buf: Vec<u8>,
    build_fds: Vec<OwnedFd>,
    /// Bytes received but not yet split into complete messages.
    recv_buf: Vec<u8>,
    /// Absolute stream offset of `recv_buf[0]`, i.e. how many bytes have
    /// already been drained off the front since the connection opened.
    recv_offset: u64,
    /// fds collected off `SCM_RIGHTS`, each tagged with the absolute
    /// stream offset its `recvmsg` call started appending at. Since
    /// every sent message is its own `sendmsg` with its fds attached to
    /// that call's first byte (see [`flush`]), a message starting at
    /// exactly that offset claims them; nothing else does.
    recv_fds: VecDeque<(u64, Vec<OwnedFd>)>,
}

impl Connection {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            pending: Vec::new(),
            build_buf: Vec::new(),
            build_fds: Vec::new(),
            recv_buf: Vec::new(),
            recv_offset: 0,
            recv_fds: VecDeque::new(),
        }
    }

    /// Connects to a `SOCK_STREAM` unix socket at `path`.
    pub fn connect(path: &Path) -> Result<Self, Error> {
        let fd = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path).map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;
        socket::connect(fd.as_raw_fd(), &addr)?;
        Ok(Self::from_fd(fd))
    }

    /// Builds a socketpair-connected pair for tests.
    pub fn pair() -> Result<(Self, Self), Error> {
        let (a, b) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::from_fd(a), Self::from_fd(b)))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Begins building a message body: returns a scratch buffer the caller
    /// fills with POD records via [`crate::pod::Builder`].
    pub fn begin_write(&mut self) -> &mut Vec<u8> {
        self.build_buf.clear();
        self.build_fds.clear();
        &mut self.build_buf
    }

    /// Attaches an fd to the message currently under construction, to be
    /// sent as an `SCM_RIGHTS` ancillary datum alongside it.
    pub fn write_fd(&mut self, fd: OwnedFd) -> Result<(), Error> {
        if self.build_fds.len() >= MAX_FDS_PER_MESSAGE {
            return Err(Error::OutOfResources);
        }
        self.build_fds.push(fd);
        Ok(())
    }

    /// Finishes the message started by [`begin_write`](Self::begin_write),
    /// framing it with `{target_id, opcode, size}` and queuing it for the
    /// next [`flush`](Self::flush).
    pub fn end_write(&mut self, target_id: u32, opcode: u8) -> Result<(), Error> {
        let header = pack_header(target_id, opcode, self.build_buf.len())?;
        let mut bytes = Vec::with_capacity(8 + self.build_buf.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.build_buf);
        let owned = std::mem::take(&mut self.build_fds);
        let fds: Vec<RawFd> = owned.iter().map(|f| f.as_raw_fd()).collect();
        self.pending.push(Outgoing { bytes, fds, _owned: owned });
        Ok(())
    }

    pub fn need_flush(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Sends every queued message as its own `sendmsg` call, so its fds
    /// (if any) ride alongside the first byte of that message on the wire.
    pub fn flush(&mut self) -> Result<(), Error> {
        while let Some(msg) = self.pending.first() {
            let iov = [IoSlice::new(&msg.bytes)];
            let cmsgs = if msg.fds.is_empty() {
                Vec::new()
            } else {
                vec![ControlMessage::ScmRights(&msg.fds)]
            };
            socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(|e| Error::Transport(std::io::Error::from(e)))?;
            self.pending.remove(0);
        }
        Ok(())
    }

    /// Returns the next complete message already sitting in the
    /// accumulation buffer, without touching the socket.
    fn take_buffered_message(&mut self) -> Result<Option<Message>, Error> {
        if self.recv_buf.len() < 8 {
            return Ok(None);
        }
        let (target_id, opcode, payload_len) = unpack_header(&self.recv_buf)?;
        let total_len = 8 + payload_len;
        if self.recv_buf.len() < total_len {
            return Ok(None);
        }

        let payload = self.recv_buf[8..total_len].to_vec();
        let msg_start = self.recv_offset;

        let fds = if self.recv_fds.front().is_some_and(|(off, _)| *off == msg_start) {
            self.recv_fds.pop_front().unwrap().1
        } else {
            Vec::new()
        };

        self.recv_buf.drain(..total_len);
        self.recv_offset += total_len as u64;

        Ok(Some(Message { target_id, opcode, payload, fds }))
    }

    /// Reads one `recvmsg` worth of bytes (and any `SCM_RIGHTS` fds) off
    /// the socket into the accumulation buffer. `Ok(false)` means the
    /// peer shut down (`EOF`).
    fn fill_from_socket(&mut self) -> Result<bool, Error> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut iov = [IoSliceMut::new(&mut chunk)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
        let recv: RecvMsg<()> = socket::recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(|e| Error::Transport(std::io::Error::from(e)))?;

        if recv.bytes == 0 {
            return Ok(false);
        }

        let read_start = self.recv_offset + self.recv_buf.len() as u64;
        let mut fds = Vec::new();
        for cmsg in recv.cmsgs().map_err(|e| Error::Transport(std::io::Error::from(e)))? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    // SAFETY: the kernel just handed us ownership of this
                    // fd via SCM_RIGHTS; it is not tracked elsewhere.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        if !fds.is_empty() {
            self.recv_fds.push_back((read_start, fds));
        }

        self.recv_buf.extend_from_slice(&chunk[..recv.bytes]);
        Ok(true)
    }

    /// Returns the next whole reassembled message, reading from the
    /// socket only when the buffer doesn't already hold a complete one.
    /// `None` means the peer shut down (`EOF`) with no message pending.
    pub fn poll_recv(&mut self) -> Result<Option<Message>, Error> {
        if let Some(msg) = self.take_buffered_message()? {
            return Ok(Some(msg));
        }
        loop {
            if !self.fill_from_socket()? {
                return Ok(None);
            }
            if let Some(msg) = self.take_buffered_message()? {
                return Ok(Some(msg));
            }
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A plain blocking [`std::io::Read`]/[`std::io::Write`] pair, for
/// callers that only need raw bytes and don't care about fd passing —
/// used by unit tests that exercise [`crate::pod`] end to end over a
/// real socket.
pub fn stream_pair() -> std::io::Result<(UnixStream, UnixStream)> {
    UnixStream::pair()
}

use std::os::fd::FromRawFd;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{Builder, PodType, parse_one};

    #[test]
    fn round_trips_header_and_payload_over_stream() {
        let (mut a, mut b) = Connection::pair().unwrap();

        let buf = a.begin_write();
        Builder::new(buf).write_int(42);
        a.end_write(7, 3).unwrap();
        a.flush().unwrap();

        let msg = b.poll_recv().unwrap().expect("message");
        assert_eq!(msg.target_id, 7);
        assert_eq!(msg.opcode, 3);
        assert!(msg.fds.is_empty());
        let pod = parse_one(&msg.payload).unwrap();
        assert_eq!(pod.as_int().unwrap(), 42);
    }

    #[test]
    fn passes_fds_out_of_band() {
        let (mut a, mut b) = Connection::pair().unwrap();

        let (r, _w) = nix::unistd::pipe().unwrap();
        let buf = a.begin_write();
        Builder::new(buf).write_fd(0);
        a.write_fd(r).unwrap();
        a.end_write(1, 0).unwrap();
        a.flush().unwrap();

        let msg = b.poll_recv().unwrap().expect("message");
        assert_eq!(msg.fds.len(), 1);
    }

    #[test]
    fn several_messages_sent_back_to_back_are_each_reassembled() {
        let (mut a, mut b) = Connection::pair().unwrap();

        for i in 0..3 {
            let buf = a.begin_write();
            Builder::new(buf).write_int(i);
            a.end_write(0, 0).unwrap();
        }
        assert!(a.need_flush());
        a.flush().unwrap();
        assert!(!a.need_flush());

        for i in 0..3 {
            let msg = b.poll_recv().unwrap().expect("message");
            let pod = parse_one(&msg.payload).unwrap();
            assert_eq!(pod.as_int().unwrap(), i);
        }
    }

    #[test]
    fn a_message_split_across_two_writes_is_reassembled() {
        use std::io::Write;
        let (raw_a, raw_b) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let mut writer = std::os::unix::net::UnixStream::from(raw_a);
        let mut b = Connection::from_fd(raw_b);

        let mut payload = Vec::new();
        Builder::new(&mut payload).write_int(99);
        let header = pack_header(3, 1, payload.len()).unwrap();
        let mut whole = header.to_vec();
        whole.extend_from_slice(&payload);

        let tail = whole.split_off(4);
        writer.write_all(&whole).unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            writer.write_all(&tail).unwrap();
        });

        let msg = b.poll_recv().unwrap().expect("reassembled message");
        assert_eq!(msg.target_id, 3);
        let pod = parse_one(&msg.payload).unwrap();
        assert_eq!(pod.as_int().unwrap(), 99);
    }

    #[test]
    fn peer_shutdown_yields_none() {
        let (a, mut b) = Connection::pair().unwrap();
        drop(a);
        assert!(b.poll_recv().unwrap().is_none());
    }

    #[test]
    fn header_packs_opcode_and_size_into_one_word() {
        let header = pack_header(5, 200, 0x00AB_CDEF & 0x00FF_FFFF).unwrap();
        let (id, opcode, size) = unpack_header(&header).unwrap();
        assert_eq!(id, 5);
        assert_eq!(opcode, 200);
        assert_eq!(size, 0x00AB_CDEF & 0x00FF_FFFF);
    }

    #[test]
    fn oversized_payload_is_rejected_at_framing_time() {
        assert!(pack_header(0, 0, 0x0100_0000).is_err());
    }

    #[test]
    fn too_many_fds_is_rejected() {
        let (mut a, _b) = Connection::pair().unwrap();
        a.begin_write();
        for _ in 0..MAX_FDS_PER_MESSAGE {
            let (r, _w) = nix::unistd::pipe().unwrap();
            a.write_fd(r).unwrap();
        }
        let (r, _w) = nix::unistd::pipe().unwrap();
        assert!(matches!(a.write_fd(r), Err(Error::OutOfResources)));
    }
}
