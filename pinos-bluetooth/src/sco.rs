// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The SCO (HSP/HFP voice) realtime I/O loop (C10, SPEC_FULL.md §4.8):
//! timerfd-paced mSBC framing over the SCO socket, plus RFCOMM AT-command
//! handling for HSP gain control, grounded on
//! `original_source/spa/plugins/bluez5/sco-sink.c`.

use std::collections::VecDeque;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::error::Error;

/// `AF_BLUETOOTH`/`BTPROTO_SCO`/`SOL_SCO`/`SCO_OPTIONS`: none of these are
/// exposed by `nix` or `libc` (they come from `<bluetooth/bluetooth.h>`
/// and `<bluetooth/sco.h>`, not glibc), so they're defined here directly
/// from the kernel/BlueZ ABI, grounded on
/// `original_source/spa/plugins/bluez5/backend-hsp-native.c`.
pub const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_SCO: libc::c_int = 2;
const SOL_SCO: libc::c_int = 17;
const SCO_OPTIONS: libc::c_int = 1;

/// `bdaddr_t`: a Bluetooth device address, stored little-endian (the
/// last octet of the human-readable `AA:BB:CC:DD:EE:FF` form is `b[0]`).
#[repr(C)]
#[derive(Clone, Copy)]
struct BdAddr {
    b: [u8; 6],
}

#[repr(C)]
struct SockAddrSco {
    sco_family: libc::sa_family_t,
    sco_bdaddr: BdAddr,
}

#[repr(C)]
#[derive(Default)]
struct ScoOptions {
    mtu: u16,
}

/// Parses a `"AA:BB:CC:DD:EE:FF"` address into wire-order `bdaddr_t`
/// bytes, avoiding a dependency on `libbluetooth` for `str2ba`.
fn parse_bdaddr(addr: &str) -> Option<BdAddr> {
    let octets: Vec<&str> = addr.split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    let mut b = [0u8; 6];
    for (i, octet) in octets.iter().rev().enumerate() {
        b[i] = u8::from_str_radix(octet, 16).ok()?;
    }
    Some(BdAddr { b })
}

fn sco_addr(addr: &str) -> Result<SockAddrSco, Error> {
    let sco_bdaddr = parse_bdaddr(addr).ok_or_else(|| Error::NotAvailable(format!("malformed Bluetooth address {addr}")))?;
    Ok(SockAddrSco { sco_family: AF_BLUETOOTH as libc::sa_family_t, sco_bdaddr })
}

fn raw_socket() -> Result<RawFd, Error> {
    // SAFETY: a plain `socket(2)` call with no pointer arguments.
    let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, BTPROTO_SCO) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(fd)
}

/// Reads the kernel-negotiated MTU off an established SCO socket via
/// `getsockopt(SOL_SCO, SCO_OPTIONS)`, falling back to 48/48 (the
/// original's documented fallback) if the kernel doesn't support it.
fn negotiated_mtu(fd: RawFd) -> (u16, u16) {
    let mut opts = ScoOptions::default();
    let mut len = std::mem::size_of::<ScoOptions>() as libc::socklen_t;
    // SAFETY: `opts`/`len` describe a valid, correctly sized buffer.
    let rc = unsafe { libc::getsockopt(fd, SOL_SCO, SCO_OPTIONS, &mut opts as *mut _ as *mut libc::c_void, &mut len) };
    if rc < 0 {
        (48, 48)
    } else {
        (opts.mtu, opts.mtu)
    }
}

/// Opens an outbound SCO connection to `remote`, bound to the local
/// adapter `local`, per `sco_do_connect`. Non-blocking: a return of
/// `EINPROGRESS` is not an error, matching the original's handling —
/// the caller polls the fd for writability to learn when it completes.
pub fn connect(local: &str, remote: &str) -> Result<OwnedFd, Error> {
    let fd = raw_socket()?;
    let local_addr = sco_addr(local)?;
    // SAFETY: `local_addr` is a validly sized `sockaddr_sco`.
    let rc = unsafe { libc::bind(fd, &local_addr as *const _ as *const libc::sockaddr, std::mem::size_of::<SockAddrSco>() as libc::socklen_t) };
    if rc < 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(e));
    }
    let remote_addr = sco_addr(remote)?;
    // SAFETY: `remote_addr` is a validly sized `sockaddr_sco`.
    let rc = unsafe { libc::connect(fd, &remote_addr as *const _ as *const libc::sockaddr, std::mem::size_of::<SockAddrSco>() as libc::socklen_t) };
    if rc < 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EINPROGRESS) && errno.raw_os_error() != Some(libc::EAGAIN) {
            unsafe { libc::close(fd) };
            return Err(Error::Io(errno));
        }
    }
    // SAFETY: `fd` was just opened above and is uniquely owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens a listening SCO socket bound to the local adapter `local`,
/// per `sco_listen`. The caller `poll`s it for readability and calls
/// [`accept`] on each readiness notification.
pub fn listen(local: &str) -> Result<OwnedFd, Error> {
    let fd = raw_socket()?;
    let local_addr = sco_addr(local)?;
    // SAFETY: `local_addr` is a validly sized `sockaddr_sco`.
    let rc = unsafe { libc::bind(fd, &local_addr as *const _ as *const libc::sockaddr, std::mem::size_of::<SockAddrSco>() as libc::socklen_t) };
    if rc < 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(e));
    }
    // SAFETY: no pointer arguments beyond `fd` itself.
    if unsafe { libc::listen(fd, 1) } < 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(e));
    }
    // SAFETY: `fd` was just opened above and is uniquely owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Accepts one pending inbound connection on a [`listen`]ing socket,
/// returning `(fd, read_mtu, write_mtu)`. `Ok(None)` means nothing was
/// pending (`EAGAIN`), matching `sco_do_accept`'s non-fatal handling.
pub fn accept(listener: &OwnedFd) -> Result<Option<(OwnedFd, u16, u16)>, Error> {
    use std::os::fd::AsRawFd;
    // SAFETY: a plain `accept4(2)` with null peer-address output.
    let fd = unsafe { libc::accept4(listener.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) };
    if fd < 0 {
        let e = std::io::Error::last_os_error();
        if e.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(Error::Io(e));
    }
    let (read_mtu, write_mtu) = negotiated_mtu(fd);
    // SAFETY: `fd` was just opened above and is uniquely owned here.
    Ok(Some((unsafe { OwnedFd::from_raw_fd(fd) }, read_mtu, write_mtu)))
}

/// H2 sync-word sequence-number nibble pairs, one per `seq % 4`.
pub const SN_TABLE: [u8; 4] = [0x08, 0x38, 0xC8, 0xF8];

/// Wire size of one mSBC-over-SCO packet: 2-byte H2 header, 57-byte SBC
/// frame payload, 1-byte zero trailer.
pub const MSBC_PACKET_LEN: usize = 60;
pub const MSBC_PAYLOAD_LEN: usize = MSBC_PACKET_LEN - 3;

/// Frames one mSBC payload into its H2-headered SCO packet.
pub fn frame_msbc_packet(seq: u8, payload: &[u8]) -> Result<[u8; MSBC_PACKET_LEN], Error> {
    if payload.len() != MSBC_PAYLOAD_LEN {
        return Err(Error::NotSupported(format!(
            "mSBC payload must be {MSBC_PAYLOAD_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let mut packet = [0u8; MSBC_PACKET_LEN];
    packet[0] = 0x01;
    packet[1] = SN_TABLE[(seq % 4) as usize];
    packet[2..2 + MSBC_PAYLOAD_LEN].copy_from_slice(payload);
    packet[MSBC_PACKET_LEN - 1] = 0x00;
    Ok(packet)
}

/// Validates and extracts the payload from a received mSBC packet,
/// returning the sequence number recovered from the H2 header.
pub fn deframe_msbc_packet(packet: &[u8; MSBC_PACKET_LEN]) -> Option<(u8, [u8; MSBC_PAYLOAD_LEN])> {
    if packet[0] != 0x01 {
        return None;
    }
    let seq = SN_TABLE.iter().position(|&b| b == packet[1])? as u8;
    let mut payload = [0u8; MSBC_PAYLOAD_LEN];
    payload.copy_from_slice(&packet[2..2 + MSBC_PAYLOAD_LEN]);
    Some((seq, payload))
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// The SCO buffer's ring capacity: the smallest size evenly divisible
/// by a 24-byte CVSD frame, a 60-byte mSBC packet, the socket's
/// negotiated write MTU, and two mSBC packets' worth (`2*60`), so that
/// no framing boundary ever straddles a wraparound.
pub fn ring_capacity(write_mtu: usize) -> usize {
    [24, 60, write_mtu.max(1), 2 * 60].into_iter().fold(1, lcm)
}

/// A byte queue sized by [`ring_capacity`], holding framed packets
/// pending write to (or just read from) the SCO socket.
pub struct ScoRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl ScoRing {
    pub fn new(write_mtu: usize) -> Self {
        let capacity = ring_capacity(write_mtu);
        Self { buf: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.buf.len() + bytes.len() > self.capacity {
            return Err(Error::TransportBusy);
        }
        self.buf.extend(bytes);
        Ok(())
    }

    pub fn pop(&mut self, n: usize) -> Vec<u8> {
        let take = n.min(self.buf.len());
        self.buf.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Two timerfds driving the loop: `io` fires once per packet interval
/// (paces writes to the SCO socket at its fixed frame rate), `flush`
/// fires on a slower cadence to force out any partially filled buffer
/// rather than let audio accumulate latency.
pub struct ScoTimers {
    pub io: TimerFd,
    pub flush: TimerFd,
}

impl ScoTimers {
    pub fn new(io_interval: Duration, flush_interval: Duration) -> Result<Self, Error> {
        let io = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::empty())?;
        io.set(Expiration::IntervalDelay(io_interval.into(), io_interval.into()), TimerSetTimeFlags::empty())?;
        let flush = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::empty())?;
        flush.set(Expiration::IntervalDelay(flush_interval.into(), flush_interval.into()), TimerSetTimeFlags::empty())?;
        Ok(Self { io, flush })
    }
}

/// An RFCOMM AT command relevant to HSP gain control and key-press
/// signaling, per `original_source`'s RFCOMM handling.
#[derive(Debug, PartialEq, Eq)]
pub enum AtCommand {
    /// `AT+VGS=n`: speaker (output) gain, 0..=15.
    SpeakerGain(u8),
    /// `AT+VGM=n`: microphone (input) gain, 0..=15.
    MicGain(u8),
    /// `AT+CKPD=n`: a simulated key press (HSP button, usually `200`).
    KeyPress(u8),
    Unknown(String),
}

impl AtCommand {
    /// Parses one RFCOMM line (without the trailing `\r\n`).
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("AT+VGS=").and_then(|v| v.parse().ok()) {
            return Self::SpeakerGain(v);
        }
        if let Some(v) = line.strip_prefix("AT+VGM=").and_then(|v| v.parse().ok()) {
            return Self::MicGain(v);
        }
        if let Some(v) = line.strip_prefix("AT+CKPD=").and_then(|v| v.parse().ok()) {
            return Self::KeyPress(v);
        }
        Self::Unknown(line.to_string())
    }

    /// Renders the command back to wire form, e.g. for the AG side to
    /// echo a gain change it initiated locally.
    pub fn to_wire(&self) -> String {
        match self {
            Self::SpeakerGain(v) => format!("AT+VGS={v}\r"),
            Self::MicGain(v) => format!("AT+VGM={v}\r"),
            Self::KeyPress(v) => format!("AT+CKPD={v}\r"),
            Self::Unknown(s) => format!("{s}\r"),
        }
    }
}

pub const AT_OK: &str = "\r\nOK\r\n";
pub const AT_ERROR: &str = "\r\nERROR\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msbc_packet_round_trips() {
        let payload = [0xAAu8; MSBC_PAYLOAD_LEN];
        let packet = frame_msbc_packet(2, &payload).unwrap();
        assert_eq!(packet[0], 0x01);
        assert_eq!(packet[1], SN_TABLE[2]);
        assert_eq!(packet[MSBC_PACKET_LEN - 1], 0x00);

        let (seq, decoded) = deframe_msbc_packet(&packet).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn wrong_payload_length_is_rejected() {
        assert!(frame_msbc_packet(0, &[0u8; 10]).is_err());
    }

    #[test]
    fn ring_capacity_is_divisible_by_all_framing_sizes() {
        let cap = ring_capacity(48);
        for factor in [24, 60, 48, 120] {
            assert_eq!(cap % factor, 0);
        }
    }

    #[test]
    fn sco_ring_rejects_overflow_push() {
        let mut ring = ScoRing::new(48);
        let cap = ring.capacity();
        assert!(ring.push(&vec![0u8; cap]).is_ok());
        assert!(ring.push(&[0u8]).is_err());
    }

    #[test]
    fn at_command_parses_known_hsp_gain_commands() {
        assert_eq!(AtCommand::parse("AT+VGS=12"), AtCommand::SpeakerGain(12));
        assert_eq!(AtCommand::parse("AT+VGM=3"), AtCommand::MicGain(3));
        assert_eq!(AtCommand::parse("AT+CKPD=200"), AtCommand::KeyPress(200));
        assert!(matches!(AtCommand::parse("AT+FOO=1"), AtCommand::Unknown(_)));
    }

    #[test]
    fn at_command_round_trips_to_wire() {
        assert_eq!(AtCommand::SpeakerGain(5).to_wire(), "AT+VGS=5\r");
    }

    #[test]
    fn bdaddr_parses_in_wire_byte_order() {
        let addr = parse_bdaddr("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(addr.b, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn bdaddr_rejects_malformed_address() {
        assert!(parse_bdaddr("not-an-address").is_none());
        assert!(sco_addr("not-an-address").is_err());
    }
}
