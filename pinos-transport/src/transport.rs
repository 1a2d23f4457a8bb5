// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The shared-memory transport (C6): one memfd mapped by both client and
//! server, laid out as area header, port I/O arrays, and two event
//! rings, per SPEC_FULL.md §3/§4.3.

use std::ffi::CString;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use crate::area::{AreaHeader, NodeEvent, PortIo, NODE_EVENT_WIRE_SIZE};
use crate::error::Error;
use crate::eventfd::Wakeup;
use crate::ring::{RingBuffer, RingHeader};

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Clone, Copy)]
struct Layout {
    inputs_offset: usize,
    outputs_offset: usize,
    ring_a_header_offset: usize,
    ring_a_data_offset: usize,
    ring_b_header_offset: usize,
    ring_b_data_offset: usize,
    ring_data_len: usize,
    total: usize,
}

impl Layout {
    fn new(max_inputs: u32, max_outputs: u32, ring_data_len: u32) -> Result<Self, Error> {
        if ring_data_len == 0 || !ring_data_len.is_power_of_two() {
            return Err(Error::InvalidCapacity(ring_data_len as usize));
        }
        let area_size = size_of::<AreaHeader>();
        let inputs_offset = align8(area_size);
        let inputs_size = max_inputs as usize * size_of::<PortIo>();
        let outputs_offset = align8(inputs_offset + inputs_size);
        let outputs_size = max_outputs as usize * size_of::<PortIo>();
        let ring_a_header_offset = align8(outputs_offset + outputs_size);
        let ring_header_size = size_of::<RingHeader>();
        let ring_a_data_offset = align8(ring_a_header_offset + ring_header_size);
        let ring_b_header_offset = align8(ring_a_data_offset + ring_data_len as usize);
        let ring_b_data_offset = align8(ring_b_header_offset + ring_header_size);
        let total = ring_b_data_offset + ring_data_len as usize;
        Ok(Self {
            inputs_offset,
            outputs_offset,
            ring_a_header_offset,
            ring_a_data_offset,
            ring_b_header_offset,
            ring_b_data_offset,
            ring_data_len: ring_data_len as usize,
            total,
        })
    }
}

/// Which of the transport's two rings a call refers to. `ClientToServer`
/// carries events the client posts for the server (e.g. a capture
/// node's `HaveOutput`); `ServerToClient` carries the reverse.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RingSide {
    ClientToServer,
    ServerToClient,
}

/// One end of the shared-memory transport. Both the side that created it
/// ([`Transport::create`]) and the side that received the memfd over
/// `SCM_RIGHTS` ([`Transport::attach`]) construct one of these with the
/// same `(max_inputs, max_outputs, ring_data_len)` triple, which the
/// `client_node.transport` event on the control socket communicates out
/// of band.
pub struct Transport {
    _memfd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
    max_inputs: u32,
    max_outputs: u32,
    /// Signaled by the client-to-server ring's producer, consumed by
    /// the server's data loop (§4.3).
    c2s_wakeup: Wakeup,
    /// Signaled by the server-to-client ring's producer, consumed by
    /// the client.
    s2c_wakeup: Wakeup,
}

// SAFETY: `base` points at a `MAP_SHARED` mapping; all mutation goes
// through the atomics embedded in `AreaHeader`/`PortIo`/`RingHeader`, so
// sharing `Transport` across the main and data loop threads is sound.
unsafe impl Send for Transport {}

impl Transport {
    /// Allocates a fresh memfd sized for this layout, maps it, and
    /// zero-initializes the area header (server side, or the owning end
    /// of a loopback transport in tests).
    pub fn create(max_inputs: u32, max_outputs: u32, ring_data_len: u32) -> Result<Self, Error> {
        let layout = Layout::new(max_inputs, max_outputs, ring_data_len)?;
        let name = CString::new("pinos-transport").unwrap();
        let fd = memfd_create(&name, MFdFlags::MFD_CLOEXEC)?;
        ftruncate(&fd, layout.total as i64)?;
        let transport = Self::map(fd, layout, max_inputs, max_outputs, Wakeup::new()?, Wakeup::new()?)?;
        transport.area().max_inputs.store(max_inputs, std::sync::atomic::Ordering::Relaxed);
        transport.area().max_outputs.store(max_outputs, std::sync::atomic::Ordering::Relaxed);
        Ok(transport)
    }

    /// Attaches to a memfd and the two wakeup eventfds received from the
    /// peer over `SCM_RIGHTS` (client side).
    pub fn attach(
        fd: OwnedFd,
        max_inputs: u32,
        max_outputs: u32,
        ring_data_len: u32,
        c2s_wakeup: OwnedFd,
        s2c_wakeup: OwnedFd,
    ) -> Result<Self, Error> {
        let layout = Layout::new(max_inputs, max_outputs, ring_data_len)?;
        Self::map(fd, layout, max_inputs, max_outputs, Wakeup::from_fd(c2s_wakeup), Wakeup::from_fd(s2c_wakeup))
    }

    fn map(
        fd: OwnedFd,
        layout: Layout,
        max_inputs: u32,
        max_outputs: u32,
        c2s_wakeup: Wakeup,
        s2c_wakeup: Wakeup,
    ) -> Result<Self, Error> {
        let len = NonZeroUsize::new(layout.total).ok_or(Error::InvalidCapacity(0))?;
        // SAFETY: `fd` is a valid memfd at least `layout.total` bytes
        // long (we just ftruncate'd it, or trust the peer's matching
        // layout); the mapping is dropped exactly once, in `Drop`.
        let base = unsafe {
            mmap(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, Some(fd.as_fd()), 0)
        }
        .map_err(Error::from)?
        .cast::<u8>();
        Ok(Self { _memfd: fd, base, len: layout.total, layout, max_inputs, max_outputs, c2s_wakeup, s2c_wakeup })
    }

    /// # Safety
    /// Caller must ensure `offset + size_of::<T>() <= self.len` and that
    /// `T`'s layout is valid at that offset (checked by construction in
    /// every call site below).
    unsafe fn at<T>(&self, offset: usize) -> &T {
        &*(self.base.as_ptr().add(offset) as *const T)
    }

    /// Borrows the backing memfd, e.g. to pass a dup'd copy to a peer
    /// over `SCM_RIGHTS` (the server side of `client_node.add_mem`).
    pub fn memfd(&self) -> std::os::fd::BorrowedFd<'_> {
        self._memfd.as_fd()
    }

    pub fn mapped_len(&self) -> usize {
        self.len
    }

    fn wakeup_for(&self, side: RingSide) -> &Wakeup {
        match side {
            RingSide::ClientToServer => &self.c2s_wakeup,
            RingSide::ServerToClient => &self.s2c_wakeup,
        }
    }

    /// The raw fd a consumer on `side` should `poll`/`epoll` for
    /// readability on (the creating/server side keeps the originals;
    /// the client side holds the `SCM_RIGHTS`-received copies).
    pub fn wakeup_fd(&self, side: RingSide) -> std::os::fd::RawFd {
        self.wakeup_for(side).as_raw_fd()
    }

    /// Dup's the eventfd backing `side`'s wakeup, e.g. to hand a copy to
    /// a peer over `SCM_RIGHTS` (`client_node.done`'s readfd/writefd).
    pub fn dup_wakeup_fd(&self, side: RingSide) -> Result<OwnedFd, Error> {
        use std::os::fd::FromRawFd;
        let raw = nix::unistd::dup(self.wakeup_for(side).as_raw_fd())?;
        // SAFETY: `dup` just handed us a fresh, uniquely owned fd.
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    pub fn area(&self) -> &AreaHeader {
        // SAFETY: offset 0 always fits; `Layout::new` sized the mapping
        // to include the area header.
        unsafe { self.at(0) }
    }

    pub fn input_port(&self, index: u32) -> Option<&PortIo> {
        if index >= self.max_inputs {
            return None;
        }
        let offset = self.layout.inputs_offset + index as usize * size_of::<PortIo>();
        // SAFETY: bounds-checked against `max_inputs` above, which the
        // layout reserved room for.
        Some(unsafe { self.at(offset) })
    }

    pub fn output_port(&self, index: u32) -> Option<&PortIo> {
        if index >= self.max_outputs {
            return None;
        }
        let offset = self.layout.outputs_offset + index as usize * size_of::<PortIo>();
        // SAFETY: bounds-checked against `max_outputs` above.
        Some(unsafe { self.at(offset) })
    }

    fn ring(&mut self, side: RingSide) -> RingBuffer<'_> {
        let (header_offset, data_offset) = match side {
            RingSide::ClientToServer => (self.layout.ring_a_header_offset, self.layout.ring_a_data_offset),
            RingSide::ServerToClient => (self.layout.ring_b_header_offset, self.layout.ring_b_data_offset),
        };
        // SAFETY: both offsets were sized by `Layout::new` to fit a
        // `RingHeader` and `ring_data_len` bytes within `self.len`.
        let header: &RingHeader = unsafe { self.at(header_offset) };
        let data = unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(data_offset), self.layout.ring_data_len) };
        RingBuffer::new(header, data).expect("layout guarantees a power-of-two ring")
    }

    /// Producer side of the handoff (§4.3): publishes `buffer_id` on
    /// `port`'s output slot and pushes a `HaveOutput` event, unless a
    /// buffer is already in flight there (backpressure — one in-flight
    /// buffer per port, no queue).
    pub fn publish_output(&mut self, side: RingSide, port: u32, buffer_id: u32) -> Result<bool, Error> {
        let io = self.output_port(port).ok_or(Error::InvalidCapacity(port as usize))?;
        if io.is_pending() {
            return Ok(false);
        }
        io.set_buffer_id(buffer_id);
        io.set_status(crate::area::STATUS_HAVE_DATA);
        let event = NodeEvent::HaveOutput { port }.encode();
        self.ring(side).write(&event)?;
        self.wakeup_for(side).signal()?;
        Ok(true)
    }

    /// Consumer side: marks `port`'s input slot free again and pushes a
    /// `ReuseBuffer` so the producer knows it may reuse `buffer_id`.
    pub fn release_input(&mut self, side: RingSide, port: u32, buffer_id: u32) -> Result<(), Error> {
        if let Some(io) = self.input_port(port) {
            io.set_buffer_id(crate::area::INVALID_BUFFER_ID);
        }
        let event = NodeEvent::ReuseBuffer { port, buffer_id }.encode();
        self.ring(side).write(&event)?;
        self.wakeup_for(side).signal()?;
        Ok(())
    }

    /// Drains every event currently queued on `side`'s ring, invoking
    /// `on_event` for each. Must be called in a loop by the consumer
    /// until the ring is empty, since the eventfd wakeup may coalesce
    /// several posts into one signal.
    pub fn drain(&mut self, side: RingSide, mut on_event: impl FnMut(NodeEvent)) -> Result<(), Error> {
        self.wakeup_for(side).consume()?;
        let mut ring = self.ring(side);
        let mut buf = [0u8; NODE_EVENT_WIRE_SIZE];
        loop {
            let n = ring.read(&mut buf);
            if n == 0 {
                return Ok(());
            }
            if n < NODE_EVENT_WIRE_SIZE {
                return Err(Error::UnknownEvent(0));
            }
            on_event(NodeEvent::decode(&buf)?);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe exactly the mapping created in
        // `map`, unmapped exactly once here.
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_consumer_handoff_round_trips() {
        let mut t = Transport::create(1, 1, 64).unwrap();

        assert!(t.publish_output(RingSide::ClientToServer, 0, 7).unwrap());
        assert_eq!(t.output_port(0).unwrap().buffer_id(), 7);

        let mut seen = Vec::new();
        t.drain(RingSide::ClientToServer, |ev| seen.push(ev)).unwrap();
        assert_eq!(seen, vec![NodeEvent::HaveOutput { port: 0 }]);
    }

    #[test]
    fn backpressure_refuses_second_publish_until_released() {
        let mut t = Transport::create(1, 1, 64).unwrap();
        assert!(t.publish_output(RingSide::ClientToServer, 0, 1).unwrap());
        assert!(!t.publish_output(RingSide::ClientToServer, 0, 2).unwrap());

        t.release_input(RingSide::ServerToClient, 0, 1).unwrap();
        t.output_port(0).unwrap().set_buffer_id(crate::area::INVALID_BUFFER_ID);
        assert!(t.publish_output(RingSide::ClientToServer, 0, 2).unwrap());
    }

    #[test]
    fn drain_loops_until_empty_across_coalesced_events() {
        let mut t = Transport::create(2, 2, 64).unwrap();
        t.publish_output(RingSide::ClientToServer, 0, 1).unwrap();
        t.output_port(0).unwrap().set_buffer_id(crate::area::INVALID_BUFFER_ID);
        t.publish_output(RingSide::ClientToServer, 1, 2).unwrap();

        let mut seen = Vec::new();
        t.drain(RingSide::ClientToServer, |ev| seen.push(ev)).unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let mut t = Transport::create(1, 1, 64).unwrap();
        assert!(t.publish_output(RingSide::ClientToServer, 5, 1).is_err());
    }
}
