// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The fixed part of the transport layout: the area header, the port I/O
//! arrays, and the `NodeEvent` wire encoding carried in the two rings.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::Error;

pub const INVALID_BUFFER_ID: u32 = 0xFFFF_FFFF;

pub const STATUS_OK: i32 = 0;
pub const STATUS_NEED_DATA: i32 = 1;
pub const STATUS_HAVE_DATA: i32 = 2;

#[repr(C)]
pub struct AreaHeader {
    pub max_inputs: AtomicU32,
    pub n_inputs: AtomicU32,
    pub max_outputs: AtomicU32,
    pub n_outputs: AtomicU32,
}

/// One port's handoff slot: `{ buffer_id, status }`.
#[repr(C)]
pub struct PortIo {
    buffer_id: AtomicU32,
    status: AtomicI32,
}

impl PortIo {
    pub const fn invalid() -> Self {
        Self { buffer_id: AtomicU32::new(INVALID_BUFFER_ID), status: AtomicI32::new(STATUS_OK) }
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id.load(Ordering::Acquire)
    }

    pub fn set_buffer_id(&self, id: u32) {
        self.buffer_id.store(id, Ordering::Release);
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.buffer_id() != INVALID_BUFFER_ID
    }
}

impl Default for PortIo {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Events posted into an event ring. Fixed-width (12 bytes) so the ring
/// never needs to reason about variable-length records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Producer has published a new buffer on `port`'s output slot.
    HaveOutput { port: u32 },
    /// Consumer is ready for more data on `port`'s input slot.
    NeedInput { port: u32 },
    /// Consumer is done with `buffer_id` on `port`; producer may reuse it.
    ReuseBuffer { port: u32, buffer_id: u32 },
}

const TAG_HAVE_OUTPUT: u32 = 1;
const TAG_NEED_INPUT: u32 = 2;
const TAG_REUSE_BUFFER: u32 = 3;

pub const NODE_EVENT_WIRE_SIZE: usize = 12;

impl NodeEvent {
    pub fn encode(&self) -> [u8; NODE_EVENT_WIRE_SIZE] {
        let mut out = [0u8; NODE_EVENT_WIRE_SIZE];
        let (tag, port, extra) = match *self {
            Self::HaveOutput { port } => (TAG_HAVE_OUTPUT, port, 0),
            Self::NeedInput { port } => (TAG_NEED_INPUT, port, 0),
            Self::ReuseBuffer { port, buffer_id } => (TAG_REUSE_BUFFER, port, buffer_id),
        };
        out[0..4].copy_from_slice(&tag.to_le_bytes());
        out[4..8].copy_from_slice(&port.to_le_bytes());
        out[8..12].copy_from_slice(&extra.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < NODE_EVENT_WIRE_SIZE {
            return Err(Error::UnknownEvent(0));
        }
        let tag = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let port = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let extra = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        Ok(match tag {
            TAG_HAVE_OUTPUT => Self::HaveOutput { port },
            TAG_NEED_INPUT => Self::NeedInput { port },
            TAG_REUSE_BUFFER => Self::ReuseBuffer { port, buffer_id: extra },
            _ => return Err(Error::UnknownEvent(tag)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_event_round_trips() {
        for ev in [
            NodeEvent::HaveOutput { port: 3 },
            NodeEvent::NeedInput { port: 0 },
            NodeEvent::ReuseBuffer { port: 1, buffer_id: 42 },
        ] {
            let bytes = ev.encode();
            assert_eq!(NodeEvent::decode(&bytes).unwrap(), ev);
        }
    }

    #[test]
    fn port_io_defaults_to_invalid_buffer() {
        let port = PortIo::invalid();
        assert_eq!(port.buffer_id(), INVALID_BUFFER_ID);
        assert!(!port.is_pending());
        port.set_buffer_id(5);
        assert!(port.is_pending());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = NodeEvent::HaveOutput { port: 0 }.encode();
        bytes[0] = 0xff;
        assert!(NodeEvent::decode(&bytes).is_err());
    }
}
