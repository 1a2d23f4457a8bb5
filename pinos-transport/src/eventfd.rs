// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The wakeup half of the RT transport: one eventfd per direction. A
//! write of `1u64` always succeeds and coalesces with any prior
//! un-consumed write, which is why [`crate::ring::RingBuffer`] consumers
//! must loop until empty rather than assuming one wakeup means one event.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd::{read, write};

use crate::error::Error;

pub struct Wakeup {
    fd: OwnedFd,
}

impl Wakeup {
    pub fn new() -> Result<Self, Error> {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(Error::from)?;
        Ok(Self { fd: efd.into() })
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Signals the peer. Never blocks.
    pub fn signal(&self) -> Result<(), Error> {
        write(&self.fd, &1u64.to_ne_bytes()).map_err(Error::from)?;
        Ok(())
    }

    /// Consumes the pending signal (if any), coalescing repeats into one.
    /// Returns `false` on `EAGAIN` (nothing pending).
    pub fn consume(&self) -> Result<bool, Error> {
        let mut buf = [0u8; 8];
        match read(self.fd.as_raw_fd(), &mut buf) {
            Ok(_) => Ok(true),
            Err(nix::Error::EAGAIN) => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }
}
