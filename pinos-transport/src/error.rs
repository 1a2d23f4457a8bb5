// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A ring's backing buffer was not a power-of-two length.
    InvalidCapacity(usize),

    /// A write was attempted with no room left; the producer must wait
    /// for the consumer to catch up (backpressure, §4.3).
    RingFull,

    /// `memfd_create`/`ftruncate`/`mmap`/`munmap` failed.
    Io(std::io::Error),

    /// An event popped off a ring had an unrecognized tag.
    UnknownEvent(u32),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity(n) => write!(f, "ring capacity {n} is not a non-zero power of two"),
            Self::RingFull => write!(f, "ring buffer full, producer must back off"),
            Self::Io(e) => write!(f, "transport I/O error: {e}"),
            Self::UnknownEvent(tag) => write!(f, "unknown node event tag {tag}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Io(std::io::Error::from(e))
    }
}
