// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The real-time shared-memory transport (C6): a memfd-backed mapping
//! holding the port I/O arrays and two lock-free event rings, woken by a
//! pair of eventfds.

pub mod area;
pub mod error;
pub mod eventfd;
pub mod ring;
pub mod transport;

pub use error::Error;
pub use transport::{RingSide, Transport};
