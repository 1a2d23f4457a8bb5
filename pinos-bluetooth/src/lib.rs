// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Bluetooth device factory: profile/route modeling (C8), the
//! quirks engine (C9), and the SCO realtime I/O loop (C10), per
//! SPEC_FULL.md §4.5-§4.8.

pub mod codec_switch;
pub mod dbus_client;
pub mod device;
pub mod error;
pub mod profile;
pub mod quirks;
pub mod route;
pub mod sco;

pub use error::Error;
