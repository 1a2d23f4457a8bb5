// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The proxy/registry runtime and bootstrap protocol (C4/C5) plus the
//! per-stream state machine (C7), built on top of `pinos-wire`.

pub mod context;
pub mod core_protocol;
pub mod error;
pub mod proxy;
pub mod stream;
pub mod types;

pub use error::Error;
