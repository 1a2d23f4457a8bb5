// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire-level building blocks shared by the client and server sides of the
//! protocol: the POD value format, the `SOCK_STREAM` + `SCM_RIGHTS`
//! framing, the dense id map proxies and objects are numbered with, and
//! the hardware/linear volume curve.

pub mod buffer;
pub mod connection;
pub mod error;
pub mod id_map;
pub mod pod;
pub mod volume;

pub use error::{Error, ProtocolError};
