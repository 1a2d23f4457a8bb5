// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    Wire(pinos_wire::Error),
    Proxy(pinos_proxy::Error),
    Transport(pinos_transport::Error),
    Bluetooth(pinos_bluetooth::Error),
    Truncated,
    UnknownTarget(u32),
    UnknownOpcode(u8),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "{e}"),
            Self::Proxy(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Bluetooth(e) => write!(f, "{e}"),
            Self::Truncated => write!(f, "message body shorter than expected"),
            Self::UnknownTarget(id) => write!(f, "no object with id {id}"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<pinos_wire::Error> for Error {
    fn from(e: pinos_wire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<pinos_proxy::Error> for Error {
    fn from(e: pinos_proxy::Error) -> Self {
        Self::Proxy(e)
    }
}

impl From<pinos_transport::Error> for Error {
    fn from(e: pinos_transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<pinos_bluetooth::Error> for Error {
    fn from(e: pinos_bluetooth::Error) -> Self {
        Self::Bluetooth(e)
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
