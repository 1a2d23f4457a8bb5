// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors raised by the proxy/registry runtime, layered over the
/// lower-level [`pinos_wire::Error`].
#[derive(Debug)]
pub enum Error {
    Wire(pinos_wire::Error),

    /// `registry.bind` named a global id the registry has not announced
    /// (or has since removed).
    UnknownGlobal(u32),

    /// A proxy id was referenced that is not currently live.
    UnknownProxy(u32),

    /// A type name was used before `update_types` announced it.
    UnknownType(String),

    /// `update_types` tried to announce a `first_id` that does not equal
    /// the next free slot in the monotonic type table.
    TypeMapNotContiguous { expected: u32, got: u32 },

    /// A stream transition was requested that the current state does not
    /// permit (e.g. `Start` while still in `CONFIGURE`).
    InvalidStateTransition { state: &'static str, action: &'static str },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "{e}"),
            Self::UnknownGlobal(id) => write!(f, "bind referenced unknown global {id}"),
            Self::UnknownProxy(id) => write!(f, "no live proxy with id {id}"),
            Self::UnknownType(name) => write!(f, "type {name:?} was never announced"),
            Self::TypeMapNotContiguous { expected, got } => {
                write!(f, "update_types first_id {got} is not contiguous (expected {expected})")
            }
            Self::InvalidStateTransition { state, action } => {
                write!(f, "cannot {action} while stream is in {state}")
            }
        }
    }
}

impl From<pinos_wire::Error> for Error {
    fn from(e: pinos_wire::Error) -> Self {
        Self::Wire(e)
    }
}
