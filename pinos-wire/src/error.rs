// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors that can arise while building, parsing, or shipping a wire message.
#[derive(Debug)]
pub enum Error {
    /// A POD value was malformed: a declared size ran past the buffer, an
    /// unexpected type tag was seen, or a `size`/`type` pair did not fit in
    /// the remaining bytes.
    Protocol(ProtocolError),

    /// The connection hit an unrecoverable transport error (`EPIPE`,
    /// `ECONNRESET`, a zero-length read). The connection must be torn down.
    Transport(std::io::Error),

    /// A single message tried to carry more file descriptors than the
    /// connection's `SCM_RIGHTS` ceiling (28 per message).
    OutOfResources,

    /// Plain I/O failure not specific to the framing protocol (e.g. `mmap`
    /// or `memfd_create` failing).
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::OutOfResources => write!(f, "out of resources (too many fds in one message)"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
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

#[derive(Debug)]
pub enum ProtocolError {
    /// A POD record's `size` field claims more bytes than remain in the
    /// buffer it was read from.
    Truncated,

    /// An opcode that the interface's event/method table does not define.
    UnknownOpcode(u8),

    /// A type id was used in a message before being announced via
    /// `update_types`.
    UnknownType(u32),

    /// Generic decode failure (wrong tag where a specific one was expected).
    Decode,

    /// A `Data::MemFd` named an fd index at or past the message's `n_fds`.
    /// (`<` not `<=`; the legacy `pinos_buffer_get_fd` off-by-one is the
    /// bug this guards against, see SPEC_FULL.md design notes.)
    FdIndexOutOfRange { index: u32, n_fds: u8 },

    /// A buffer's `Data` named a `mem_id` that no live `add_mem` covers.
    UnknownMemId(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "POD record truncated"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Self::UnknownType(id) => write!(f, "unknown type id {id} (not yet announced)"),
            Self::Decode => write!(f, "could not decode value as requested type"),
            Self::FdIndexOutOfRange { index, n_fds } => {
                write!(f, "fd index {index} out of range (message carries {n_fds} fd(s))")
            }
            Self::UnknownMemId(id) => write!(f, "mem id {id} was never announced (or has been removed)"),
        }
    }
}
