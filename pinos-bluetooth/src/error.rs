// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// The BlueZ daemon replied `org.bluez.Error.NotSupported` or an
    /// unknown method/property; recoverable by falling back (§4.5/§7).
    NotSupported(String),

    /// A transport `acquire()` failed with EBUSY twice in a row.
    TransportBusy,

    /// Requested a profile/route/codec combination the device does not
    /// currently expose.
    NotAvailable(String),

    /// The quirks configuration was malformed (bad JSON, bad regex).
    Quirks(String),

    /// The codec-switch coroutine was cancelled or the device
    /// disconnected mid-switch.
    Cancelled,
    DeviceGone,

    Io(std::io::Error),
    DBus(dbus::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported(m) => write!(f, "not supported: {m}"),
            Self::TransportBusy => write!(f, "transport busy (EBUSY) after retry"),
            Self::NotAvailable(m) => write!(f, "not available: {m}"),
            Self::Quirks(m) => write!(f, "quirks config error: {m}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::DeviceGone => write!(f, "device disconnected (ENODEV)"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::DBus(e) => write!(f, "D-Bus error: {e}"),
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

impl From<dbus::Error> for Error {
    fn from(e: dbus::Error) -> Self {
        Self::DBus(e)
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Self::Quirks(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Quirks(e.to_string())
    }
}
