// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A thin blocking D-Bus client for talking to `org.bluez`, adapted
//! from `bluer`'s connection handling (`session.rs`) to the blocking
//! `dbus` API: this crate's main loop is a single cooperative,
//! non-blocking event loop (SPEC_FULL.md §5), not a `tokio` runtime, so
//! every call here is either instantaneous (property reads cached by
//! the caller) or explicitly polled via [`DbusClient::process`] rather
//! than awaited.

use std::collections::HashMap;
use std::time::Duration;

use dbus::arg::{RefArg, Variant};
use dbus::blocking::{Connection, Proxy};
use dbus::Path;

use crate::error::Error;

pub const BLUEZ_SERVICE: &str = "org.bluez";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub type PropertyDict = HashMap<String, Variant<Box<dyn RefArg>>>;

/// Owns the system-bus connection used for every BlueZ call the
/// Bluetooth device factory makes.
pub struct DbusClient {
    connection: Connection,
}

impl DbusClient {
    pub fn system() -> Result<Self, Error> {
        Ok(Self { connection: Connection::new_system()? })
    }

    fn proxy<'a>(&'a self, path: &'a str) -> Proxy<'a, &'a Connection> {
        self.connection.with_proxy(BLUEZ_SERVICE, path, DEFAULT_TIMEOUT)
    }

    /// `org.freedesktop.DBus.ObjectManager.GetManagedObjects`, the call
    /// BlueZ clients use to enumerate adapters/devices on startup.
    pub fn managed_objects(&self) -> Result<HashMap<Path<'static>, HashMap<String, PropertyDict>>, Error> {
        use dbus::blocking::stdintf::org_freedesktop_dbus::ObjectManager;
        Ok(self.proxy("/").get_managed_objects()?)
    }

    /// `org.freedesktop.DBus.Properties.Set` on `interface` at `path`.
    pub fn set_property<T: dbus::arg::Arg + dbus::arg::Append>(
        &self,
        path: &str,
        interface: &str,
        property: &str,
        value: T,
    ) -> Result<(), Error> {
        use dbus::blocking::stdintf::org_freedesktop_dbus::Properties;
        Ok(self.proxy(path).set(interface, property, value)?)
    }

    pub fn get_property<T: for<'a> dbus::arg::Get<'a> + 'static>(
        &self,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<T, Error> {
        use dbus::blocking::stdintf::org_freedesktop_dbus::Properties;
        Ok(self.proxy(path).get(interface, property)?)
    }

    /// Calls a zero-or-more-argument method with no return value beyond
    /// success/failure, e.g. `Device1.Connect`/`Device1.Disconnect`.
    pub fn call_method0(&self, path: &str, interface: &str, method: &str) -> Result<(), Error> {
        self.proxy(path).method_call(interface, method, ()).map_err(Error::from)
    }

    /// Picks the first `org.bluez.Adapter1` object's `Address`
    /// property out of a [`Self::managed_objects`] snapshot, for
    /// binding the local SCO listening socket.
    pub fn adapter_address(objects: &HashMap<Path<'static>, HashMap<String, PropertyDict>>) -> Option<String> {
        objects.values().find_map(|ifaces| {
            ifaces.get("org.bluez.Adapter1")?.get("Address")?.0.as_str().map(str::to_owned)
        })
    }

    /// Pumps the connection's incoming-message queue for up to
    /// `timeout`. The caller's main loop invokes this once per
    /// iteration rather than blocking indefinitely, keeping BlueZ
    /// signal dispatch cooperative with the rest of the event sources.
    pub fn process(&self, timeout: Duration) -> Result<(), Error> {
        self.connection.process(timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bluez_service_name_is_stable() {
        assert_eq!(BLUEZ_SERVICE, "org.bluez");
    }
}
