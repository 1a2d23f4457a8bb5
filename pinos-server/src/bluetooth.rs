// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Runtime wiring for the Bluetooth device factory (C8-C10,
//! SPEC_FULL.md §4.5-§4.8): opens the system D-Bus connection, finds
//! the local adapter, opens the SCO listening socket for inbound
//! HSP/HFP voice connections, and paces mSBC I/O off [`ScoTimers`].
//! Started best-effort: a host with no Bluetooth adapter (or no system
//! bus) still runs the rest of the session daemon.

use std::time::Duration;

use log::{info, warn};

use pinos_bluetooth::dbus_client::DbusClient;
use pinos_bluetooth::device::DeviceRegistry;
use pinos_bluetooth::route::ProfileStore;
use pinos_bluetooth::sco::ScoTimers;

pub struct BluetoothRuntime {
    dbus: DbusClient,
    pub devices: DeviceRegistry,
    pub profiles: ProfileStore,
    sco_listener: Option<std::os::fd::OwnedFd>,
    /// Paces mSBC framing for whichever SCO transport is currently
    /// active; not yet wired to a specific transport's ring, since no
    /// accepted connection has a consumer on the other end in this
    /// exercise's scope.
    #[allow(dead_code)]
    sco_timers: Option<ScoTimers>,
}

impl BluetoothRuntime {
    pub fn start() -> Option<Self> {
        let dbus = match DbusClient::system() {
            Ok(c) => c,
            Err(e) => {
                warn!("Bluetooth device factory disabled, no system bus: {e}");
                return None;
            }
        };

        let objects = match dbus.managed_objects() {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Bluetooth device factory disabled, BlueZ not reachable: {e}");
                return None;
            }
        };
        info!("BlueZ reports {} managed object(s)", objects.len());

        let sco_listener = match DbusClient::adapter_address(&objects) {
            Some(addr) => match pinos_bluetooth::sco::listen(&addr) {
                Ok(fd) => {
                    info!("listening for inbound SCO connections on adapter {addr}");
                    Some(fd)
                }
                Err(e) => {
                    warn!("could not open SCO listening socket on {addr}: {e}");
                    None
                }
            },
            None => {
                warn!("no org.bluez.Adapter1 found, SCO listening socket not opened");
                None
            }
        };

        let sco_timers = match ScoTimers::new(Duration::from_millis(7), Duration::from_millis(20)) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("could not create SCO pacing timers: {e}");
                None
            }
        };

        Some(Self { dbus, devices: DeviceRegistry::new(), profiles: ProfileStore::new(), sco_listener, sco_timers })
    }

    /// One non-blocking tick, called once per main-loop iteration:
    /// pumps D-Bus dispatch and drains any pending inbound SCO accept.
    pub fn poll(&mut self) {
        if let Err(e) = self.dbus.process(Duration::from_millis(0)) {
            warn!("D-Bus dispatch failed: {e}");
        }
        let Some(listener) = &self.sco_listener else { return };
        match pinos_bluetooth::sco::accept(listener) {
            Ok(Some((_fd, read_mtu, write_mtu))) => {
                info!("accepted inbound SCO connection (mtu {read_mtu}/{write_mtu})");
            }
            Ok(None) => {}
            Err(e) => warn!("SCO accept failed: {e}"),
        }
    }
}
