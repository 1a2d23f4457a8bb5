// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Ties [`Connection`], [`TypeMap`] and [`ProxyTable`] together into the
//! client-side handle described by SPEC_FULL.md's GLOSSARY: "a client's
//! handle to a server connection; owner of the proxy id space".

use pinos_wire::connection::Connection;

use crate::core_protocol::{self, core_event, CoreProxy};
use crate::error::Error;
use crate::proxy::ProxyTable;
use crate::types::TypeMap;

pub const CORE_ID: u32 = 0;

/// A client's connection to the server: owns the id space, the type
/// table, and drives the bootstrap handshake (SPEC_FULL.md §4.1 / S1).
pub struct Context {
    pub connection: Connection,
    pub proxies: ProxyTable,
    pub types: TypeMap,
}

impl Context {
    pub fn new(connection: Connection) -> Self {
        let mut proxies = ProxyTable::new();
        let _ = proxies.insert_at(CORE_ID, 0, Box::new(CoreProxy::default()));
        Self { connection, proxies, types: TypeMap::new() }
    }

    /// Runs S1: `client_update({})`, `update_types`, `get_registry`,
    /// `sync(seq)`. Returns the new registry proxy's id.
    pub fn bootstrap(&mut self, local_type_names: &[&str], sync_seq: u32) -> Result<u32, Error> {
        core_protocol::send_client_update(&mut self.connection, CORE_ID, &[])?;
        core_protocol::send_update_types(&mut self.connection, CORE_ID, 0, local_type_names)?;
        self.types.announce(0, &local_type_names.iter().map(|s| s.to_string()).collect::<Vec<_>>())?;

        let registry_id = self.proxies.insert(0, Box::new(crate::core_protocol::RegistryProxy::default()));
        core_protocol::send_get_registry(&mut self.connection, CORE_ID, registry_id)?;
        core_protocol::send_sync(&mut self.connection, CORE_ID, sync_seq)?;
        self.connection.flush()?;
        Ok(registry_id)
    }

    /// Drains every message currently queued on the socket, dispatching
    /// each to the target proxy. `core`-level events that affect the
    /// shared id space (`remove_id`) are handled here rather than inside
    /// [`CoreProxy`], since they mutate the [`ProxyTable`] the proxy
    /// itself cannot reach.
    pub fn dispatch_pending(&mut self) -> Result<(), Error> {
        loop {
            let msg = match self.connection.poll_recv() {
                Ok(Some(m)) => m,
                Ok(None) => return Ok(()),
                Err(pinos_wire::Error::Transport(_)) => return Ok(()),
                Err(e) => return Err(Error::from(e)),
            };

            if msg.target_id == CORE_ID && msg.opcode == core_event::REMOVE_ID {
                if let Ok(pod) = pinos_wire::pod::parse_one(&msg.payload) {
                    if let Ok(mut fields) = pod.as_struct() {
                        if let Some(Ok(id_pod)) = fields.next() {
                            if let Ok(id) = id_pod.as_id() {
                                let _ = self.proxies.destroy(id);
                                continue;
                            }
                        }
                    }
                }
            }

            self.proxies.dispatch(msg.target_id, msg.opcode, &msg.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_produces_the_s1_method_sequence() {
        let (client_conn, mut server_conn) = Connection::pair().unwrap();
        let mut ctx = Context::new(client_conn);
        let registry_id = ctx.bootstrap(&["Core", "Registry"], 42).unwrap();
        assert_eq!(registry_id, 1);

        let mut opcodes = Vec::new();
        while let Some(msg) = server_conn.poll_recv().unwrap() {
            opcodes.push(msg.opcode);
        }
        assert_eq!(
            opcodes,
            vec![
                core_protocol::core_method::CLIENT_UPDATE,
                core_protocol::core_method::UPDATE_TYPES,
                core_protocol::core_method::GET_REGISTRY,
                core_protocol::core_method::SYNC,
            ]
        );
    }

    #[test]
    fn remove_id_frees_the_proxy_slot() {
        let (client_conn, mut server_conn) = Connection::pair().unwrap();
        let mut ctx = Context::new(client_conn);
        let node_id = ctx.proxies.insert(0, Box::new(core_protocol::RegistryProxy::default()));
        assert!(ctx.proxies.contains(node_id));

        let buf = server_conn.begin_write();
        pinos_wire::pod::Builder::new(buf).write_struct(|b| b.write_id(node_id));
        server_conn.end_write(CORE_ID, core_event::REMOVE_ID).unwrap();
        server_conn.flush().unwrap();

        ctx.dispatch_pending().unwrap();
        assert!(!ctx.proxies.contains(node_id));
    }
}
