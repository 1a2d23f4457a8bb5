// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-connection server state: the bootstrap handshake (S1), registry
//! subscription/bind, and client-node creation (§4.1/§4.3).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use log::{debug, warn};

use pinos_proxy::core_protocol::{core_method, registry_method};
use pinos_wire::connection::{Connection, Message};

use crate::data_loop::NodeMsg;
use crate::error::Error;
use crate::registry::GlobalRegistry;
use crate::server_protocol as proto;

pub const CORE_ID: u32 = 0;

/// A client-created node's server-side bookkeeping. The RT transport
/// itself is handed off to the data loop at creation time (§5: the data
/// loop, not the main loop, owns RT state) — only its control-plane
/// metadata lives here.
pub struct NodeSession {
    pub max_inputs: u32,
    pub max_outputs: u32,
    /// `mem_id`s this node has been told about via `add_mem`, so any
    /// `SpaBuffer` a later `port_update` carries can be validated.
    pub mems: pinos_wire::buffer::MemRegistry,
}

pub struct ClientSession {
    pub connection: Connection,
    registry_id: Option<u32>,
    /// `new_id` (as assigned by the client's `bind`) -> bound global id.
    bound: HashMap<u32, u32>,
    /// `client_node` object id -> its server-side session state.
    nodes: HashMap<u32, NodeSession>,
    data_loop: std::sync::mpsc::Sender<NodeMsg>,
}

impl ClientSession {
    pub fn new(connection: Connection, data_loop: std::sync::mpsc::Sender<NodeMsg>) -> Self {
        Self { connection, registry_id: None, bound: HashMap::new(), nodes: HashMap::new(), data_loop }
    }

    pub fn handle_message(&mut self, msg: Message, registry: &GlobalRegistry) -> Result<(), Error> {
        if msg.target_id == CORE_ID {
            return self.handle_core_method(msg, registry);
        }
        if Some(msg.target_id) == self.registry_id {
            return self.handle_registry_method(msg, registry);
        }
        if self.nodes.contains_key(&msg.target_id) {
            return self.handle_client_node_method(msg);
        }
        warn!("message for unknown target {}", msg.target_id);
        proto::send_error(&mut self.connection, CORE_ID, msg.target_id, -(libc::ENOENT), "no such object")
    }

    fn handle_core_method(&mut self, msg: Message, registry: &GlobalRegistry) -> Result<(), Error> {
        match msg.opcode {
            core_method::CLIENT_UPDATE => {
                let props = proto::parse_client_update(&msg.payload)?;
                debug!("client_update: {props:?}");
                Ok(())
            }
            core_method::UPDATE_TYPES => {
                let (first_id, names) = proto::parse_update_types(&msg.payload)?;
                debug!("client announced {} type names starting at {first_id}", names.len());
                Ok(())
            }
            core_method::SYNC => {
                let seq = proto::parse_sync(&msg.payload)?;
                proto::send_done(&mut self.connection, CORE_ID, seq)
            }
            core_method::GET_REGISTRY => {
                let new_id = proto::parse_get_registry(&msg.payload)?;
                self.registry_id = Some(new_id);
                for (id, global) in registry.iter() {
                    proto::send_global(&mut self.connection, new_id, id, &global.type_name)?;
                }
                Ok(())
            }
            core_method::CREATE_NODE | core_method::CREATE_CLIENT_NODE => {
                let node_id = self.allocate_node_id();
                self.create_client_node(node_id)
            }
            _ => Err(Error::UnknownOpcode(msg.opcode)),
        }
    }

    fn allocate_node_id(&self) -> u32 {
        // Client-node ids live in the same namespace as bound proxies on
        // the client side; the server just needs one that isn't already
        // in use for a node it's tracking.
        (1..).find(|id| !self.nodes.contains_key(id)).unwrap()
    }

    fn handle_registry_method(&mut self, msg: Message, registry: &GlobalRegistry) -> Result<(), Error> {
        match msg.opcode {
            registry_method::BIND => {
                let (global_id, new_id) = proto::parse_bind(&msg.payload)?;
                if registry.get(global_id).is_none() {
                    return proto::send_error(&mut self.connection, CORE_ID, global_id, -(libc::ENOENT), "no such global");
                }
                self.bound.insert(new_id, global_id);
                Ok(())
            }
            _ => Err(Error::UnknownOpcode(msg.opcode)),
        }
    }

    fn handle_client_node_method(&mut self, msg: Message) -> Result<(), Error> {
        use pinos_proxy::core_protocol::client_node_method;
        match msg.opcode {
            client_node_method::DESTROY => {
                self.nodes.remove(&msg.target_id);
                let _ = self.data_loop.send(NodeMsg::Remove(msg.target_id));
                proto::send_remove_id(&mut self.connection, CORE_ID, msg.target_id)
            }
            client_node_method::PORT_UPDATE => {
                // The trailing struct, if present, is a `SpaBuffer` the
                // client wants to attach to the port; a bare
                // port-format update carries none.
                if let Some(node) = self.nodes.get(&msg.target_id) {
                    if !msg.payload.is_empty() {
                        let buf = pinos_wire::buffer::SpaBuffer::decode(&msg.payload)?;
                        buf.validate(&node.mems, msg.fds.len() as u8)?;
                    }
                }
                debug!("client_node {} port_update", msg.target_id);
                Ok(())
            }
            client_node_method::UPDATE | client_node_method::EVENT => {
                debug!("client_node {} method {}", msg.target_id, msg.opcode);
                Ok(())
            }
            _ => Err(Error::UnknownOpcode(msg.opcode)),
        }
    }

    /// Stands up the RT transport for a newly created node: allocates
    /// the memfd-backed [`pinos_transport::Transport`], hands its fd
    /// over via `add_mem`/`transport`, and completes the handshake with
    /// `done` (§4.1, §4.3).
    fn create_client_node(&mut self, node_id: u32) -> Result<(), Error> {
        const MAX_PORTS: u32 = 4;
        const RING_LEN: u32 = 4096;
        let transport = pinos_transport::Transport::create(MAX_PORTS, MAX_PORTS, RING_LEN)?;

        let dup_raw = nix::unistd::dup(transport.memfd().as_raw_fd())?;
        // SAFETY: `dup` just handed us a fresh, uniquely owned fd.
        let memfd_dup = unsafe { OwnedFd::from_raw_fd(dup_raw) };
        let size = transport.mapped_len() as u64;
        proto::send_add_mem(&mut self.connection, node_id, 0, 1, memfd_dup, 0, 0, size)?;
        proto::send_transport(&mut self.connection, node_id, 0, 0, size)?;

        // readfd = server→client wakeup (client polls it), writefd =
        // client→server wakeup (client signals it); §4.3.
        let readfd = transport.dup_wakeup_fd(pinos_transport::RingSide::ServerToClient)?;
        let writefd = transport.dup_wakeup_fd(pinos_transport::RingSide::ClientToServer)?;
        proto::send_client_node_done(&mut self.connection, node_id, readfd, writefd)?;

        let mut mems = pinos_wire::buffer::MemRegistry::new();
        mems.announce(0);
        self.nodes.insert(node_id, NodeSession { max_inputs: MAX_PORTS, max_outputs: MAX_PORTS, mems });
        let _ = self.data_loop.send(NodeMsg::Add(node_id, transport));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_registry_replays_existing_globals() {
        let (mut client_conn, server_conn) = Connection::pair().unwrap();
        let mut registry = GlobalRegistry::new();
        registry.add("Node", 3);
        let mut session = ClientSession::new(server_conn, std::sync::mpsc::channel().0);

        pinos_proxy::core_protocol::send_get_registry(&mut client_conn, CORE_ID, 5).unwrap();
        client_conn.flush().unwrap();
        let msg = session.connection.poll_recv().unwrap().unwrap();
        session.handle_message(msg, &registry).unwrap();
        session.connection.flush().unwrap();

        let reply = client_conn.poll_recv().unwrap().unwrap();
        assert_eq!(reply.target_id, 5);
    }

    #[test]
    fn sync_replies_with_done_carrying_same_seq() {
        let (mut client_conn, server_conn) = Connection::pair().unwrap();
        let registry = GlobalRegistry::new();
        let mut session = ClientSession::new(server_conn, std::sync::mpsc::channel().0);

        pinos_proxy::core_protocol::send_sync(&mut client_conn, CORE_ID, 99).unwrap();
        client_conn.flush().unwrap();
        let msg = session.connection.poll_recv().unwrap().unwrap();
        session.handle_message(msg, &registry).unwrap();
        session.connection.flush().unwrap();

        let reply = client_conn.poll_recv().unwrap().unwrap();
        let pod = pinos_wire::pod::parse_one(&reply.payload).unwrap();
        let mut s = pod.as_struct().unwrap();
        assert_eq!(s.next().unwrap().unwrap().as_int().unwrap(), 99);
    }

    #[test]
    fn port_update_rejects_buffer_with_unannounced_mem_id() {
        let (_client_conn, server_conn) = Connection::pair().unwrap();
        let mut session = ClientSession::new(server_conn, std::sync::mpsc::channel().0);
        let mut mems = pinos_wire::buffer::MemRegistry::new();
        mems.announce(0);
        session.nodes.insert(1, NodeSession { max_inputs: 1, max_outputs: 1, mems });

        let buf = pinos_wire::buffer::SpaBuffer {
            id: 0,
            metas: vec![],
            datas: vec![pinos_wire::buffer::Data::MemId(99)],
        };
        let mut payload = Vec::new();
        buf.encode(&mut payload);
        let msg = Message { target_id: 1, opcode: pinos_proxy::core_protocol::client_node_method::PORT_UPDATE, payload, fds: Vec::new() };

        assert!(session.handle_client_node_method(msg).is_err());
    }

    #[test]
    fn bind_to_unknown_global_sends_error_not_panic() {
        let (mut client_conn, server_conn) = Connection::pair().unwrap();
        let registry = GlobalRegistry::new();
        let mut session = ClientSession::new(server_conn, std::sync::mpsc::channel().0);
        session.registry_id = Some(5);

        pinos_proxy::core_protocol::send_bind(&mut client_conn, 5, 404, 6).unwrap();
        client_conn.flush().unwrap();
        let msg = session.connection.poll_recv().unwrap().unwrap();
        session.handle_message(msg, &registry).unwrap();
        session.connection.flush().unwrap();

        let reply = client_conn.poll_recv().unwrap().unwrap();
        assert_eq!(reply.opcode, pinos_proxy::core_protocol::core_event::ERROR);
    }
}
