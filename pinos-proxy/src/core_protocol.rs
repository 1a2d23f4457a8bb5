// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The bootstrap objects: `core`, `registry`, and `client_node`. Opcodes
//! are fixed by the external wire format (SPEC_FULL.md §6); this module
//! provides both the method-send helpers (writing through a
//! [`pinos_wire::connection::Connection`]) and the event demarshalers
//! wired up as [`ProxyObject`] impls.

use pinos_wire::connection::Connection;
use pinos_wire::pod::Builder;

use crate::error::Error;
use crate::proxy::ProxyObject;

pub mod core_method {
    pub const CLIENT_UPDATE: u8 = 0;
    pub const SYNC: u8 = 1;
    pub const GET_REGISTRY: u8 = 2;
    pub const CREATE_NODE: u8 = 3;
    pub const CREATE_CLIENT_NODE: u8 = 4;
    pub const UPDATE_TYPES: u8 = 5;
}

pub mod core_event {
    pub const INFO: u8 = 0;
    pub const DONE: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const REMOVE_ID: u8 = 3;
    pub const UPDATE_TYPES: u8 = 4;
}

pub mod registry_method {
    pub const BIND: u8 = 0;
}

pub mod registry_event {
    pub const GLOBAL: u8 = 0;
    pub const GLOBAL_REMOVE: u8 = 1;
}

pub mod client_node_method {
    pub const UPDATE: u8 = 0;
    pub const PORT_UPDATE: u8 = 1;
    pub const EVENT: u8 = 2;
    pub const DESTROY: u8 = 3;
}

pub mod client_node_event {
    pub const DONE: u8 = 0;
    pub const EVENT: u8 = 1;
    pub const ADD_PORT: u8 = 2;
    pub const REMOVE_PORT: u8 = 3;
    pub const SET_FORMAT: u8 = 4;
    pub const SET_PROPERTY: u8 = 5;
    pub const ADD_MEM: u8 = 6;
    pub const USE_BUFFERS: u8 = 7;
    pub const NODE_COMMAND: u8 = 8;
    pub const PORT_COMMAND: u8 = 9;
    pub const TRANSPORT: u8 = 10;
}

/// `core.client_update(props)`. `props` is encoded as a flat Struct of
/// `(String key, String value)` pairs, the way the rest of this runtime
/// treats property dictionaries.
pub fn send_client_update(conn: &mut Connection, core_id: u32, props: &[(&str, &str)]) -> Result<(), Error> {
    let buf = conn.begin_write();
    let mut b = Builder::new(buf);
    b.write_struct(|b| {
        for (k, v) in props {
            b.write_string(k);
            b.write_string(v);
        }
    });
    conn.end_write(core_id, core_method::CLIENT_UPDATE)?;
    Ok(())
}

pub fn send_update_types(conn: &mut Connection, core_id: u32, first_id: u32, names: &[&str]) -> Result<(), Error> {
    let buf = conn.begin_write();
    let mut b = Builder::new(buf);
    b.write_struct(|b| {
        b.write_int(first_id as i32);
        for name in names {
            b.write_string(name);
        }
    });
    conn.end_write(core_id, core_method::UPDATE_TYPES)?;
    Ok(())
}

pub fn send_sync(conn: &mut Connection, core_id: u32, seq: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| b.write_int(seq as i32));
    conn.end_write(core_id, core_method::SYNC)?;
    Ok(())
}

pub fn send_get_registry(conn: &mut Connection, core_id: u32, new_id: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| b.write_id(new_id));
    conn.end_write(core_id, core_method::GET_REGISTRY)?;
    Ok(())
}

pub fn send_bind(conn: &mut Connection, registry_id: u32, global_id: u32, new_id: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(global_id);
        b.write_id(new_id);
    });
    conn.end_write(registry_id, registry_method::BIND)?;
    Ok(())
}

/// `core` proxy: receives `info`/`done`/`error`/`remove_id`/`update_types`
/// events and calls whichever handler the owner installed. Handlers are
/// optional so a client that only cares about `sync`/`done` need not wire
/// up the rest.
#[derive(Default)]
pub struct CoreProxy {
    pub on_info: Option<Box<dyn FnMut(u32, u64, &str)>>,
    pub on_done: Option<Box<dyn FnMut(u32)>>,
    pub on_error: Option<Box<dyn FnMut(u32, i32, &str)>>,
    pub on_remove_id: Option<Box<dyn FnMut(u32)>>,
    pub on_update_types: Option<Box<dyn FnMut(u32, Vec<String>)>>,
}

impl ProxyObject for CoreProxy {
    fn interface_name(&self) -> &'static str {
        "Core"
    }

    fn dispatch_event(&mut self, opcode: u8, body: &[u8]) -> Result<bool, Error> {
        let pod = match pinos_wire::pod::parse_one(body) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        let mut fields = match pod.as_struct() {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        match opcode {
            core_event::INFO => {
                let id = match fields.next() {
                    Some(Ok(p)) => p.as_id().unwrap_or(0),
                    _ => return Ok(false),
                };
                let cookie = match fields.next() {
                    Some(Ok(p)) => p.as_long().unwrap_or(0) as u64,
                    _ => return Ok(false),
                };
                let name = match fields.next() {
                    Some(Ok(p)) => p.as_string().unwrap_or("").to_owned(),
                    _ => return Ok(false),
                };
                if let Some(cb) = &mut self.on_info {
                    cb(id, cookie, &name);
                }
                Ok(true)
            }
            core_event::DONE => {
                let seq = match fields.next() {
                    Some(Ok(p)) => p.as_int().unwrap_or(0) as u32,
                    _ => return Ok(false),
                };
                if let Some(cb) = &mut self.on_done {
                    cb(seq);
                }
                Ok(true)
            }
            core_event::ERROR => {
                let id = match fields.next() {
                    Some(Ok(p)) => p.as_id().unwrap_or(0),
                    _ => return Ok(false),
                };
                let res = match fields.next() {
                    Some(Ok(p)) => p.as_int().unwrap_or(0),
                    _ => return Ok(false),
                };
                let msg = match fields.next() {
                    Some(Ok(p)) => p.as_string().unwrap_or("").to_owned(),
                    _ => return Ok(false),
                };
                if let Some(cb) = &mut self.on_error {
                    cb(id, res, &msg);
                }
                Ok(true)
            }
            core_event::REMOVE_ID => {
                let id = match fields.next() {
                    Some(Ok(p)) => p.as_id().unwrap_or(0),
                    _ => return Ok(false),
                };
                if let Some(cb) = &mut self.on_remove_id {
                    cb(id);
                }
                Ok(true)
            }
            core_event::UPDATE_TYPES => {
                let first_id = match fields.next() {
                    Some(Ok(p)) => p.as_int().unwrap_or(0) as u32,
                    _ => return Ok(false),
                };
                let mut names = Vec::new();
                for item in fields {
                    match item {
                        Ok(p) => {
                            if let Ok(s) = p.as_string() {
                                names.push(s.to_owned());
                            }
                        }
                        Err(_) => return Ok(false),
                    }
                }
                if let Some(cb) = &mut self.on_update_types {
                    cb(first_id, names);
                }
                Ok(true)
            }
            _ => Err(Error::Wire(pinos_wire::error::Error::Protocol(
                pinos_wire::error::ProtocolError::UnknownOpcode(opcode),
            ))),
        }
    }
}

/// `registry` proxy: receives `global`/`global_remove`.
#[derive(Default)]
pub struct RegistryProxy {
    pub on_global: Option<Box<dyn FnMut(u32, &str)>>,
    pub on_global_remove: Option<Box<dyn FnMut(u32)>>,
}

impl ProxyObject for RegistryProxy {
    fn interface_name(&self) -> &'static str {
        "Registry"
    }

    fn dispatch_event(&mut self, opcode: u8, body: &[u8]) -> Result<bool, Error> {
        let pod = match pinos_wire::pod::parse_one(body) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        let mut fields = match pod.as_struct() {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        match opcode {
            registry_event::GLOBAL => {
                let id = match fields.next() {
                    Some(Ok(p)) => p.as_id().unwrap_or(0),
                    _ => return Ok(false),
                };
                let type_name = match fields.next() {
                    Some(Ok(p)) => p.as_string().unwrap_or("").to_owned(),
                    _ => return Ok(false),
                };
                if let Some(cb) = &mut self.on_global {
                    cb(id, &type_name);
                }
                Ok(true)
            }
            registry_event::GLOBAL_REMOVE => {
                let id = match fields.next() {
                    Some(Ok(p)) => p.as_id().unwrap_or(0),
                    _ => return Ok(false),
                };
                if let Some(cb) = &mut self.on_global_remove {
                    cb(id);
                }
                Ok(true)
            }
            _ => Err(Error::Wire(pinos_wire::error::Error::Protocol(
                pinos_wire::error::ProtocolError::UnknownOpcode(opcode),
            ))),
        }
    }
}

/// `client_node` proxy. Only the events needed to stand up the RT
/// transport (§4.3) and format negotiation (§4.4) are demarshaled in
/// detail; `node_command`/`port_command`/`event` carry `SpaEvent`
/// payloads whose DSP-level contents are an explicit non-goal, so they
/// are handed to the owner as opaque bytes.
#[derive(Default)]
pub struct ClientNodeProxy {
    pub on_done: Option<Box<dyn FnMut(i32, i32)>>,
    pub on_add_port: Option<Box<dyn FnMut(u32, u32)>>,
    pub on_remove_port: Option<Box<dyn FnMut(u32, u32)>>,
    pub on_add_mem: Option<Box<dyn FnMut(u32, u32, i32, u32, u64, u64)>>,
    pub on_transport: Option<Box<dyn FnMut(i32, u64, u64)>>,
    pub on_set_format: Option<Box<dyn FnMut(u32, u32, u32, Vec<u8>)>>,
    pub on_use_buffers: Option<Box<dyn FnMut(u32, u32, u32)>>,
    pub on_opaque: Option<Box<dyn FnMut(u8, Vec<u8>)>>,
}

impl ProxyObject for ClientNodeProxy {
    fn interface_name(&self) -> &'static str {
        "ClientNode"
    }

    fn dispatch_event(&mut self, opcode: u8, body: &[u8]) -> Result<bool, Error> {
        let pod = match pinos_wire::pod::parse_one(body) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        let mut fields = match pod.as_struct() {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        match opcode {
            client_node_event::DONE => {
                let readfd = int_field(&mut fields)?;
                let writefd = int_field(&mut fields)?;
                if let Some(cb) = &mut self.on_done {
                    cb(readfd, writefd);
                }
                Ok(true)
            }
            client_node_event::ADD_PORT => {
                let dir = id_field(&mut fields)?;
                let port = id_field(&mut fields)?;
                if let Some(cb) = &mut self.on_add_port {
                    cb(dir, port);
                }
                Ok(true)
            }
            client_node_event::REMOVE_PORT => {
                let dir = id_field(&mut fields)?;
                let port = id_field(&mut fields)?;
                if let Some(cb) = &mut self.on_remove_port {
                    cb(dir, port);
                }
                Ok(true)
            }
            client_node_event::ADD_MEM => {
                let mem_id = id_field(&mut fields)?;
                let ty = id_field(&mut fields)?;
                let fd_index = int_field(&mut fields)?;
                let flags = id_field(&mut fields)?;
                let offset = long_field(&mut fields)?;
                let size = long_field(&mut fields)?;
                if let Some(cb) = &mut self.on_add_mem {
                    cb(mem_id, ty, fd_index, flags, offset, size);
                }
                Ok(true)
            }
            client_node_event::TRANSPORT => {
                let memfd_index = int_field(&mut fields)?;
                let offset = long_field(&mut fields)?;
                let size = long_field(&mut fields)?;
                if let Some(cb) = &mut self.on_transport {
                    cb(memfd_index, offset, size);
                }
                Ok(true)
            }
            client_node_event::SET_FORMAT => {
                let dir = id_field(&mut fields)?;
                let port = id_field(&mut fields)?;
                let flags = id_field(&mut fields)?;
                let format = match fields.next() {
                    Some(Ok(p)) => p.as_bytes().map(|b| b.to_vec()).unwrap_or_default(),
                    _ => Vec::new(),
                };
                if let Some(cb) = &mut self.on_set_format {
                    cb(dir, port, flags, format);
                }
                Ok(true)
            }
            client_node_event::USE_BUFFERS => {
                let dir = id_field(&mut fields)?;
                let port = id_field(&mut fields)?;
                let n_buffers = id_field(&mut fields)?;
                if let Some(cb) = &mut self.on_use_buffers {
                    cb(dir, port, n_buffers);
                }
                Ok(true)
            }
            client_node_event::EVENT
            | client_node_event::SET_PROPERTY
            | client_node_event::NODE_COMMAND
            | client_node_event::PORT_COMMAND => {
                if let Some(cb) = &mut self.on_opaque {
                    cb(opcode, body.to_vec());
                }
                Ok(true)
            }
            _ => Err(Error::Wire(pinos_wire::error::Error::Protocol(
                pinos_wire::error::ProtocolError::UnknownOpcode(opcode),
            ))),
        }
    }
}

fn int_field(fields: &mut pinos_wire::pod::Parser<'_>) -> Result<i32, Error> {
    match fields.next() {
        Some(Ok(p)) => p.as_int().map_err(Error::from),
        _ => Err(Error::Wire(pinos_wire::error::Error::Protocol(
            pinos_wire::error::ProtocolError::Decode,
        ))),
    }
}

fn id_field(fields: &mut pinos_wire::pod::Parser<'_>) -> Result<u32, Error> {
    match fields.next() {
        Some(Ok(p)) => p.as_id().map_err(Error::from),
        _ => Err(Error::Wire(pinos_wire::error::Error::Protocol(
            pinos_wire::error::ProtocolError::Decode,
        ))),
    }
}

fn long_field(fields: &mut pinos_wire::pod::Parser<'_>) -> Result<u64, Error> {
    match fields.next() {
        Some(Ok(p)) => p.as_long().map(|v| v as u64).map_err(Error::from),
        _ => Err(Error::Wire(pinos_wire::error::Error::Protocol(
            pinos_wire::error::ProtocolError::Decode,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinos_wire::connection::Connection;

    #[test]
    fn s1_handshake_client_to_server_messages_decode() {
        let (mut client, mut server) = Connection::pair().unwrap();

        send_client_update(&mut client, 0, &[]).unwrap();
        send_update_types(&mut client, 0, 0, &["Core", "Registry"]).unwrap();
        send_get_registry(&mut client, 0, 1).unwrap();
        send_sync(&mut client, 0, 42).unwrap();
        client.flush().unwrap();

        let msg = server.poll_recv().unwrap().unwrap();
        assert_eq!(msg.target_id, 0);
        assert_eq!(msg.opcode, core_method::CLIENT_UPDATE);

        let msg = server.poll_recv().unwrap().unwrap();
        assert_eq!(msg.opcode, core_method::UPDATE_TYPES);

        let msg = server.poll_recv().unwrap().unwrap();
        assert_eq!(msg.opcode, core_method::GET_REGISTRY);
        let pod = pinos_wire::pod::parse_one(&msg.payload).unwrap();
        let mut s = pod.as_struct().unwrap();
        assert_eq!(s.next().unwrap().unwrap().as_id().unwrap(), 1);

        let msg = server.poll_recv().unwrap().unwrap();
        assert_eq!(msg.opcode, core_method::SYNC);
        let pod = pinos_wire::pod::parse_one(&msg.payload).unwrap();
        let mut s = pod.as_struct().unwrap();
        assert_eq!(s.next().unwrap().unwrap().as_int().unwrap(), 42);
    }

    #[test]
    fn core_proxy_dispatches_done_event() {
        let mut core = CoreProxy::default();
        let seen = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let seen2 = seen.clone();
        core.on_done = Some(Box::new(move |seq| seen2.set(seq)));

        let mut buf = Vec::new();
        Builder::new(&mut buf).write_struct(|b| b.write_int(42));
        let ok = core.dispatch_event(core_event::DONE, &buf).unwrap();
        assert!(ok);
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn registry_proxy_dispatches_global() {
        let mut registry = RegistryProxy::default();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        registry.on_global = Some(Box::new(move |id, name| *seen2.borrow_mut() = Some((id, name.to_owned()))));

        let mut buf = Vec::new();
        Builder::new(&mut buf).write_struct(|b| {
            b.write_id(7);
            b.write_string("Node");
        });
        registry.dispatch_event(registry_event::GLOBAL, &buf).unwrap();
        assert_eq!(*seen.borrow(), Some((7, "Node".to_owned())));
    }

    #[test]
    fn unknown_core_opcode_is_an_error_not_a_panic() {
        let mut core = CoreProxy::default();
        assert!(core.dispatch_event(200, &[]).is_err());
    }
}
