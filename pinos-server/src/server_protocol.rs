// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server-side method parsing and event emission for `core`/`registry`/
//! `client_node`. Opcodes come from [`pinos_proxy::core_protocol`] so the
//! client and server sides can never drift apart on numbering.

use pinos_wire::connection::Connection;
use pinos_wire::pod::{Builder, Parser};

use pinos_proxy::core_protocol::{client_node_event, core_event, registry_event};

use crate::error::Error;

fn parser(body: &[u8]) -> Result<Parser<'_>, Error> {
    let pod = pinos_wire::pod::parse_one(body)?;
    pod.as_struct().map_err(Error::from)
}

fn next_id(fields: &mut Parser<'_>) -> Result<u32, Error> {
    fields.next().ok_or(Error::Truncated)?.map_err(Error::from).and_then(|p| p.as_id().map_err(Error::from))
}

fn next_int(fields: &mut Parser<'_>) -> Result<i32, Error> {
    fields.next().ok_or(Error::Truncated)?.map_err(Error::from).and_then(|p| p.as_int().map_err(Error::from))
}

fn next_string(fields: &mut Parser<'_>) -> Result<String, Error> {
    fields
        .next()
        .ok_or(Error::Truncated)?
        .map_err(Error::from)
        .and_then(|p| p.as_string().map(str::to_owned).map_err(Error::from))
}

/// `core.client_update(props)`: returns the flattened `(key, value)` pairs.
pub fn parse_client_update(body: &[u8]) -> Result<Vec<(String, String)>, Error> {
    let mut fields = parser(body)?;
    let mut props = Vec::new();
    while let (Ok(k), Ok(v)) = (next_string(&mut fields), next_string(&mut fields)) {
        props.push((k, v));
    }
    Ok(props)
}

pub fn parse_sync(body: &[u8]) -> Result<u32, Error> {
    Ok(next_int(&mut parser(body)?)? as u32)
}

pub fn parse_get_registry(body: &[u8]) -> Result<u32, Error> {
    next_id(&mut parser(body)?)
}

pub fn parse_bind(body: &[u8]) -> Result<(u32, u32), Error> {
    let mut fields = parser(body)?;
    Ok((next_id(&mut fields)?, next_id(&mut fields)?))
}

pub fn parse_update_types(body: &[u8]) -> Result<(u32, Vec<String>), Error> {
    let mut fields = parser(body)?;
    let first_id = next_int(&mut fields)? as u32;
    let mut names = Vec::new();
    for item in fields {
        names.push(item?.as_string().map_err(Error::from)?.to_owned());
    }
    Ok((first_id, names))
}

pub fn send_info(conn: &mut Connection, core_id: u32, id: u32, cookie: u64, name: &str) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(id);
        b.write_long(cookie as i64);
        b.write_string(name);
    });
    conn.end_write(core_id, core_event::INFO)?;
    Ok(())
}

pub fn send_done(conn: &mut Connection, core_id: u32, seq: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| b.write_int(seq as i32));
    conn.end_write(core_id, core_event::DONE)?;
    Ok(())
}

pub fn send_error(conn: &mut Connection, core_id: u32, id: u32, res: i32, message: &str) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(id);
        b.write_int(res);
        b.write_string(message);
    });
    conn.end_write(core_id, core_event::ERROR)?;
    Ok(())
}

pub fn send_remove_id(conn: &mut Connection, core_id: u32, id: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| b.write_id(id));
    conn.end_write(core_id, core_event::REMOVE_ID)?;
    Ok(())
}

pub fn send_global(conn: &mut Connection, registry_id: u32, id: u32, type_name: &str) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(id);
        b.write_string(type_name);
    });
    conn.end_write(registry_id, registry_event::GLOBAL)?;
    Ok(())
}

pub fn send_global_remove(conn: &mut Connection, registry_id: u32, id: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| b.write_id(id));
    conn.end_write(registry_id, registry_event::GLOBAL_REMOVE)?;
    Ok(())
}

/// `client_node.done(readfd, writefd)`: `readfd`/`writefd` are real
/// eventfds riding along via `SCM_RIGHTS` (§4.3's RT wakeup protocol),
/// not placeholders — `readfd` is what the client polls to learn the
/// server posted to the server→client ring, `writefd` is what it
/// signals to wake the server's data loop.
pub fn send_client_node_done(conn: &mut Connection, node_id: u32, readfd: std::os::fd::OwnedFd, writefd: std::os::fd::OwnedFd) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_fd(0);
        b.write_fd(1);
    });
    conn.write_fd(readfd)?;
    conn.write_fd(writefd)?;
    conn.end_write(node_id, client_node_event::DONE)?;
    Ok(())
}

pub fn send_add_port(conn: &mut Connection, node_id: u32, direction: u32, port: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(direction);
        b.write_id(port);
    });
    conn.end_write(node_id, client_node_event::ADD_PORT)?;
    Ok(())
}

pub fn send_set_format(
    conn: &mut Connection,
    node_id: u32,
    direction: u32,
    port: u32,
    flags: u32,
    format: &[u8],
) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(direction);
        b.write_id(port);
        b.write_id(flags);
        b.write_bytes(format);
    });
    conn.end_write(node_id, client_node_event::SET_FORMAT)?;
    Ok(())
}

/// `client_node.add_mem(mem_id, type, fd, flags, offset, size)`. `fd`
/// rides along via `SCM_RIGHTS` on this same message — it must be
/// attached here, not by the caller beforehand, since
/// [`Connection::begin_write`] clears any fd queued before it runs.
pub fn send_add_mem(
    conn: &mut Connection,
    node_id: u32,
    mem_id: u32,
    ty: u32,
    fd: std::os::fd::OwnedFd,
    flags: u32,
    offset: u64,
    size: u64,
) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(mem_id);
        b.write_id(ty);
        b.write_fd(0);
        b.write_id(flags);
        b.write_long(offset as i64);
        b.write_long(size as i64);
    });
    conn.write_fd(fd)?;
    conn.end_write(node_id, client_node_event::ADD_MEM)?;
    Ok(())
}

pub fn send_transport(conn: &mut Connection, node_id: u32, memfd_index: i32, offset: u64, size: u64) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_int(memfd_index);
        b.write_long(offset as i64);
        b.write_long(size as i64);
    });
    conn.end_write(node_id, client_node_event::TRANSPORT)?;
    Ok(())
}

pub fn send_use_buffers(conn: &mut Connection, node_id: u32, direction: u32, port: u32, n_buffers: u32) -> Result<(), Error> {
    let buf = conn.begin_write();
    Builder::new(buf).write_struct(|b| {
        b.write_id(direction);
        b.write_id(port);
        b.write_id(n_buffers);
    });
    conn.end_write(node_id, client_node_event::USE_BUFFERS)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinos_proxy::core_protocol::send_bind as client_send_bind;

    #[test]
    fn bind_round_trips_through_client_and_server_parsing() {
        let (mut client, mut server) = Connection::pair().unwrap();
        client_send_bind(&mut client, 1, 9, 10).unwrap();
        client.flush().unwrap();
        let msg = server.poll_recv().unwrap().unwrap();
        let (global_id, new_id) = parse_bind(&msg.payload).unwrap();
        assert_eq!((global_id, new_id), (9, 10));
    }

    #[test]
    fn global_event_round_trips_to_a_registry_proxy() {
        let (mut server, mut client) = Connection::pair().unwrap();
        send_global(&mut server, 1, 42, "Node").unwrap();
        server.flush().unwrap();
        let msg = client.poll_recv().unwrap().unwrap();
        let mut registry = pinos_proxy::core_protocol::RegistryProxy::default();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        registry.on_global = Some(Box::new(move |id, name| *seen2.borrow_mut() = Some((id, name.to_owned()))));
        use pinos_proxy::proxy::ProxyObject;
        registry.dispatch_event(msg.opcode, &msg.payload).unwrap();
        assert_eq!(*seen.borrow(), Some((42, "Node".to_owned())));
    }
}
