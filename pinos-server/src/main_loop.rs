// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The main loop (§5): single-threaded and cooperative, owning the
//! control-socket listener, every client connection, and the global
//! registry. `run_once` is one `poll(2)` pass; callers drive it in a
//! loop (or from the `pinos-server` binary's top-level `for`).

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use log::{info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use crate::client::ClientSession;
use crate::error::Error;
use crate::registry::GlobalRegistry;

pub struct Server {
    listener: OwnedFd,
    clients: Vec<ClientSession>,
    pub registry: GlobalRegistry,
    data_loop_nodes: std::sync::mpsc::Sender<crate::data_loop::NodeMsg>,
}

impl Server {
    /// `data_loop_nodes` is handed to every accepted client so it can
    /// register its RT nodes directly with the data loop without
    /// routing registration through `Server` (see
    /// [`crate::data_loop::DataLoopHandle::node_sender`]).
    pub fn bind(path: &Path, data_loop_nodes: std::sync::mpsc::Sender<crate::data_loop::NodeMsg>) -> Result<Self, Error> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        let addr = UnixAddr::new(path).map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;
        socket::bind(fd.as_raw_fd(), &addr)?;
        socket::listen(&fd, Backlog::new(16).expect("16 fits in a backlog"))?;
        info!("listening on {}", path.display());
        Ok(Self { listener: fd, clients: Vec::new(), registry: GlobalRegistry::new(), data_loop_nodes })
    }

    /// One `poll` pass over the listener and every client connection.
    /// `timeout` is the max time to block with nothing ready.
    pub fn run_once(&mut self, timeout: PollTimeout) -> Result<(), Error> {
        let mut fds: Vec<PollFd> = Vec::with_capacity(self.clients.len() + 1);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        for client in &self.clients {
            fds.push(PollFd::new(client.connection.as_fd(), PollFlags::POLLIN));
        }

        poll(&mut fds, timeout)?;

        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            self.accept_one()?;
        }

        let mut dead = Vec::new();
        for (i, pfd) in fds.iter().enumerate().skip(1) {
            if pfd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) && !self.service_client(i - 1)? {
                dead.push(i - 1);
            }
        }
        for i in dead.into_iter().rev() {
            self.clients.remove(i);
        }
        Ok(())
    }

    fn accept_one(&mut self) -> Result<(), Error> {
        // Plain `accept(2)` does not inherit `SOCK_NONBLOCK` from the
        // listening socket, so use `accept4` directly or every blocked
        // client would stall this single-threaded loop.
        let raw = socket::accept4(self.listener.as_raw_fd(), SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC)?;
        // SAFETY: `accept4` returns a freshly opened, uniquely owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        self.clients.push(ClientSession::new(pinos_wire::connection::Connection::from_fd(fd), self.data_loop_nodes.clone()));
        info!("accepted client, {} connected", self.clients.len());
        Ok(())
    }

    /// Drains every pending message from one client. Returns `false` if
    /// the peer disconnected, so the caller can drop the session.
    fn service_client(&mut self, index: usize) -> Result<bool, Error> {
        loop {
            let msg = match self.clients[index].connection.poll_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(false),
                Err(pinos_wire::Error::Transport(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = self.clients[index].handle_message(msg, &self.registry) {
                warn!("client {index} message handling failed: {e}");
            }
        }
        if self.clients[index].connection.need_flush() {
            self.clients[index].connection.flush()?;
        }
        Ok(true)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
