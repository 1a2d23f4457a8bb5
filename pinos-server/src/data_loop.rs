// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The data loop (§5): a realtime-priority thread separate from the
//! main loop, woken by the eventfd pair embedded in each node's RT
//! transport. It never touches the control-socket connections or the
//! registry directly — it only drains/publishes [`pinos_transport`]
//! rings and reports back to the main loop over `events`.

use std::os::fd::BorrowedFd;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use pinos_transport::{RingSide, Transport};

/// One fact the data loop reports back to the main loop per tick. The
/// main loop owns what happens next (e.g. turning a buffer underrun
/// into a stream `fail()`); the data loop only observes.
#[derive(Debug)]
pub enum DataLoopEvent {
    BufferReady { node_id: u32, port: u32 },
    BufferReleased { node_id: u32, port: u32, buffer_id: u32 },
}

/// Sent from the main loop to hand a node's RT transport over to (or
/// take it back from) the data loop, which becomes its sole owner —
/// the main loop keeps no reference to a node's `Transport` once it's
/// registered (§5: the data loop, not the main loop, owns RT state).
pub enum NodeMsg {
    Add(u32, Transport),
    Remove(u32),
}

/// Spawns the data loop on its own OS thread. Dropping the returned
/// [`DataLoopHandle`] asks the thread to exit at its next wakeup.
pub struct DataLoopHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
    nodes: Sender<NodeMsg>,
}

impl DataLoopHandle {
    pub fn spawn(events: Sender<DataLoopEvent>) -> Self {
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();
        let (nodes_tx, nodes_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("pinos-data".into())
            .spawn(move || run(events, shutdown_rx, nodes_rx))
            .expect("spawning the data loop thread");
        Self { thread: Some(thread), shutdown: shutdown_tx, nodes: nodes_tx }
    }

    /// Hands a newly created node's transport to the data loop. The
    /// caller must not keep using `transport` afterward.
    pub fn register_node(&self, node_id: u32, transport: Transport) {
        let _ = self.nodes.send(NodeMsg::Add(node_id, transport));
    }

    pub fn remove_node(&self, node_id: u32) {
        let _ = self.nodes.send(NodeMsg::Remove(node_id));
    }

    /// A clonable handle each client session can hold directly, so
    /// registering a node doesn't require routing through `Server`.
    pub fn node_sender(&self) -> Sender<NodeMsg> {
        self.nodes.clone()
    }

    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Attempts to raise this thread to realtime scheduling (`SCHED_FIFO`);
/// failure (e.g. no `CAP_SYS_NICE`) is logged and otherwise ignored —
/// the loop still runs, just without RT priority guarantees.
fn try_set_realtime_priority() {
    let param = libc::sched_param { sched_priority: 20 };
    // SAFETY: `sched_setscheduler(0, ...)` targets the calling thread
    // and `param` is a valid, fully initialized `sched_param`.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!("could not set SCHED_FIFO priority for data loop: {}", std::io::Error::last_os_error());
    }
}

fn run(events: Sender<DataLoopEvent>, shutdown: Receiver<()>, node_msgs: Receiver<NodeMsg>) {
    try_set_realtime_priority();
    let mut nodes: Vec<(u32, Transport)> = Vec::new();

    loop {
        match shutdown.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }
        loop {
            match node_msgs.try_recv() {
                Ok(NodeMsg::Add(id, transport)) => nodes.push((id, transport)),
                Ok(NodeMsg::Remove(id)) => nodes.retain(|(nid, _)| *nid != id),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if nodes.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }

        // Each node's client-to-server wakeup is the data loop's
        // consumer-side fd (§4.3): the client signals it whenever it
        // posts or releases a buffer on that ring.
        let mut fds: Vec<PollFd> = nodes
            .iter()
            .map(|(_, t)| {
                // SAFETY: `t.wakeup_fd` is a live eventfd owned by `t`,
                // which outlives this poll call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(t.wakeup_fd(RingSide::ClientToServer)) }, PollFlags::POLLIN)
            })
            .collect();

        if let Err(e) = poll(&mut fds, PollTimeout::from(5u16)) {
            warn!("data loop poll failed: {e}");
            continue;
        }

        for (i, (node_id, transport)) in nodes.iter_mut().enumerate() {
            if !fds[i].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
                continue;
            }
            let id = *node_id;
            let tx = events.clone();
            let result = transport.drain(RingSide::ClientToServer, |event| {
                let _ = tx.send(match event {
                    pinos_transport::area::NodeEvent::HaveOutput { port } => DataLoopEvent::BufferReady { node_id: id, port },
                    pinos_transport::area::NodeEvent::ReuseBuffer { port, buffer_id } => {
                        DataLoopEvent::BufferReleased { node_id: id, port, buffer_id }
                    }
                });
            });
            if let Err(e) = result {
                warn!("node {id} ring drain failed: {e}");
            }
        }
    }
}
