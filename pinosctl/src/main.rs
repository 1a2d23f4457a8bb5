// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::warn;

use pinos_proxy::context::Context;
use pinos_proxy::core_protocol::{core_event, registry_event};
use pinos_wire::connection::Connection;

const LOCAL_TYPES: &[&str] = &["Core", "Registry", "ClientNode"];

#[derive(Parser)]
#[command(name = "pinosctl")]
struct Cli {
    /// Path to the server's `SOCK_STREAM` control socket.
    #[arg(long, default_value = "/run/pinos/pinos-0")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every global the server's registry currently exposes.
    List,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let connection = match Connection::connect(&args.socket) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("could not connect to {}: {e}", args.socket.display());
            std::process::exit(1);
        }
    };
    let mut ctx = Context::new(connection);

    match args.command {
        Command::List => list_globals(&mut ctx),
    }
}

/// Runs S1, then reads every `registry.global` event the server sends
/// in reply to `get_registry` until `core.done` confirms the matching
/// `sync` has been processed (the standard "subscribe and drain"
/// pattern, SPEC_FULL.md §8 scenario S1).
fn list_globals(ctx: &mut Context) {
    let sync_seq = 1;
    let registry_id = match ctx.bootstrap(LOCAL_TYPES, sync_seq) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("bootstrap failed: {e}");
            std::process::exit(1);
        }
    };

    loop {
        let msg = match ctx.connection.poll_recv() {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                eprintln!("server closed the connection");
                return;
            }
            Err(e) => {
                warn!("read error: {e}");
                return;
            }
        };

        if msg.target_id == registry_id && msg.opcode == registry_event::GLOBAL {
            if let Some((id, type_name)) = parse_global(&msg.payload) {
                println!("{id}\t{type_name}");
            }
            continue;
        }
        if msg.opcode == core_event::DONE && msg.target_id == 0 {
            return;
        }
    }
}

fn parse_global(payload: &[u8]) -> Option<(u32, String)> {
    let pod = pinos_wire::pod::parse_one(payload).ok()?;
    let mut fields = pod.as_struct().ok()?;
    let id = fields.next()?.ok()?.as_id().ok()?;
    let type_name = fields.next()?.ok()?.as_string().ok()?.to_owned();
    Some((id, type_name))
}
