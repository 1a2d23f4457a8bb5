// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod bluetooth;
mod client;
mod config;
mod data_loop;
mod error;
mod main_loop;
mod registry;
mod server_protocol;

use clap::Parser;
use log::{info, warn};
use nix::poll::PollTimeout;

use config::Cli;
use data_loop::DataLoopHandle;
use main_loop::Server;

fn main() {
    env_logger::init();
    let args = Cli::parse();

    if let Some(parent) = args.socket_path().parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("could not create socket directory {}: {e}", parent.display());
        }
    }

    let (data_events_tx, _data_events_rx) = std::sync::mpsc::channel();
    let data_loop = DataLoopHandle::spawn(data_events_tx);

    let mut server = match Server::bind(&args.socket_path(), data_loop.node_sender()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to bind control socket: {e}");
            std::process::exit(1);
        }
    };

    let quirks = load_quirks(&args);
    info!(
        "loaded quirks: {} no-feature rule(s), force_profile={:?}, force_codec={:?}",
        quirks.no_features.len(),
        quirks.force_profile,
        quirks.force_codec
    );

    let mut bt = bluetooth::BluetoothRuntime::start();
    if bt.is_none() {
        info!("Bluetooth device factory not started, continuing with plain audio clients only");
    }

    info!("pinos-server ready");
    loop {
        if let Err(e) = server.run_once(PollTimeout::from(1000u16)) {
            warn!("main loop iteration failed: {e}");
        }
        if let Some(bt) = &mut bt {
            bt.poll();
        }
    }
}

fn load_quirks(args: &Cli) -> pinos_bluetooth::quirks::AppliedQuirks {
    let read = |p: &Option<String>| -> String {
        p.as_ref().and_then(|path| std::fs::read_to_string(path).ok()).unwrap_or_else(|| "[]".to_string())
    };
    let kernel = read(&args.quirks_kernel);
    let adapter = read(&args.quirks_adapter);
    let device = read(&args.quirks_device);
    match pinos_bluetooth::quirks::QuirksEngine::from_json(&kernel, &adapter, &device) {
        Ok(engine) => engine.evaluate(&Default::default(), &Default::default(), &Default::default()).unwrap_or_default(),
        Err(e) => {
            warn!("quirks configuration rejected, continuing with no quirks applied: {e}");
            Default::default()
        }
    }
}
