// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

/// pinos-server: the session daemon's control-socket listener and
/// Bluetooth device factory.
#[derive(Parser, Debug)]
#[command(name = "pinos-server")]
pub struct Cli {
    /// Directory the `SOCK_STREAM` control socket is created in.
    #[arg(long, default_value = "/run/pinos")]
    pub socket_dir: String,

    /// Socket file name within `socket_dir`.
    #[arg(long, default_value = "pinos-0")]
    pub socket_name: String,

    /// JSON quirks rules keyed by kernel driver/version (C9, §4.7).
    #[arg(long)]
    pub quirks_kernel: Option<String>,

    /// JSON quirks rules keyed by local adapter address.
    #[arg(long)]
    pub quirks_adapter: Option<String>,

    /// JSON quirks rules keyed by remote device properties.
    #[arg(long)]
    pub quirks_device: Option<String>,
}

impl Cli {
    pub fn socket_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.socket_dir).join(&self.socket_name)
    }
}
