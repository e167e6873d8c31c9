// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use overlord_lib::server;

/// The overlord_server binary serves the HTTP API.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("OVERLORD_LOG", "info"))
        .init();

    let args = server::Cli::parse();

    if server::main(&args).is_err() {
        std::process::exit(1);
    }
}
