// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use overlord_lib::worker;

/// The overlord_worker binary runs queued jobs of one class.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("OVERLORD_LOG", "info"))
        .init();

    let args = worker::Cli::parse();

    if worker::main(&args).is_err() {
        std::process::exit(worker::EX_SOFTWARE);
    }
}
