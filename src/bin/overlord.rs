// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use overlord_lib::commands::{self, Cli};

/// The overlord binary talks to an entrypoint: deploy, inspect and tear down projects and VMs.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("OVERLORD_LOG", "warn"))
        .init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
