// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use {clap::Args, serde_json::Value};

use crate::{
    commands::{Cli, Handle, HandledResult},
    config::Config,
    server::TokenAuthority,
};

#[derive(Args, Debug, Clone)]
pub struct GenTokenArgs {
    /// Seconds until the token expires. Without it the token never does.
    #[arg(short, long)]
    expire: Option<u64>,

    /// JSON object embedded in the token.
    #[arg(short, long)]
    metadata: Option<String>,
}

pub fn gen_token(cli: &Cli, args: &GenTokenArgs) -> HandledResult<()> {
    let path = cli.config.clone().unwrap_or_else(crate::default_config_path);
    let config = Config::load(&path).handle_err(|e| eprintln!("Could not load '{path}': {e}"))?;
    let secret = config
        .token_secret()
        .handle_err(|e| eprintln!("{e}"))?;

    let metadata = match &args.metadata {
        Some(metadata) => serde_json::from_str(metadata)
            .handle_err(|e| eprintln!("--metadata is not valid JSON: {e}"))?,
        None => Value::Null,
    };

    let token = TokenAuthority::new(secret)
        .issue(args.expire.map(Duration::from_secs), metadata)
        .handle_err(|e| eprintln!("Could not sign the token: {e}"))?;
    println!("{token}");
    Ok(())
}
