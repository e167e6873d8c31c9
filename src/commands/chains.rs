// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::pin::pin;

use {clap::Args, futures::StreamExt};

use crate::{
    chain::enumerate_all,
    commands::{Cli, EntrypointClient, HandledResult},
};

#[derive(Args, Debug, Clone)]
pub struct ChainsArgs {
    /// Stop descending below this many hops.
    #[arg(long, default_value_t = 16)]
    max_depth: usize,
}

pub async fn chains(cli: &Cli, args: &ChainsArgs) -> HandledResult<()> {
    let client = EntrypointClient::from_cli(cli)?;
    let root = client.chain().clone();
    let mut walk = pin!(enumerate_all(
        &client,
        root,
        args.max_depth,
        |chain, failure| eprintln!("{}: {failure}", display(chain)),
    ));
    while let Some(chain) = walk.next().await {
        println!("{chain}");
    }
    Ok(())
}

fn display(chain: &crate::chain::Chain) -> String {
    if chain.is_empty() {
        "<entrypoint>".to_string()
    } else {
        chain.to_string()
    }
}
