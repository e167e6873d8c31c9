// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::{Args, ValueEnum};

use crate::{
    commands::{self, Cli, HandledResult},
    remote::Operation,
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Listing {
    Jails,
    Projects,
    Labels,
    Chains,
}

#[derive(Args, Debug, Clone)]
pub struct GetInfoArgs {
    what: Listing,
}

#[derive(Args, Debug, Clone)]
pub struct JailArgs {
    /// One of info, labels, expose, healthcheck, limits, fstab, volumes or nat.
    item: String,

    name: String,
}

pub async fn get_info(cli: &Cli, args: &GetInfoArgs) -> HandledResult<()> {
    let op = match args.what {
        Listing::Jails => Operation::ListJails,
        Listing::Projects => Operation::ListProjects,
        Listing::Labels => Operation::ListLabels,
        Listing::Chains => Operation::ListChains,
    };
    commands::run(cli, op).await
}

pub async fn jail(cli: &Cli, args: &JailArgs) -> HandledResult<()> {
    commands::run(
        cli,
        Operation::JailItem {
            item: args.item.clone(),
            name: args.name.clone(),
        },
    )
    .await
}
