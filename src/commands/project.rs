// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;

use {
    clap::{Args, ValueEnum},
    serde::Serialize,
    serde_json::Value,
};

use crate::{
    commands::{self, Cli, Handle, HandledResult},
    jobs::{DownRequest, ReservePort, UpRequest},
    remote::Operation,
    status::StatusKind,
};

fn parse_env(pair: &str) -> Result<(String, String), String> {
    pair.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{pair}'"))
}

#[derive(Args, Debug, Clone)]
pub struct NameArgs {
    name: String,
}

#[derive(Args, Debug, Clone)]
pub struct UpArgs {
    name: String,

    /// The launcher's project file.
    #[arg(short, long, default_value = "appjail-director.yml")]
    file: String,

    #[arg(short, long = "env", value_parser = parse_env)]
    environment: Vec<(String, String)>,

    /// Tear the project down first when it is already deployed.
    #[arg(long)]
    restart: bool,

    /// Reserve a port under this name before launching. May be repeated.
    #[arg(long = "reserve-port")]
    ports: Vec<String>,

    /// Interface the reserved ports are bound on.
    #[arg(long, requires = "ports")]
    interface: Option<String>,

    /// Network the interface address must belong to.
    #[arg(long, requires = "ports")]
    address: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DownArgs {
    name: String,

    #[arg(short, long = "env", value_parser = parse_env)]
    environment: Vec<(String, String)>,

    /// Skip deregistering the project from the load balancer and DNS.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CancelArgs {
    name: String,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StatusOf {
    Up,
    Down,
    Autoscale,
    Vm,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    of: StatusOf,

    name: String,
}

#[derive(Args, Debug, Clone)]
pub struct CreateVmArgs {
    name: String,

    /// JSON file holding the VM profile.
    #[arg(short, long)]
    file: String,

    #[arg(long)]
    restart: bool,
}

fn body<T: Serialize>(request: &T) -> HandledResult<Value> {
    serde_json::to_value(request).handle_err(|e| eprintln!("Could not encode the request: {e}"))
}

pub async fn info(cli: &Cli, args: &NameArgs) -> HandledResult<()> {
    let name = args.name.clone();
    commands::run(cli, Operation::ProjectInfo { name }).await
}

pub async fn up(cli: &Cli, args: &UpArgs) -> HandledResult<()> {
    let director_file = tokio::fs::read_to_string(&args.file)
        .await
        .handle_err(|e| eprintln!("Could not read '{}': {e}", args.file))?;

    let reserve_port = (!args.ports.is_empty()).then(|| ReservePort {
        interface: args.interface.clone(),
        address: args.address.clone(),
        ports: args.ports.clone(),
    });
    let request = UpRequest {
        director_file,
        environment: args.environment.iter().cloned().collect(),
        restart: args.restart,
        reserve_port,
    };

    let op = Operation::ProjectUp {
        name: args.name.clone(),
        body: body(&request)?,
    };
    commands::run(cli, op).await
}

pub async fn down(cli: &Cli, args: &DownArgs) -> HandledResult<()> {
    let request = DownRequest {
        environment: args.environment.iter().cloned().collect::<BTreeMap<_, _>>(),
        force: args.force,
    };
    let op = Operation::ProjectDown {
        name: args.name.clone(),
        body: body(&request)?,
    };
    commands::run(cli, op).await
}

pub async fn cancel(cli: &Cli, args: &CancelArgs) -> HandledResult<()> {
    let name = args.name.clone();
    commands::run(cli, Operation::ProjectCancel { name }).await
}

pub async fn status(cli: &Cli, args: &StatusArgs) -> HandledResult<()> {
    let name = args.name.clone();
    let op = match args.of {
        StatusOf::Up => Operation::ProjectStatus {
            kind: StatusKind::Up,
            name,
        },
        StatusOf::Down => Operation::ProjectStatus {
            kind: StatusKind::Down,
            name,
        },
        StatusOf::Autoscale => Operation::ProjectStatus {
            kind: StatusKind::Autoscale,
            name,
        },
        StatusOf::Vm => Operation::VmStatus { name },
    };
    commands::run(cli, op).await
}

pub async fn create_vm(cli: &Cli, args: &CreateVmArgs) -> HandledResult<()> {
    let profile = tokio::fs::read_to_string(&args.file)
        .await
        .handle_err(|e| eprintln!("Could not read '{}': {e}", args.file))?;
    let mut profile: Value = serde_json::from_str(&profile)
        .handle_err(|e| eprintln!("'{}' is not valid JSON: {e}", args.file))?;
    if args.restart {
        profile["restart"] = Value::Bool(true);
    }
    let op = Operation::CreateVm {
        name: args.name.clone(),
        body: profile,
    };
    commands::run(cli, op).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("A").is_err());
    }
}
