// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod chains;
pub mod info;
pub mod project;
pub mod token;

use {
    chains::ChainsArgs,
    info::{GetInfoArgs, JailArgs},
    project::{CancelArgs, CreateVmArgs, DownArgs, NameArgs, StatusArgs, UpArgs},
    token::GenTokenArgs,
};

use {
    async_trait::async_trait,
    clap::{Parser, Subcommand},
};

use crate::{
    chain::{Chain, ChainLister},
    config::{RetryConfig, TimeoutConfig},
    error::ApiResponse,
    remote::{
        chain_names,
        client::{http_client, PeerClient, PeerError},
        Operation,
    },
};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Base URL of the entrypoint to talk to.
    #[arg(
        long,
        global = true,
        env = "OVERLORD_ENTRYPOINT",
        default_value = "http://127.0.0.1:8888"
    )]
    pub entrypoint: String,

    #[arg(long, global = true, env = "OVERLORD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Run the command at the end of this chain instead of on the entrypoint itself.
    #[arg(long, global = true, default_value = "")]
    pub chain: String,

    /// Trust this CA bundle in addition to the system roots.
    #[arg(long, global = true)]
    pub tls_ca: Option<String>,

    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mint a bearer token with the configured secret.
    GenToken(GenTokenArgs),
    GetInfo(GetInfoArgs),
    Jail(JailArgs),
    ProjectInfo(NameArgs),
    Up(UpArgs),
    Down(DownArgs),
    Cancel(CancelArgs),
    Status(StatusArgs),
    CreateVm(CreateVmArgs),
    /// List every chain reachable from the entrypoint.
    Chains(ChainsArgs),
}

/// Talks to one entrypoint, optionally through a chain.
pub struct EntrypointClient {
    client: PeerClient,
    chain: Chain,
}

impl EntrypointClient {
    pub fn new(client: PeerClient, chain: Chain) -> Self {
        Self { client, chain }
    }

    pub fn from_cli(cli: &Cli) -> HandledResult<Self> {
        let chain = Chain::parse(&cli.chain).handle_err(|e| eprintln!("{e}"))?;
        let http = http_client(&TimeoutConfig::default(), cli.tls_ca.as_deref(), 1)
            .handle_err(|e| eprintln!("Could not set up the HTTP client: {e}"))?;
        let retry = RetryConfig {
            total: 1,
            ..RetryConfig::default()
        };
        let client = PeerClient::new(http, &cli.entrypoint, cli.token.clone(), retry);
        Ok(Self::new(client, chain))
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    fn path(chain: &Chain, op: &Operation) -> String {
        if chain.is_empty() {
            op.path()
        } else {
            format!("chain/{chain}/{}", op.path())
        }
    }

    /// Run `op` at the end of `chain`, which is taken relative to the entrypoint.
    pub async fn call_at(&self, chain: &Chain, op: &Operation) -> Result<ApiResponse, PeerError> {
        self.client
            .call(op.method(), &Self::path(chain, op), op.body())
            .await
    }

    pub async fn call(&self, op: &Operation) -> Result<ApiResponse, PeerError> {
        self.call_at(&self.chain, op).await
    }
}

#[async_trait]
impl ChainLister for EntrypointClient {
    type Error = String;

    async fn list_chains(&self, chain: &Chain) -> Result<Vec<String>, String> {
        let response = self
            .call_at(chain, &Operation::ListChains)
            .await
            .map_err(|e| e.to_string())?;
        chain_names(&response).map_err(|e| e.to_string())
    }
}

/// Print a response body, and turn an error status into a `HandledError`.
pub fn report(response: ApiResponse) -> HandledResult<()> {
    if response.is_success() {
        let body = response
            .message()
            .cloned()
            .unwrap_or_else(|| response.body.clone());
        match body {
            serde_json::Value::String(text) => println!("{text}"),
            other => println!(
                "{}",
                serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string())
            ),
        }
        Ok(())
    } else {
        eprintln!(
            "{}: {}",
            response.status,
            serde_json::to_string_pretty(&response.body)
                .unwrap_or_else(|_| response.body.to_string())
        );
        handled_error()
    }
}

/// Run one operation and report its result.
pub async fn run(cli: &Cli, op: Operation) -> HandledResult<()> {
    let client = EntrypointClient::from_cli(cli)?;
    let response = client
        .call(&op)
        .await
        .handle_err(|e| eprintln!("Could not reach '{}': {e}", cli.entrypoint))?;
    report(response)
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    if let Commands::GenToken(args) = &cli.command {
        return token::gen_token(cli, args);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::GetInfo(args) => info::get_info(cli, args).await,
            Commands::Jail(args) => info::jail(cli, args).await,
            Commands::ProjectInfo(args) => project::info(cli, args).await,
            Commands::Up(args) => project::up(cli, args).await,
            Commands::Down(args) => project::down(cli, args).await,
            Commands::Cancel(args) => project::cancel(cli, args).await,
            Commands::Status(args) => project::status(cli, args).await,
            Commands::CreateVm(args) => project::create_vm(cli, args).await,
            Commands::Chains(args) => chains::chains(cli, args).await,
            Commands::GenToken(_) => unreachable!(),
        }
    })
}
