// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The request-serving half: an HTTP API on a single-threaded event loop. It only talks to the
//! worker through the queue and the status cache.

pub mod auth;
pub mod handlers;
pub mod http;

use std::sync::Arc;

use {clap::Parser, log::info, tokio::net::TcpListener};

use crate::{
    cache::{FsCache, KeyValueCache},
    chain::ChainRegistry,
    commands::{Handle, HandledResult},
    config::{Config, ConfigError},
    director::{Director, Launcher},
    jail::{AppJail, JailManager},
    jobs::JobDispatcher,
    queue::{SpoolQueue, WorkQueue},
    remote::{client::PeerError, RemoteProxy},
    tls::{self, TlsError},
};

pub use {auth::TokenAuthority, handlers::LocalHandlers};

#[derive(Parser, Debug)]
#[command(version, about = "Serve the overlord API", long_about = None)]
pub struct Cli {
    #[arg(long, default_value_t = crate::default_config_path())]
    pub config: String,

    /// Overrides `api.bind`.
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

/// What every route handler shares.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<RemoteProxy>,
    pub auth: Arc<TokenAuthority>,
}

/// The backends the local handlers run against.
pub struct Backends {
    pub cache: Arc<dyn KeyValueCache>,
    pub queue: Arc<dyn WorkQueue>,
    pub launcher: Arc<dyn Launcher>,
    pub jails: Arc<dyn JailManager>,
}

impl Backends {
    /// The filesystem queue and cache shared with the worker, and the real launcher and jail
    /// manager.
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache: Arc::new(FsCache::new(&config.jobs.cache_dir, &config.serverid)),
            queue: Arc::new(SpoolQueue::new(&config.jobs.queue_dir)),
            launcher: Arc::new(Director::new(
                &config.projects.launcher,
                &config.projects.directory,
            )),
            jails: Arc::new(AppJail::new(&config.projects.appjail)),
        }
    }
}

impl AppState {
    pub fn new(config: Arc<Config>, backends: Backends) -> Result<Self, ServerError> {
        let registry = Arc::new(ChainRegistry::from_config(&config)?);
        let dispatcher = JobDispatcher::new(
            backends.queue,
            config.job_secret()?,
            config.jobs.tubes.clone(),
        );
        let auth = Arc::new(TokenAuthority::new(config.token_secret()?));
        let local = LocalHandlers::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            backends.cache,
            dispatcher,
            backends.launcher,
            backends.jails,
        );
        Ok(Self {
            proxy: Arc::new(RemoteProxy::new(registry, Arc::new(local))),
            auth,
        })
    }
}

/// Serve the API on `listener` until it fails, over TLS when a certificate is configured.
pub async fn serve(
    config: &Config,
    listener: TcpListener,
    state: AppState,
) -> Result<(), ServerError> {
    let app = http::router(state);
    let io = |context: &str| {
        let context = context.to_string();
        move |source| ServerError::Io { context, source }
    };
    match (&config.api.tls_cert, &config.api.tls_key) {
        (Some(cert), Some(key)) => {
            let acceptor = tls::acceptor(cert, key)?;
            tls::serve(listener, app, acceptor)
                .await
                .map_err(io("TLS listener failed"))
        }
        (None, None) => axum::serve(listener, app)
            .await
            .map_err(io("listener failed")),
        _ => Err(ConfigError::Invalid(
            "api.tls_cert and api.tls_key must be set together".to_string(),
        )
        .into()),
    }
}

/// Main entrypoint for the API server.
pub fn main(args: &Cli) -> HandledResult<()> {
    let config = Config::load(&args.config)
        .handle_err(|e| eprintln!("Could not load '{}': {e}", args.config))?;
    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&config), Backends::from_config(&config))
        .handle_err(|e| eprintln!("Could not set up the server: {e}"))?;
    let bind = args.bind.clone().unwrap_or_else(|| config.api.bind.clone());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch server runtime: {e}"))?;

    rt.block_on(async {
        let listener = TcpListener::bind(&bind)
            .await
            .handle_err(|e| eprintln!("Could not listen on {bind}: {e}"))?;
        info!("'{}' serving on {bind}", config.serverid);
        serve(&config, listener, state)
            .await
            .handle_err(|e| eprintln!("Server failed: {e}"))
    })
}
