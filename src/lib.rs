// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod autodisable;
pub mod cache;
pub mod chain;
pub mod commands;
pub mod config;
pub mod director;
pub mod error;
pub mod jail;
pub mod jobs;
pub mod labels;
pub mod locks;
pub mod metadata;
pub mod net;
pub mod queue;
pub mod remote;
pub mod server;
pub mod status;
pub mod test_env;
pub mod tls;
pub mod worker;

pub fn default_config_path() -> String {
    match std::env::var("OVERLORD_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/usr/local/etc/overlord.toml".to_string(),
    }
}

pub fn default_bind() -> String {
    match std::env::var("OVERLORD_BIND") {
        Ok(bind) => bind,
        Err(_) => "0.0.0.0:8888".to_string(),
    }
}

pub fn default_queue_dir() -> String {
    match std::env::var("OVERLORD_QUEUE_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/spool/overlord".to_string(),
    }
}

pub fn default_cache_dir() -> String {
    match std::env::var("OVERLORD_CACHE_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/cache/overlord".to_string(),
    }
}

pub fn default_data_dir() -> String {
    match std::env::var("OVERLORD_DATA_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/db/overlord".to_string(),
    }
}

/// The name this server publishes itself under when `serverid` is not configured.
pub fn default_serverid() -> String {
    if let Ok(id) = std::env::var("OVERLORD_SERVERID") {
        return id;
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
