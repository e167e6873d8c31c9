// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use {
    axum::http::{header::RETRY_AFTER, Method},
    log::{debug, warn},
    rand::Rng,
    serde_json::Value,
};

use crate::{
    config::{PeerConfig, RetryConfig, TimeoutConfig},
    error::ApiResponse,
};

/// Header carrying the bearer token on every API request.
pub const AUTH_HEADER: &str = "Authentication";

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("could not read CA bundle '{path}': {source}")]
    Ca {
        path: String,
        source: std::io::Error,
    },

    #[error("could not build HTTP client: {0}")]
    Build(reqwest::Error),

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("peer kept answering {status}: {body}")]
    Status { status: u16, body: String },
}

impl PeerError {
    /// A short name for the kind of failure, reported to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::Ca { .. } | PeerError::Build(_) => "ConfigurationError",
            PeerError::Transport(e) if e.is_timeout() => "TimeoutError",
            PeerError::Transport(e) if e.is_connect() => "ConnectError",
            PeerError::Transport(_) => "RequestError",
            PeerError::Decode(_) => "DecodeError",
            PeerError::Status { .. } => "RetryError",
        }
    }
}

/// Build an async HTTP client with the given timeouts. When `tls_ca` is set, its certificates
/// are trusted in addition to the built-in roots.
pub fn http_client(
    timeout: &TimeoutConfig,
    tls_ca: Option<&str>,
    max_idle: usize,
) -> Result<reqwest::Client, PeerError> {
    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(timeout.connect))
        .timeout(Duration::from_secs(timeout.read + timeout.write))
        .pool_idle_timeout(Duration::from_secs(timeout.pool))
        .pool_max_idle_per_host(max_idle);

    if let Some(path) = tls_ca {
        let pem = std::fs::read(path).map_err(|source| PeerError::Ca {
            path: path.to_string(),
            source,
        })?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem).map_err(PeerError::Build)? {
            builder = builder.add_root_certificate(cert);
        }
    }

    builder.build().map_err(PeerError::Build)
}

/// Client for one peer's API.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    entrypoint: String,
    token: Option<String>,
    retry: RetryConfig,
}

impl PeerClient {
    pub fn new(
        http: reqwest::Client,
        entrypoint: &str,
        token: Option<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            http,
            entrypoint: entrypoint.trim_end_matches('/').to_string(),
            token,
            retry,
        }
    }

    pub fn from_config(peer: &PeerConfig) -> Result<Self, PeerError> {
        let http = http_client(
            &peer.timeout,
            peer.tls_ca.as_deref(),
            peer.limits.max_keepalive_connections,
        )?;
        Ok(Self::new(
            http,
            &peer.entrypoint,
            peer.access_token.clone(),
            peer.retry.clone(),
        ))
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    /// Call `/v1/<path>` on the peer. Connection failures, timeouts and the configured
    /// statuses are retried with exponential backoff; any other response is returned as is.
    /// A configured status still seen on the last attempt is an error.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, PeerError> {
        let url = format!("{}/v1/{}", self.entrypoint, path.trim_start_matches('/'));
        let total = self.retry.total.max(1);
        let mut attempt = 1;

        loop {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(token) = &self.token {
                request = request.header(AUTH_HEADER, format!("Bearer {token}"));
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) if self.retry.statuses.contains(&response.status().as_u16()) => {
                    let status = response.status().as_u16();
                    if attempt >= total {
                        let body = response.text().await.unwrap_or_default();
                        return Err(PeerError::Status { status, body });
                    }
                    let delay = self
                        .retry_after(&response)
                        .unwrap_or_else(|| self.backoff(attempt));
                    warn!(
                        "{method} {url} returned {}; retrying in {:.1}s",
                        response.status(),
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return decode(response).await,
                Err(e) if attempt < total && (e.is_connect() || e.is_timeout()) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{method} {url} failed: {e}; retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }

            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let retry = &self.retry;
        let base = (retry.min_delay * retry.factor.powi(attempt as i32 - 1)).min(retry.max_delay);
        let delay = if retry.jitter && base > 0.0 {
            base / 2.0 + rand::thread_rng().gen_range(0.0..=base / 2.0)
        } else {
            base
        };
        Duration::from_secs_f64(delay.max(0.0))
    }

    fn retry_after(&self, response: &reqwest::Response) -> Option<Duration> {
        if !self.retry.respect_retry_after {
            return None;
        }
        let seconds: f64 = response
            .headers()
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()?;
        Some(Duration::from_secs_f64(
            seconds.clamp(0.0, self.retry.max_delay),
        ))
    }
}

async fn decode(response: reqwest::Response) -> Result<ApiResponse, PeerError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).map_err(|e| PeerError::Decode(e.to_string()))?
    };
    debug!("peer answered {status}");
    Ok(ApiResponse::new(status, body))
}
