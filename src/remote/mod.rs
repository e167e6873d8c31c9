// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Forwarding of operations along a chain.
//!
//! An operation addressed to the empty chain runs on this entrypoint. Otherwise the first
//! segment names the peer to forward to and the rest of the chain travels with the request,
//! so each hop only ever resolves one segment. Whatever the tail peer answers is relayed back
//! unchanged.

pub mod client;
pub mod operation;

use std::sync::Arc;

use {
    async_trait::async_trait,
    axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    log::warn,
    serde::{Deserialize, Serialize},
    serde_json::{json, Value},
};

pub use operation::Operation;

use crate::{
    chain::{Chain, ChainLister, ChainRegistry},
    error::{ApiError, ApiResponse},
};

/// The operations this entrypoint can run itself.
#[async_trait]
pub trait LocalService: Send + Sync {
    async fn handle(&self, op: Operation) -> Result<ApiResponse, ApiError>;
}

/// Body of the 503 sent back when a peer along the chain could not be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainFailure {
    pub function: String,
    pub entrypoint: String,
    pub chain: String,
    pub error: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("entrypoint not found: {0}")]
    EntrypointNotFound(String),

    #[error("entrypoint '{}' is unavailable: {}", .0.entrypoint, .0.message)]
    Unavailable(Box<ChainFailure>),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ProxyError {
    pub fn to_response(&self) -> ApiResponse {
        match self {
            ProxyError::EntrypointNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, self.to_string()).to_response()
            }
            ProxyError::Unavailable(failure) => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let failure = serde_json::to_value(failure.as_ref()).unwrap_or(Value::Null);
                ApiResponse::new(
                    status,
                    json!({
                        "status_code": status.as_u16(),
                        "message": failure,
                    }),
                )
            }
            ProxyError::Api(e) => e.to_response(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_response().into_response()
    }
}

pub struct RemoteProxy {
    registry: Arc<ChainRegistry>,
    local: Arc<dyn LocalService>,
}

impl RemoteProxy {
    pub fn new(registry: Arc<ChainRegistry>, local: Arc<dyn LocalService>) -> Self {
        Self { registry, local }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Run `op` at the end of `chain`.
    pub async fn invoke(&self, chain: &Chain, op: Operation) -> Result<ApiResponse, ProxyError> {
        let Some((hop, rest)) = chain.resolve() else {
            return Ok(self.local.handle(op).await?);
        };

        let peer = self
            .registry
            .peer(hop)
            .ok_or_else(|| ProxyError::EntrypointNotFound(hop.to_string()))?;

        // The tail is the call that reaches the peer the caller actually addressed.
        let tail = rest.is_empty();
        let path = if tail {
            op.path()
        } else {
            format!("chain/{rest}/{}", op.path())
        };

        match peer.client.call(op.method(), &path, op.body()).await {
            Ok(response) => {
                if tail {
                    self.registry.tracker().record_success(hop);
                }
                Ok(response)
            }
            Err(e) => {
                if tail {
                    self.registry.tracker().record_failure(hop);
                }
                warn!(
                    "{} via '{chain}' failed at '{hop}' ({}): {e}",
                    op.function(),
                    peer.client.entrypoint()
                );
                Err(ProxyError::Unavailable(Box::new(ChainFailure {
                    function: op.function().to_string(),
                    entrypoint: hop.to_string(),
                    chain: chain.to_string(),
                    error: e.kind().to_string(),
                    message: e.to_string(),
                })))
            }
        }
    }
}

#[async_trait]
impl ChainLister for RemoteProxy {
    type Error = ProxyError;

    async fn list_chains(&self, chain: &Chain) -> Result<Vec<String>, ProxyError> {
        if chain.is_empty() {
            return Ok(self.registry.list());
        }
        let response = self.invoke(chain, Operation::ListChains).await?;
        chain_names(&response).map_err(ProxyError::Api)
    }
}

/// Pull the list of chain names out of a `GET /v1/chains` response.
pub fn chain_names(response: &ApiResponse) -> Result<Vec<String>, ApiError> {
    if !response.is_success() {
        return Err(ApiError::new(response.status, response.message_text()));
    }
    let names = response.message().cloned().unwrap_or(Value::Null);
    serde_json::from_value(names)
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, format!("invalid chain list: {e}")))
}
