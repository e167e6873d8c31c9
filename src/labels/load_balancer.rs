// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Registering services as servers of a load balancer backend through the HAProxy Data Plane
//! API. Changes are made inside a transaction opened against the current configuration
//! version.

use std::{net::IpAddr, sync::Arc};

use {
    log::debug,
    reqwest::{Method, StatusCode},
    serde::Deserialize,
    serde_json::{json, Map, Value},
};

use super::{LabelError, Mode, ServiceLabels};
use crate::{
    config::LoadBalancerConfig,
    net::{first_address, parse_network, AddressResolver},
    remote::client::{http_client, PeerError},
};

#[derive(Debug, thiserror::Error)]
pub enum LbError {
    #[error("{0}")]
    Label(#[from] LabelError),

    #[error("backend '{0}' does not exist")]
    BackendNotFound(String),

    #[error("{step}: unexpected status {status}: {body}")]
    Status {
        step: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{step}: {source}")]
    Transport {
        step: &'static str,
        source: reqwest::Error,
    },

    #[error("{0}")]
    Address(String),

    #[error("{step}: invalid response: {reason}")]
    Decode { step: &'static str, reason: String },
}

#[derive(Debug, Deserialize)]
struct Transaction {
    id: String,
}

/// What a service's labels ask of the load balancer.
#[derive(Debug, Clone, PartialEq)]
struct ServerSpec {
    backend: String,
    name: String,
    interface: String,
    network: Option<String>,
    port: u16,
    extra: Map<String, Value>,
}

impl ServerSpec {
    fn from_labels(labels: &ServiceLabels, serverid: &str) -> Result<Self, LabelError> {
        let backend = labels.require("load-balancer.backend")?.to_string();
        let interface = labels.require("load-balancer.interface")?.to_string();
        let port: u16 = labels
            .require("load-balancer.interface.port")?
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| LabelError::Invalid {
                label: "load-balancer.interface.port".to_string(),
                reason: e.to_string(),
            })?;

        let mut extra = Map::new();
        for (field, value) in labels.below("load-balancer.set.") {
            let parsed: Value = serde_json::from_str(value).map_err(|e| LabelError::Invalid {
                label: format!("load-balancer.set.{field}"),
                reason: e.to_string(),
            })?;
            extra.insert(field.to_string(), parsed);
        }

        let name = match extra.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(LabelError::Invalid {
                    label: "load-balancer.set.name".to_string(),
                    reason: format!("expected a string, got {other}"),
                })
            }
            None => serverid.to_string(),
        };

        Ok(Self {
            backend,
            name,
            interface,
            network: labels.get("load-balancer.interface.address").map(|s| s.to_string()),
            port,
            extra,
        })
    }

    fn body(&self, address: IpAddr) -> Value {
        let mut body = Map::new();
        body.insert("name".to_string(), json!(self.name));
        body.insert("address".to_string(), json!(address.to_string()));
        body.insert("port".to_string(), json!(self.port));
        for (field, value) in self.extra.iter() {
            body.insert(field.clone(), value.clone());
        }
        Value::Object(body)
    }
}

pub struct LoadBalancer {
    http: reqwest::Client,
    base: String,
    username: String,
    password: Option<String>,
    serverid: String,
    resolver: Arc<dyn AddressResolver>,
}

impl LoadBalancer {
    pub fn new(
        http: reqwest::Client,
        config: &LoadBalancerConfig,
        serverid: &str,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            http,
            base: format!(
                "{}/{}",
                config.entrypoint.trim_end_matches('/'),
                config.prefix.trim_matches('/')
            ),
            username: config.username.clone(),
            password: config.password.clone(),
            serverid: serverid.to_string(),
            resolver,
        }
    }

    pub fn from_config(
        config: &LoadBalancerConfig,
        serverid: &str,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self, PeerError> {
        let http = http_client(&config.timeout, config.tls_ca.as_deref(), 1)?;
        Ok(Self::new(http, config, serverid, resolver))
    }

    /// Add or update (on create) or remove (on destroy) the server for one service.
    pub async fn apply(&self, labels: &ServiceLabels, mode: Mode) -> Result<String, LbError> {
        let spec = ServerSpec::from_labels(labels, &self.serverid)?;

        let version = self.version().await?;

        let (status, body) = self
            .send(
                "get backend",
                Method::GET,
                &format!("configuration/backends/{}", spec.backend),
                None,
            )
            .await?;
        match status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(LbError::BackendNotFound(spec.backend)),
            status => {
                return Err(LbError::Status {
                    step: "get backend",
                    status,
                    body: body.to_string(),
                })
            }
        }

        let network = spec
            .network
            .as_deref()
            .map(parse_network)
            .transpose()
            .map_err(LbError::Address)?;
        let address = match first_address(self.resolver.as_ref(), &spec.interface, network.as_ref())
        {
            Ok(address) => Ok(address),
            Err(e) if mode == Mode::Create => return Err(LbError::Address(e.to_string())),
            Err(e) => Err(e),
        };

        let exists = self.server_exists(&spec).await?;
        let transaction = self.open(version).await?;

        match mode {
            Mode::Create => {
                let address = address.map_err(|e| LbError::Address(e.to_string()))?;
                let body = spec.body(address);
                if exists {
                    self.expect(
                        "replace server",
                        Method::PUT,
                        &format!(
                            "configuration/servers/{}?backend={}&transaction_id={transaction}",
                            spec.name, spec.backend
                        ),
                        Some(&body),
                        &[StatusCode::OK, StatusCode::ACCEPTED],
                    )
                    .await?;
                } else {
                    self.expect(
                        "add server",
                        Method::POST,
                        &format!(
                            "configuration/servers?backend={}&transaction_id={transaction}",
                            spec.backend
                        ),
                        Some(&body),
                        &[StatusCode::CREATED, StatusCode::ACCEPTED],
                    )
                    .await?;
                }
                self.commit(&transaction).await?;
                Ok(format!(
                    "server '{}' ({address}:{}) {} in backend '{}'",
                    spec.name,
                    spec.port,
                    if exists { "updated" } else { "added" },
                    spec.backend
                ))
            }
            Mode::Destroy => {
                if !exists {
                    return Ok(format!(
                        "server '{}' is not in backend '{}'",
                        spec.name, spec.backend
                    ));
                }
                if let Err(e) = &address {
                    debug!("destroying '{}' without a local address: {e}", spec.name);
                }
                self.expect(
                    "delete server",
                    Method::DELETE,
                    &format!(
                        "configuration/servers/{}?backend={}&transaction_id={transaction}",
                        spec.name, spec.backend
                    ),
                    None,
                    &[StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
                )
                .await?;
                self.commit(&transaction).await?;
                Ok(format!(
                    "server '{}' removed from backend '{}'",
                    spec.name, spec.backend
                ))
            }
        }
    }

    async fn version(&self) -> Result<u64, LbError> {
        let body = self
            .expect(
                "get version",
                Method::GET,
                "configuration/version",
                None,
                &[StatusCode::OK],
            )
            .await?;
        body.as_u64().ok_or_else(|| LbError::Decode {
            step: "get version",
            reason: format!("expected a number, got {body}"),
        })
    }

    async fn server_exists(&self, spec: &ServerSpec) -> Result<bool, LbError> {
        let (status, body) = self
            .send(
                "get server",
                Method::GET,
                &format!(
                    "configuration/servers/{}?backend={}",
                    spec.name, spec.backend
                ),
                None,
            )
            .await?;
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(LbError::Status {
                step: "get server",
                status,
                body: body.to_string(),
            }),
        }
    }

    async fn open(&self, version: u64) -> Result<String, LbError> {
        let body = self
            .expect(
                "open transaction",
                Method::POST,
                &format!("transactions?version={version}"),
                None,
                &[StatusCode::CREATED],
            )
            .await?;
        let transaction: Transaction =
            serde_json::from_value(body).map_err(|e| LbError::Decode {
                step: "open transaction",
                reason: e.to_string(),
            })?;
        debug!("opened load balancer transaction {}", transaction.id);
        Ok(transaction.id)
    }

    async fn commit(&self, transaction: &str) -> Result<(), LbError> {
        self.expect(
            "commit transaction",
            Method::PUT,
            &format!("transactions/{transaction}"),
            None,
            &[StatusCode::OK, StatusCode::ACCEPTED],
        )
        .await?;
        Ok(())
    }

    async fn expect(
        &self,
        step: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        accepted: &[StatusCode],
    ) -> Result<Value, LbError> {
        let (status, body) = self.send(step, method, path, body).await?;
        if accepted.contains(&status) {
            Ok(body)
        } else {
            Err(LbError::Status {
                step,
                status,
                body: body.to_string(),
            })
        }
    }

    async fn send(
        &self,
        step: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), LbError> {
        let url = format!("{}/{path}", self.base);
        debug!("{step}: {method} {url}");
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.username, self.password.as_deref());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|source| LbError::Transport { step, source })?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| LbError::Transport { step, source })?;
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Ok((status, body))
    }
}
