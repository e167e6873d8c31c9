// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Publishing services in a SkyDNS-style DNS system, where every record is a JSON value stored
//! in etcd under a path made of the record name's labels in reverse order.

use std::{
    net::IpAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use {
    log::debug,
    regex::Regex,
    serde_json::{json, Value},
};

use super::{etcd::EtcdPool, IntegrationResult, LabelError, Mode, ServiceLabels};
use crate::{
    config::SkyDnsConfig,
    net::{first_address, parse_network, AddressResolver},
    remote::client::{http_client, PeerError},
};

static GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_-][a-zA-Z0-9_-]+$").unwrap());

const DEFAULT_TTL: u32 = 60;
const DEFAULT_PRIORITY: u16 = 10;
const DEFAULT_WEIGHT: u16 = 100;

/// Turn a DNS name into its key under `root`: `web.overlord.lan` becomes
/// `<root>/lan/overlord/web`.
pub fn name_to_path(root: &str, name: &str) -> String {
    let mut path = root.trim_end_matches('/').to_string();
    for label in name.trim_end_matches('.').rsplit('.') {
        path.push('/');
        path.push_str(label);
    }
    path
}

/// The reverse-lookup name of an address.
pub fn reverse_name(address: &IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!(
                "{}.{}.{}.{}.in-addr.arpa",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        IpAddr::V6(v6) => {
            let mut labels: Vec<String> = v6
                .octets()
                .iter()
                .flat_map(|byte| [byte >> 4, byte & 0x0f])
                .map(|nibble| format!("{nibble:x}"))
                .collect();
            labels.reverse();
            labels.push("ip6.arpa".to_string());
            labels.join(".")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Srv {
    service: String,
    proto: String,
    port: u16,
    priority: u16,
    weight: u16,
    ttl: u32,
}

pub struct SkyDns {
    etcd: EtcdPool,
    zone: String,
    root: String,
    serverid: String,
    resolver: Arc<dyn AddressResolver>,
}

impl SkyDns {
    pub fn new(
        etcd: EtcdPool,
        config: &SkyDnsConfig,
        serverid: &str,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            etcd,
            zone: config.zone.trim_end_matches('.').to_lowercase(),
            root: config.path.clone(),
            serverid: serverid.to_string(),
            resolver,
        }
    }

    pub fn from_config(
        config: &SkyDnsConfig,
        serverid: &str,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self, PeerError> {
        let http = http_client(&config.timeout, None, config.servers.len())?;
        let etcd = EtcdPool::new(http, &config.servers, Duration::from_secs(config.blacklist));
        Ok(Self::new(etcd, config, serverid, resolver))
    }

    /// Publish (or withdraw) the address record of a service, and its PTR and SRV records when
    /// they are asked for. Each record succeeds or fails on its own.
    pub async fn apply(&self, labels: &ServiceLabels, mode: Mode) -> IntegrationResult {
        let group = match group(labels) {
            Ok(group) => group,
            Err(e) => return IntegrationResult::failed(e.to_string()),
        };
        let ttl = labels
            .parse_or("skydns.ttl", DEFAULT_TTL)
            .map_err(|e| e.to_string());
        let fqdn = format!("{group}.{}", self.zone);
        let address = self.address(labels);

        let mut failed = false;
        let mut messages = Vec::new();
        let mut note = |result: Result<String, String>| match result {
            Ok(message) => messages.push(message),
            Err(message) => {
                failed = true;
                messages.push(message);
            }
        };

        note(self.address_record(&fqdn, address.as_ref(), ttl.as_ref(), mode).await);
        if labels.get("skydns.ptr").is_some() {
            note(self.ptr_record(&fqdn, address.as_ref(), ttl.as_ref(), mode).await);
        }
        if labels.get("skydns.srv").is_some() {
            // SRV records carry their own ttl and only fall back to the group's.
            let ttl = ttl.as_ref().copied().unwrap_or(DEFAULT_TTL);
            note(self.srv_record(labels, &fqdn, ttl, mode).await);
        }

        let message = messages.join("; ");
        if failed {
            IntegrationResult::failed(message)
        } else {
            IntegrationResult::ok(message)
        }
    }

    fn address(&self, labels: &ServiceLabels) -> Result<IpAddr, String> {
        let interface = labels
            .require("skydns.interface")
            .map_err(|e| e.to_string())?;
        let network = labels
            .get("skydns.interface.address")
            .map(parse_network)
            .transpose()?;
        first_address(self.resolver.as_ref(), interface, network.as_ref())
            .map_err(|e| e.to_string())
    }

    async fn address_record(
        &self,
        fqdn: &str,
        address: Result<&IpAddr, &String>,
        ttl: Result<&u32, &String>,
        mode: Mode,
    ) -> Result<String, String> {
        let key = name_to_path(&self.root, &format!("{}.{fqdn}", self.serverid));
        match mode {
            Mode::Create => {
                let address = address.map_err(|e| format!("address record: {e}"))?;
                let ttl = ttl.map_err(|e| format!("address record: {e}"))?;
                let value = json!({ "host": address.to_string(), "ttl": ttl });
                self.put(&key, &value).await?;
                Ok(format!("{fqdn} -> {address}"))
            }
            Mode::Destroy => {
                self.delete(&key).await?;
                Ok(format!("{fqdn} removed"))
            }
        }
    }

    async fn ptr_record(
        &self,
        fqdn: &str,
        address: Result<&IpAddr, &String>,
        ttl: Result<&u32, &String>,
        mode: Mode,
    ) -> Result<String, String> {
        let address = match (address, mode) {
            (Ok(address), _) => address,
            (Err(e), Mode::Create) => return Err(format!("PTR record: {e}")),
            (Err(_), Mode::Destroy) => {
                return Ok("no address to remove a PTR record for".to_string())
            }
        };
        let reverse = reverse_name(address);
        let key = name_to_path(&self.root, &reverse);
        match mode {
            Mode::Create => {
                let ttl = ttl.map_err(|e| format!("PTR record: {e}"))?;
                let value = json!({ "host": format!("{}.{fqdn}", self.serverid), "ttl": ttl });
                self.put(&key, &value).await?;
                Ok(format!("{reverse} -> {}.{fqdn}", self.serverid))
            }
            Mode::Destroy => {
                self.delete(&key).await?;
                Ok(format!("{reverse} removed"))
            }
        }
    }

    async fn srv_record(
        &self,
        labels: &ServiceLabels,
        fqdn: &str,
        ttl: u32,
        mode: Mode,
    ) -> Result<String, String> {
        let srv = srv(labels, ttl).map_err(|e| format!("SRV record: {e}"))?;
        let name = format!("_{}._{}.{fqdn}", srv.service, srv.proto);
        let key = name_to_path(&self.root, &format!("{}.{name}", self.serverid));
        match mode {
            Mode::Create => {
                let target = format!("{}.{fqdn}", self.serverid);
                let value = json!({
                    "host": target,
                    "port": srv.port,
                    "priority": srv.priority,
                    "weight": srv.weight,
                    "ttl": srv.ttl,
                });
                self.put(&key, &value).await?;
                Ok(format!("{name} -> {target}:{}", srv.port))
            }
            Mode::Destroy => {
                self.delete(&key).await?;
                Ok(format!("{name} removed"))
            }
        }
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), String> {
        debug!("skydns: put {key} = {value}");
        self.etcd
            .put(key, &value.to_string())
            .await
            .map_err(|e| format!("{key}: {e}"))
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        debug!("skydns: delete {key}");
        self.etcd.delete(key).await.map_err(|e| format!("{key}: {e}"))
    }
}

fn group(labels: &ServiceLabels) -> Result<String, LabelError> {
    let group = labels.require("skydns.group")?;
    if !GROUP.is_match(group) {
        return Err(LabelError::Invalid {
            label: "skydns.group".to_string(),
            reason: format!("'{group}' must match {}", GROUP.as_str()),
        });
    }
    Ok(group.to_lowercase())
}

fn srv(labels: &ServiceLabels, ttl: u32) -> Result<Srv, LabelError> {
    let port = labels
        .require("skydns.srv.port")?
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| LabelError::Invalid {
            label: "skydns.srv.port".to_string(),
            reason: e.to_string(),
        })?;
    Ok(Srv {
        service: labels
            .require("skydns.srv.service")?
            .trim_start_matches('_')
            .to_string(),
        proto: labels
            .require("skydns.srv.proto")?
            .trim_start_matches('_')
            .to_string(),
        port,
        priority: labels.parse_or("skydns.srv.priority", DEFAULT_PRIORITY)?,
        weight: labels.parse_or("skydns.srv.weight", DEFAULT_WEIGHT)?,
        ttl: labels.parse_or("skydns.srv.ttl", ttl)?,
    })
}
