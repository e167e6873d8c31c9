// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Special labels: jail labels under the `overlord.` prefix that ask for a service to be wired
//! into the load balancer and DNS once it is up, and unwired before it goes down.
//!
//! Each integration runs independently for each service. A failure is recorded in the result
//! and never stops the other integration or the other services.

pub mod etcd;
pub mod load_balancer;
pub mod skydns;

use std::{collections::BTreeMap, sync::Arc};

use {
    log::{info, warn},
    serde::{Deserialize, Serialize},
};

pub use {load_balancer::LoadBalancer, skydns::SkyDns};

use crate::{
    config::Config, director::Launcher, jail::JailManager, net::AddressResolver,
    remote::client::PeerError,
};

pub const PREFIX: &str = "overlord.";
pub const LOAD_BALANCER: &str = "load-balancer";
pub const SKYDNS: &str = "skydns";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub error: bool,
    pub message: String,
}

impl IntegrationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            error: false,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
        }
    }
}

impl<E: std::fmt::Display> From<Result<String, E>> for IntegrationResult {
    fn from(result: Result<String, E>) -> Self {
        match result {
            Ok(message) => Self::ok(message),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// Outcome of one dispatch over a project, keyed by service name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecialLabelResult {
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, rename = "load-balancer")]
    pub load_balancer: BTreeMap<String, IntegrationResult>,
    #[serde(default)]
    pub skydns: BTreeMap<String, IntegrationResult>,
}

impl SpecialLabelResult {
    fn failed(message: String) -> Self {
        Self {
            error: true,
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error
            || self.load_balancer.values().any(|r| r.error)
            || self.skydns.values().any(|r| r.error)
    }
}

/// The special labels of one jail, with the prefix stripped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceLabels(BTreeMap<String, String>);

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("missing label 'overlord.{0}'")]
    Missing(String),

    #[error("invalid value for 'overlord.{label}': {reason}")]
    Invalid { label: String, reason: String },
}

impl ServiceLabels {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self(
            labels
                .into_iter()
                .filter_map(|(name, value)| {
                    name.strip_prefix(PREFIX)
                        .map(|name| (name.to_string(), value))
                })
                .collect(),
        )
    }

    /// Whether the integration `name` was asked for.
    pub fn wants(&self, name: &str) -> bool {
        let nested = format!("{name}.");
        self.0
            .keys()
            .any(|key| key == name || key.starts_with(&nested))
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(|value| value.as_str())
    }

    pub fn require(&self, label: &str) -> Result<&str, LabelError> {
        self.get(label)
            .ok_or_else(|| LabelError::Missing(label.to_string()))
    }

    /// Parse an optional label, falling back to `default` when it is absent.
    pub fn parse_or<T>(&self, label: &str, default: T) -> Result<T, LabelError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(label) {
            Some(value) => value.trim().parse().map_err(|e: T::Err| LabelError::Invalid {
                label: label.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Labels below `prefix`, with `prefix` stripped.
    pub fn below<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.0.iter().filter_map(move |(key, value)| {
            key.strip_prefix(prefix)
                .map(|rest| (rest, value.as_str()))
        })
    }
}

pub struct SpecialLabelDispatcher {
    launcher: Arc<dyn Launcher>,
    jails: Arc<dyn JailManager>,
    load_balancer: Option<LoadBalancer>,
    skydns: Option<SkyDns>,
}

impl SpecialLabelDispatcher {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        jails: Arc<dyn JailManager>,
        load_balancer: Option<LoadBalancer>,
        skydns: Option<SkyDns>,
    ) -> Self {
        Self {
            launcher,
            jails,
            load_balancer,
            skydns,
        }
    }

    /// Build the dispatcher with whichever integrations are configured.
    pub fn from_config(
        config: &Config,
        launcher: Arc<dyn Launcher>,
        jails: Arc<dyn JailManager>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self, PeerError> {
        let load_balancer = config
            .load_balancer
            .as_ref()
            .map(|lb| LoadBalancer::from_config(lb, &config.serverid, resolver.clone()))
            .transpose()?;
        let skydns = config
            .skydns
            .as_ref()
            .map(|dns| SkyDns::from_config(dns, &config.serverid, resolver.clone()))
            .transpose()?;
        Ok(Self::new(launcher, jails, load_balancer, skydns))
    }

    pub async fn dispatch(&self, project: &str, mode: Mode) -> SpecialLabelResult {
        let description = match self.launcher.describe(project).await {
            Ok(Some(description)) => description,
            Ok(None) => {
                return SpecialLabelResult::failed(format!("project '{project}' does not exist"))
            }
            Err(e) => {
                return SpecialLabelResult::failed(format!(
                    "could not describe project '{project}': {e}"
                ))
            }
        };

        let mut result = SpecialLabelResult::default();
        for service in description.services.iter() {
            let names = match self.jails.label_names(&service.jail).await {
                Ok(names) => names,
                Err(e) => {
                    warn!(
                        "{project}/{}: could not list labels of '{}': {e}",
                        service.name, service.jail
                    );
                    continue;
                }
            };
            if !names.iter().any(|name| name.starts_with(PREFIX)) {
                continue;
            }

            let labels = match self.jails.labels(&service.jail).await {
                Ok(labels) => ServiceLabels::new(labels),
                Err(e) => {
                    warn!(
                        "{project}/{}: could not read labels of '{}': {e}",
                        service.name, service.jail
                    );
                    continue;
                }
            };

            let (lb, dns) = futures::join!(
                self.apply_load_balancer(&labels, mode),
                self.apply_skydns(&labels, mode)
            );
            if let Some(lb) = lb {
                info!("{project}/{}: load balancer: {}", service.name, lb.message);
                result.load_balancer.insert(service.name.clone(), lb);
            }
            if let Some(dns) = dns {
                info!("{project}/{}: skydns: {}", service.name, dns.message);
                result.skydns.insert(service.name.clone(), dns);
            }
        }

        result.error = result.has_errors();
        result
    }

    async fn apply_load_balancer(
        &self,
        labels: &ServiceLabels,
        mode: Mode,
    ) -> Option<IntegrationResult> {
        if !labels.wants(LOAD_BALANCER) {
            return None;
        }
        Some(match &self.load_balancer {
            Some(lb) => lb.apply(labels, mode).await.into(),
            None => IntegrationResult::failed("the load balancer integration is not configured"),
        })
    }

    async fn apply_skydns(&self, labels: &ServiceLabels, mode: Mode) -> Option<IntegrationResult> {
        if !labels.wants(SKYDNS) {
            return None;
        }
        Some(match &self.skydns {
            Some(dns) => dns.apply(labels, mode).await,
            None => IntegrationResult::failed("the DNS integration is not configured"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> ServiceLabels {
        ServiceLabels::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn prefix_is_stripped() {
        let labels = labels(&[
            ("overlord.load-balancer", "1"),
            ("overlord.load-balancer.backend", "web"),
            ("overlord.load-balancer.set.weight", "10"),
            ("appjail.dns.alt-name", "x"),
        ]);
        assert!(labels.wants(LOAD_BALANCER));
        assert!(!labels.wants(SKYDNS));
        assert_eq!(labels.get("load-balancer.backend"), Some("web"));
        assert_eq!(labels.get("appjail.dns.alt-name"), None);
        assert_eq!(
            labels.below("load-balancer.set.").collect::<Vec<_>>(),
            vec![("weight", "10")]
        );
    }

    #[test]
    fn typed_labels() {
        let labels = labels(&[("overlord.skydns.ttl", "300"), ("overlord.skydns.srv.port", "x")]);
        assert_eq!(labels.parse_or("skydns.ttl", 60u32).unwrap(), 300);
        assert_eq!(labels.parse_or("skydns.srv.weight", 100u16).unwrap(), 100);
        assert!(labels.parse_or("skydns.srv.port", 0u16).is_err());
        assert!(matches!(
            labels.require("skydns.group"),
            Err(LabelError::Missing(_))
        ));
    }

    #[test]
    fn errors_roll_up() {
        let mut result = SpecialLabelResult::default();
        result
            .skydns
            .insert("web".to_string(), IntegrationResult::ok("ok"));
        assert!(!result.has_errors());
        result
            .load_balancer
            .insert("web".to_string(), IntegrationResult::failed("backend missing"));
        assert!(result.has_errors());
    }
}
