// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::chain;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Config is the model of the configuration file of one entrypoint. It is deserialized once at
/// startup and never mutated afterwards; the runtime objects (peer clients, integrations, the
/// worker) are built from it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Unique identifier of this server. Used to key cache entries and to publish per-server
    /// records in the load balancer and in DNS so multiple servers never clobber each other.
    #[serde(default = "crate::default_serverid")]
    pub serverid: String,

    /// Free-form labels describing this entrypoint, served by `GET /v1/labels`.
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    /// The chain table: every peer this entrypoint can forward requests to.
    #[serde(default)]
    pub chains: BTreeMap<String, PeerConfig>,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub autodisable: AutoDisableConfig,

    pub load_balancer: Option<LoadBalancerConfig>,

    pub skydns: Option<SkyDnsConfig>,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub projects: ProjectsConfig,

    #[serde(default)]
    pub vm: VmConfig,
}

impl Config {
    /// Read, parse and validate the configuration file at `path`. Secrets that are configured
    /// as files are read in place so the rest of the program only deals with inline values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.resolve_secrets()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_secrets(&mut self) -> Result<(), ConfigError> {
        self.security.secret_key = read_secret(
            self.security.secret_key.take(),
            self.security.secret_key_file.as_deref(),
        )?;
        self.jobs.secret = read_secret(self.jobs.secret.take(), self.jobs.secret_file.as_deref())?;
        for peer in self.chains.values_mut() {
            peer.access_token =
                read_secret(peer.access_token.take(), peer.access_token_file.as_deref())?;
        }
        if let Some(lb) = self.load_balancer.as_mut() {
            lb.password = read_secret(lb.password.take(), lb.password_file.as_deref())?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.serverid.is_empty() || !chain::is_valid_segment(&self.serverid) {
            return Err(ConfigError::Invalid(format!(
                "serverid '{}' must match {}",
                self.serverid,
                chain::SEGMENT_PATTERN
            )));
        }

        for (name, peer) in self.chains.iter() {
            if !chain::is_valid_segment(name) {
                return Err(ConfigError::Invalid(format!(
                    "chain name '{name}' must match {}",
                    chain::SEGMENT_PATTERN
                )));
            }
            if peer.entrypoint.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "chain '{name}' has an empty entrypoint"
                )));
            }
        }

        if let Some(skydns) = &self.skydns {
            if !is_valid_zone(&skydns.zone) {
                return Err(ConfigError::Invalid(format!(
                    "skydns zone '{}' is not a valid domain",
                    skydns.zone
                )));
            }
            if skydns.servers.is_empty() {
                return Err(ConfigError::Invalid(
                    "skydns requires at least one server".to_string(),
                ));
            }
        }

        if self.projects.port_min > self.projects.port_max {
            return Err(ConfigError::Invalid(
                "projects.port_min must not exceed projects.port_max".to_string(),
            ));
        }

        Ok(())
    }

    /// The secret used to sign and verify bearer tokens.
    pub fn token_secret(&self) -> Result<&str, ConfigError> {
        match self.security.secret_key.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => Err(ConfigError::Invalid(
                "security.secret_key is required".to_string(),
            )),
        }
    }

    /// The secret used to compute job envelope digests.
    pub fn job_secret(&self) -> Result<&str, ConfigError> {
        match self.jobs.secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => Err(ConfigError::Invalid("jobs.secret is required".to_string())),
        }
    }
}

fn read_secret(inline: Option<String>, file: Option<&str>) -> Result<Option<String>, ConfigError> {
    if inline.is_some() {
        return Ok(inline);
    }
    let Some(path) = file else {
        return Ok(None);
    };
    let secret = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    Ok(Some(secret.trim().to_string()))
}

fn is_valid_zone(zone: &str) -> bool {
    !zone.is_empty()
        && zone.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiConfig {
    #[serde(default = "crate::default_bind")]
    pub bind: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Include error traces in API error responses.
    #[serde(default)]
    pub debug: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: crate::default_bind(),
            tls_cert: None,
            tls_key: None,
            debug: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SecurityConfig {
    pub secret_key: Option<String>,
    pub secret_key_file: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobsConfig {
    pub secret: Option<String>,
    pub secret_file: Option<String>,
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Hard cap, in seconds, on a single launcher invocation.
    #[serde(default = "default_job_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub tubes: Tubes,
}

impl JobsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_file: None,
            queue_dir: default_queue_dir(),
            cache_dir: default_cache_dir(),
            timeout: default_job_timeout(),
            tubes: Tubes::default(),
        }
    }
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from(crate::default_queue_dir())
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(crate::default_cache_dir())
}

fn default_job_timeout() -> u64 {
    3 * 60 * 60
}

/// Names of the queues used for each class of job. Project and VM jobs never share a tube, and
/// cancellations have their own so they are never queued behind the job they target.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Tubes {
    pub project: String,
    pub vm: String,
    pub control: String,
}

impl Default for Tubes {
    fn default() -> Self {
        Self {
            project: "overlord_project".to_string(),
            vm: "overlord_vm".to_string(),
            control: "overlord_control".to_string(),
        }
    }
}

/// One entry of the chain table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    /// Base URL of the peer's API, e.g. `https://dc2.example.org:8888`.
    pub entrypoint: String,
    pub access_token: Option<String>,
    pub access_token_file: Option<String>,
    /// PEM bundle used to verify the peer's certificate.
    pub tls_ca: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Timeouts, in seconds, for outbound HTTP calls.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    #[serde(default = "default_io_timeout")]
    pub read: u64,
    #[serde(default = "default_io_timeout")]
    pub write: u64,
    #[serde(default = "default_pool_timeout")]
    pub pool: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_io_timeout(),
            write: default_io_timeout(),
            pool: default_pool_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_io_timeout() -> u64 {
    30
}

fn default_pool_timeout() -> u64 {
    10
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_keepalive_connections")]
    pub max_keepalive_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_keepalive_connections: default_keepalive_connections(),
        }
    }
}

fn default_keepalive_connections() -> usize {
    20
}

/// Transport-level retry policy for calls to a peer. Delays are in seconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    #[serde(default = "default_retry_total")]
    pub total: u32,
    #[serde(default = "default_retry_min_delay")]
    pub min_delay: f64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_true")]
    pub respect_retry_after: bool,
    /// Response statuses that are retried. 503 is left out on purpose: peers use it to relay
    /// a failure further down the chain, and that failure has already been retried there.
    #[serde(default = "default_retry_statuses")]
    pub statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            total: default_retry_total(),
            min_delay: default_retry_min_delay(),
            max_delay: default_retry_max_delay(),
            factor: default_retry_factor(),
            jitter: true,
            respect_retry_after: true,
            statuses: default_retry_statuses(),
        }
    }
}

fn default_retry_total() -> u32 {
    3
}

fn default_retry_min_delay() -> f64 {
    0.5
}

fn default_retry_max_delay() -> f64 {
    30.0
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_statuses() -> Vec<u16> {
    vec![429, 502, 504]
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChainConfig {
    /// Chains longer than this are never descended into while enumerating.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

fn default_max_depth() -> usize {
    16
}

/// Parameters of the peer auto-disable circuit breaker. Durations are in seconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AutoDisableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_increase")]
    pub increase: u64,
    #[serde(default = "default_max_increase")]
    pub max_increase: u64,
}

impl Default for AutoDisableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: default_max_failures(),
            interval: default_interval(),
            increase: default_increase(),
            max_increase: default_max_increase(),
        }
    }
}

fn default_max_failures() -> u32 {
    2
}

fn default_interval() -> u64 {
    60
}

fn default_increase() -> u64 {
    60
}

fn default_max_increase() -> u64 {
    1800
}

/// Connection parameters of the load balancer's Data Plane API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoadBalancerConfig {
    pub entrypoint: String,
    pub username: String,
    pub password: Option<String>,
    pub password_file: Option<String>,
    #[serde(default = "default_lb_prefix")]
    pub prefix: String,
    pub tls_ca: Option<String>,
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

fn default_lb_prefix() -> String {
    "/v2/services/haproxy".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SkyDnsConfig {
    /// The DNS zone records are published under, e.g. `overlord.lan`.
    pub zone: String,
    /// Base URLs of the etcd gateways backing the DNS system.
    pub servers: Vec<String>,
    #[serde(default = "default_skydns_path")]
    pub path: String,
    /// Seconds a failing server is skipped for, multiplied by the number of servers.
    #[serde(default = "default_blacklist_step")]
    pub blacklist: u64,
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

fn default_skydns_path() -> String {
    "/skydns".to_string()
}

fn default_blacklist_step() -> u64 {
    10
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_dir")]
    pub directory: PathBuf,
    /// Largest accepted value, in bytes.
    #[serde(default = "default_metadata_size")]
    pub size: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            directory: default_metadata_dir(),
            size: default_metadata_size(),
        }
    }
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from(crate::default_data_dir()).join("metadata")
}

fn default_metadata_size() -> usize {
    1024 * 1024
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProjectsConfig {
    #[serde(default = "default_projects_dir")]
    pub directory: PathBuf,
    /// The multi-service launcher executable.
    #[serde(default = "default_launcher")]
    pub launcher: String,
    /// The jail manager executable.
    #[serde(default = "default_appjail")]
    pub appjail: String,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_reserve_attempts")]
    pub reserve_attempts: u32,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            directory: default_projects_dir(),
            launcher: default_launcher(),
            appjail: default_appjail(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            reserve_attempts: default_reserve_attempts(),
        }
    }
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from(crate::default_data_dir()).join("projects")
}

fn default_launcher() -> String {
    "appjail-director".to_string()
}

fn default_appjail() -> String {
    "appjail".to_string()
}

fn default_port_min() -> u16 {
    10000
}

fn default_port_max() -> u16 {
    65000
}

fn default_reserve_attempts() -> u32 {
    3
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VmConfig {
    #[serde(default = "default_vm_dir")]
    pub directory: PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            directory: default_vm_dir(),
        }
    }
}

fn default_vm_dir() -> PathBuf {
    PathBuf::from(crate::default_data_dir()).join("vm")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        serverid = "node1"

        [security]
        secret_key = "token-secret"

        [jobs]
        secret = "job-secret"
    "#;

    #[test]
    fn defaults_are_filled_in() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.serverid, "node1");
        assert!(config.chains.is_empty());
        assert!(config.autodisable.enabled);
        assert_eq!(config.autodisable.max_failures, 2);
        assert_eq!(config.autodisable.interval, 60);
        assert_eq!(config.autodisable.increase, 60);
        assert_eq!(config.autodisable.max_increase, 1800);
        assert_eq!(config.jobs.timeout(), Duration::from_secs(10800));
        assert_eq!(config.metadata.size, 1024 * 1024);
        assert_eq!(config.token_secret().unwrap(), "token-secret");
        assert_eq!(config.job_secret().unwrap(), "job-secret");
    }

    #[test]
    fn chain_table() {
        let config = Config::from_toml(&format!(
            r#"{MINIMAL}
            [chains.dc1]
            entrypoint = "http://127.0.0.1:8001"
            access_token = "abc"

            [chains.dc1.retry]
            total = 5

            [chains.dc2]
            entrypoint = "http://127.0.0.1:8002"
            disabled = true
            "#
        ))
        .unwrap();

        let dc1 = &config.chains["dc1"];
        assert_eq!(dc1.access_token.as_deref(), Some("abc"));
        assert_eq!(dc1.retry.total, 5);
        assert_eq!(dc1.retry.statuses, vec![429, 502, 504]);
        assert_eq!(dc1.timeout.connect, 5);
        assert!(config.chains["dc2"].disabled);
    }

    #[test]
    fn invalid_chain_name() {
        let err = Config::from_toml(&format!(
            r#"{MINIMAL}
            [chains."dc.1"]
            entrypoint = "http://127.0.0.1:8001"
            "#
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn secret_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "from-file\n").unwrap();

        let config = Config::from_toml(&format!(
            r#"
            serverid = "node1"
            [security]
            secret_key_file = "{}"
            "#,
            path.display()
        ))
        .unwrap();
        assert_eq!(config.token_secret().unwrap(), "from-file");
        assert!(config.job_secret().is_err());
    }

    #[test]
    fn zones() {
        assert!(is_valid_zone("overlord.lan"));
        assert!(!is_valid_zone("overlord..lan"));
        assert!(!is_valid_zone(""));
    }
}
