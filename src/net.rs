// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Host network helpers: finding the address of an interface, and picking free ports for a
//! project before it is launched.

use std::{
    collections::BTreeMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddrV4, SocketAddrV6},
};

use {cidr::IpCidr, log::debug, rand::Rng};

use crate::{config::ProjectsConfig, jobs::model::ReservePort};

pub fn parse_network(network: &str) -> Result<IpCidr, String> {
    network
        .parse::<IpCidr>()
        .map_err(|e| format!("invalid network '{network}': {e}"))
}

/// Looks up the addresses assigned to an interface.
pub trait AddressResolver: Send + Sync {
    /// Addresses of `interface`, IPv4 first. When `network` is given, only addresses inside
    /// it are returned.
    fn resolve(&self, interface: &str, network: Option<&IpCidr>) -> io::Result<Vec<IpAddr>>;
}

#[derive(Debug, Default)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, interface: &str, network: Option<&IpCidr>) -> io::Result<Vec<IpAddr>> {
        let mut addresses = Vec::new();
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            if ifaddr.interface_name != interface {
                continue;
            }
            let Some(address) = ifaddr.address else {
                continue;
            };
            let ip = if let Some(v4) = address.as_sockaddr_in() {
                IpAddr::V4(*SocketAddrV4::from(*v4).ip())
            } else if let Some(v6) = address.as_sockaddr_in6() {
                IpAddr::V6(*SocketAddrV6::from(*v6).ip())
            } else {
                continue;
            };
            if network.is_some_and(|network| !network.contains(&ip)) {
                continue;
            }
            addresses.push(ip);
        }
        addresses.sort_by_key(|ip| ip.is_ipv6());
        Ok(addresses)
    }
}

/// Resolve the first matching address of `interface`, for callers that need exactly one.
pub fn first_address(
    resolver: &dyn AddressResolver,
    interface: &str,
    network: Option<&IpCidr>,
) -> io::Result<IpAddr> {
    resolver
        .resolve(interface, network)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                match network {
                    Some(network) => format!("no address of '{interface}' is inside {network}"),
                    None => format!("'{interface}' has no address"),
                },
            )
        })
}

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
    #[error("{0}")]
    Request(String),

    #[error("could not resolve the reservation address: {0}")]
    Address(io::Error),

    #[error("no free port for '{name}' after {attempts} attempt(s)")]
    Exhausted { name: String, attempts: u32 },

    #[error("could not bind {address}:{port}: {source}")]
    Bind {
        address: IpAddr,
        port: u16,
        source: io::Error,
    },
}

/// Pick a free port for every name in `request` and return the environment handed to the
/// launcher: `OVERLORD_ADDRESS` and one `OVERLORD_PORT_<NAME>` per port.
///
/// A port counts as free when it can be bound. The listener is closed again right away, so the
/// reservation only narrows the window in which another process could take the port.
pub async fn reserve_ports(
    resolver: &dyn AddressResolver,
    request: &ReservePort,
    config: &ProjectsConfig,
) -> Result<BTreeMap<String, String>, ReserveError> {
    let network = request
        .address
        .as_deref()
        .map(parse_network)
        .transpose()
        .map_err(ReserveError::Request)?;

    let address = match &request.interface {
        Some(interface) => first_address(resolver, interface, network.as_ref())
            .map_err(ReserveError::Address)?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };

    let mut environment = BTreeMap::new();
    environment.insert("OVERLORD_ADDRESS".to_string(), address.to_string());

    let mut taken = Vec::new();
    for name in request.ports.iter() {
        let port = reserve_one(address, name, &taken, config).await?;
        debug!("reserved {address}:{port} for {name}");
        taken.push(port);
        environment.insert(format!("OVERLORD_PORT_{}", name.to_uppercase()), port.to_string());
    }

    Ok(environment)
}

async fn reserve_one(
    address: IpAddr,
    name: &str,
    taken: &[u16],
    config: &ProjectsConfig,
) -> Result<u16, ReserveError> {
    let attempts = config.reserve_attempts.max(1);
    for _ in 0..attempts {
        let port = rand::thread_rng().gen_range(config.port_min..=config.port_max);
        if taken.contains(&port) {
            continue;
        }
        match tokio::net::TcpListener::bind((address, port)).await {
            Ok(_) => return Ok(port),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(source) => {
                return Err(ReserveError::Bind {
                    address,
                    port,
                    source,
                })
            }
        }
    }
    Err(ReserveError::Exhausted {
        name: name.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Loopback;

    impl AddressResolver for Loopback {
        fn resolve(&self, interface: &str, network: Option<&IpCidr>) -> io::Result<Vec<IpAddr>> {
            let addresses: Vec<IpAddr> = match interface {
                "lo0" => vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
                _ => Vec::new(),
            };
            Ok(addresses
                .into_iter()
                .filter(|ip| network.map_or(true, |n| n.contains(ip)))
                .collect())
        }
    }

    #[test]
    fn first_address_honours_network() {
        let v6 = parse_network("::1/128").unwrap();
        assert_eq!(
            first_address(&Loopback, "lo0", Some(&v6)).unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
        let elsewhere = parse_network("10.0.0.0/8").unwrap();
        assert!(first_address(&Loopback, "lo0", Some(&elsewhere)).is_err());
        assert!(first_address(&Loopback, "em9", None).is_err());
    }

    #[tokio::test]
    async fn reserves_named_ports() {
        let request = ReservePort {
            interface: Some("lo0".to_string()),
            address: Some("127.0.0.0/8".to_string()),
            ports: vec!["http".to_string(), "ADMIN".to_string()],
        };
        let env = reserve_ports(&Loopback, &request, &ProjectsConfig::default())
            .await
            .unwrap();
        assert_eq!(env["OVERLORD_ADDRESS"], "127.0.0.1");
        let http: u16 = env["OVERLORD_PORT_HTTP"].parse().unwrap();
        let admin: u16 = env["OVERLORD_PORT_ADMIN"].parse().unwrap();
        assert!((10000..=65000).contains(&http));
        assert_ne!(http, admin);
    }

    #[tokio::test]
    async fn gives_up_when_every_attempt_is_taken() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ProjectsConfig {
            port_min: port,
            port_max: port,
            ..Default::default()
        };
        let request = ReservePort {
            interface: Some("lo0".to_string()),
            address: None,
            ports: vec!["HTTP".to_string()],
        };
        let err = reserve_ports(&Loopback, &request, &config).await.unwrap_err();
        assert!(matches!(err, ReserveError::Exhausted { attempts: 3, .. }));
    }
}
