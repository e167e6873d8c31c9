// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Chains: dot-separated paths through the federation of entrypoints.
//!
//! A chain such as `dc1.rack3` is read from the left: the first segment names a peer in the
//! local chain table, and the rest is handed to that peer to resolve in its own table. The
//! empty chain addresses the local entrypoint.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::LazyLock};

use futures::stream::{self, Stream};
use regex::Regex;

use crate::{
    autodisable::AutoDisableTracker,
    config::Config,
    remote::client::{PeerClient, PeerError},
};

pub const SEGMENT_PATTERN: &str = "^[a-zA-Z0-9_][a-zA-Z0-9_-]*$";

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(SEGMENT_PATTERN).unwrap());

pub fn is_valid_segment(segment: &str) -> bool {
    SEGMENT.is_match(segment)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chain segment '{0}': segments must match {SEGMENT_PATTERN}")]
pub struct ChainError(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chain(Vec<String>);

impl Chain {
    /// The empty chain, addressing the local entrypoint.
    pub fn local() -> Self {
        Self(Vec::new())
    }

    /// Parse a dotted chain. The empty string is the local chain.
    pub fn parse(chain: &str) -> Result<Self, ChainError> {
        if chain.is_empty() {
            return Ok(Self::local());
        }
        chain
            .split('.')
            .map(|segment| {
                if is_valid_segment(segment) {
                    Ok(segment.to_string())
                } else {
                    Err(ChainError(segment.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Split off the next hop. Returns `None` for the local chain.
    pub fn resolve(&self) -> Option<(&str, Chain)> {
        let (next, rest) = self.0.split_first()?;
        Some((next.as_str(), Chain(rest.to_vec())))
    }

    /// The chain one level below this one, through `segment`.
    pub fn child(&self, segment: &str) -> Result<Chain, ChainError> {
        if !is_valid_segment(segment) {
            return Err(ChainError(segment.to_string()));
        }
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Chain(segments))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for Chain {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Chain::parse(s)
    }
}

/// One configured peer.
#[derive(Debug)]
pub struct Peer {
    pub name: String,
    pub disabled: bool,
    pub client: PeerClient,
}

/// The chain table of this entrypoint plus the failure history of its peers. Built once at
/// startup; only the tracker's state changes afterwards.
#[derive(Debug)]
pub struct ChainRegistry {
    peers: BTreeMap<String, Peer>,
    tracker: AutoDisableTracker,
    max_depth: usize,
}

impl ChainRegistry {
    pub fn new(peers: Vec<Peer>, tracker: AutoDisableTracker, max_depth: usize) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|peer| (peer.name.clone(), peer))
                .collect(),
            tracker,
            max_depth,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, PeerError> {
        let peers = config
            .chains
            .iter()
            .map(|(name, peer)| {
                Ok(Peer {
                    name: name.clone(),
                    disabled: peer.disabled,
                    client: PeerClient::from_config(peer)?,
                })
            })
            .collect::<Result<Vec<_>, PeerError>>()?;
        Ok(Self::new(
            peers,
            AutoDisableTracker::new((&config.autodisable).into()),
            config.chain.max_depth,
        ))
    }

    /// Look up a peer that may be forwarded to. Disabled peers are treated as unknown.
    pub fn peer(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name).filter(|peer| !peer.disabled)
    }

    pub fn tracker(&self) -> &AutoDisableTracker {
        &self.tracker
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Names of the peers that are currently advertised: not disabled and not excluded by the
    /// auto-disable tracker.
    pub fn list(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|peer| !peer.disabled && !self.tracker.is_excluded(&peer.name))
            .map(|peer| peer.name.clone())
            .collect()
    }
}

/// Anything that can list the peers advertised at the end of a chain.
#[async_trait::async_trait]
pub trait ChainLister: Send + Sync {
    type Error: fmt::Display + Send;

    async fn list_chains(&self, chain: &Chain) -> Result<Vec<String>, Self::Error>;
}

/// Why part of the chain graph could not be walked.
#[derive(Debug)]
pub enum EnumerateFailure<E> {
    List(E),
    InvalidName(ChainError),
    TooDeep(usize),
}

impl<E: fmt::Display> fmt::Display for EnumerateFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumerateFailure::List(e) => write!(f, "{e}"),
            EnumerateFailure::InvalidName(e) => write!(f, "{e}"),
            EnumerateFailure::TooDeep(max) => write!(f, "chain is deeper than {max} hops"),
        }
    }
}

struct Walk<'a, L: ?Sized, F> {
    lister: &'a L,
    root: Option<Chain>,
    stack: Vec<Chain>,
    max_depth: usize,
    on_failure: F,
}

/// Lazily walk every chain reachable from `root`, depth first.
///
/// A chain is only yielded once its own listing succeeded. Failures are passed to `on_failure`
/// and the walk carries on with the siblings of the failed chain. Chains longer than
/// `max_depth` are reported instead of being listed, which bounds the walk when peers
/// reference each other in a cycle.
pub fn enumerate_all<'a, L, F>(
    lister: &'a L,
    root: Chain,
    max_depth: usize,
    on_failure: F,
) -> impl Stream<Item = Chain> + 'a
where
    L: ChainLister + ?Sized,
    F: FnMut(&Chain, EnumerateFailure<L::Error>) + 'a,
{
    let walk = Walk {
        lister,
        root: Some(root),
        stack: Vec::new(),
        max_depth,
        on_failure,
    };

    stream::unfold(walk, |mut walk| async move {
        loop {
            let (chain, is_root) = match walk.root.take() {
                Some(root) => (root, true),
                None => (walk.stack.pop()?, false),
            };

            if chain.len() > walk.max_depth {
                (walk.on_failure)(&chain, EnumerateFailure::TooDeep(walk.max_depth));
                continue;
            }

            let children = match walk.lister.list_chains(&chain).await {
                Ok(children) => children,
                Err(e) => {
                    (walk.on_failure)(&chain, EnumerateFailure::List(e));
                    continue;
                }
            };

            for name in children.iter().rev() {
                match chain.child(name) {
                    Ok(child) => walk.stack.push(child),
                    Err(e) => (walk.on_failure)(&chain, EnumerateFailure::InvalidName(e)),
                }
            }

            if !is_root {
                return Some((chain, walk));
            }
        }
    })
}
