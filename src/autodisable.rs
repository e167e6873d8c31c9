// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Per-peer circuit breaker.
//!
//! Every failed call that ends at a peer bumps its failure count. Once the count reaches
//! `max_failures`, the peer is hidden from chain listings until a cooldown window has passed
//! since its last failure. The window is `interval` plus an increase that grows by
//! `increase` on each further failure, capped at `max_increase`. A single successful call
//! clears the peer's history.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::config::AutoDisableConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct AutoDisablePolicy {
    pub enabled: bool,
    pub max_failures: u32,
    pub interval: Duration,
    pub increase: Duration,
    pub max_increase: Duration,
}

impl From<&AutoDisableConfig> for AutoDisablePolicy {
    fn from(config: &AutoDisableConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_failures: config.max_failures,
            interval: Duration::from_secs(config.interval),
            increase: Duration::from_secs(config.increase),
            max_increase: Duration::from_secs(config.max_increase),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeerState {
    /// No failures on record.
    Enabled,
    /// Failures on record, but the peer is still listed.
    CoolingDown,
    /// Hidden from chain listings.
    Excluded,
}

#[derive(Debug, Clone)]
struct FailureRecord {
    failures: u32,
    increase: Duration,
    last_failure: Instant,
}

#[derive(Debug)]
pub struct AutoDisableTracker {
    policy: AutoDisablePolicy,
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl AutoDisableTracker {
    pub fn new(policy: AutoDisablePolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AutoDisablePolicy {
        &self.policy
    }

    pub fn record_failure(&self, peer: &str) {
        self.record_failure_at(peer, Instant::now());
    }

    pub fn record_failure_at(&self, peer: &str, now: Instant) {
        if !self.policy.enabled {
            return;
        }
        let mut records = self.records.lock().unwrap();
        match records.get_mut(peer) {
            Some(record) => {
                record.failures += 1;
                record.increase =
                    (record.increase + self.policy.increase).min(self.policy.max_increase);
                record.last_failure = now;
            }
            None => {
                records.insert(
                    peer.to_string(),
                    FailureRecord {
                        failures: 1,
                        increase: Duration::ZERO,
                        last_failure: now,
                    },
                );
            }
        }
        let record = &records[peer];
        log::debug!(
            "peer '{peer}' failed {} time(s), cooldown increase is {}s",
            record.failures,
            record.increase.as_secs()
        );
    }

    pub fn record_success(&self, peer: &str) {
        if self.records.lock().unwrap().remove(peer).is_some() {
            log::info!("peer '{peer}' answered again; clearing its failure history");
        }
    }

    pub fn is_excluded(&self, peer: &str) -> bool {
        self.is_excluded_at(peer, Instant::now())
    }

    pub fn is_excluded_at(&self, peer: &str, now: Instant) -> bool {
        self.state_at(peer, now) == PeerState::Excluded
    }

    pub fn state_at(&self, peer: &str, now: Instant) -> PeerState {
        if !self.policy.enabled {
            return PeerState::Enabled;
        }
        let records = self.records.lock().unwrap();
        let Some(record) = records.get(peer) else {
            return PeerState::Enabled;
        };
        let window = self.policy.interval + record.increase;
        let since = now.saturating_duration_since(record.last_failure);
        if record.failures >= self.policy.max_failures && since < window {
            PeerState::Excluded
        } else {
            PeerState::CoolingDown
        }
    }

    pub fn failures(&self, peer: &str) -> u32 {
        self.records
            .lock()
            .unwrap()
            .get(peer)
            .map(|record| record.failures)
            .unwrap_or(0)
    }

    pub fn increase(&self, peer: &str) -> Duration {
        self.records
            .lock()
            .unwrap()
            .get(peer)
            .map(|record| record.increase)
            .unwrap_or(Duration::ZERO)
    }
}
