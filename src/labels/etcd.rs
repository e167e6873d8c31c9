// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Writes to etcd through its v3 JSON gateway, spread over a pool of hosts.
//!
//! A host that fails a request is skipped for `step * hosts` seconds. A write only fails once
//! every host has been tried or is still skipped.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use {
    base64::{engine::general_purpose::STANDARD, Engine},
    log::{debug, warn},
    serde_json::{json, Value},
};

#[derive(Debug, thiserror::Error)]
pub enum EtcdError {
    #[error("every etcd host failed or is blacklisted (last error: {last})")]
    Exhausted { last: String },
}

#[derive(Debug)]
pub struct EtcdPool {
    http: reqwest::Client,
    hosts: Vec<String>,
    step: Duration,
    blacklist: Mutex<HashMap<usize, Instant>>,
}

impl EtcdPool {
    pub fn new(http: reqwest::Client, hosts: &[String], step: Duration) -> Self {
        Self {
            http,
            hosts: hosts
                .iter()
                .map(|host| host.trim_end_matches('/').to_string())
                .collect(),
            step,
            blacklist: Mutex::new(HashMap::new()),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), EtcdError> {
        self.request(
            "kv/put",
            json!({
                "key": STANDARD.encode(key),
                "value": STANDARD.encode(value),
            }),
        )
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), EtcdError> {
        self.request("kv/deleterange", json!({ "key": STANDARD.encode(key) }))
            .await
    }

    fn is_blacklisted(&self, index: usize, now: Instant) -> bool {
        let mut blacklist = self.blacklist.lock().unwrap();
        match blacklist.get(&index) {
            Some(until) if *until > now => true,
            Some(_) => {
                blacklist.remove(&index);
                false
            }
            None => false,
        }
    }

    fn blacklist(&self, index: usize) {
        let cooldown = self.step * self.hosts.len() as u32;
        self.blacklist
            .lock()
            .unwrap()
            .insert(index, Instant::now() + cooldown);
    }

    async fn request(&self, endpoint: &str, body: Value) -> Result<(), EtcdError> {
        let mut last = "no host was available".to_string();
        for (index, host) in self.hosts.iter().enumerate() {
            if self.is_blacklisted(index, Instant::now()) {
                debug!("skipping blacklisted etcd host {host}");
                continue;
            }
            let url = format!("{host}/v3/{endpoint}");
            let result = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("etcd request to {url} failed: {e}; blacklisting {host}");
                    self.blacklist(index);
                    last = e.to_string();
                }
            }
        }
        Err(EtcdError::Exhausted { last })
    }
}
