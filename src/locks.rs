// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use tokio::sync::{Mutex, MutexGuard};

/// A fixed set of mutexes that keys are hashed onto. Two keys may share a stripe, which only
/// costs some contention; the table never grows.
#[derive(Debug)]
pub struct LockTable {
    stripes: Vec<Mutex<()>>,
}

pub const DEFAULT_STRIPES: usize = 64;

impl LockTable {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock().await
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
