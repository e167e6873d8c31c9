// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Key/value store shared by the API server and the workers. Keys are scoped by `serverid` so
//! several servers can share one store. An entry given a time to live reads as absent once it
//! has passed; setting the key again makes it permanent.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use {async_trait::async_trait, serde_json::Value};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on '{key}': {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },

    #[error("corrupt cache entry '{key}': {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
    async fn set(&self, key: &str, value: &Value) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Drop `key` once `ttl` has elapsed. Returns false when there is no such key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

#[derive(Debug)]
struct Entry {
    value: Value,
    deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct MemoryCache {
    serverid: String,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl MemoryCache {
    pub fn new(serverid: &str) -> Self {
        Self {
            serverid: serverid.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn scoped(&self, key: &str) -> (String, String) {
        (self.serverid.clone(), key.to_string())
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let key = self.scoped(key);
        let mut entries = self.entries.lock().unwrap();
        let expired = entries
            .get(&key)
            .is_some_and(|entry| entry.deadline.is_some_and(|at| at <= Instant::now()));
        if expired {
            entries.remove(&key);
            return Ok(None);
        }
        Ok(entries.get(&key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        self.entries.lock().unwrap().insert(
            self.scoped(key),
            Entry {
                value: value.clone(),
                deadline: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(&self.scoped(key));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&self.scoped(key)) {
            Some(entry) if !entry.deadline.is_some_and(|at| at <= now) => {
                entry.deadline = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// One JSON file per key under `<root>/<serverid>/`. Writes go to a temporary file that is
/// renamed into place, so readers never see a partial entry. A key's deadline, in Unix
/// milliseconds, sits next to it in a `.expires` file.
#[derive(Debug)]
pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    pub fn new(root: &Path, serverid: &str) -> Self {
        Self {
            dir: root.join(serverid),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace('/', "_")))
    }

    fn expiry_path(&self, key: &str) -> PathBuf {
        self.path(key).with_extension("expires")
    }

    /// Whether `key` has a deadline that has passed.
    async fn expired(&self, key: &str) -> Result<bool, CacheError> {
        let contents = match tokio::fs::read_to_string(self.expiry_path(key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error(key)(e)),
        };
        // An unreadable deadline is treated as already past.
        let deadline: i64 = contents.trim().parse().unwrap_or(0);
        Ok(deadline <= chrono::Utc::now().timestamp_millis())
    }

    async fn write_atomic(
        &self,
        key: &str,
        path: &Path,
        contents: &[u8],
    ) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(key))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(io_error(key))?;
        tokio::fs::rename(&tmp, path).await.map_err(io_error(key))
    }
}

async fn remove(key: &str, path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(key)(e)),
    }
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl KeyValueCache for FsCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if self.expired(key).await? {
            self.delete(key).await?;
            return Ok(None);
        }
        let contents = match tokio::fs::read(self.path(key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(key)(e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| CacheError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let contents = serde_json::to_vec(value).map_err(|source| CacheError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        remove(key, &self.expiry_path(key)).await?;
        self.write_atomic(key, &self.path(key), &contents).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        remove(key, &self.path(key)).await?;
        remove(key, &self.expiry_path(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        if self.get(key).await?.is_none() {
            return Ok(false);
        }
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let deadline = chrono::Utc::now().timestamp_millis().saturating_add(ttl);
        self.write_atomic(key, &self.expiry_path(key), deadline.to_string().as_bytes())
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn fs_cache_is_scoped_by_server() {
        let dir = tempfile::tempdir().unwrap();
        let node1 = FsCache::new(dir.path(), "node1");
        let node2 = FsCache::new(dir.path(), "node2");

        node1
            .set("project:up:web", &json!({"operation": "RUNNING"}))
            .await
            .unwrap();
        assert_eq!(
            node1.get("project:up:web").await.unwrap(),
            Some(json!({"operation": "RUNNING"}))
        );
        assert_eq!(node2.get("project:up:web").await.unwrap(), None);

        node1.delete("project:up:web").await.unwrap();
        node1.delete("project:up:web").await.unwrap();
        assert_eq!(node1.get("project:up:web").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fs_cache_expires_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path(), "node1");

        assert!(!cache.expire("vm:vm1", Duration::ZERO).await.unwrap());

        cache.set("vm:vm1", &json!(1)).await.unwrap();
        assert!(cache.expire("vm:vm1", Duration::from_secs(3600)).await.unwrap());
        assert_eq!(cache.get("vm:vm1").await.unwrap(), Some(json!(1)));

        // Setting the key again drops its deadline.
        cache.expire("vm:vm1", Duration::ZERO).await.unwrap();
        cache.set("vm:vm1", &json!(2)).await.unwrap();
        assert_eq!(cache.get("vm:vm1").await.unwrap(), Some(json!(2)));

        cache.expire("vm:vm1", Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("vm:vm1").await.unwrap(), None);
        assert!(!dir.path().join("node1/vm:vm1.json").exists());
        assert!(!dir.path().join("node1/vm:vm1.expires").exists());
    }

    #[tokio::test]
    async fn memory_cache_expires_keys() {
        let cache = MemoryCache::new("node1");
        assert!(!cache.expire("vm:vm1", Duration::ZERO).await.unwrap());

        cache.set("vm:vm1", &json!(1)).await.unwrap();
        assert!(cache.expire("vm:vm1", Duration::from_secs(3600)).await.unwrap());
        assert_eq!(cache.get("vm:vm1").await.unwrap(), Some(json!(1)));

        cache.expire("vm:vm1", Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("vm:vm1").await.unwrap(), None);
        assert!(!cache.expire("vm:vm1", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryCache::new("node1");
        cache.set("vm:vm1", &json!(1)).await.unwrap();
        assert_eq!(cache.get("vm:vm1").await.unwrap(), Some(json!(1)));
        cache.delete("vm:vm1").await.unwrap();
        assert_eq!(cache.get("vm:vm1").await.unwrap(), None);
    }
}
