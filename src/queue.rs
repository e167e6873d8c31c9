// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Durable, named work queues ("tubes").
//!
//! A job is reserved by exactly one consumer. It stays reserved until it is deleted (done) or
//! buried (set aside for inspection). Jobs still reserved when a consumer dies are put back by
//! `recover`, which a worker calls on startup.

use std::{
    collections::{HashMap, VecDeque},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use {async_trait::async_trait, log::debug, tokio::time::Instant};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("job {id} is not reserved in tube '{tube}'")]
    NotReserved { tube: String, id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservedJob {
    pub id: u64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a job and return its id.
    async fn put(&self, tube: &str, payload: &[u8]) -> Result<u64, QueueError>;

    /// Reserve the oldest ready job, waiting up to `timeout` for one to show up.
    async fn reserve(&self, tube: &str, timeout: Duration)
        -> Result<Option<ReservedJob>, QueueError>;

    async fn delete(&self, tube: &str, id: u64) -> Result<(), QueueError>;

    async fn bury(&self, tube: &str, id: u64) -> Result<(), QueueError>;

    /// Make every reserved job ready again. Returns how many were released.
    async fn recover(&self, tube: &str) -> Result<usize, QueueError>;
}

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Tube {
    ready: VecDeque<ReservedJob>,
    reserved: HashMap<u64, ReservedJob>,
    buried: Vec<ReservedJob>,
}

/// In-process queue, used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    next_id: Mutex<u64>,
    tubes: Mutex<HashMap<String, Tube>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(&self, tube: &str) -> usize {
        self.tubes
            .lock()
            .unwrap()
            .get(tube)
            .map(|t| t.ready.len())
            .unwrap_or(0)
    }

    pub fn buried(&self, tube: &str) -> Vec<u64> {
        self.tubes
            .lock()
            .unwrap()
            .get(tube)
            .map(|t| t.buried.iter().map(|job| job.id).collect())
            .unwrap_or_default()
    }

    /// Replace the payload of a ready job. Lets tests simulate tampering with the store.
    pub fn overwrite(&self, tube: &str, id: u64, payload: Vec<u8>) -> bool {
        let mut tubes = self.tubes.lock().unwrap();
        let Some(tube) = tubes.get_mut(tube) else {
            return false;
        };
        match tube.ready.iter_mut().find(|job| job.id == id) {
            Some(job) => {
                job.payload = payload;
                true
            }
            None => false,
        }
    }

    fn try_reserve(&self, tube: &str) -> Option<ReservedJob> {
        let mut tubes = self.tubes.lock().unwrap();
        let tube = tubes.get_mut(tube)?;
        let job = tube.ready.pop_front()?;
        tube.reserved.insert(job.id, job.clone());
        Some(job)
    }

    fn take_reserved(&self, tube: &str, id: u64) -> Result<ReservedJob, QueueError> {
        self.tubes
            .lock()
            .unwrap()
            .get_mut(tube)
            .and_then(|t| t.reserved.remove(&id))
            .ok_or_else(|| QueueError::NotReserved {
                tube: tube.to_string(),
                id,
            })
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn put(&self, tube: &str, payload: &[u8]) -> Result<u64, QueueError> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            *next_id
        };
        self.tubes
            .lock()
            .unwrap()
            .entry(tube.to_string())
            .or_default()
            .ready
            .push_back(ReservedJob {
                id,
                payload: payload.to_vec(),
            });
        Ok(id)
    }

    async fn reserve(
        &self,
        tube: &str,
        timeout: Duration,
    ) -> Result<Option<ReservedJob>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_reserve(tube) {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL.min(deadline - Instant::now())).await;
        }
    }

    async fn delete(&self, tube: &str, id: u64) -> Result<(), QueueError> {
        self.take_reserved(tube, id).map(|_| ())
    }

    async fn bury(&self, tube: &str, id: u64) -> Result<(), QueueError> {
        let job = self.take_reserved(tube, id)?;
        self.tubes
            .lock()
            .unwrap()
            .entry(tube.to_string())
            .or_default()
            .buried
            .push(job);
        Ok(())
    }

    async fn recover(&self, tube: &str) -> Result<usize, QueueError> {
        let mut tubes = self.tubes.lock().unwrap();
        let Some(tube) = tubes.get_mut(tube) else {
            return Ok(0);
        };
        let mut jobs: Vec<ReservedJob> = tube.reserved.drain().map(|(_, job)| job).collect();
        jobs.sort_by_key(|job| job.id);
        let count = jobs.len();
        for job in jobs.into_iter().rev() {
            tube.ready.push_front(job);
        }
        Ok(count)
    }
}

const SEQUENCE: &str = ".sequence";

/// Spool directory queue: `<root>/<tube>/<id>.job`, renamed to `.reserved` while a consumer
/// holds it and to `.buried` when set aside. Renames are atomic, so two consumers never get
/// the same job.
#[derive(Debug)]
pub struct SpoolQueue {
    root: PathBuf,
    ids: tokio::sync::Mutex<()>,
    poll: Duration,
}

impl SpoolQueue {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ids: tokio::sync::Mutex::new(()),
            poll: Duration::from_millis(250),
        }
    }

    fn tube_dir(&self, tube: &str) -> PathBuf {
        self.root.join(tube)
    }

    fn job_path(&self, tube: &str, id: u64, state: &str) -> PathBuf {
        self.tube_dir(tube).join(format!("{id:020}.{state}"))
    }

    async fn next_id(&self, tube: &str) -> Result<u64, QueueError> {
        let _guard = self.ids.lock().await;
        let path = self.tube_dir(tube).join(SEQUENCE);
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().parse::<u64>().unwrap_or(0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let id = current + 1;
        tokio::fs::write(&path, id.to_string()).await?;
        Ok(id)
    }

    /// Ids of the jobs in `state`, oldest first.
    async fn list(&self, tube: &str, state: &str) -> Result<Vec<u64>, QueueError> {
        let mut entries = match tokio::fs::read_dir(self.tube_dir(tube)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let suffix = format!(".{state}");
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|name| name.strip_suffix(&suffix))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };
            ids.push(id);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn try_reserve(&self, tube: &str) -> Result<Option<ReservedJob>, QueueError> {
        for id in self.list(tube, "job").await? {
            let reserved = self.job_path(tube, id, "reserved");
            match tokio::fs::rename(self.job_path(tube, id, "job"), &reserved).await {
                Ok(()) => {
                    let payload = tokio::fs::read(&reserved).await?;
                    return Ok(Some(ReservedJob { id, payload }));
                }
                // Someone else got it first.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn move_reserved(&self, tube: &str, id: u64, to: Option<&str>) -> Result<(), QueueError> {
        let reserved = self.job_path(tube, id, "reserved");
        let result = match to {
            Some(state) => tokio::fs::rename(&reserved, self.job_path(tube, id, state)).await,
            None => tokio::fs::remove_file(&reserved).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(QueueError::NotReserved {
                tube: tube.to_string(),
                id,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WorkQueue for SpoolQueue {
    async fn put(&self, tube: &str, payload: &[u8]) -> Result<u64, QueueError> {
        tokio::fs::create_dir_all(self.tube_dir(tube)).await?;
        let id = self.next_id(tube).await?;
        let tmp = self.job_path(tube, id, "tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, self.job_path(tube, id, "job")).await?;
        debug!("queued job {id} in '{tube}'");
        Ok(id)
    }

    async fn reserve(
        &self,
        tube: &str,
        timeout: Duration,
    ) -> Result<Option<ReservedJob>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_reserve(tube).await? {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll.min(deadline - Instant::now())).await;
        }
    }

    async fn delete(&self, tube: &str, id: u64) -> Result<(), QueueError> {
        self.move_reserved(tube, id, None).await
    }

    async fn bury(&self, tube: &str, id: u64) -> Result<(), QueueError> {
        self.move_reserved(tube, id, Some("buried")).await
    }

    async fn recover(&self, tube: &str) -> Result<usize, QueueError> {
        let ids = self.list(tube, "reserved").await?;
        for id in ids.iter() {
            tokio::fs::rename(
                self.job_path(tube, *id, "reserved"),
                self.job_path(tube, *id, "job"),
            )
            .await?;
        }
        Ok(ids.len())
    }
}
