// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, str::FromStr, sync::LazyLock};

use {
    regex::Regex,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::{
    cache::{CacheError, KeyValueCache},
    labels::SpecialLabelResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Running,
    Completed,
    Incompleted,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                JobState::Running => "RUNNING",
                JobState::Completed => "COMPLETED",
                JobState::Incompleted => "INCOMPLETED",
                JobState::Failed => "FAILED",
            }
        )
    }
}

/// The kinds of project status that are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Up,
    Down,
    Autoscale,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                StatusKind::Up => "up",
                StatusKind::Down => "down",
                StatusKind::Autoscale => "autoscale",
            }
        )
    }
}

impl FromStr for StatusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(StatusKind::Up),
            "down" => Ok(StatusKind::Down),
            "autoscale" => Ok(StatusKind::Autoscale),
            other => Err(format!("unknown status kind '{other}'")),
        }
    }
}

/// Cache key of an entity's status.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusKey {
    Project(StatusKind, String),
    Vm(String),
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKey::Project(kind, name) => write!(f, "project:{kind}:{name}"),
            StatusKey::Vm(name) => write!(f, "vm:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: String,
    pub message: String,
}

/// What the worker last recorded about a project or VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub operation: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Unix timestamp, in seconds.
    pub last_update: i64,
    pub job_id: u64,
    #[serde(default)]
    pub restarted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<SpecialLabelResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl EntityStatus {
    pub fn running(job_id: u64) -> Self {
        Self {
            operation: JobState::Running,
            output: None,
            last_update: now(),
            job_id,
            restarted: false,
            labels: None,
            error: None,
        }
    }

    pub fn finished(job_id: u64, operation: JobState, output: &str) -> Self {
        Self {
            operation,
            output: Some(strip_ansi(output)),
            last_update: now(),
            job_id,
            restarted: false,
            labels: None,
            error: None,
        }
    }

    pub fn failed(job_id: u64, error: &str, message: impl Into<String>) -> Self {
        Self {
            operation: JobState::Failed,
            output: None,
            last_update: now(),
            job_id,
            restarted: false,
            labels: None,
            error: Some(ErrorInfo {
                error: error.to_string(),
                message: strip_ansi(&message.into()),
            }),
        }
    }

    /// The status as served by the API: `last_update` is turned into the number of seconds
    /// since the update.
    pub fn to_api_value(&self, now: i64) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        value["last_update"] = Value::from((now - self.last_update).max(0));
        value
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// Remove terminal escape sequences from launcher output.
pub fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").into_owned()
}

pub async fn get(
    cache: &dyn KeyValueCache,
    key: &StatusKey,
) -> Result<Option<EntityStatus>, CacheError> {
    let key = key.to_string();
    match cache.get(&key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { key, source }),
        None => Ok(None),
    }
}

pub async fn put(
    cache: &dyn KeyValueCache,
    key: &StatusKey,
    status: &EntityStatus,
) -> Result<(), CacheError> {
    let key = key.to_string();
    let value =
        serde_json::to_value(status).map_err(|source| CacheError::Corrupt {
            key: key.clone(),
            source,
        })?;
    cache.set(&key, &value).await
}

/// Put back what was recorded before a job started, or forget the key if nothing was.
pub async fn restore(
    cache: &dyn KeyValueCache,
    key: &StatusKey,
    previous: Option<EntityStatus>,
) -> Result<(), CacheError> {
    match previous {
        Some(previous) => put(cache, key, &previous).await,
        None => cache.delete(&key.to_string()).await,
    }
}
