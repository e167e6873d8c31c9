// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The jail manager (`appjail`), used to inspect jails, read their labels and run commands
//! inside them.

use std::{collections::BTreeMap, fmt, io, process::Stdio, str::FromStr};

use {
    async_trait::async_trait,
    log::debug,
    serde_json::{json, Map, Value},
    tokio::process::Command,
};

use crate::status::strip_ansi;

#[derive(Debug, thiserror::Error)]
pub enum JailError {
    #[error("could not run '{program}': {source}")]
    Spawn { program: String, source: io::Error },

    #[error("'{command}' exited with status {code}: {output}")]
    Failed {
        command: String,
        code: i32,
        output: String,
    },
}

/// The per-jail resources that can be read through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailItem {
    Info,
    Labels,
    Expose,
    Healthcheck,
    Limits,
    Fstab,
    Volumes,
    Nat,
}

impl JailItem {
    pub fn as_str(&self) -> &'static str {
        match self {
            JailItem::Info => "info",
            JailItem::Labels => "labels",
            JailItem::Expose => "expose",
            JailItem::Healthcheck => "healthcheck",
            JailItem::Limits => "limits",
            JailItem::Fstab => "fstab",
            JailItem::Volumes => "volumes",
            JailItem::Nat => "nat",
        }
    }
}

impl fmt::Display for JailItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JailItem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "info" => JailItem::Info,
            "labels" => JailItem::Labels,
            "expose" => JailItem::Expose,
            "healthcheck" => JailItem::Healthcheck,
            "limits" => JailItem::Limits,
            "fstab" => JailItem::Fstab,
            "volumes" => JailItem::Volumes,
            "nat" => JailItem::Nat,
            other => return Err(format!("unknown jail item '{other}'")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait JailManager: Send + Sync {
    async fn list(&self) -> Result<Vec<String>, JailError>;

    /// `None` when there is no such jail.
    async fn item(&self, jail: &str, item: JailItem) -> Result<Option<Value>, JailError>;

    async fn label_names(&self, jail: &str) -> Result<Vec<String>, JailError>;

    async fn labels(&self, jail: &str) -> Result<BTreeMap<String, String>, JailError>;

    /// Run `argv` inside `jail` with `environment` set.
    async fn exec(
        &self,
        jail: &str,
        argv: &[String],
        environment: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, JailError>;

    /// Force the VM `vm` running inside `jail` off.
    async fn vm_poweroff(&self, jail: &str, vm: &str) -> Result<(), JailError>;
}

/// Columns read for `info`.
const INFO_KEYS: &[&str] = &[
    "name", "status", "type", "version", "ports", "network_ip4", "priority", "boot",
];

#[derive(Debug, Clone)]
pub struct AppJail {
    program: String,
}

impl AppJail {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput, JailError> {
        debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| JailError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            output: strip_ansi(&text),
        })
    }

    /// Run a listing command and split its tab-separated rows.
    async fn rows(&self, args: &[&str]) -> Result<Vec<Vec<String>>, JailError> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(JailError::Failed {
                command: format!("{} {}", self.program, args.join(" ")),
                code: output.code,
                output: output.output,
            });
        }
        Ok(output
            .output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split('\t').map(|s| s.to_string()).collect())
            .collect())
    }

    async fn exists(&self, jail: &str) -> Result<bool, JailError> {
        Ok(self.list().await?.iter().any(|name| name == jail))
    }
}

#[async_trait]
impl JailManager for AppJail {
    async fn list(&self) -> Result<Vec<String>, JailError> {
        Ok(self
            .rows(&["jail", "list", "-eHIpt", "name"])
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    async fn item(&self, jail: &str, item: JailItem) -> Result<Option<Value>, JailError> {
        if !self.exists(jail).await? {
            return Ok(None);
        }
        let value = match item {
            JailItem::Info => {
                let mut args = vec!["jail", "get", "-eHIp", "--", jail];
                args.extend(INFO_KEYS);
                let row = self.rows(&args).await?.into_iter().next().unwrap_or_default();
                let info: Map<String, Value> = INFO_KEYS
                    .iter()
                    .zip(row)
                    .map(|(key, value)| (key.to_string(), Value::String(value)))
                    .collect();
                Value::Object(info)
            }
            JailItem::Labels => json!(self.labels(jail).await?),
            other => {
                let rows = self
                    .rows(&[other.as_str(), "list", "-eHIpt", "-j", jail])
                    .await?;
                json!(rows)
            }
        };
        Ok(Some(value))
    }

    async fn label_names(&self, jail: &str) -> Result<Vec<String>, JailError> {
        Ok(self
            .rows(&["label", "list", "-eHIpt", "-j", jail, "name"])
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    async fn labels(&self, jail: &str) -> Result<BTreeMap<String, String>, JailError> {
        Ok(self
            .rows(&["label", "list", "-eHIpt", "-j", jail, "name", "value"])
            .await?
            .into_iter()
            .filter_map(|mut row| {
                if row.is_empty() {
                    return None;
                }
                let name = row.remove(0);
                Some((name, row.join("\t")))
            })
            .collect())
    }

    async fn exec(
        &self,
        jail: &str,
        argv: &[String],
        environment: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, JailError> {
        let assignments: Vec<String> = environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let mut args = vec!["cmd", "jexec", jail, "--", "env"];
        args.extend(assignments.iter().map(|s| s.as_str()));
        args.extend(argv.iter().map(|s| s.as_str()));
        self.run(&args).await
    }

    async fn vm_poweroff(&self, jail: &str, vm: &str) -> Result<(), JailError> {
        let args = ["cmd", "jexec", jail, "--", "vm", "poweroff", "-f", vm];
        let output = self.run(&args).await?;
        if !output.success() {
            return Err(JailError::Failed {
                command: format!("{} {}", self.program, args.join(" ")),
                code: output.code,
                output: output.output,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items() {
        for item in ["info", "labels", "expose", "healthcheck", "limits", "fstab", "volumes", "nat"]
        {
            assert_eq!(item.parse::<JailItem>().unwrap().as_str(), item);
        }
        assert!("rctl".parse::<JailItem>().is_err());
    }
}
