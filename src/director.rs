// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! director.rs
//!
//! Driving the multi-service launcher (`appjail-director`). The launcher is an external
//! program; what it reports through its exit code and its `describe` JSON is taken as the
//! truth about a project.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use {
    async_trait::async_trait,
    log::{debug, warn},
    nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    },
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncRead, AsyncReadExt},
        process::{Child, Command},
    },
    tokio_util::sync::CancellationToken,
};

/// How long a child gets to exit after SIGTERM before it is killed.
const GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("could not run '{program}': {source}")]
    Spawn {
        program: String,
        source: io::Error,
    },

    #[error("launcher I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not decode the description of '{project}': {source}")]
    Decode {
        project: String,
        source: serde_json::Error,
    },

    #[error("'{command}' exited with status {code}: {output}")]
    Failed {
        command: String,
        code: i32,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    /// Exit status of the service's last operation; 0 when it is up.
    pub status: i32,
    pub jail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescription {
    #[serde(default)]
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub last_log: Option<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub services: Vec<ServiceDescription>,
}

impl ProjectDescription {
    /// The launcher finished converging the project.
    pub fn is_done(&self) -> bool {
        self.state == "DONE"
    }

    pub fn failed_services(&self) -> impl Iterator<Item = &ServiceDescription> {
        self.services.iter().filter(|service| service.status != 0)
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub project: String,
    pub file: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    /// For `down`: remove the jails instead of only stopping them.
    pub destroy: bool,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOutcome {
    pub errlevel: i32,
    pub output: String,
    pub canceled: bool,
    pub timed_out: bool,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn up(&self, request: LaunchRequest) -> Result<LaunchOutcome, LauncherError>;

    async fn down(&self, request: LaunchRequest) -> Result<LaunchOutcome, LauncherError>;

    /// Ask the launcher to abandon whatever it is doing on `project`.
    async fn cancel(&self, project: &str) -> Result<(), LauncherError>;

    /// `None` when the launcher does not know the project.
    async fn describe(&self, project: &str) -> Result<Option<ProjectDescription>, LauncherError>;

    async fn list(&self) -> Result<Vec<String>, LauncherError>;
}

/// The `appjail-director` command line.
#[derive(Debug, Clone)]
pub struct Director {
    program: String,
    workdir: PathBuf,
}

impl Director {
    pub fn new(program: &str, workdir: &Path) -> Self {
        Self {
            program: program.to_string(),
            workdir: workdir.to_path_buf(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args).env("NO_COLOR", "1");
        command
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.workdir.join(project)
    }

    async fn supervise(
        &self,
        mut command: Command,
        request: &LaunchRequest,
    ) -> Result<LaunchOutcome, LauncherError> {
        let dir = self.project_dir(&request.project);
        tokio::fs::create_dir_all(&dir).await?;
        command.current_dir(dir).envs(&request.environment);
        run_supervised(command, &request.cancel, request.timeout)
            .await
            .map_err(|source| LauncherError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

#[async_trait]
impl Launcher for Director {
    async fn up(&self, request: LaunchRequest) -> Result<LaunchOutcome, LauncherError> {
        let file = request.file.as_ref().map(|f| f.to_string_lossy().into_owned());
        let mut args = vec!["up", "-p", request.project.as_str()];
        if let Some(file) = &file {
            args.extend(["-f", file.as_str()]);
        }
        debug!("{} {}", self.program, args.join(" "));
        self.supervise(self.command(&args), &request).await
    }

    async fn down(&self, request: LaunchRequest) -> Result<LaunchOutcome, LauncherError> {
        let mut args = vec!["down", "-p", request.project.as_str()];
        if request.destroy {
            args.push("-d");
        }
        debug!("{} {}", self.program, args.join(" "));
        self.supervise(self.command(&args), &request).await
    }

    async fn cancel(&self, project: &str) -> Result<(), LauncherError> {
        let output = self
            .command(&["cancel", "-p", project])
            .output()
            .await
            .map_err(|source| LauncherError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            return Err(LauncherError::Failed {
                command: format!("{} cancel -p {project}", self.program),
                code,
                output: combined(&output.stdout, &output.stderr),
            });
        }
        Ok(())
    }

    async fn describe(&self, project: &str) -> Result<Option<ProjectDescription>, LauncherError> {
        let output = self
            .command(&["describe", "-p", project])
            .output()
            .await
            .map_err(|source| LauncherError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            debug!(
                "describe '{project}' exited with {:?}; treating the project as absent",
                output.status.code()
            );
            return Ok(None);
        }
        let mut description: ProjectDescription = serde_json::from_slice(&output.stdout)
            .map_err(|source| LauncherError::Decode {
                project: project.to_string(),
                source,
            })?;
        if description.name.is_empty() {
            description.name = project.to_string();
        }
        Ok(Some(description))
    }

    async fn list(&self) -> Result<Vec<String>, LauncherError> {
        let mut entries = match tokio::fs::read_dir(&self.workdir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut projects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    projects.push(name.to_string());
                }
            }
        }
        projects.sort();
        Ok(projects)
    }
}

fn combined(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(stderr));
    output
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buffer).await {
            warn!("error reading child output: {e}");
        }
    }
    buffer
}

enum Interrupt {
    Canceled,
    TimedOut,
}

/// Run `command` to completion, or until `cancel` fires or `limit` elapses. The child gets its
/// own process group so that the launcher and everything it started can be signalled together.
pub async fn run_supervised(
    mut command: Command,
    cancel: &CancellationToken,
    limit: Duration,
) -> io::Result<LaunchOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (status, stdout, stderr) = tokio::join!(
        wait_supervised(&mut child, cancel, limit),
        read_all(stdout),
        read_all(stderr),
    );
    let (status, interrupt) = status?;

    Ok(LaunchOutcome {
        errlevel: status.code().unwrap_or(-1),
        output: combined(&stdout, &stderr),
        canceled: matches!(interrupt, Some(Interrupt::Canceled)),
        timed_out: matches!(interrupt, Some(Interrupt::TimedOut)),
    })
}

async fn wait_supervised(
    child: &mut Child,
    cancel: &CancellationToken,
    limit: Duration,
) -> io::Result<(ExitStatus, Option<Interrupt>)> {
    let interrupt = tokio::select! {
        status = child.wait() => return Ok((status?, None)),
        _ = cancel.cancelled() => Interrupt::Canceled,
        _ = tokio::time::sleep(limit) => Interrupt::TimedOut,
    };

    let Some(pid) = child.id() else {
        return Ok((child.wait().await?, Some(interrupt)));
    };
    let group = Pid::from_raw(pid as i32);

    warn!(
        "{} process group {pid}; sending SIGTERM",
        match interrupt {
            Interrupt::Canceled => "canceling",
            Interrupt::TimedOut => "time limit reached for",
        }
    );
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        warn!("could not signal process group {pid}: {e}");
    }

    let status = match tokio::time::timeout(GRACE, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            warn!("process group {pid} ignored SIGTERM; killing it");
            let _ = killpg(group, Signal::SIGKILL);
            child.kill().await?;
            child.wait().await?
        }
    };
    Ok((status, Some(interrupt)))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn collects_exit_code_and_output() {
        let outcome = run_supervised(
            shell("echo started; echo oops >&2; exit 3"),
            &CancellationToken::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(outcome.errlevel, 3);
        assert_eq!(outcome.output, "started\noops\n");
        assert!(!outcome.canceled && !outcome.timed_out);
    }

    #[tokio::test]
    async fn cancel_terminates_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = run_supervised(shell("sleep 30"), &cancel, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.canceled);
        assert_ne!(outcome.errlevel, 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn time_limit_terminates_the_child() {
        let outcome = run_supervised(
            shell("sleep 30"),
            &CancellationToken::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
    }

    #[test]
    fn description_shape() {
        let description: ProjectDescription = serde_json::from_str(
            r#"{"state": "DONE", "last_log": "/tmp/log", "locked": false,
                "services": [{"name": "web", "status": 0, "jail": "e969b06736"},
                             {"name": "db", "status": 1, "jail": "a13b2fa8c1"}]}"#,
        )
        .unwrap();
        assert!(description.is_done());
        assert_eq!(
            description
                .failed_services()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>(),
            vec!["db"]
        );
    }
}
