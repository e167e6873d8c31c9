// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The reconciliation worker: takes jobs off the queue one at a time, drives the launcher and
//! the jail manager, and records the outcome in the status cache.
//!
//! A job that fails is recorded as `FAILED` and the worker moves on. An error that leaves the
//! worker unable to trust its input or its queue (a job whose digest does not match, a queue
//! or cache that cannot be reached) is returned from [`Worker::run`] and ends the process.

mod project;
mod vm;

use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    log::{error, info, warn},
    serde::de::DeserializeOwned,
    tokio_util::sync::CancellationToken,
};

use crate::{
    cache::{CacheError, FsCache, KeyValueCache},
    commands::{Handle, HandledResult},
    config::{Config, ConfigError},
    director::{
        Director, LaunchOutcome, LaunchRequest, Launcher, LauncherError, ProjectDescription,
    },
    jail::{AppJail, JailError, JailManager},
    jobs::{Envelope, EnvelopeError, ProjectJob, VmJob},
    labels::{Mode, SpecialLabelDispatcher},
    net::{AddressResolver, ReserveError, SystemResolver},
    queue::{QueueError, ReservedJob, SpoolQueue, WorkQueue},
    remote::client::PeerError,
    status::{self, EntityStatus, ErrorInfo, JobState, StatusKey},
};

/// How long one reservation waits before the loop comes around again.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that stop the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("job {id} on '{tube}' was rejected: {source}")]
    Integrity {
        tube: String,
        id: u64,
        source: EnvelopeError,
    },

    #[error("could not record status: {0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("could not set up integrations: {0}")]
    Integration(#[from] PeerError),
}

/// Errors that fail a single job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Launcher(#[from] LauncherError),

    #[error("{0}")]
    Jail(#[from] JailError),

    #[error("{0}")]
    Reserve(#[from] ReserveError),

    #[error("{0}")]
    Cache(#[from] CacheError),

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error("project '{0}' does not exist")]
    NotFound(String),

    #[error("provisioning step '{step}' exited with status {code}: {output}")]
    Provision {
        step: String,
        code: i32,
        output: String,
    },
}

impl JobError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| JobError::Io { context, source }
    }

    /// The name recorded as `error.error` in a failed status.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Launcher(_) => "LauncherError",
            JobError::Jail(_) => "JailError",
            JobError::Reserve(_) => "ReservePortError",
            JobError::Cache(_) => "CacheError",
            JobError::Io { .. } => "IOError",
            JobError::NotFound(_) => "NotFound",
            JobError::Provision { .. } => "ProvisionError",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum JobClass {
    Project,
    Vm,
}

/// Exit status of the worker when an error escapes its job loop.
pub const EX_SOFTWARE: i32 = 70;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Run overlord jobs", long_about = None)]
pub struct Cli {
    #[arg(long, default_value_t = crate::default_config_path())]
    pub config: String,

    /// Which queue to serve. One process per class.
    #[arg(long, value_enum, default_value_t = JobClass::Project)]
    pub class: JobClass,
}

/// Main entrypoint for the worker. Runs until a fatal error or an interrupt.
pub fn main(args: &Cli) -> HandledResult<()> {
    let config = Config::load(&args.config)
        .handle_err(|e| eprintln!("Could not load '{}': {e}", args.config))?;
    let config = Arc::new(config);

    let worker = Worker::new(
        Arc::clone(&config),
        Arc::new(FsCache::new(&config.jobs.cache_dir, &config.serverid)),
        Arc::new(SpoolQueue::new(&config.jobs.queue_dir)),
        Arc::new(Director::new(
            &config.projects.launcher,
            &config.projects.directory,
        )),
        Arc::new(AppJail::new(&config.projects.appjail)),
        Arc::new(SystemResolver),
    )
    .handle_err(|e| eprintln!("Could not set up the worker: {e}"))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch worker runtime: {e}"))?;

    rt.block_on(async {
        tokio::select! {
            result = worker.run(args.class) => {
                result.handle_err(|e| error!("worker stopped: {e}"))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; leaving reserved jobs to be recovered");
                Ok(())
            }
        }
    })
}

/// Cancellation handles of the launches currently in flight, by project name.
#[derive(Debug, Default)]
pub struct RunningJobs {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl RunningJobs {
    pub fn register(&self, name: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(name.to_string(), token.clone());
        token
    }

    pub fn remove(&self, name: &str) {
        self.tokens.lock().unwrap().remove(name);
    }

    /// Returns whether a launch for `name` was in flight.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tokens.lock().unwrap().get(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct Worker {
    config: Arc<Config>,
    secret: Vec<u8>,
    cache: Arc<dyn KeyValueCache>,
    queue: Arc<dyn WorkQueue>,
    launcher: Arc<dyn Launcher>,
    jails: Arc<dyn JailManager>,
    resolver: Arc<dyn AddressResolver>,
    labels: SpecialLabelDispatcher,
    running: RunningJobs,
}

impl Worker {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<dyn KeyValueCache>,
        queue: Arc<dyn WorkQueue>,
        launcher: Arc<dyn Launcher>,
        jails: Arc<dyn JailManager>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self, WorkerError> {
        let secret = config.job_secret()?.as_bytes().to_vec();
        let labels = SpecialLabelDispatcher::from_config(
            &config,
            launcher.clone(),
            jails.clone(),
            resolver.clone(),
        )?;
        Ok(Self {
            config,
            secret,
            cache,
            queue,
            launcher,
            jails,
            resolver,
            labels,
            running: RunningJobs::default(),
        })
    }

    fn tube(&self, class: JobClass) -> &str {
        match class {
            JobClass::Project => &self.config.jobs.tubes.project,
            JobClass::Vm => &self.config.jobs.tubes.vm,
        }
    }

    /// Serve `class` jobs until a fatal error. The project worker also serves cancellations.
    pub async fn run(&self, class: JobClass) -> Result<(), WorkerError> {
        let mut tubes = vec![self.tube(class).to_string()];
        if class == JobClass::Project {
            tubes.push(self.config.jobs.tubes.control.clone());
        }
        for tube in tubes.iter() {
            let recovered = self.queue.recover(tube).await?;
            if recovered > 0 {
                warn!("released {recovered} job(s) left reserved on '{tube}'");
            }
        }

        info!("serving {} on {}", self.config.serverid, tubes.join(", "));
        match class {
            JobClass::Project => {
                futures::try_join!(self.serve(class), self.serve_control())?;
                Ok(())
            }
            JobClass::Vm => self.serve(class).await,
        }
    }

    async fn serve(&self, class: JobClass) -> Result<(), WorkerError> {
        loop {
            self.process_next(class).await?;
        }
    }

    async fn serve_control(&self) -> Result<(), WorkerError> {
        loop {
            self.process_control().await?;
        }
    }

    /// Reserve and handle one job of `class`, if one shows up in time. Returns its id.
    pub async fn process_next(&self, class: JobClass) -> Result<Option<u64>, WorkerError> {
        let tube = self.tube(class).to_string();
        let Some(job) = self.queue.reserve(&tube, RESERVE_TIMEOUT).await? else {
            return Ok(None);
        };
        info!("reserved job {} on '{tube}'", job.id);

        match class {
            JobClass::Project => match self.open::<ProjectJob>(&tube, &job).await? {
                Some(ProjectJob::Create(up)) => self.project_up(job.id, up).await?,
                Some(ProjectJob::Destroy(down)) => self.project_down(job.id, down).await?,
                Some(ProjectJob::Cancel(cancel)) => self.cancel(&cancel.name).await,
                None => return Ok(Some(job.id)),
            },
            JobClass::Vm => match self.open::<VmJob>(&tube, &job).await? {
                Some(VmJob::Create(create)) => self.create_vm(job.id, create).await?,
                None => return Ok(Some(job.id)),
            },
        }

        self.queue.delete(&tube, job.id).await?;
        Ok(Some(job.id))
    }

    /// Reserve and handle one cancellation, if one shows up in time.
    pub async fn process_control(&self) -> Result<Option<u64>, WorkerError> {
        let tube = self.config.jobs.tubes.control.clone();
        let Some(job) = self.queue.reserve(&tube, RESERVE_TIMEOUT).await? else {
            return Ok(None);
        };
        match self.open::<ProjectJob>(&tube, &job).await? {
            Some(ProjectJob::Cancel(cancel)) => self.cancel(&cancel.name).await,
            Some(other) => warn!("ignoring job {} on the control tube: {other:?}", job.id),
            None => return Ok(Some(job.id)),
        }
        self.queue.delete(&tube, job.id).await?;
        Ok(Some(job.id))
    }

    /// Verify and decode a reserved job. A job that fails verification is buried and is fatal.
    /// One that verifies but cannot be decoded is buried and skipped.
    async fn open<T: DeserializeOwned>(
        &self,
        tube: &str,
        job: &ReservedJob,
    ) -> Result<Option<T>, WorkerError> {
        match Envelope::from_bytes(&job.payload).and_then(|envelope| envelope.open(&self.secret)) {
            Ok(message) => Ok(Some(message)),
            Err(EnvelopeError::Decode(e)) => {
                error!("burying job {} on '{tube}': {e}", job.id);
                self.queue.bury(tube, job.id).await?;
                Ok(None)
            }
            Err(source) => {
                error!("burying job {} on '{tube}': {source}", job.id);
                self.queue.bury(tube, job.id).await?;
                Err(WorkerError::Integrity {
                    tube: tube.to_string(),
                    id: job.id,
                    source,
                })
            }
        }
    }

    async fn cancel(&self, name: &str) {
        if self.running.cancel(name) {
            info!("canceled the running launch of '{name}'");
        }
        if let Err(e) = self.launcher.cancel(name).await {
            warn!("launcher could not cancel '{name}': {e}");
        }
    }

    fn launch_request(
        &self,
        project: &str,
        file: Option<PathBuf>,
        environment: BTreeMap<String, String>,
        destroy: bool,
        cancel: &CancellationToken,
    ) -> LaunchRequest {
        LaunchRequest {
            project: project.to_string(),
            file,
            environment,
            destroy,
            timeout: self.config.jobs.timeout(),
            cancel: cancel.clone(),
        }
    }

    /// Mark `key` as running, then record the outcome of `job`. `Ok(None)` from the job means
    /// there was nothing to do, and the status recorded before the job is put back.
    async fn track<F>(&self, key: StatusKey, job_id: u64, job: F) -> Result<(), WorkerError>
    where
        F: std::future::Future<Output = Result<Option<EntityStatus>, JobError>>,
    {
        let previous = match status::get(self.cache.as_ref(), &key).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("ignoring unreadable status of {key}: {e}");
                None
            }
        };
        status::put(self.cache.as_ref(), &key, &EntityStatus::running(job_id)).await?;

        let status = match job.await {
            Ok(Some(status)) => status,
            Ok(None) => {
                info!("{key}: nothing to do");
                status::restore(self.cache.as_ref(), &key, previous).await?;
                return Ok(());
            }
            Err(e) => {
                error!("{key}: job {job_id} failed: {e}");
                EntityStatus::failed(job_id, e.kind(), e.to_string())
            }
        };
        info!("{key}: job {job_id} finished as {}", status.operation);
        status::put(self.cache.as_ref(), &key, &status).await?;
        Ok(())
    }

    /// Run the label dispatcher after a converged launch and fold its result into `status`.
    async fn dispatch_labels(&self, project: &str, mode: Mode, status: &mut EntityStatus) {
        let result = self.labels.dispatch(project, mode).await;
        if result.has_errors() && status.operation == JobState::Completed {
            status.operation = JobState::Incompleted;
        }
        status.labels = Some(result);
    }

    async fn describe(&self, project: &str) -> Result<Option<ProjectDescription>, JobError> {
        Ok(self.launcher.describe(project).await?)
    }
}

/// Decide the outcome of a launch from the launcher's exit code and what it reports about each
/// service: every service up is `COMPLETED`, some is `INCOMPLETED`, none is `FAILED`.
pub fn classify(outcome: &LaunchOutcome, description: Option<&ProjectDescription>) -> JobState {
    let (total, failed) = match description {
        Some(description) => (
            description.services.len(),
            description.failed_services().count(),
        ),
        None => return JobState::Failed,
    };
    if outcome.errlevel == 0 && failed == 0 {
        JobState::Completed
    } else if failed < total {
        JobState::Incompleted
    } else {
        JobState::Failed
    }
}

/// The status recorded for a finished launch.
fn launch_status(job_id: u64, state: JobState, outcome: &LaunchOutcome) -> EntityStatus {
    let mut status = EntityStatus::finished(job_id, state, &outcome.output);
    if outcome.canceled || outcome.timed_out {
        status.error = Some(ErrorInfo {
            error: if outcome.canceled {
                "Canceled".to_string()
            } else {
                "TimeoutError".to_string()
            },
            message: format!("the launcher was interrupted (exit status {})", outcome.errlevel),
        });
    }
    status
}
