// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

use {
    log::{debug, info, warn},
    tokio_util::sync::CancellationToken,
};

use super::{classify, launch_status, JobError, Worker, WorkerError};
use crate::{
    director::LaunchOutcome,
    jobs::{ProjectDown, ProjectUp},
    labels::Mode,
    net,
    status::{EntityStatus, JobState, StatusKey, StatusKind},
};

/// Name of the launcher file written into a project's directory.
pub const DIRECTOR_FILE: &str = "appjail-director.yml";

impl Worker {
    pub(super) async fn project_up(&self, job_id: u64, up: ProjectUp) -> Result<(), WorkerError> {
        let key = StatusKey::Project(StatusKind::Up, up.name.clone());
        let cancel = self.running.register(&up.name);
        let result = self.track(key, job_id, self.converge_up(job_id, &up, &cancel)).await;
        self.running.remove(&up.name);
        result
    }

    pub(super) async fn project_down(
        &self,
        job_id: u64,
        down: ProjectDown,
    ) -> Result<(), WorkerError> {
        let key = StatusKey::Project(StatusKind::Down, down.name.clone());
        let cancel = self.running.register(&down.name);
        let result = self
            .track(key, job_id, self.converge_down(job_id, &down, &cancel))
            .await;
        self.running.remove(&down.name);
        result
    }

    pub(super) fn vm_dir(&self, name: &str) -> PathBuf {
        self.config.vm.directory.join(name)
    }

    /// Force off the VM a project runs, if it is one, then remove the project's jails.
    pub(super) async fn teardown(
        &self,
        name: &str,
        destroy: bool,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutcome, JobError> {
        if tokio::fs::try_exists(self.vm_dir(name)).await.unwrap_or(false) {
            self.poweroff(name).await;
        }
        let request = self.launch_request(name, None, Default::default(), destroy, cancel);
        Ok(self.launcher.down(request).await?)
    }

    pub(super) async fn poweroff(&self, name: &str) {
        let description = match self.describe(name).await {
            Ok(Some(description)) => description,
            Ok(None) => return,
            Err(e) => {
                warn!("could not describe '{name}' to power its VM off: {e}");
                return;
            }
        };
        for service in description.services.iter() {
            match self.jails.vm_poweroff(&service.jail, name).await {
                Ok(()) => info!("{name}: powered off the VM in '{}'", service.jail),
                Err(e) => warn!("{name}: could not power off the VM in '{}': {e}", service.jail),
            }
        }
    }

    async fn converge_up(
        &self,
        job_id: u64,
        up: &ProjectUp,
        cancel: &CancellationToken,
    ) -> Result<Option<EntityStatus>, JobError> {
        let name = up.name.as_str();
        let request = &up.request;

        let mut restarted = false;
        if let Some(description) = self.describe(name).await? {
            if description.is_done() && !request.restart {
                return Ok(None);
            }
            if request.restart {
                info!("{name}: restarting");
                let outcome = self.teardown(name, true, cancel).await?;
                if outcome.errlevel != 0 {
                    warn!(
                        "{name}: teardown before restart exited with {}",
                        outcome.errlevel
                    );
                }
                restarted = true;
            }
        }

        let mut environment = request.environment.clone();
        if let Some(reserve) = &request.reserve_port {
            environment.extend(
                net::reserve_ports(self.resolver.as_ref(), reserve, &self.config.projects).await?,
            );
        }

        let dir = self.config.projects.directory.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(JobError::io(format!("could not create '{}'", dir.display())))?;
        let file = dir.join(DIRECTOR_FILE);
        tokio::fs::write(&file, &request.director_file)
            .await
            .map_err(JobError::io(format!("could not write '{}'", file.display())))?;

        let launch = self.launch_request(name, Some(file), environment, false, cancel);
        let outcome = self.launcher.up(launch).await?;
        debug!("{name}: launcher exited with {}", outcome.errlevel);

        let description = self.describe(name).await?;
        let state = classify(&outcome, description.as_ref());
        let mut status = launch_status(job_id, state, &outcome);
        status.restarted = restarted;

        if state == JobState::Completed {
            self.dispatch_labels(name, Mode::Create, &mut status).await;
        }
        Ok(Some(status))
    }

    async fn converge_down(
        &self,
        job_id: u64,
        down: &ProjectDown,
        cancel: &CancellationToken,
    ) -> Result<Option<EntityStatus>, JobError> {
        let name = down.name.as_str();
        let request = &down.request;

        if self.describe(name).await?.is_none() {
            return Err(JobError::NotFound(name.to_string()));
        }

        let labels = if request.force {
            None
        } else {
            Some(self.labels.dispatch(name, Mode::Destroy).await)
        };

        let vm_dir = self.vm_dir(name);
        let is_vm = tokio::fs::try_exists(&vm_dir).await.unwrap_or(false);
        if is_vm {
            self.poweroff(name).await;
        }

        let launch = self.launch_request(name, None, request.environment.clone(), true, cancel);
        let outcome = self.launcher.down(launch).await?;

        let state = match (&labels, outcome.errlevel) {
            (_, code) if code != 0 => JobState::Failed,
            (Some(labels), _) if labels.has_errors() => JobState::Incompleted,
            _ => JobState::Completed,
        };
        let mut status = launch_status(job_id, state, &outcome);
        status.labels = labels;

        if state != JobState::Failed && is_vm {
            if let Err(e) = tokio::fs::remove_dir_all(&vm_dir).await {
                warn!("could not remove '{}': {e}", vm_dir.display());
            }
        }
        Ok(Some(status))
    }
}
