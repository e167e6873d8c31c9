// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! VMs are projects with a single `vm` service whose jail runs the hypervisor. The worker
//! writes the VM's files next to it, launches the jail, then drives the in-jail helper through
//! the provisioning steps. The `.done` marker records that provisioning finished; after that
//! only the start step is run.

use std::{collections::BTreeMap, path::Path};

use {
    log::{debug, info},
    serde_json::{json, Value},
    tokio_util::sync::CancellationToken,
};

use super::{classify, launch_status, project::DIRECTOR_FILE, JobError, Worker, WorkerError};
use crate::{
    director::ProjectDescription,
    jobs::{VmCreate, VmRequest},
    labels::Mode,
    status::{EntityStatus, JobState, StatusKey},
};

pub const DONE_MARKER: &str = ".done";

/// The provisioning helper, run inside the VM's jail.
const HELPER: &str = "overlord-vm";

/// Where the VM directory is mounted inside the jail.
const MOUNT: &str = "overlord";

const SERVICE: &str = "vm";

/// One in-jail step of bringing a VM up.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    name: String,
    argv: Vec<String>,
    environment: BTreeMap<String, String>,
}

impl Step {
    fn new(name: &str, args: Vec<String>, environment: &BTreeMap<String, String>) -> Self {
        let mut argv = vec![HELPER.to_string(), name.to_string()];
        argv.extend(args);
        Self {
            name: name.to_string(),
            argv,
            environment: environment.clone(),
        }
    }
}

/// The steps run after the jail is up. A provisioned VM only needs starting.
fn steps(request: &VmRequest, provisioned: bool) -> Vec<Step> {
    let none = BTreeMap::new();
    let mut steps = Vec::new();
    if !provisioned {
        let disk = &request.disk_layout;
        steps.push(Step::new(
            "disk",
            vec![disk.driver.clone(), disk.size.clone()],
            &none,
        ));
        if request.cloud_init.is_some() {
            steps.push(Step::new("seed", Vec::new(), &none));
        }
        steps.push(Step::new(
            &format!("install-{}", disk.from.strategy()),
            disk.from.arguments(),
            &none,
        ));
        if request.script.is_some() {
            steps.push(Step::new("script", Vec::new(), &request.script_environment));
        }
    }
    steps.push(Step::new(
        "start",
        pairs(&request.start_arguments),
        &request.start_environment,
    ));
    steps
}

fn pairs(map: &BTreeMap<String, String>) -> Vec<String> {
    map.iter().map(|(key, value)| format!("{key}={value}")).collect()
}

fn single_entries(map: &BTreeMap<String, String>) -> Vec<Value> {
    map.iter().map(|(key, value)| json!({ key: value })).collect()
}

/// The launcher file for a VM.
fn director_file(name: &str, dir: &Path, request: &VmRequest) -> Value {
    let mut options = vec![json!({ "fstab": format!("{} {MOUNT}", dir.display()) })];
    options.extend(request.options.iter().map(|option| json!(option)));

    let mut arguments = vec![json!({ "overlord_vm_name": name })];
    arguments.extend(single_entries(&request.build_arguments));

    json!({
        "services": {
            SERVICE: {
                "name": name,
                "makejail": dir.join("Makejail").display().to_string(),
                "options": options,
                "arguments": arguments,
                "environment": single_entries(&request.build_environment),
            }
        }
    })
}

fn template(template: &BTreeMap<String, String>) -> String {
    template
        .iter()
        .map(|(key, value)| format!("{key}=\"{}\"\n", value.replace('"', "\\\"")))
        .collect()
}

async fn write(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), JobError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(JobError::io(format!("could not write '{}'", path.display())))
}

async fn create_dir(path: &Path) -> Result<(), JobError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(JobError::io(format!("could not create '{}'", path.display())))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

impl Worker {
    pub(super) async fn create_vm(&self, job_id: u64, create: VmCreate) -> Result<(), WorkerError> {
        let key = StatusKey::Vm(create.name.clone());
        let cancel = self.running.register(&create.name);
        let result = self
            .track(key, job_id, self.converge_vm(job_id, &create, &cancel))
            .await;
        self.running.remove(&create.name);
        result
    }

    async fn write_vm_files(&self, dir: &Path, create: &VmCreate) -> Result<(), JobError> {
        let request = &create.request;
        create_dir(dir).await?;
        write(&dir.join("Makejail"), &create.makejail).await?;
        write(&dir.join("template.conf"), template(&request.template)).await?;

        let metadata = dir.join("metadata");
        create_dir(&metadata).await?;
        for (key, value) in request.metadata.iter() {
            write(&metadata.join(key), value).await?;
        }

        if let Some(script) = &request.script {
            write(&dir.join("script"), script).await?;
        }

        if let Some(cloud_init) = &request.cloud_init {
            let seed = dir.join("seed");
            create_dir(&seed).await?;
            write(
                &seed.join("meta-data"),
                Value::Object(cloud_init.meta_data.clone()).to_string(),
            )
            .await?;
            write(&seed.join("user-data"), &cloud_init.user_data).await?;
            if let Some(network) = &cloud_init.network_config {
                write(&seed.join("network-config"), network.to_string()).await?;
            }
        }

        let file = director_file(&create.name, dir, request);
        write(&dir.join(DIRECTOR_FILE), file.to_string()).await
    }

    /// Run the remaining steps in the VM's jail, writing the done marker right before the
    /// VM is first started.
    async fn provision(
        &self,
        name: &str,
        description: &ProjectDescription,
        request: &VmRequest,
        provisioned: bool,
        dir: &Path,
    ) -> Result<(), JobError> {
        let jail = description
            .services
            .iter()
            .find(|service| service.name == SERVICE)
            .or_else(|| description.services.first())
            .map(|service| service.jail.clone())
            .ok_or_else(|| JobError::NotFound(format!("{name}/{SERVICE}")))?;

        for step in steps(request, provisioned) {
            if step.name == "start" && !provisioned {
                write(&dir.join(DONE_MARKER), b"").await?;
            }
            let mut environment = step.environment.clone();
            environment.insert("OVERLORD_VM_NAME".to_string(), name.to_string());
            debug!("{name}: {}", step.argv.join(" "));
            let output = self.jails.exec(&jail, &step.argv, &environment).await?;
            if !output.success() {
                return Err(JobError::Provision {
                    step: step.name,
                    code: output.code,
                    output: output.output,
                });
            }
            info!("{name}: {} done", step.name);
        }
        Ok(())
    }

    async fn converge_vm(
        &self,
        job_id: u64,
        create: &VmCreate,
        cancel: &CancellationToken,
    ) -> Result<Option<EntityStatus>, JobError> {
        let name = create.name.as_str();
        let request = &create.request;
        let dir = self.vm_dir(name);
        let provisioned = exists(&dir.join(DONE_MARKER)).await;

        let mut restarted = false;
        if let Some(description) = self.describe(name).await? {
            if provisioned && description.is_done() && !request.restart {
                return Ok(None);
            }
            if request.restart {
                info!("{name}: restarting the VM");
                self.poweroff(name).await;
                let down = self.launch_request(name, None, BTreeMap::new(), false, cancel);
                self.launcher.down(down).await?;
                restarted = true;
            }
        }

        let file = dir.join(DIRECTOR_FILE);
        if provisioned && exists(&file).await {
            debug!("{name}: reusing {}", file.display());
        } else {
            self.write_vm_files(&dir, create).await?;
        }

        let launch = self.launch_request(name, Some(file), BTreeMap::new(), false, cancel);
        let outcome = self.launcher.up(launch).await?;

        let description = self.describe(name).await?;
        let state = classify(&outcome, description.as_ref());
        let mut status = launch_status(job_id, state, &outcome);
        status.restarted = restarted;

        if let (JobState::Completed, Some(description)) = (state, description.as_ref()) {
            self.provision(name, description, request, provisioned, &dir)
                .await?;
            self.dispatch_labels(name, Mode::Create, &mut status).await;
        }
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> VmRequest {
        serde_json::from_value(json!({
            "makejail": "OPTION overwrite=force\n",
            "template": {"loader": "bhyveload", "memory": "1G"},
            "diskLayout": {
                "driver": "virtio-blk",
                "size": "10G",
                "from": {"type": "iso", "isoFile": "/iso/fbsd.iso"}
            },
            "script": "#!/bin/sh\necho hi\n",
            "start-arguments": {"console": "tmux"},
            "build-arguments": {"network": "public"},
            "options": [{"virtualnet": ":<random> default"}],
        }))
        .unwrap()
    }

    #[test]
    fn provisioning_steps() {
        let names = |steps: Vec<Step>| steps.into_iter().map(|s| s.name).collect::<Vec<_>>();
        assert_eq!(
            names(steps(&request(), false)),
            vec!["disk", "install-iso", "script", "start"]
        );
        assert_eq!(names(steps(&request(), true)), vec!["start"]);

        let start = steps(&request(), true).remove(0);
        assert_eq!(start.argv, vec!["overlord-vm", "start", "console=tmux"]);
    }

    #[test]
    fn director_file_mounts_the_vm_dir() {
        let file = director_file("vm1", Path::new("/var/db/overlord/vm/vm1"), &request());
        let service = &file["services"]["vm"];
        assert_eq!(service["name"], "vm1");
        assert_eq!(service["makejail"], "/var/db/overlord/vm/vm1/Makejail");
        assert_eq!(
            service["options"][0]["fstab"],
            "/var/db/overlord/vm/vm1 overlord"
        );
        assert_eq!(service["options"][1]["virtualnet"], ":<random> default");
        assert_eq!(
            service["arguments"],
            json!([{"overlord_vm_name": "vm1"}, {"network": "public"}])
        );
    }

    #[test]
    fn template_quoting() {
        let template = template(&BTreeMap::from([
            ("cpu".to_string(), "2".to_string()),
            ("comment".to_string(), "say \"hi\"".to_string()),
        ]));
        assert_eq!(template, "comment=\"say \\\"hi\\\"\"\ncpu=\"2\"\n");
    }
}
