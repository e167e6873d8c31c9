// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::runtime::Runtime;

    use overlord_lib::{
        jobs::{parse_vm_request, Envelope, ProjectJob, ProjectUp, UpRequest},
        queue::WorkQueue,
        status::{self, EntityStatus, JobState, StatusKey, StatusKind},
        test_env::*,
        worker::{JobClass, WorkerError},
    };

    const DIRECTOR_FILE: &str = "services:\n  app:\n    makejail: Makejail\n";

    fn up_body(restart: bool) -> Value {
        json!({ "director_file": DIRECTOR_FILE, "restart": restart })
    }

    async fn up_status(harness: &Harness, name: &str) -> Option<EntityStatus> {
        let key = StatusKey::Project(StatusKind::Up, name.to_string());
        status::get(harness.cache.as_ref(), &key).await.unwrap()
    }

    async fn down_status(harness: &Harness, name: &str) -> Option<EntityStatus> {
        let key = StatusKey::Project(StatusKind::Down, name.to_string());
        status::get(harness.cache.as_ref(), &key).await.unwrap()
    }

    async fn vm_status(harness: &Harness, name: &str) -> Option<EntityStatus> {
        status::get(harness.cache.as_ref(), &StatusKey::Vm(name.to_string()))
            .await
            .unwrap()
    }

    fn vm_body(restart: bool) -> Value {
        json!({
            "makejail": "OPTION overwrite=force\n",
            "template": {"loader": "bhyveload", "memory": "1G"},
            "diskLayout": {
                "driver": "virtio-blk",
                "size": "10G",
                "from": {"type": "iso", "isoFile": "/iso/fbsd.iso"}
            },
            "script": "#!/bin/sh\necho hi\n",
            "metadata": {"motd": "hello"},
            "start-arguments": {"console": "tmux"},
            "restart": restart,
        })
    }

    /// The step names run in a VM's jail, in order.
    fn steps(jails: &FakeJails) -> Vec<String> {
        jails
            .execs()
            .into_iter()
            .map(|(_, argv)| argv[1].clone())
            .collect()
    }

    #[test]
    fn up_completes() {
        let env = TestEnvironment::new("worker_up_completes");
        let harness = env.harness("");
        let worker = harness.worker();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let body = json!({
                "director_file": DIRECTOR_FILE,
                "environment": {"GREETING": "hi"},
            });
            let id = harness.dispatcher().project_up("web", body).await.unwrap();
            assert_eq!(worker.process_next(JobClass::Project).await.unwrap(), Some(id));

            let status = up_status(&harness, "web").await.unwrap();
            assert_eq!(status.operation, JobState::Completed);
            assert_eq!(status.job_id, id);
            assert!(!status.restarted);
            assert!(status.error.is_none());
            assert_eq!(status.output.as_deref(), Some("web is up\n"));

            let file = env.path("projects/web/appjail-director.yml");
            assert_eq!(std::fs::read_to_string(&file).unwrap(), DIRECTOR_FILE);
            assert_eq!(harness.launcher.files(), vec![file]);
            assert_eq!(harness.launcher.environments()[0]["GREETING"], "hi");
            assert_eq!(harness.queue.ready(&harness.config.jobs.tubes.project), 0);
        });
    }

    #[test]
    fn empty_tube_times_out() {
        let env = TestEnvironment::new("worker_empty_tube");
        let harness = env.harness("");
        let worker = harness.worker();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            assert_eq!(worker.process_next(JobClass::Project).await.unwrap(), None);
            assert!(harness.launcher.calls().is_empty());
        });
    }

    #[test]
    fn up_is_idempotent() {
        let env = TestEnvironment::new("worker_up_is_idempotent");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let first = dispatcher.project_up("web", up_body(false)).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let second = dispatcher.project_up("web", up_body(false)).await.unwrap();
            assert_eq!(worker.process_next(JobClass::Project).await.unwrap(), Some(second));

            assert_eq!(harness.launcher.count("up web"), 1);
            let status = up_status(&harness, "web").await.unwrap();
            assert_eq!(status.operation, JobState::Completed);
            assert_eq!(status.job_id, first);
        });
    }

    #[test]
    fn restart_tears_down_first() {
        let env = TestEnvironment::new("worker_restart");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            dispatcher.project_up("web", up_body(false)).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let id = dispatcher.project_up("web", up_body(true)).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            assert_eq!(
                harness.launcher.calls(),
                vec!["up web", "down web --destroy", "up web"]
            );
            let status = up_status(&harness, "web").await.unwrap();
            assert_eq!(status.operation, JobState::Completed);
            assert_eq!(status.job_id, id);
            assert!(status.restarted);
            assert!(harness.jails.poweroffs().is_empty());
        });
    }

    #[test]
    fn reserved_ports_reach_the_launcher() {
        let env = TestEnvironment::new("worker_reserved_ports");
        let harness = env.harness("");
        let worker = harness.worker();
        let range = harness.config.projects.port_min..=harness.config.projects.port_max;

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let body = json!({
                "director_file": DIRECTOR_FILE,
                "reserve_port": {"interface": "lo0", "ports": ["http", "admin"]},
            });
            harness.dispatcher().project_up("web", body).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let environments = harness.launcher.environments();
            let environment = &environments[0];
            assert_eq!(environment["OVERLORD_ADDRESS"], "127.0.0.1");
            let http: u16 = environment["OVERLORD_PORT_HTTP"].parse().unwrap();
            let admin: u16 = environment["OVERLORD_PORT_ADMIN"].parse().unwrap();
            assert!(range.contains(&http) && range.contains(&admin));
            assert_ne!(http, admin);
        });
    }

    #[test]
    fn unknown_interface_fails_the_job() {
        let env = TestEnvironment::new("worker_unknown_interface");
        let harness = env.harness("");
        let worker = harness.worker();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let body = json!({
                "director_file": DIRECTOR_FILE,
                "reserve_port": {"interface": "em9", "ports": ["http"]},
            });
            harness.dispatcher().project_up("web", body).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let status = up_status(&harness, "web").await.unwrap();
            assert_eq!(status.operation, JobState::Failed);
            assert_eq!(status.error.unwrap().error, "ReservePortError");
            assert!(harness.launcher.calls().is_empty());
        });
    }

    #[test]
    fn partial_failure_is_incompleted() {
        let env = TestEnvironment::new("worker_partial_failure");
        let harness = env.harness("");
        let worker = harness.worker();
        harness.launcher.set_services("web", &["app", "db"]);
        harness.launcher.set_services("batch", &["db"]);
        harness.launcher.fail_service("db");

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dispatcher = harness.dispatcher();
            dispatcher.project_up("web", up_body(false)).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();
            dispatcher.project_up("batch", up_body(false)).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let web = up_status(&harness, "web").await.unwrap();
            assert_eq!(web.operation, JobState::Incompleted);
            assert!(web.labels.is_none());

            let batch = up_status(&harness, "batch").await.unwrap();
            assert_eq!(batch.operation, JobState::Failed);
        });
    }

    #[test]
    fn tampered_job_is_fatal() {
        let env = TestEnvironment::new("worker_tampered_job");
        let harness = env.harness("");
        let worker = harness.worker();
        let tube = harness.config.jobs.tubes.project.clone();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let job = ProjectJob::Create(ProjectUp {
                name: "web".to_string(),
                request: UpRequest {
                    director_file: DIRECTOR_FILE.to_string(),
                    environment: Default::default(),
                    restart: false,
                    reserve_port: None,
                },
            });
            let sealed = Envelope::seal(JOB_SECRET.as_bytes(), &job)
                .unwrap()
                .to_bytes()
                .unwrap();
            let mut tampered: Value = serde_json::from_slice(&sealed).unwrap();
            tampered["message"]["message"]["name"] = json!("evil");
            let id = harness
                .queue
                .put(&tube, &serde_json::to_vec(&tampered).unwrap())
                .await
                .unwrap();

            match worker.process_next(JobClass::Project).await {
                Err(WorkerError::Integrity { id: buried, .. }) => assert_eq!(buried, id),
                other => panic!("expected an integrity error, got {other:?}"),
            }
            assert_eq!(harness.queue.buried(&tube), vec![id]);
            assert!(harness.launcher.calls().is_empty());
            assert!(up_status(&harness, "evil").await.is_none());
        });
    }

    #[test]
    fn undecodable_job_is_skipped() {
        let env = TestEnvironment::new("worker_undecodable_job");
        let harness = env.harness("");
        let worker = harness.worker();
        let tube = harness.config.jobs.tubes.project.clone();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let sealed = Envelope::seal(JOB_SECRET.as_bytes(), &json!({"type": "bogus"}))
                .unwrap()
                .to_bytes()
                .unwrap();
            let id = harness.queue.put(&tube, &sealed).await.unwrap();

            assert_eq!(worker.process_next(JobClass::Project).await.unwrap(), Some(id));
            assert_eq!(harness.queue.buried(&tube), vec![id]);
        });
    }

    #[test]
    fn cancel_interrupts_a_launch() {
        let env = TestEnvironment::new("worker_cancel");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();
        harness.launcher.hold_up(true);

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let id = dispatcher.project_up("web", up_body(false)).await.unwrap();

            let (processed, ()) = tokio::join!(worker.process_next(JobClass::Project), async {
                harness.launcher.started().await;
                let running = up_status(&harness, "web").await.unwrap();
                assert_eq!(running.operation, JobState::Running);
                assert_eq!(running.job_id, id);

                dispatcher.project_cancel("web").await.unwrap();
                assert!(worker.process_control().await.unwrap().is_some());
            });
            assert_eq!(processed.unwrap(), Some(id));

            let status = up_status(&harness, "web").await.unwrap();
            assert_eq!(status.operation, JobState::Failed);
            assert_eq!(status.error.unwrap().error, "Canceled");
            assert_eq!(harness.launcher.count("cancel web"), 1);
        });
    }

    #[test]
    fn down_destroys_the_project() {
        let env = TestEnvironment::new("worker_down");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            dispatcher.project_up("web", up_body(false)).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let id = dispatcher.project_down("web", Value::Null).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let status = down_status(&harness, "web").await.unwrap();
            assert_eq!(status.operation, JobState::Completed);
            assert_eq!(status.job_id, id);
            assert_eq!(harness.launcher.count("down web --destroy"), 1);

            // The up status is left as it was.
            let up = up_status(&harness, "web").await.unwrap();
            assert_eq!(up.operation, JobState::Completed);
        });
    }

    #[test]
    fn down_of_unknown_project_fails() {
        let env = TestEnvironment::new("worker_down_unknown");
        let harness = env.harness("");
        let worker = harness.worker();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            harness
                .dispatcher()
                .project_down("ghost", json!({"force": true}))
                .await
                .unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            let status = down_status(&harness, "ghost").await.unwrap();
            assert_eq!(status.operation, JobState::Failed);
            assert_eq!(status.error.unwrap().error, "NotFound");
            assert!(harness.launcher.calls().is_empty());
        });
    }

    #[test]
    fn vm_is_provisioned_once() {
        let env = TestEnvironment::new("worker_vm");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let request = parse_vm_request(vm_body(false)).unwrap();
            let makejail = request.makejail.clone().unwrap();
            let id = dispatcher
                .create_vm("vm1", request.clone(), makejail.clone())
                .await
                .unwrap();
            assert_eq!(worker.process_next(JobClass::Vm).await.unwrap(), Some(id));

            let status = vm_status(&harness, "vm1").await.unwrap();
            assert_eq!(status.operation, JobState::Completed);
            assert_eq!(status.job_id, id);

            let dir = env.path("vm/vm1");
            assert!(dir.join(".done").exists());
            assert_eq!(
                std::fs::read_to_string(dir.join("Makejail")).unwrap(),
                makejail
            );
            assert_eq!(
                std::fs::read_to_string(dir.join("metadata/motd")).unwrap(),
                "hello"
            );
            assert!(dir.join("template.conf").exists());
            assert!(dir.join("script").exists());
            assert_eq!(
                steps(&harness.jails),
                vec!["disk", "install-iso", "script", "start"]
            );
            let jail = FakeLauncher::jail("vm1", "app");
            assert!(harness.jails.execs().iter().all(|(j, _)| *j == jail));

            // Already provisioned and running: nothing to do.
            dispatcher
                .create_vm("vm1", request, makejail)
                .await
                .unwrap();
            worker.process_next(JobClass::Vm).await.unwrap();
            assert_eq!(harness.launcher.count("up vm1"), 1);
            assert_eq!(vm_status(&harness, "vm1").await.unwrap().job_id, id);
        });
    }

    #[test]
    fn vm_restart_only_starts() {
        let env = TestEnvironment::new("worker_vm_restart");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let request = parse_vm_request(vm_body(false)).unwrap();
            let makejail = request.makejail.clone().unwrap();
            dispatcher
                .create_vm("vm1", request, makejail.clone())
                .await
                .unwrap();
            worker.process_next(JobClass::Vm).await.unwrap();

            let restart = parse_vm_request(vm_body(true)).unwrap();
            dispatcher.create_vm("vm1", restart, makejail).await.unwrap();
            worker.process_next(JobClass::Vm).await.unwrap();

            let jail = FakeLauncher::jail("vm1", "app");
            assert_eq!(
                harness.jails.poweroffs(),
                vec![(jail, "vm1".to_string())]
            );
            assert_eq!(harness.launcher.calls(), vec!["up vm1", "down vm1", "up vm1"]);
            assert_eq!(
                steps(&harness.jails),
                vec!["disk", "install-iso", "script", "start", "start"]
            );
            let status = vm_status(&harness, "vm1").await.unwrap();
            assert_eq!(status.operation, JobState::Completed);
            assert!(status.restarted);
        });
    }

    #[test]
    fn failed_provisioning_step() {
        let env = TestEnvironment::new("worker_vm_failed_step");
        let harness = env.harness("");
        let worker = harness.worker();
        harness.jails.set_exec_code(3);
        harness
            .jails
            .set_exec_output("\x1b[31mdisk: no space left\x1b[0m\n");

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let request = parse_vm_request(vm_body(false)).unwrap();
            let makejail = request.makejail.clone().unwrap();
            harness
                .dispatcher()
                .create_vm("vm1", request, makejail)
                .await
                .unwrap();
            worker.process_next(JobClass::Vm).await.unwrap();

            let status = vm_status(&harness, "vm1").await.unwrap();
            assert_eq!(status.operation, JobState::Failed);
            let error = status.error.unwrap();
            assert_eq!(error.error, "ProvisionError");
            assert!(error.message.contains("disk: no space left"));
            assert!(!error.message.contains('\x1b'));
            assert_eq!(steps(&harness.jails), vec!["disk"]);
            assert!(!env.path("vm/vm1/.done").exists());
        });
    }

    #[test]
    fn vm_down_removes_its_directory() {
        let env = TestEnvironment::new("worker_vm_down");
        let harness = env.harness("");
        let worker = harness.worker();
        let dispatcher = harness.dispatcher();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let request = parse_vm_request(vm_body(false)).unwrap();
            let makejail = request.makejail.clone().unwrap();
            dispatcher.create_vm("vm1", request, makejail).await.unwrap();
            worker.process_next(JobClass::Vm).await.unwrap();

            dispatcher.project_down("vm1", Value::Null).await.unwrap();
            worker.process_next(JobClass::Project).await.unwrap();

            assert_eq!(down_status(&harness, "vm1").await.unwrap().operation, JobState::Completed);
            assert_eq!(harness.jails.poweroffs().len(), 1);
            assert!(!env.path("vm/vm1").exists());
        });
    }
}
