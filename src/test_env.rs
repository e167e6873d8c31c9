// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Shared harness for the integration tests: a private scratch directory per test, in-memory
//! queue and cache, and scripted stand-ins for the launcher, the jail manager and the
//! interface lookup.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    cidr::IpCidr,
    serde_json::{json, Value},
    tokio::sync::Notify,
};

use crate::{
    cache::MemoryCache,
    config::Config,
    director::{
        LaunchOutcome, LaunchRequest, Launcher, LauncherError, ProjectDescription,
        ServiceDescription,
    },
    jail::{CommandOutput, JailError, JailItem, JailManager},
    jobs::JobDispatcher,
    net::AddressResolver,
    queue::MemoryQueue,
    server::{http, AppState, Backends, TokenAuthority},
    worker::Worker,
};

pub const TOKEN_SECRET: &str = "test-token-secret";
pub const JOB_SECRET: &str = "test-job-secret";

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
fn test_path(path: &str) -> PathBuf {
    PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap())
        .join("tests")
        .join(path)
}

/// A token every test server accepts.
pub fn token() -> String {
    TokenAuthority::new(TOKEN_SECRET)
        .issue(None, json!({"test": true}))
        .unwrap()
}

/// A TestEnvironment holds a test's private working directory, where the queue spool, the
/// projects, the VMs and the metadata of the test live.
pub struct TestEnvironment {
    test_id: String,
    dir: PathBuf,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`, starting from an empty directory.
    pub fn new(test_id: &str) -> Self {
        let dir = test_path(&format!("test_output/{test_id}"));
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            test_id: test_id.to_string(),
            dir,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    /// A configuration rooted in the private directory. `extra` is appended as is, so it
    /// should only hold tables.
    pub fn config(&self, extra: &str) -> Config {
        let dir = self.dir.display();
        Config::from_toml(&format!(
            r#"
            serverid = "{id}"
            labels = ["test", "{id}"]

            [security]
            secret_key = "{TOKEN_SECRET}"

            [jobs]
            secret = "{JOB_SECRET}"
            queue_dir = "{dir}/queue"
            cache_dir = "{dir}/cache"

            [metadata]
            directory = "{dir}/metadata"
            size = 1024

            [projects]
            directory = "{dir}/projects"

            [vm]
            directory = "{dir}/vm"

            {extra}
            "#,
            id = self.test_id,
        ))
        .unwrap()
    }

    pub fn harness(&self, extra: &str) -> Harness {
        Harness::new(self.config(extra))
    }
}

/// Everything one entrypoint and its worker run against.
pub struct Harness {
    pub config: Arc<Config>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
    pub launcher: Arc<FakeLauncher>,
    pub jails: Arc<FakeJails>,
    pub resolver: Arc<FakeResolver>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let cache = Arc::new(MemoryCache::new(&config.serverid));
        Self {
            config: Arc::new(config),
            cache,
            queue: Arc::new(MemoryQueue::new()),
            launcher: Arc::new(FakeLauncher::default()),
            jails: Arc::new(FakeJails::default()),
            resolver: Arc::new(FakeResolver::new(&[("lo0", "127.0.0.1")])),
        }
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            Arc::clone(&self.config),
            self.cache.clone(),
            self.queue.clone(),
            self.launcher.clone(),
            self.jails.clone(),
            self.resolver.clone(),
        )
        .unwrap()
    }

    pub fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher::new(
            self.queue.clone(),
            JOB_SECRET,
            self.config.jobs.tubes.clone(),
        )
    }

    pub fn app_state(&self) -> AppState {
        let backends = Backends {
            cache: self.cache.clone(),
            queue: self.queue.clone(),
            launcher: self.launcher.clone(),
            jails: self.jails.clone(),
        };
        AppState::new(Arc::clone(&self.config), backends).unwrap()
    }

    /// Serve the API on an ephemeral port of the loopback interface.
    pub async fn spawn_server(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = http::router(self.app_state());
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }
}

/// A loopback address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Default)]
struct LauncherState {
    deployed: BTreeMap<String, ProjectDescription>,
    services: HashMap<String, Vec<String>>,
    failing: BTreeSet<String>,
    errlevel: i32,
    hold: bool,
    calls: Vec<String>,
    files: Vec<PathBuf>,
    environments: Vec<BTreeMap<String, String>>,
}

/// A launcher that deploys projects into memory. Each service `s` of project `p` runs in jail
/// `p_s`.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    state: Mutex<LauncherState>,
    started: Notify,
}

impl FakeLauncher {
    /// Services of `project`; defaults to a single `app`.
    pub fn set_services(&self, project: &str, services: &[&str]) {
        self.state.lock().unwrap().services.insert(
            project.to_string(),
            services.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Services with this name come up with a non-zero status.
    pub fn fail_service(&self, service: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(service.to_string());
    }

    pub fn set_errlevel(&self, errlevel: i32) {
        self.state.lock().unwrap().errlevel = errlevel;
    }

    /// Make `up` block until its launch is canceled.
    pub fn hold_up(&self, hold: bool) {
        self.state.lock().unwrap().hold = hold;
    }

    /// Wait until an `up` has started.
    pub async fn started(&self) {
        self.started.notified().await
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().files.clone()
    }

    pub fn environments(&self) -> Vec<BTreeMap<String, String>> {
        self.state.lock().unwrap().environments.clone()
    }

    pub fn jail(project: &str, service: &str) -> String {
        format!("{project}_{service}")
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn up(&self, request: LaunchRequest) -> Result<LaunchOutcome, LauncherError> {
        let hold = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("up {}", request.project));
            state.files.extend(request.file.clone());
            state.environments.push(request.environment.clone());
            state.hold
        };
        self.started.notify_one();

        if hold {
            request.cancel.cancelled().await;
            return Ok(LaunchOutcome {
                errlevel: 1,
                output: "interrupted\n".to_string(),
                canceled: true,
                timed_out: false,
            });
        }

        let mut state = self.state.lock().unwrap();
        let names = state
            .services
            .get(&request.project)
            .cloned()
            .unwrap_or_else(|| vec!["app".to_string()]);
        let services: Vec<_> = names
            .iter()
            .map(|name| ServiceDescription {
                name: name.clone(),
                status: i32::from(state.failing.contains(name)),
                jail: Self::jail(&request.project, name),
            })
            .collect();
        let errlevel = if services.iter().any(|s| s.status != 0) {
            1
        } else {
            state.errlevel
        };
        state.deployed.insert(
            request.project.clone(),
            ProjectDescription {
                name: request.project.clone(),
                state: if errlevel == 0 { "DONE" } else { "FAILED" }.to_string(),
                last_log: None,
                locked: false,
                services,
            },
        );
        Ok(LaunchOutcome {
            errlevel,
            output: format!("\x1b[32m{}\x1b[0m is up\n", request.project),
            canceled: false,
            timed_out: false,
        })
    }

    async fn down(&self, request: LaunchRequest) -> Result<LaunchOutcome, LauncherError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!(
            "down {}{}",
            request.project,
            if request.destroy { " --destroy" } else { "" }
        ));
        if request.destroy {
            state.deployed.remove(&request.project);
        } else if let Some(project) = state.deployed.get_mut(&request.project) {
            project.state = "STOPPED".to_string();
        }
        Ok(LaunchOutcome {
            errlevel: 0,
            output: format!("{} is down\n", request.project),
            canceled: false,
            timed_out: false,
        })
    }

    async fn cancel(&self, project: &str) -> Result<(), LauncherError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("cancel {project}"));
        Ok(())
    }

    async fn describe(&self, project: &str) -> Result<Option<ProjectDescription>, LauncherError> {
        Ok(self.state.lock().unwrap().deployed.get(project).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, LauncherError> {
        Ok(self.state.lock().unwrap().deployed.keys().cloned().collect())
    }
}

#[derive(Debug, Default)]
struct JailState {
    labels: HashMap<String, BTreeMap<String, String>>,
    exec_code: i32,
    exec_output: String,
    execs: Vec<(String, Vec<String>)>,
    poweroffs: Vec<(String, String)>,
}

/// A jail manager whose jails are whatever was given labels.
#[derive(Debug, Default)]
pub struct FakeJails {
    state: Mutex<JailState>,
}

impl FakeJails {
    pub fn set_labels(&self, jail: &str, labels: &[(&str, &str)]) {
        self.state.lock().unwrap().labels.insert(
            jail.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    /// Exit status of every command run in a jail from now on.
    pub fn set_exec_code(&self, code: i32) {
        self.state.lock().unwrap().exec_code = code;
    }

    /// Output of every command run in a jail from now on.
    pub fn set_exec_output(&self, output: &str) {
        self.state.lock().unwrap().exec_output = output.to_string();
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn poweroffs(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().poweroffs.clone()
    }
}

#[async_trait]
impl JailManager for FakeJails {
    async fn list(&self) -> Result<Vec<String>, JailError> {
        let mut jails: Vec<_> = self.state.lock().unwrap().labels.keys().cloned().collect();
        jails.sort();
        Ok(jails)
    }

    async fn item(&self, jail: &str, item: JailItem) -> Result<Option<Value>, JailError> {
        let state = self.state.lock().unwrap();
        Ok(state.labels.get(jail).map(|labels| match item {
            JailItem::Labels => json!(labels),
            other => json!({ "name": jail, "item": other.as_str() }),
        }))
    }

    async fn label_names(&self, jail: &str) -> Result<Vec<String>, JailError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .labels
            .get(jail)
            .map(|labels| labels.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn labels(&self, jail: &str) -> Result<BTreeMap<String, String>, JailError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .labels
            .get(jail)
            .cloned()
            .unwrap_or_default())
    }

    async fn exec(
        &self,
        jail: &str,
        argv: &[String],
        _environment: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, JailError> {
        let mut state = self.state.lock().unwrap();
        state.execs.push((jail.to_string(), argv.to_vec()));
        Ok(CommandOutput {
            code: state.exec_code,
            output: state.exec_output.clone(),
        })
    }

    async fn vm_poweroff(&self, jail: &str, vm: &str) -> Result<(), JailError> {
        self.state
            .lock()
            .unwrap()
            .poweroffs
            .push((jail.to_string(), vm.to_string()));
        Ok(())
    }
}

/// Interfaces with fixed addresses.
#[derive(Debug, Default)]
pub struct FakeResolver {
    interfaces: HashMap<String, Vec<IpAddr>>,
}

impl FakeResolver {
    pub fn new(interfaces: &[(&str, &str)]) -> Self {
        let mut resolver = Self::default();
        for (name, address) in interfaces {
            resolver
                .interfaces
                .entry(name.to_string())
                .or_default()
                .push(address.parse().unwrap());
        }
        resolver
    }
}

impl AddressResolver for FakeResolver {
    fn resolve(&self, interface: &str, network: Option<&IpCidr>) -> io::Result<Vec<IpAddr>> {
        let addresses = self.interfaces.get(interface).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no interface '{interface}'"))
        })?;
        Ok(addresses
            .iter()
            .filter(|address| network.map_or(true, |network| network.contains(address)))
            .copied()
            .collect())
    }
}
