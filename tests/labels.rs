// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use {
        base64::{engine::general_purpose::STANDARD, Engine},
        httpmock::prelude::*,
        serde_json::{json, Value},
        tokio::runtime::Runtime,
    };

    use overlord_lib::{
        status::{self, EntityStatus, JobState, StatusKey, StatusKind},
        test_env::*,
        worker::JobClass,
    };

    const BASE: &str = "/v2/services/haproxy";

    const LB_LABELS: [(&str, &str); 4] = [
        ("overlord.load-balancer", "1"),
        ("overlord.load-balancer.backend", "web"),
        ("overlord.load-balancer.interface", "lo0"),
        ("overlord.load-balancer.interface.port", "8080"),
    ];

    const DNS_LABELS: [(&str, &str); 3] = [
        ("overlord.skydns", "1"),
        ("overlord.skydns.group", "web"),
        ("overlord.skydns.interface", "lo0"),
    ];

    fn load_balancer(server: &MockServer) -> String {
        format!(
            r#"
            [load_balancer]
            entrypoint = "{}"
            username = "admin"
            password = "secret"
            "#,
            server.base_url()
        )
    }

    fn skydns(servers: &[String]) -> String {
        format!(
            r#"
            [skydns]
            zone = "overlord.lan"
            servers = {}
            "#,
            Value::from(servers.to_vec())
        )
    }

    /// Bring project `web` up and return its status.
    async fn up(harness: &Harness) -> EntityStatus {
        let body = json!({ "director_file": "services:\n  app: {}\n" });
        harness.dispatcher().project_up("web", body).await.unwrap();
        harness.worker().process_next(JobClass::Project).await.unwrap();
        let key = StatusKey::Project(StatusKind::Up, "web".to_string());
        status::get(harness.cache.as_ref(), &key).await.unwrap().unwrap()
    }

    async fn down(harness: &Harness, body: Value) -> EntityStatus {
        harness.dispatcher().project_down("web", body).await.unwrap();
        harness.worker().process_next(JobClass::Project).await.unwrap();
        let key = StatusKey::Project(StatusKind::Down, "web".to_string());
        status::get(harness.cache.as_ref(), &key).await.unwrap().unwrap()
    }

    fn jail_labels(harness: &Harness, sets: &[&[(&str, &str)]]) {
        let labels: Vec<(&str, &str)> = sets.iter().flat_map(|set| set.iter().copied()).collect();
        harness
            .jails
            .set_labels(&FakeLauncher::jail("web", "app"), &labels);
    }

    #[test]
    fn missing_backend_does_not_block_dns() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let lb = MockServer::start_async().await;
            lb.mock_async(|when, then| {
                when.method(GET).path(format!("{BASE}/configuration/version"));
                then.status(200).body("3");
            })
            .await;
            lb.mock_async(|when, then| {
                when.method(GET).path(format!("{BASE}/configuration/backends/web"));
                then.status(404).json_body(json!({"code": 404, "message": "missing"}));
            })
            .await;

            let etcd = MockServer::start_async().await;
            let put = etcd
                .mock_async(|when, then| {
                    when.method(POST).path("/v3/kv/put");
                    then.status(200).json_body(json!({}));
                })
                .await;

            let env = TestEnvironment::new("labels_missing_backend");
            let harness =
                env.harness(&(load_balancer(&lb) + &skydns(&[etcd.base_url()])));
            jail_labels(&harness, &[&LB_LABELS, &DNS_LABELS]);

            let status = up(&harness).await;
            assert_eq!(status.operation, JobState::Incompleted);
            let labels = status.labels.unwrap();
            assert!(labels.error);
            let lb_result = &labels.load_balancer["app"];
            assert!(lb_result.error);
            assert!(lb_result.message.contains("'web'"));
            assert!(!labels.skydns["app"].error);
            put.assert_async().await;
        });
    }

    #[test]
    fn backend_errors_carry_the_response_body() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let lb = MockServer::start_async().await;
            lb.mock_async(|when, then| {
                when.method(GET).path(format!("{BASE}/configuration/version"));
                then.status(200).body("3");
            })
            .await;
            lb.mock_async(|when, then| {
                when.method(GET).path(format!("{BASE}/configuration/backends/web"));
                then.status(500).body("runtime API socket is gone");
            })
            .await;
            let open = lb
                .mock_async(|when, then| {
                    when.method(POST).path(format!("{BASE}/transactions"));
                    then.status(201).json_body(json!({"id": "tx1"}));
                })
                .await;

            let env = TestEnvironment::new("labels_backend_error");
            let harness = env.harness(&load_balancer(&lb));
            jail_labels(&harness, &[&LB_LABELS]);

            let status = up(&harness).await;
            assert_eq!(status.operation, JobState::Incompleted);
            let lb_result = &status.labels.unwrap().load_balancer["app"];
            assert!(lb_result.error);
            assert!(lb_result.message.contains("500"));
            assert!(lb_result.message.contains("runtime API socket is gone"));
            assert_eq!(open.hits_async().await, 0);
        });
    }

    #[test]
    fn server_is_added_to_the_backend() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("labels_lb_register");
            let lb = MockServer::start_async().await;
            lb.mock_async(|when, then| {
                when.method(GET).path(format!("{BASE}/configuration/version"));
                then.status(200).body("3");
            })
            .await;
            lb.mock_async(|when, then| {
                when.method(GET).path(format!("{BASE}/configuration/backends/web"));
                then.status(200).json_body(json!({"data": {"name": "web"}}));
            })
            .await;
            lb.mock_async(|when, then| {
                when.method(GET)
                    .path(format!("{BASE}/configuration/servers/labels_lb_register"))
                    .query_param("backend", "web");
                then.status(404);
            })
            .await;
            let open = lb
                .mock_async(|when, then| {
                    when.method(POST)
                        .path(format!("{BASE}/transactions"))
                        .query_param("version", "3");
                    then.status(201).json_body(json!({"id": "tx9"}));
                })
                .await;
            let add = lb
                .mock_async(|when, then| {
                    when.method(POST)
                        .path(format!("{BASE}/configuration/servers"))
                        .query_param("backend", "web")
                        .query_param("transaction_id", "tx9")
                        .json_body(json!({
                            "name": "labels_lb_register",
                            "address": "127.0.0.1",
                            "port": 8080,
                        }));
                    then.status(201);
                })
                .await;
            let commit = lb
                .mock_async(|when, then| {
                    when.method(PUT).path(format!("{BASE}/transactions/tx9"));
                    then.status(202);
                })
                .await;

            let harness = env.harness(&load_balancer(&lb));
            jail_labels(&harness, &[&LB_LABELS]);

            let status = up(&harness).await;
            assert_eq!(status.operation, JobState::Completed);
            let labels = status.labels.unwrap();
            assert!(!labels.error);
            assert!(labels.load_balancer["app"].message.contains("added"));
            assert!(labels.skydns.is_empty());
            open.assert_async().await;
            add.assert_async().await;
            commit.assert_async().await;
        });
    }

    #[test]
    fn dns_fails_over_to_the_next_server() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("labels_dns_failover");
            let etcd = MockServer::start_async().await;
            let key = STANDARD.encode("/skydns/lan/overlord/web/labels_dns_failover");
            let put = etcd
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/v3/kv/put")
                        .json_body_partial(json!({ "key": key }).to_string());
                    then.status(200).json_body(json!({}));
                })
                .await;
            let delete = etcd
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/v3/kv/deleterange")
                        .json_body_partial(json!({ "key": key }).to_string());
                    then.status(200).json_body(json!({}));
                })
                .await;

            let dead = format!("http://{}", closed_port().await);
            let harness = env.harness(&skydns(&[dead, etcd.base_url()]));
            jail_labels(&harness, &[&DNS_LABELS]);

            let status = up(&harness).await;
            assert_eq!(status.operation, JobState::Completed);
            let dns = &status.labels.unwrap().skydns["app"];
            assert!(!dns.error);
            assert!(dns.message.contains("web.overlord.lan -> 127.0.0.1"));
            put.assert_async().await;

            let status = down(&harness, Value::Null).await;
            assert_eq!(status.operation, JobState::Completed);
            assert!(status.labels.unwrap().skydns["app"].message.contains("removed"));
            delete.assert_async().await;
        });
    }

    #[test]
    fn dns_without_servers_is_incompleted() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("labels_dns_exhausted");
            let servers = [
                format!("http://{}", closed_port().await),
                format!("http://{}", closed_port().await),
            ];
            let harness = env.harness(&skydns(&servers));
            jail_labels(&harness, &[&DNS_LABELS]);

            let status = up(&harness).await;
            assert_eq!(status.operation, JobState::Incompleted);
            assert!(status.labels.unwrap().skydns["app"].error);

            // Forced teardown leaves DNS alone.
            let status = down(&harness, json!({"force": true})).await;
            assert_eq!(status.operation, JobState::Completed);
            assert!(status.labels.is_none());
        });
    }

    #[test]
    fn unconfigured_integration_is_reported() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("labels_unconfigured");
            let harness = env.harness("");
            jail_labels(&harness, &[&LB_LABELS]);

            let status = up(&harness).await;
            assert_eq!(status.operation, JobState::Incompleted);
            let lb = &status.labels.unwrap().load_balancer["app"];
            assert!(lb.error);
            assert!(lb.message.contains("not configured"));
        });
    }
}
