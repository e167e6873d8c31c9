// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use {
        reqwest::Method,
        serde_json::{json, Value},
        tokio::runtime::Runtime,
    };

    use overlord_lib::{
        remote::client::AUTH_HEADER, server::TokenAuthority, test_env::*, worker::JobClass,
    };

    /// A client for one test server.
    struct Api {
        addr: SocketAddr,
        http: reqwest::Client,
        token: Option<String>,
    }

    impl Api {
        fn new(addr: SocketAddr) -> Self {
            Self {
                addr,
                http: reqwest::Client::new(),
                token: Some(token()),
            }
        }

        fn with_token(addr: SocketAddr, token: Option<String>) -> Self {
            Self {
                token,
                ..Self::new(addr)
            }
        }

        async fn send(&self, method: Method, path: &str, body: Option<&str>) -> (u16, Value) {
            let mut request = self
                .http
                .request(method, format!("http://{}{path}", self.addr));
            if let Some(token) = &self.token {
                request = request.header(AUTH_HEADER, format!("Bearer {token}"));
            }
            if let Some(body) = body {
                request = request
                    .header("content-type", "application/json")
                    .body(body.to_string());
            }
            let response = request.send().await.unwrap();
            let status = response.status().as_u16();
            let bytes = response.bytes().await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            self.send(Method::GET, path, None).await
        }

        async fn post(&self, path: &str, body: &Value) -> (u16, Value) {
            self.send(Method::POST, path, Some(&body.to_string())).await
        }
    }

    #[test]
    fn tokens_are_required() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_tokens");
            let addr = env.harness("").spawn_server().await;

            let (status, body) = Api::with_token(addr, None).get("/v1/labels").await;
            assert_eq!(status, 401);
            assert_eq!(body["status_code"], 401);

            let (status, _) = Api::with_token(addr, Some("garbage".to_string()))
                .get("/v1/labels")
                .await;
            assert_eq!(status, 401);

            let foreign = TokenAuthority::new("another-secret")
                .issue(None, Value::Null)
                .unwrap();
            let (status, _) = Api::with_token(addr, Some(foreign))
                .get("/v1/chain/x/labels")
                .await;
            assert_eq!(status, 401);

            let (status, body) = Api::new(addr).get("/v1/labels").await;
            assert_eq!(status, 200);
            assert_eq!(body["status_code"], 200);
            assert_eq!(body["message"], json!(["test", "api_tokens"]));
        });
    }

    #[test]
    fn head_is_served_for_get_routes() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_head");
            let addr = env.harness("").spawn_server().await;
            let (status, _) = Api::new(addr).send(Method::HEAD, "/v1/projects", None).await;
            assert_eq!(status, 200);
        });
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_invalid");
            let harness = env.harness("");
            let api = Api::new(harness.spawn_server().await);

            let (status, body) = api
                .send(Method::POST, "/v1/project/up/web", Some("{oops"))
                .await;
            assert_eq!(status, 400);
            assert_eq!(body["status_code"], 400);

            let (status, _) = api
                .post("/v1/project/up/web", &json!({"director_file": "  "}))
                .await;
            assert_eq!(status, 400);

            let (status, _) = api
                .post(
                    "/v1/project/up/web",
                    &json!({"director_file": "x", "surprise": true}),
                )
                .await;
            assert_eq!(status, 400);

            let (status, _) = api
                .post(
                    "/v1/project/up/web",
                    &json!({"director_file": "x", "environment": {"1BAD": "v"}}),
                )
                .await;
            assert_eq!(status, 400);

            let (status, _) = api.post("/v1/project/up/we.b", &json!({"director_file": "x"})).await;
            assert_eq!(status, 400);

            let (status, _) = api.get("/v1/chain/a..b/labels").await;
            assert_eq!(status, 400);

            let (status, _) = api.post("/v1/vm/vm1", &json!({"template": {}})).await;
            assert_eq!(status, 400);

            assert_eq!(harness.queue.ready(&harness.config.jobs.tubes.project), 0);
            assert_eq!(harness.queue.ready(&harness.config.jobs.tubes.vm), 0);
        });
    }

    #[test]
    fn jobs_and_status() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_jobs");
            let harness = env.harness("");
            let api = Api::new(harness.spawn_server().await);

            let (status, _) = api.get("/v1/project/up/web").await;
            assert_eq!(status, 404);

            let (status, body) = api
                .post("/v1/project/up/web", &json!({"director_file": "services: {}\n"}))
                .await;
            assert_eq!(status, 200);
            let job_id = body["message"]["job_id"].as_u64().unwrap();

            harness.worker().process_next(JobClass::Project).await.unwrap();

            let (status, body) = api.get("/v1/project/up/web").await;
            assert_eq!(status, 200);
            let message = &body["message"];
            assert_eq!(message["operation"], "COMPLETED");
            assert_eq!(message["job_id"], job_id);
            assert_eq!(message["restarted"], false);
            // Seconds since the update, not a timestamp.
            assert!(message["last_update"].as_i64().unwrap() < 60);

            let (_, body) = api.get("/v1/projects").await;
            assert_eq!(body["message"], json!(["web"]));

            let (status, body) = api.get("/v1/project/info/web").await;
            assert_eq!(status, 200);
            assert_eq!(body["message"]["name"], "web");
            let (status, _) = api.get("/v1/project/info/ghost").await;
            assert_eq!(status, 404);

            let (status, _) = api.get("/v1/project/autoscale/web").await;
            assert_eq!(status, 404);

            let (status, body) = api
                .send(Method::POST, "/v1/project/down/web", None)
                .await;
            assert_eq!(status, 200);
            assert!(body["message"]["job_id"].as_u64().unwrap() > job_id);

            let (status, _) = api.send(Method::POST, "/v1/project/cancel/web", None).await;
            assert_eq!(status, 200);
            assert_eq!(harness.queue.ready(&harness.config.jobs.tubes.project), 1);
            assert_eq!(harness.queue.ready(&harness.config.jobs.tubes.control), 1);
        });
    }

    #[test]
    fn metadata_round_trip() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_metadata");
            let api = Api::new(env.harness("").spawn_server().await);

            let (status, body) = api.post("/v1/metadata/motd", &json!({"value": "hi"})).await;
            assert_eq!(status, 200);
            assert_eq!(body["message"], "motd");

            let (status, body) = api.get("/v1/metadata/motd").await;
            assert_eq!(status, 200);
            assert_eq!(body["message"], "hi");

            let (status, _) = api
                .send(Method::PUT, "/v1/metadata/motd", Some(r#"{"value": "bye"}"#))
                .await;
            assert_eq!(status, 200);
            assert_eq!(api.get("/v1/metadata/motd").await.1["message"], "bye");

            let big = "x".repeat(2048);
            let (status, _) = api.post("/v1/metadata/motd", &json!({ "value": big })).await;
            assert_eq!(status, 400);
            let (status, _) = api.post("/v1/metadata/motd", &json!({"value": 7})).await;
            assert_eq!(status, 400);
            assert_eq!(api.get("/v1/metadata/motd").await.1["message"], "bye");

            let (status, _) = api.send(Method::DELETE, "/v1/metadata/motd", None).await;
            assert_eq!(status, 200);
            let (status, _) = api.send(Method::DELETE, "/v1/metadata/motd", None).await;
            assert_eq!(status, 404);
            let (status, _) = api.get("/v1/metadata/motd").await;
            assert_eq!(status, 404);
        });
    }

    #[test]
    fn vm_from_metadata() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_vm");
            let harness = env.harness("");
            let api = Api::new(harness.spawn_server().await);
            let profile = json!({
                "makejailFromMetadata": "vm-makejail",
                "template": {"loader": "uefi"},
                "diskLayout": {
                    "driver": "nvme",
                    "size": "20G",
                    "from": {"type": "img", "imgFile": "/img/debian.img"}
                },
            });

            let (status, _) = api.post("/v1/vm/vm1", &profile).await;
            assert_eq!(status, 404);

            api.post("/v1/metadata/vm-makejail", &json!({"value": "OPTION start\n"}))
                .await;
            let (status, body) = api.post("/v1/vm/vm1", &profile).await;
            assert_eq!(status, 200);
            assert!(body["message"]["job_id"].is_u64());
            assert_eq!(harness.queue.ready(&harness.config.jobs.tubes.vm), 1);

            harness.worker().process_next(JobClass::Vm).await.unwrap();
            assert_eq!(
                std::fs::read_to_string(env.path("vm/vm1/Makejail")).unwrap(),
                "OPTION start\n"
            );
            let (status, body) = api.get("/v1/vm/vm1").await;
            assert_eq!(status, 200);
            assert_eq!(body["message"]["operation"], "COMPLETED");
        });
    }

    #[test]
    fn jail_items() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnvironment::new("api_jails");
            let harness = env.harness("");
            harness.jails.set_labels("j1", &[("role", "db")]);
            let api = Api::new(harness.spawn_server().await);

            let (_, body) = api.get("/v1/jails").await;
            assert_eq!(body["message"], json!(["j1"]));

            let (status, body) = api.get("/v1/jail/labels/j1").await;
            assert_eq!(status, 200);
            assert_eq!(body["message"], json!({"role": "db"}));

            let (status, _) = api.get("/v1/jail/bogus/j1").await;
            assert_eq!(status, 400);

            let (status, _) = api.get("/v1/jail/info/ghost").await;
            assert_eq!(status, 404);
        });
    }
}
