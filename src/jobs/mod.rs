// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Turning accepted API requests into queued jobs.

pub mod envelope;
pub mod model;

use std::sync::Arc;

use {
    log::info,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub use envelope::{Envelope, EnvelopeError};
pub use model::{
    DownRequest, ProjectCancel, ProjectDown, ProjectUp, ReservePort, UpRequest, VmCreate,
    VmRequest,
};

use crate::{config::Tubes, error::ApiError, queue::WorkQueue};

/// Messages consumed by the project worker. Cancellations travel on their own tube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "lowercase")]
pub enum ProjectJob {
    Create(ProjectUp),
    Destroy(ProjectDown),
    Cancel(ProjectCancel),
}

/// Messages consumed by the VM worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "lowercase")]
pub enum VmJob {
    Create(VmCreate),
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    let body = if body.is_null() {
        Value::Object(Default::default())
    } else {
        body
    };
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(e.to_string()))
}

pub fn validate_name(name: &str) -> Result<(), ApiError> {
    model::validate_name("name", name).map_err(ApiError::bad_request)
}

/// Parse and check a VM profile. Resolving `makejailFromMetadata` is left to the caller, which
/// owns the metadata store.
pub fn parse_vm_request(body: Value) -> Result<VmRequest, ApiError> {
    let request: VmRequest = parse(body)?;
    request.validate().map_err(ApiError::bad_request)?;
    Ok(request)
}

pub struct JobDispatcher {
    queue: Arc<dyn WorkQueue>,
    secret: Vec<u8>,
    tubes: Tubes,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn WorkQueue>, secret: &str, tubes: Tubes) -> Self {
        Self {
            queue,
            secret: secret.as_bytes().to_vec(),
            tubes,
        }
    }

    pub async fn project_up(&self, name: &str, body: Value) -> Result<u64, ApiError> {
        validate_name(name)?;
        let request: UpRequest = parse(body)?;
        request.validate().map_err(ApiError::bad_request)?;
        let job = ProjectJob::Create(ProjectUp {
            name: name.to_string(),
            request,
        });
        self.enqueue(&self.tubes.project, &job).await
    }

    pub async fn project_down(&self, name: &str, body: Value) -> Result<u64, ApiError> {
        validate_name(name)?;
        let request: DownRequest = parse(body)?;
        request.validate().map_err(ApiError::bad_request)?;
        let job = ProjectJob::Destroy(ProjectDown {
            name: name.to_string(),
            request,
        });
        self.enqueue(&self.tubes.project, &job).await
    }

    pub async fn project_cancel(&self, name: &str) -> Result<u64, ApiError> {
        validate_name(name)?;
        let job = ProjectJob::Cancel(ProjectCancel {
            name: name.to_string(),
        });
        self.enqueue(&self.tubes.control, &job).await
    }

    pub async fn create_vm(
        &self,
        name: &str,
        request: VmRequest,
        makejail: String,
    ) -> Result<u64, ApiError> {
        validate_name(name)?;
        let job = VmJob::Create(VmCreate {
            name: name.to_string(),
            makejail,
            request,
        });
        self.enqueue(&self.tubes.vm, &job).await
    }

    async fn enqueue<T: Serialize>(&self, tube: &str, job: &T) -> Result<u64, ApiError> {
        let payload = Envelope::seal(&self.secret, job)
            .and_then(|envelope| envelope.to_bytes())
            .map_err(|e| ApiError::internal(format!("could not seal job: {e}")))?;
        let id = self
            .queue
            .put(tube, &payload)
            .await
            .map_err(|e| ApiError::internal(format!("could not queue job: {e}")))?;
        info!("queued job {id} on '{tube}'");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::queue::MemoryQueue;

    fn dispatcher() -> (Arc<MemoryQueue>, JobDispatcher) {
        let queue = Arc::new(MemoryQueue::new());
        let dispatcher = JobDispatcher::new(queue.clone(), "s3cret", Tubes::default());
        (queue, dispatcher)
    }

    #[tokio::test]
    async fn up_is_signed_and_queued() {
        let (queue, dispatcher) = dispatcher();
        let id = dispatcher
            .project_up("web", json!({"director_file": "services: {}"}))
            .await
            .unwrap();

        let job = queue
            .reserve("overlord_project", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);

        let envelope = Envelope::from_bytes(&job.payload).unwrap();
        assert_eq!(envelope.message["type"], "create");
        let job: ProjectJob = envelope.open(b"s3cret").unwrap();
        match job {
            ProjectJob::Create(up) => {
                assert_eq!(up.name, "web");
                assert!(!up.request.restart);
            }
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_uses_control_tube() {
        let (queue, dispatcher) = dispatcher();
        dispatcher.project_cancel("web").await.unwrap();
        assert_eq!(queue.ready("overlord_control"), 1);
        assert_eq!(queue.ready("overlord_project"), 0);
    }

    #[tokio::test]
    async fn invalid_requests_are_not_queued() {
        let (queue, dispatcher) = dispatcher();

        let err = dispatcher
            .project_up("../etc", json!({"director_file": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        let err = dispatcher
            .project_up("web", json!({"director_file": ""}))
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        let err = dispatcher
            .project_down("web", json!({"force": "yes"}))
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        assert_eq!(queue.ready("overlord_project"), 0);
    }

    #[tokio::test]
    async fn down_accepts_empty_body() {
        let (queue, dispatcher) = dispatcher();
        dispatcher.project_down("web", Value::Null).await.unwrap();
        assert_eq!(queue.ready("overlord_project"), 1);
    }
}
