// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The operations this entrypoint serves itself.

use std::{fmt, sync::Arc};

use {
    async_trait::async_trait,
    log::error,
    serde_json::{json, Value},
};

use crate::{
    cache::KeyValueCache,
    chain::ChainRegistry,
    config::Config,
    director::Launcher,
    error::{ApiError, ApiResponse},
    jail::{JailItem, JailManager},
    jobs::{self, JobDispatcher},
    metadata::{MetadataError, MetadataStore},
    remote::{LocalService, Operation},
    status::{self, StatusKey},
};

pub struct LocalHandlers {
    config: Arc<Config>,
    registry: Arc<ChainRegistry>,
    cache: Arc<dyn KeyValueCache>,
    dispatcher: JobDispatcher,
    metadata: MetadataStore,
    launcher: Arc<dyn Launcher>,
    jails: Arc<dyn JailManager>,
}

impl LocalHandlers {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ChainRegistry>,
        cache: Arc<dyn KeyValueCache>,
        dispatcher: JobDispatcher,
        launcher: Arc<dyn Launcher>,
        jails: Arc<dyn JailManager>,
    ) -> Self {
        let metadata = MetadataStore::new(
            config.metadata.directory.clone(),
            config.metadata.size,
        );
        Self {
            config,
            registry,
            cache,
            dispatcher,
            metadata,
            launcher,
            jails,
        }
    }

    /// A 500 for an error the caller can do nothing about. The debug rendering is only sent
    /// back when the API runs with traces enabled.
    fn internal<E: fmt::Display + fmt::Debug>(&self, context: &str, e: E) -> ApiError {
        error!("{context}: {e}");
        let err = ApiError::internal(format!("{context}: {e}"));
        if self.config.api.debug {
            err.with_trace(format!("{e:?}"))
        } else {
            err
        }
    }

    fn metadata_error(&self, e: MetadataError) -> ApiError {
        match e {
            MetadataError::InvalidKey(_) | MetadataError::TooLarge { .. } => {
                ApiError::bad_request(e.to_string())
            }
            MetadataError::Io(_) => self.internal("metadata store failed", e),
        }
    }

    async fn status(&self, key: StatusKey) -> Result<ApiResponse, ApiError> {
        let found = status::get(self.cache.as_ref(), &key)
            .await
            .map_err(|e| self.internal("could not read status", e))?;
        match found {
            Some(found) => Ok(ApiResponse::ok(found.to_api_value(status::now()))),
            None => Err(ApiError::not_found(format!("no status recorded for '{key}'"))),
        }
    }

    async fn jail_item(&self, item: &str, name: &str) -> Result<ApiResponse, ApiError> {
        let item: JailItem = item.parse().map_err(ApiError::bad_request)?;
        jobs::validate_name(name)?;
        let value = self
            .jails
            .item(name, item)
            .await
            .map_err(|e| self.internal(&format!("could not read {item} of '{name}'"), e))?;
        value
            .map(ApiResponse::ok)
            .ok_or_else(|| ApiError::not_found(format!("jail '{name}' not found")))
    }

    async fn project_info(&self, name: &str) -> Result<ApiResponse, ApiError> {
        jobs::validate_name(name)?;
        let description = self
            .launcher
            .describe(name)
            .await
            .map_err(|e| self.internal(&format!("could not describe '{name}'"), e))?
            .ok_or_else(|| ApiError::not_found(format!("project '{name}' not found")))?;
        let description =
            serde_json::to_value(description).map_err(|e| self.internal("encode", e))?;
        Ok(ApiResponse::ok(description))
    }

    async fn create_vm(&self, name: &str, body: Value) -> Result<ApiResponse, ApiError> {
        jobs::validate_name(name)?;
        let request = jobs::parse_vm_request(body)?;
        let makejail = match (&request.makejail, &request.makejail_from_metadata) {
            (Some(makejail), _) => makejail.clone(),
            (None, Some(key)) => self
                .metadata
                .get(key)
                .await
                .map_err(|e| self.metadata_error(e))?
                .ok_or_else(|| ApiError::not_found(format!("metadata '{key}' not found")))?,
            (None, None) => {
                return Err(ApiError::bad_request(
                    "one of 'makejail' and 'makejailFromMetadata' is required",
                ))
            }
        };
        let id = self.dispatcher.create_vm(name, request, makejail).await?;
        Ok(job(id))
    }

    async fn set_metadata(&self, key: &str, body: Value) -> Result<ApiResponse, ApiError> {
        let value = body
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::bad_request("'value' must be a string"))?;
        self.metadata
            .set(key, value)
            .await
            .map_err(|e| self.metadata_error(e))?;
        Ok(ApiResponse::ok(json!(key)))
    }
}

fn job(id: u64) -> ApiResponse {
    ApiResponse::ok(json!({ "job_id": id }))
}

#[async_trait]
impl LocalService for LocalHandlers {
    async fn handle(&self, op: Operation) -> Result<ApiResponse, ApiError> {
        match op {
            Operation::ListJails => {
                let jails = self
                    .jails
                    .list()
                    .await
                    .map_err(|e| self.internal("could not list jails", e))?;
                Ok(ApiResponse::ok(json!(jails)))
            }
            Operation::JailItem { item, name } => self.jail_item(&item, &name).await,
            Operation::ListProjects => {
                let projects = self
                    .launcher
                    .list()
                    .await
                    .map_err(|e| self.internal("could not list projects", e))?;
                Ok(ApiResponse::ok(json!(projects)))
            }
            Operation::ProjectInfo { name } => self.project_info(&name).await,
            Operation::ProjectUp { name, body } => {
                Ok(job(self.dispatcher.project_up(&name, body).await?))
            }
            Operation::ProjectDown { name, body } => {
                Ok(job(self.dispatcher.project_down(&name, body).await?))
            }
            Operation::ProjectCancel { name } => {
                Ok(job(self.dispatcher.project_cancel(&name).await?))
            }
            Operation::ProjectStatus { kind, name } => {
                jobs::validate_name(&name)?;
                self.status(StatusKey::Project(kind, name)).await
            }
            Operation::CreateVm { name, body } => self.create_vm(&name, body).await,
            Operation::VmStatus { name } => {
                jobs::validate_name(&name)?;
                self.status(StatusKey::Vm(name)).await
            }
            Operation::ListChains => Ok(ApiResponse::ok(json!(self.registry.list()))),
            Operation::ListLabels => Ok(ApiResponse::ok(json!(self.config.labels))),
            Operation::GetMetadata { key } => {
                let value = self
                    .metadata
                    .get(&key)
                    .await
                    .map_err(|e| self.metadata_error(e))?
                    .ok_or_else(|| ApiError::not_found(format!("metadata '{key}' not found")))?;
                Ok(ApiResponse::ok(Value::String(value)))
            }
            Operation::SetMetadata { key, body } => self.set_metadata(&key, body).await,
            Operation::DeleteMetadata { key } => {
                if self
                    .metadata
                    .delete(&key)
                    .await
                    .map_err(|e| self.metadata_error(e))?
                {
                    Ok(ApiResponse::ok(json!(key)))
                } else {
                    Err(ApiError::not_found(format!("metadata '{key}' not found")))
                }
            }
        }
    }
}
