// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use axum::http::Method;
use serde_json::Value;

use crate::status::StatusKind;

/// Every operation the API exposes. The same value is either handled locally or turned back
/// into a request against a peer, so each variant knows its own method and path.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ListJails,
    JailItem { item: String, name: String },
    ListProjects,
    ProjectInfo { name: String },
    ProjectUp { name: String, body: Value },
    ProjectDown { name: String, body: Value },
    ProjectCancel { name: String },
    ProjectStatus { kind: StatusKind, name: String },
    CreateVm { name: String, body: Value },
    VmStatus { name: String },
    ListChains,
    ListLabels,
    GetMetadata { key: String },
    SetMetadata { key: String, body: Value },
    DeleteMetadata { key: String },
}

impl Operation {
    /// Name reported in chain failure bodies.
    pub fn function(&self) -> &'static str {
        match self {
            Operation::ListJails => "get_jails",
            Operation::JailItem { .. } => "get_jail",
            Operation::ListProjects => "get_projects",
            Operation::ProjectInfo { .. } => "get_project_info",
            Operation::ProjectUp { .. } => "project_up",
            Operation::ProjectDown { .. } => "project_down",
            Operation::ProjectCancel { .. } => "project_cancel",
            Operation::ProjectStatus { .. } => "get_project_status",
            Operation::CreateVm { .. } => "create_vm",
            Operation::VmStatus { .. } => "get_vm_status",
            Operation::ListChains => "get_chains",
            Operation::ListLabels => "get_labels",
            Operation::GetMetadata { .. } => "get_metadata",
            Operation::SetMetadata { .. } => "set_metadata",
            Operation::DeleteMetadata { .. } => "delete_metadata",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Operation::ProjectUp { .. }
            | Operation::ProjectDown { .. }
            | Operation::ProjectCancel { .. }
            | Operation::CreateVm { .. } => Method::POST,
            Operation::SetMetadata { .. } => Method::PUT,
            Operation::DeleteMetadata { .. } => Method::DELETE,
            _ => Method::GET,
        }
    }

    /// Path relative to `/v1/`.
    pub fn path(&self) -> String {
        match self {
            Operation::ListJails => "jails".to_string(),
            Operation::JailItem { item, name } => format!("jail/{item}/{name}"),
            Operation::ListProjects => "projects".to_string(),
            Operation::ProjectInfo { name } => format!("project/info/{name}"),
            Operation::ProjectUp { name, .. } => format!("project/up/{name}"),
            Operation::ProjectDown { name, .. } => format!("project/down/{name}"),
            Operation::ProjectCancel { name } => format!("project/cancel/{name}"),
            Operation::ProjectStatus { kind, name } => format!("project/{kind}/{name}"),
            Operation::CreateVm { name, .. } | Operation::VmStatus { name } => format!("vm/{name}"),
            Operation::ListChains => "chains".to_string(),
            Operation::ListLabels => "labels".to_string(),
            Operation::GetMetadata { key }
            | Operation::SetMetadata { key, .. }
            | Operation::DeleteMetadata { key } => format!("metadata/{key}"),
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Operation::ProjectUp { body, .. }
            | Operation::ProjectDown { body, .. }
            | Operation::CreateVm { body, .. }
            | Operation::SetMetadata { body, .. } => Some(body),
            _ => None,
        }
    }
}
