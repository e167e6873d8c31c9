// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, sync::Arc};

use {
    axum::{
        body::Bytes,
        extract::{FromRequestParts, Path},
        http::request::Parts,
        middleware,
        response::{IntoResponse, Response},
        routing::{get, post, MethodRouter},
        Router,
    },
    serde_json::Value,
};

use super::{auth::authenticate, AppState};
use crate::{
    chain::Chain,
    error::ApiError,
    remote::Operation,
    status::StatusKind,
};

const CHAIN_PREFIX: &str = "/v1/chain/";

/// The chain a request is addressed to: the `{chain}` segment of `/v1/chain/{chain}/...`, or
/// the local chain for plain `/v1/...` paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTarget(pub Chain);

impl<S: Send + Sync> FromRequestParts<S> for ChainTarget {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let chain = parts
            .uri
            .path()
            .strip_prefix(CHAIN_PREFIX)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default();
        Chain::parse(chain)
            .map(ChainTarget)
            .map_err(|e| ApiError::bad_request(e.to_string()))
    }
}

type Params = Path<HashMap<String, String>>;

fn param(params: &HashMap<String, String>, name: &str) -> Result<String, ApiError> {
    params
        .get(name)
        .cloned()
        .ok_or_else(|| ApiError::bad_request(format!("missing path parameter '{name}'")))
}

/// An empty body reads as `null`, which the request parsers take as "all defaults".
fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))
}

async fn run(state: AppState, ChainTarget(chain): ChainTarget, op: Operation) -> Response {
    match state.proxy.invoke(&chain, op).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn named(
    state: AppState,
    target: ChainTarget,
    Path(params): Params,
    key: &str,
    op: impl FnOnce(String) -> Operation,
) -> Response {
    match param(&params, key) {
        Ok(value) => run(state, target, op(value)).await,
        Err(e) => e.into_response(),
    }
}

async fn with_body(
    state: AppState,
    target: ChainTarget,
    Path(params): Params,
    key: &str,
    body: Bytes,
    op: fn(String, Value) -> Operation,
) -> Response {
    let op = param(&params, key).and_then(|value| Ok(op(value, parse_body(&body)?)));
    match op {
        Ok(op) => run(state, target, op).await,
        Err(e) => e.into_response(),
    }
}

async fn jail_item(state: AppState, target: ChainTarget, Path(params): Params) -> Response {
    let op = param(&params, "item")
        .and_then(|item| Ok(Operation::JailItem { item, name: param(&params, "name")? }));
    match op {
        Ok(op) => run(state, target, op).await,
        Err(e) => e.into_response(),
    }
}

fn status_route(state: &AppState, kind: StatusKind) -> MethodRouter {
    get({
        let state = state.clone();
        move |target, params| {
            named(state, target, params, "name", move |name| {
                Operation::ProjectStatus { kind, name }
            })
        }
    })
}

/// Every endpoint, relative to `/v1`.
fn routes(state: &AppState) -> Vec<(&'static str, MethodRouter)> {
    vec![
        (
            "/jails",
            get({
                let state = state.clone();
                |target| run(state, target, Operation::ListJails)
            }),
        ),
        (
            "/jail/{item}/{name}",
            get({
                let state = state.clone();
                |target, params| jail_item(state, target, params)
            }),
        ),
        (
            "/projects",
            get({
                let state = state.clone();
                |target| run(state, target, Operation::ListProjects)
            }),
        ),
        (
            "/project/info/{name}",
            get({
                let state = state.clone();
                |target, params| {
                    named(state, target, params, "name", |name| Operation::ProjectInfo { name })
                }
            }),
        ),
        (
            "/project/up/{name}",
            status_route(state, StatusKind::Up).post({
                let state = state.clone();
                |target, params, body| {
                    with_body(state, target, params, "name", body, |name, body| {
                        Operation::ProjectUp { name, body }
                    })
                }
            }),
        ),
        (
            "/project/down/{name}",
            status_route(state, StatusKind::Down).post({
                let state = state.clone();
                |target, params, body| {
                    with_body(state, target, params, "name", body, |name, body| {
                        Operation::ProjectDown { name, body }
                    })
                }
            }),
        ),
        ("/project/autoscale/{name}", status_route(state, StatusKind::Autoscale)),
        (
            "/project/cancel/{name}",
            post({
                let state = state.clone();
                |target, params| {
                    named(state, target, params, "name", |name| Operation::ProjectCancel { name })
                }
            }),
        ),
        (
            "/vm/{name}",
            get({
                let state = state.clone();
                |target, params| {
                    named(state, target, params, "name", |name| Operation::VmStatus { name })
                }
            })
            .post({
                let state = state.clone();
                |target, params, body| {
                    with_body(state, target, params, "name", body, |name, body| {
                        Operation::CreateVm { name, body }
                    })
                }
            }),
        ),
        (
            "/chains",
            get({
                let state = state.clone();
                |target| run(state, target, Operation::ListChains)
            }),
        ),
        (
            "/labels",
            get({
                let state = state.clone();
                |target| run(state, target, Operation::ListLabels)
            }),
        ),
        (
            "/metadata/{key}",
            get({
                let state = state.clone();
                |target, params| {
                    named(state, target, params, "key", |key| Operation::GetMetadata { key })
                }
            })
            .post({
                let state = state.clone();
                |target, params, body| {
                    with_body(state, target, params, "key", body, |key, body| {
                        Operation::SetMetadata { key, body }
                    })
                }
            })
            .put({
                let state = state.clone();
                |target, params, body| {
                    with_body(state, target, params, "key", body, |key, body| {
                        Operation::SetMetadata { key, body }
                    })
                }
            })
            .delete({
                let state = state.clone();
                |target, params| {
                    named(state, target, params, "key", |key| Operation::DeleteMetadata { key })
                }
            }),
        ),
    ]
}

/// The API router. Each endpoint is served both locally under `/v1` and through a chain under
/// `/v1/chain/{chain}`. Every route requires a bearer token.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new();
    for (path, route) in routes(&state) {
        router = router
            .route(&format!("/v1{path}"), route.clone())
            .route(&format!("{CHAIN_PREFIX}{{chain}}{path}"), route);
    }
    router.route_layer(middleware::from_fn_with_state(
        Arc::clone(&state.auth),
        authenticate,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bodies_are_null() {
        assert_eq!(parse_body(&Bytes::new()).unwrap(), Value::Null);
        assert_eq!(parse_body(&Bytes::from_static(b" \n")).unwrap(), Value::Null);
        assert_eq!(
            parse_body(&Bytes::from_static(b"{\"force\":true}")).unwrap()["force"],
            true
        );
        assert_eq!(
            parse_body(&Bytes::from_static(b"{oops")).unwrap_err().status().as_u16(),
            400
        );
    }
}
