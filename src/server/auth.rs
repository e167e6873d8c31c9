// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Bearer tokens: HS256 JWTs carrying an optional expiry and free-form metadata.

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    axum::{
        extract::{Request, State},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation},
    log::debug,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::{error::ApiError, remote::client::AUTH_HEADER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default)]
    pub metadata: Value,
}

pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenAuthority {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token. Without `expire` the token never expires.
    pub fn issue(
        &self,
        expire: Option<Duration>,
        metadata: Value,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let exp =
            expire.map(|expire| chrono::Utc::now().timestamp().max(0) as u64 + expire.as_secs());
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &Claims { exp, metadata },
            &self.encoding,
        )
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("rejected token: {e}");
                ApiError::unauthorized(format!("invalid token: {e}"))
            })
    }
}

/// Pull the token out of an `Authentication: Bearer <token>` header value.
pub fn bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Middleware rejecting every request without a valid token.
pub async fn authenticate(
    State(authority): State<Arc<TokenAuthority>>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer);

    let Some(token) = token else {
        return ApiError::unauthorized(format!("missing '{AUTH_HEADER}: Bearer' header"))
            .into_response();
    };

    match authority.verify(token) {
        Ok(_) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
