// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The JSON shapes every API response takes.
//!
//! Both successful and failed responses carry `status_code` next to `message`, so automation
//! can branch on the code without parsing the message. Responses coming back from a peer are
//! kept as an [`ApiResponse`] and relayed verbatim.

use {
    axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
        Json,
    },
    serde_json::{json, Value},
};

/// A response body together with the status it is sent with.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    /// A 200 response whose `message` is `message`.
    pub fn ok(message: Value) -> Self {
        Self::new(
            StatusCode::OK,
            json!({
                "status_code": StatusCode::OK.as_u16(),
                "message": message,
            }),
        )
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The `message` member of the body, if there is one.
    pub fn message(&self) -> Option<&Value> {
        self.body.get("message")
    }

    /// Render the message as text, for errors that have to be reported as a string.
    pub fn message_text(&self) -> String {
        match self.message() {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => self.body.to_string(),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// An error that is reported to the API caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
    trace: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            trace: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Attach a trace. Only done when the API runs with `debug` enabled.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_response(&self) -> ApiResponse {
        let mut body = json!({
            "status_code": self.status.as_u16(),
            "message": self.message,
        });
        if let Some(trace) = &self.trace {
            body["trace"] = Value::String(trace.clone());
        }
        ApiResponse::new(self.status, body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.to_response().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_shape() {
        let response = ApiError::not_found("jail not found").to_response();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(
            response.body,
            json!({"status_code": 404, "message": "jail not found"})
        );
    }

    #[test]
    fn trace_only_when_attached() {
        let response = ApiError::internal("boom").with_trace("Io(..)").to_response();
        assert_eq!(response.body["trace"], "Io(..)");
        assert_eq!(response.message_text(), "boom");
    }

    #[test]
    fn ok_shape() {
        let response = ApiResponse::ok(json!({"job_id": 3}));
        assert!(response.is_success());
        assert_eq!(response.body["status_code"], 200);
        assert_eq!(response.message().unwrap()["job_id"], 3);
    }
}
