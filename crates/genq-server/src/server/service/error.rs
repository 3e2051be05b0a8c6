//! HTTP error responses.
//!
//! Every failure leaves the server as
//! `{"success": false, "error": {"code": ..., "message": ...}}` with the
//! status code of its class. Rate-limit rejections also carry `Retry-After`.

use crate::server::telemetry;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use core::time::Duration;
use genq::Error;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Per-client request limit exceeded.
    fn rate_limited(retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                "Too many requests, please try again later",
            )
        }
    }

    /// Per-requester request limit exceeded.
    pub fn user_rate_limited(retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "USER_RATE_LIMIT_EXCEEDED",
                "Too many requests from this user, please try again later",
            )
        }
    }

    /// Generation submission limit exceeded.
    pub fn image_rate_limited(retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "IMAGE_RATE_LIMIT_EXCEEDED",
                "Too many image generation requests, please try again later",
            )
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation { reason } => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", reason)
            }
            Error::Unauthorized { reason } => {
                Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", reason)
            }
            Error::RateLimited { retry_after } => Self::rate_limited(retry_after),
            Error::DependencyUnavailable { context } => {
                tracing::error!("Dependency unavailable: {context}");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DEPENDENCY_UNAVAILABLE",
                    "A backing service is unavailable, please retry",
                )
            }
            Error::Generator(e) => {
                Self::new(StatusCode::BAD_GATEWAY, "GENERATOR_ERROR", e.to_string())
            }
            Error::NotFound => Self::not_found("Task not found"),
            Error::ServiceShutdown => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_SHUTDOWN",
                "Service is shutting down",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        telemetry::record_rejection(self.code);
        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
