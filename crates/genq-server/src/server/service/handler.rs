//! HTTP routes.
//!
//! - `GET /health` - Liveness check.
//! - `POST /images/generate` - Submits a generation request; answers `202`
//!   with the task key whether the task was enqueued, already queued, or
//!   already cached.
//! - `GET /images/{task_key}` - Task status for the requester that submitted
//!   it. Other requesters get `404`.
//!
//! Every route, including the fallback, first passes the per-client IP limit.

use crate::server::auth::Requester;
use crate::server::service::error::ApiError;
use crate::server::service::state::AppState;
use crate::server::telemetry;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, MatchedPath, Path, Request, State};
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use genq::{Error, GenerationRequest, TaskKey, TaskStatus};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Key used when the peer address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/images/generate", post(generate))
        .route("/images/{task_key}", get(task_status))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), limit_by_ip))
        .layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Service is healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn generate(
    State(state): State<AppState>,
    Requester(requester): Requester,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.draining.is_cancelled() {
        return Err(Error::ServiceShutdown.into());
    }
    if let Err(retry_after) = state.image_limiter.check(requester.as_str()) {
        tracing::warn!(requester = %requester, "Image rate limit exceeded");
        return Err(ApiError::image_rate_limited(retry_after));
    }
    let Json(request) = body.map_err(|e| Error::validation(e.body_text()))?;

    let submission = state.dispatcher.submit(&requester, request).await?;

    let (outcome, message) = if submission.cached {
        ("cached", "Image already generated")
    } else if submission.already_queued {
        ("already_queued", "Image generation already in progress")
    } else {
        ("enqueued", "Image generation task queued")
    };
    telemetry::record_submission(outcome);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "taskKey": submission.task_key,
            "cached": submission.cached,
            "alreadyQueued": submission.already_queued,
            "message": message,
        })),
    ))
}

async fn task_status(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(raw_key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = TaskKey::parse(&raw_key).ok_or_else(|| Error::validation("invalid task key"))?;

    let status = state.resolver.query(&requester, &key).await?;
    telemetry::record_status_query(status.name());

    let body = match status {
        TaskStatus::NotFound => return Err(ApiError::not_found("Task not found")),
        TaskStatus::Pending => json!({
            "success": true,
            "status": "pending",
            "message": "Task is waiting to be processed",
        }),
        TaskStatus::Processing { progress } => json!({
            "success": true,
            "status": "processing",
            "progress": progress,
        }),
        TaskStatus::Completed { result } => json!({
            "success": true,
            "status": "completed",
            "data": result.urls,
        }),
        TaskStatus::Failed { reason } => json!({
            "success": true,
            "status": "failed",
            "message": reason,
        }),
    };
    Ok(Json(body))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}

async fn limit_by_ip(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| UNKNOWN_CLIENT.to_string(), |ConnectInfo(addr)| addr.ip().to_string());
    if let Err(retry_after) = state.ip_limiter.check(&client) {
        tracing::warn!(client = %client, "Client rate limit exceeded");
        return Err(Error::RateLimited { retry_after }.into());
    }
    Ok(next.run(request).await)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let response = next.run(request).await;
    telemetry::record_request_duration(
        route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64() * 1000.0,
    );
    response
}
