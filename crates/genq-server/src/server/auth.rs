//! Requester identity.
//!
//! Handlers receive the caller as a [`Requester`], extracted from an
//! `Authorization: Bearer <token>` header and resolved through the configured
//! [`IdentityVerifier`]. Extraction also applies the per-requester request
//! limit.

use crate::server::service::error::ApiError;
use crate::server::service::state::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use core::time::Duration;
use genq::{Error, RequesterId, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;

/// Resolves a bearer credential to a stable requester identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] if the token is not accepted.
    /// - [`Error::DependencyUnavailable`] if the identity source cannot be
    ///   reached.
    async fn verify(&self, token: &str) -> Result<RequesterId>;
}

/// Verifier backed by a fixed token table.
#[derive(Debug, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, RequesterId>,
}

impl StaticTokenVerifier {
    pub const fn new(tokens: HashMap<String, RequesterId>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<RequesterId> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::unauthorized("Invalid authentication token"))
    }
}

/// Verifier that asks a remote user endpoint (e.g. `GET /auth/v1/user`) who
/// the bearer is. The endpoint answers `200 {"id": ...}` for valid tokens.
#[derive(Debug, Clone)]
pub struct RemoteVerifier {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct RemoteUser {
    id: String,
}

impl RemoteVerifier {
    /// # Errors
    ///
    /// Returns [`Error::DependencyUnavailable`] if the HTTP client cannot be
    /// built.
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DependencyUnavailable {
                context: format!("failed to build identity client: {e}"),
            })?;
        Ok(Self { http, url, api_key })
    }
}

#[async_trait]
impl IdentityVerifier for RemoteVerifier {
    async fn verify(&self, token: &str) -> Result<RequesterId> {
        let mut request = self.http.get(&self.url).bearer_auth(token);
        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key);
        }

        let response = request.send().await.map_err(|e| Error::DependencyUnavailable {
            context: format!("identity endpoint unreachable: {e}"),
        })?;

        match response.status() {
            status if status.is_success() => {
                let user: RemoteUser =
                    response
                        .json()
                        .await
                        .map_err(|e| Error::DependencyUnavailable {
                            context: format!("identity endpoint returned invalid body: {e}"),
                        })?;
                if user.id.trim().is_empty() {
                    return Err(Error::unauthorized("Invalid authentication token"));
                }
                Ok(RequesterId::new(user.id))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Error::unauthorized("Invalid authentication token"))
            }
            status => Err(Error::DependencyUnavailable {
                context: format!("identity endpoint returned {status}"),
            }),
        }
    }
}

/// Extracts the bearer token from an `Authorization` header value.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Requester(pub RequesterId);

impl FromRequestParts<AppState> for Requester {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> core::result::Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| Error::unauthorized("Missing authentication token"))?;

        let requester = state.verifier.verify(token).await?;

        if let Err(retry_after) = state.user_limiter.check(requester.as_str()) {
            tracing::warn!(requester = %requester, "User rate limit exceeded");
            return Err(ApiError::user_rate_limited(retry_after));
        }

        Ok(Self(requester))
    }
}
