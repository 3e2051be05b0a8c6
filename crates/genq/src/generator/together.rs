use super::{ImageGenerator, normalize_urls};
use crate::error::GeneratorError;
use crate::types::GenerationParams;
use async_trait::async_trait;
use core::time::Duration;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const GENERATIONS_PATH: &str = "/v1/images/generations";
const MAX_REASON_LEN: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TogetherConfig {
    /// Provider base URL, e.g. `https://api.together.xyz`.
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
}

/// Image generator backed by the Together images API.
#[derive(Clone, Debug)]
pub struct TogetherGenerator {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerationBody<'a> {
    model: &'a str,
    prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    n: u32,
}

#[derive(Deserialize)]
struct GenerationResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    #[serde(default)]
    url: Option<String>,
}

impl TogetherGenerator {
    /// # Errors
    ///
    /// Returns [`GeneratorError::Unavailable`] if the HTTP client cannot be
    /// built (e.g. no TLS backend).
    pub fn new(config: TogetherConfig) -> Result<Self, GeneratorError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GeneratorError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}{GENERATIONS_PATH}",
                config.base_url.trim_end_matches('/')
            ),
            api_key: config.api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ImageGenerator for TogetherGenerator {
    fn name(&self) -> &str {
        "together"
    }

    async fn generate(&self, params: &GenerationParams) -> Result<Vec<String>, GeneratorError> {
        let body = GenerationBody {
            model: &params.model,
            prompt: &params.prompt,
            width: params.width,
            height: params.height,
            steps: params.steps,
            n: params.count,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GeneratorError::Unavailable {
                reason: format!("request to {} failed: {e}", self.endpoint),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GeneratorError::Unavailable {
                reason: format!("failed reading response body: {e}"),
            })?;

        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }
        parse_urls(&text)
    }
}

/// Maps a non-success response to the failure taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> GeneratorError {
    let reason = error_message(body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        GeneratorError::Unavailable {
            reason: format!("provider returned {status}: {reason}"),
        }
    } else {
        GeneratorError::Rejected {
            status: status.as_u16(),
            reason,
        }
    }
}

/// Pulls a human-readable message out of an error body. Accepts
/// `{"error": "..."}`, `{"error": {"message": "..."}}` or falls back to the
/// raw (truncated) body.
fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        let error = v.get("error")?;
        error
            .as_str()
            .or_else(|| error.get("message").and_then(|m| m.as_str()))
            .map(str::to_string)
    });
    let message = message.unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        return "no response body".to_string();
    }
    message.chars().take(MAX_REASON_LEN).collect()
}

fn parse_urls(body: &str) -> Result<Vec<String>, GeneratorError> {
    let response: GenerationResponse =
        serde_json::from_str(body).map_err(|e| GeneratorError::Malformed {
            reason: e.to_string(),
        })?;
    normalize_urls(response.data.into_iter().filter_map(|image| image.url))
}
