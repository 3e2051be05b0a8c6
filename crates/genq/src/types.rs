//! Shared data model: identities, task keys, generation parameters and cached
//! results.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Hex length of a [`TaskKey`] (SHA-256 digest).
pub const TASK_KEY_LEN: usize = 64;

pub const DEFAULT_MODEL: &str = "black-forest-labs/FLUX.1-schnell-Free";
pub const MAX_PROMPT_CHARS: usize = 2000;
pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 2048;
pub const MAX_STEPS: u32 = 50;
pub const MAX_IMAGES: u32 = 4;

/// Opaque, stable identity of the caller as returned by identity
/// verification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(String);

impl RequesterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-length fingerprint identifying one logical generation task.
///
/// The key doubles as the queue item identity and the cache key suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Wraps an already-computed lowercase hex digest.
    pub(crate) fn from_digest(hex: String) -> Self {
        debug_assert_eq!(hex.len(), TASK_KEY_LEN);
        Self(hex)
    }

    /// Parses a client-supplied key. Returns `None` unless the input is
    /// exactly [`TASK_KEY_LEN`] hex characters; uppercase is folded.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == TASK_KEY_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generation request as submitted by a client; every field but `prompt` is
/// optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub n: Option<u32>,
}

impl GenerationRequest {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Applies defaults and bounds, producing the canonical parameter set.
    ///
    /// Omitted fields and fields explicitly set to their default normalize
    /// identically, so both fingerprint to the same task key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a missing or oversized prompt and
    /// for out-of-range numeric fields.
    pub fn normalize(self, defaults: &ParamDefaults) -> Result<GenerationParams> {
        let prompt = self
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::validation("missing required field: prompt"))?;
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(Error::validation(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }

        let model = match self.model.as_deref().map(str::trim) {
            Some("") | None => defaults.model.clone(),
            Some(model) => model.to_string(),
        };
        let width = self.width.unwrap_or(defaults.width);
        let height = self.height.unwrap_or(defaults.height);
        let steps = self.steps.unwrap_or(defaults.steps);
        let count = self.n.unwrap_or(defaults.count);

        for (name, value) in [("width", width), ("height", height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) || value % 8 != 0 {
                return Err(Error::validation(format!(
                    "{name} must be a multiple of 8 between {MIN_DIMENSION} and {MAX_DIMENSION}"
                )));
            }
        }
        if !(1..=MAX_STEPS).contains(&steps) {
            return Err(Error::validation(format!(
                "steps must be between 1 and {MAX_STEPS}"
            )));
        }
        if !(1..=MAX_IMAGES).contains(&count) {
            return Err(Error::validation(format!(
                "n must be between 1 and {MAX_IMAGES}"
            )));
        }

        Ok(GenerationParams {
            prompt: prompt.to_string(),
            model,
            width,
            height,
            steps,
            count,
        })
    }
}

/// Values substituted for omitted request fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamDefaults {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub count: u32,
}

impl Default for ParamDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            width: 512,
            height: 512,
            steps: 10,
            count: 1,
        }
    }
}

/// Canonical generation parameters; the payload of every task record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub count: u32,
}

/// A successful generation, as stored in the result cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub task_key: TaskKey,
    /// Result URLs in provider order.
    pub urls: Vec<String>,
    pub params: GenerationParams,
    pub completed_at: DateTime<Utc>,
}
