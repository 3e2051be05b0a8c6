use super::ImageGenerator;
use crate::error::GeneratorError;
use crate::types::GenerationParams;
use async_trait::async_trait;
use core::time::Duration;
use sha2::{Digest, Sha256};

/// Offline generator for local runs.
///
/// Returns `count` placeholder URLs derived from the parameters, so identical
/// parameters always yield identical URLs. An optional latency simulates a
/// slow provider.
#[derive(Clone, Debug, Default)]
pub struct DryRunGenerator {
    base_url: String,
    latency: Duration,
}

impl DryRunGenerator {
    pub fn new(base_url: impl Into<String>, latency: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            latency,
        }
    }
}

#[async_trait]
impl ImageGenerator for DryRunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, params: &GenerationParams) -> Result<Vec<String>, GeneratorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let digest = Sha256::digest(format!(
            "{}|{}|{}x{}|{}",
            params.model, params.prompt, params.width, params.height, params.steps
        ));
        let stem = hex::encode(&digest[..8]);
        Ok((0..params.count)
            .map(|i| format!("{}/{stem}-{i}.png", self.base_url))
            .collect())
    }
}
