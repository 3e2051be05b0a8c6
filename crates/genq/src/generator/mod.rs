//! External image generator contract and providers.
//!
//! The generator is a black box: given normalized parameters it returns the
//! result URLs in provider order, or a [`GeneratorError`] classifying the
//! failure as retryable or not.
//!
//! ## Structure
//!
//! - [`together`] - HTTP provider ([`TogetherGenerator`]).
//! - [`dryrun`] - Offline provider returning placeholder URLs
//!   ([`DryRunGenerator`]).

mod dryrun;
mod together;

pub use dryrun::DryRunGenerator;
pub use together::{TogetherConfig, TogetherGenerator};

use crate::error::GeneratorError;
use crate::types::GenerationParams;
use async_trait::async_trait;

#[async_trait]
pub trait ImageGenerator: Send + Sync + 'static {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Generates `params.count` images and returns their URLs.
    ///
    /// Implementations need not enforce a deadline; the worker pool bounds
    /// every invocation with its own timeout.
    async fn generate(&self, params: &GenerationParams) -> Result<Vec<String>, GeneratorError>;
}

/// Drops blank entries and surrounding whitespace from provider URLs,
/// preserving order.
///
/// # Errors
///
/// Returns [`GeneratorError::Empty`] if nothing usable remains.
pub fn normalize_urls<I>(urls: I) -> Result<Vec<String>, GeneratorError>
where
    I: IntoIterator<Item = String>,
{
    let urls: Vec<String> = urls
        .into_iter()
        .filter_map(|url| {
            let trimmed = url.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect();
    if urls.is_empty() {
        return Err(GeneratorError::Empty);
    }
    Ok(urls)
}
