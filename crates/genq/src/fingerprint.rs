//! Task key derivation.
//!
//! A task key is the SHA-256 digest of a canonical encoding of the requester
//! identity and the normalized [`GenerationParams`]. Fields are written in a
//! fixed order, each preceded by a one-byte tag and its length, so no two
//! distinct inputs share an encoding and the key is reproducible across
//! processes and releases.

use crate::types::{GenerationParams, RequesterId, TaskKey};
use sha2::{Digest, Sha256};

/// Bumped whenever the canonical encoding changes.
const ENCODING_VERSION: u8 = 1;

/// Derives the task key for `(requester, params)`.
///
/// Pure: identical inputs always produce identical keys.
pub fn fingerprint(requester: &RequesterId, params: &GenerationParams) -> TaskKey {
    let mut hasher = Sha256::new();
    hasher.update([ENCODING_VERSION]);
    write_field(&mut hasher, b'r', requester.as_str().as_bytes());
    write_field(&mut hasher, b'p', params.prompt.as_bytes());
    write_field(&mut hasher, b'm', params.model.as_bytes());
    write_field(&mut hasher, b'w', &params.width.to_be_bytes());
    write_field(&mut hasher, b'h', &params.height.to_be_bytes());
    write_field(&mut hasher, b's', &params.steps.to_be_bytes());
    write_field(&mut hasher, b'n', &params.count.to_be_bytes());
    TaskKey::from_digest(hex::encode(hasher.finalize()))
}

fn write_field(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
