//! BLAKE3 hashing of resource attribute snapshots.

use crate::core::types::{Attributes, ResourceKind};

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a kind plus its attribute snapshot.
///
/// Attributes serialize with sorted keys at every level, so equal snapshots
/// always hash equal regardless of how they were built.
pub fn hash_attributes(kind: ResourceKind, attributes: &Attributes) -> String {
    let canonical = serde_json::to_string(attributes).unwrap_or_default();
    composite_hash(&[&kind.to_string(), &canonical])
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
