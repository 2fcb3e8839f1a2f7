//! Payload fingerprints
//!
//! Jobs are deduplicated on `(kind, payload key)`. When the producer does not
//! name a key explicitly, the key is the SHA-256 of the payload's canonical
//! JSON encoding, with object keys sorted so logically equal payloads encode
//! identically.

use crate::error::Result;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of arbitrary bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable fingerprint of a JSON payload
pub fn payload_fingerprint(payload: &serde_json::Value) -> Result<String> {
    let encoded = serde_json::to_vec(&canonical(payload))?;
    Ok(sha256_hex(&encoded))
}

/// Rebuild objects with keys in sorted order, recursively
fn canonical(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
