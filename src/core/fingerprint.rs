//! Deterministic fingerprints used in cache keys and sweep metadata.
//!
//! `serde_json` serialises struct fields in declaration order and
//! `serde_json::Value` maps in sorted key order (no `preserve_order` feature),
//! so hashing `to_value` output gives a stable canonical digest.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::EvalResult;

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex-encoded SHA-256 of the canonical JSON form of `value`.
pub fn fingerprint_json<T: Serialize>(value: &T) -> EvalResult<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"qp": 32, "scale": 0.5});
        let b = json!({"scale": 0.5, "qp": 32});
        assert_eq!(fingerprint_json(&a).unwrap(), fingerprint_json(&b).unwrap());
    }

    #[test]
    fn values_change_the_digest() {
        let a = json!({"version": "12.0"});
        let b = json!({"version": "12.1"});
        assert_ne!(fingerprint_json(&a).unwrap(), fingerprint_json(&b).unwrap());
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
