//! # Core Infrastructure Module
//!
//! Small building blocks shared by every stage of a sweep: cooperative
//! cancellation and deterministic content fingerprints.

pub mod cancel;
pub mod fingerprint;

pub use cancel::CancelToken;
pub use fingerprint::{fingerprint_json, sha256_hex};

/// Replace characters that are unsafe in file names with `_`.
/// Names made only of dots would walk the directory tree and become `_`.
pub fn path_safe(name: &str) -> String {
    if name.chars().all(|c| c == '.') {
        return "_".to_string();
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
