//! # Video Coding for Machines Evaluation
//!
//! Rate-accuracy sweeps for codecs whose output is consumed by a
//! machine-vision model rather than a human viewer. Every sample of a dataset
//! is compressed at a list of operating points, reconstructed, run through a
//! detection model and scored; each operating point yields one
//! (bits-per-pixel, accuracy) pair.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - `codec`: the [`CodecAdapter`] capability with a learned in-process codec
//!   and an external reference binary driven as a subprocess
//! - `cache`: durable, content-addressed bitstream store shared across runs
//! - `transcode`: cache-aware encode/decode of one sample at one point
//! - `sweep`: the per-operating-point state machine and the resumable result file
//! - `conformance`: optional bitstream and reconstruction snapshots
//! - `dataset`, `vision`, `metrics`: the collaborator seams
//! - `config`: typed configuration, named bases and dotted overrides
//! - `core`: cancellation and fingerprinting helpers
//!
//! ## Features
//!
//! - **Deterministic caching**: keys cover codec identity, configuration
//!   fingerprint, sample and operating point; entries are written atomically
//! - **Crash resumability**: the result file is rewritten after every point
//! - **Failure isolation**: a failing sample costs one sample, a failing metric
//!   costs one point, only configuration and cancellation stop a sweep
//! - **Scoped subprocesses**: per-invocation temp dirs, timeouts and kill on cancel
//!
//! ## Example
//!
//! ```rust,no_run
//! use vcm_eval::{CancelToken, config, run_sweep};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = config::load("image-neural", None, &["codec.operating_points=[1,3,5]".into()])?;
//! let result = run_sweep(config, CancelToken::new())?;
//! print!("{}", result.summary_table());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod conformance;
pub mod core;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod sample;
pub mod sweep;
pub mod transcode;
pub mod vision;

/// Re-export error types for convenience
pub use error::{ErrorScope, ErrorSeverity, EvalError, EvalResult};

pub use cache::{BitstreamCache, CacheKey, ConflictPolicy};
pub use codec::{CodecAdapter, CodecIdentity, EncodedArtifact, OperatingPoint};
pub use config::EvalConfig;
pub use crate::core::CancelToken;
pub use sample::{Frame, Media, SampleHandle};
pub use sweep::{SweepOrchestrator, SweepResult};
pub use transcode::{RateMetric, SampleTranscoder, TranscodeResult};

/// Exit status: the sweep completed. Invalid entries are recorded in the
/// result file, not reported through the exit status.
pub const EXIT_OK: i32 = 0;
/// Exit status: unrecoverable error.
pub const EXIT_FATAL: i32 = 1;
/// Exit status: cancelled by signal.
pub const EXIT_CANCELLED: i32 = 130;

/// Run a complete sweep with every collaborator built from `config`.
///
/// Operating points already present in `config.misc.output` (same sweep
/// fingerprint) are skipped. The result file is rewritten after every point,
/// so an error or cancellation leaves a valid, resumable file behind.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration is invalid or the dataset cannot be opened
/// - The result file holds a different sweep
/// - The token is cancelled
/// - The result file cannot be written
///
/// Per-sample codec and inference failures are not errors; they are recorded
/// in the entry of the affected operating point.
///
/// # Performance Characteristics
///
/// **Time complexity**: O(points * samples) encode/decode/inference calls on a
/// cold cache, O(points * samples) decode/inference calls on a warm one.
///
/// **Missing functionality**: None
pub fn run_sweep(config: EvalConfig, cancel: CancelToken) -> EvalResult<SweepResult> {
    SweepOrchestrator::from_config(config, cancel)?.run()
}

/// Map a sweep outcome onto the process exit status.
pub fn exit_code(outcome: &EvalResult<SweepResult>) -> i32 {
    match outcome {
        Ok(_) => EXIT_OK,
        Err(EvalError::Cancelled { .. }) => EXIT_CANCELLED,
        Err(_) => EXIT_FATAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{EntryStatus, SweepEntry, SweepMeta};
    use std::collections::BTreeMap;

    fn result(statuses: Vec<EntryStatus>) -> SweepResult {
        let mut result = SweepResult::new(SweepMeta {
            sweep_fingerprint: "fp".into(),
            codec: "c".into(),
            codec_config_fingerprint: "f".into(),
            dataset: "d".into(),
            pipeline: "image".into(),
            evaluator: "coco-map".into(),
            criteria: "map".into(),
            rate_metric: RateMetric::MeanBpp,
            created_at_unix: 0,
        });
        for (i, status) in statuses.into_iter().enumerate() {
            result.entries.push(SweepEntry {
                operating_point: OperatingPoint::new(i as i64),
                label: format!("q{}", i),
                rate: 0.0,
                accuracy: None,
                breakdown: BTreeMap::new(),
                status,
                samples_total: 0,
                samples_ok: 0,
                cache_hits: 0,
                failures: Vec::new(),
                elapsed_secs: 0.0,
            });
        }
        result
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(result(vec![EntryStatus::Valid]))), EXIT_OK);
        let partial = result(vec![
            EntryStatus::Valid,
            EntryStatus::Invalid { reason: "empty prediction set".into() },
        ]);
        assert!(!partial.all_valid());
        assert_eq!(exit_code(&Ok(partial)), EXIT_OK);
        assert_eq!(exit_code(&Err(EvalError::cancelled("sweep"))), EXIT_CANCELLED);
        assert_eq!(
            exit_code(&Err(EvalError::config("dataset.root", "/nope", "missing"))),
            EXIT_FATAL
        );
    }
}
