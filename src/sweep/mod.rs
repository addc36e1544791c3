//! # Sweep Orchestration
//!
//! A sweep evaluates one codec configuration at a list of operating points
//! and produces one rate-accuracy pair per point.
//!
//! ## Architecture
//!
//! ```text
//! SweepOrchestrator
//!   └─ per operating point (sequential, configuration order)
//!        ├─ SampleTranscoder ──▶ CodecAdapter + BitstreamCache
//!        ├─ ConformanceRecorder (optional side channel)
//!        ├─ VisionModel ──▶ PredictionCollector
//!        ├─ MetricsAggregator (once, over the frozen PredictionSet)
//!        └─ SweepResult::persist (atomic rewrite)
//! ```
//!
//! Operating points never interleave. Samples inside one point may run on a
//! worker pool (`misc.workers > 1`); the collector and the cache are the only
//! shared state and both tolerate concurrent writers.
//!
//! ## Resuming
//!
//! The result file carries a fingerprint of every configuration input that
//! changes the meaning of an entry. Re-running with the same configuration
//! skips points already in the file, including invalid ones; a different
//! fingerprint is refused.

pub mod orchestrator;
pub mod result;
pub mod state;

pub use orchestrator::{SweepOrchestrator, SweepOrchestratorBuilder};
pub use result::{EntryStatus, SampleFailure, SweepEntry, SweepMeta, SweepResult};
pub use state::OperatingPointState;
