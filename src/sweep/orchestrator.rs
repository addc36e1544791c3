//! Operating point loop.
//!
//! For each operating point in configuration order:
//!
//! 1. `prepare` the codec adapter (the neural codec loads its model here),
//! 2. for every sample: load, transcode, snapshot, infer, register,
//! 3. score the frozen [`PredictionSet`] once,
//! 4. aggregate the rate of the samples that made it through,
//! 5. append the entry and atomically rewrite the result file,
//! 6. `release` the adapter and drop the prediction collection.
//!
//! Per-sample failures are recorded in the entry and the sample is skipped.
//! A metric failure (including a point where no sample survived) persists an
//! invalid entry and the sweep moves on. Configuration, dataset and
//! cancellation errors stop the sweep; whatever was persisted before stays
//! valid and resumable.

// Standard library imports
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

// External crate imports
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

// Internal module imports
use crate::cache::BitstreamCache;
use crate::codec::{CodecAdapter, OperatingPoint, build_adapter};
use crate::config::{EvalConfig, PipelineKind};
use crate::conformance::ConformanceRecorder;
use crate::core::CancelToken;
use crate::dataset::{AnnotatedImageFolder, Dataset};
use crate::error::{EvalError, EvalResult, classify};
use crate::metrics::{MetricsAggregator, build_evaluator};
use crate::sweep::result::{EntryStatus, SampleFailure, SweepEntry, SweepMeta, SweepResult};
use crate::sweep::state::OperatingPointState;
use crate::transcode::SampleTranscoder;
use crate::vision::{HttpVisionModel, PredictionCollector, PredictionSet, VisionModel};

/// What one successful sample contributes to the rate axis.
#[derive(Debug, Clone, Copy)]
struct SampleRate {
    bits: u64,
    pixels: u64,
    cache_hit: bool,
}

/// Outer `Err` stops the sweep, inner `Err` skips the sample.
type SampleOutcome = EvalResult<Result<SampleRate, SampleFailure>>;

/// Drives a full rate-accuracy sweep.
pub struct SweepOrchestrator {
    config: EvalConfig,
    dataset: Box<dyn Dataset>,
    codec: Box<dyn CodecAdapter>,
    vision: Box<dyn VisionModel>,
    evaluator: Box<dyn MetricsAggregator>,
    transcoder: SampleTranscoder,
    conformance: Option<ConformanceRecorder>,
    cancel: CancelToken,
    pool: Option<ThreadPool>,
    states: BTreeMap<OperatingPoint, OperatingPointState>,
}

impl SweepOrchestrator {
    pub fn builder(config: EvalConfig) -> SweepOrchestratorBuilder {
        SweepOrchestratorBuilder::new(config)
    }

    /// Everything built from configuration.
    pub fn from_config(config: EvalConfig, cancel: CancelToken) -> EvalResult<Self> {
        Self::builder(config).with_cancel_token(cancel).build()
    }

    pub fn states(&self) -> &BTreeMap<OperatingPoint, OperatingPointState> {
        &self.states
    }

    pub fn output_path(&self) -> &Path {
        &self.config.misc.output
    }

    pub fn cache(&self) -> &BitstreamCache {
        self.transcoder.cache()
    }

    fn meta(&self) -> EvalResult<SweepMeta> {
        Ok(SweepMeta {
            sweep_fingerprint: self.config.sweep_fingerprint()?,
            codec: self.codec.identity().to_string(),
            codec_config_fingerprint: self.codec.config_fingerprint().to_string(),
            dataset: self.dataset.name().to_string(),
            pipeline: match self.config.pipeline {
                PipelineKind::Image => "image",
                PipelineKind::Video => "video",
            }
            .to_string(),
            evaluator: self.evaluator.name().to_string(),
            criteria: self.config.evaluator.criteria.key().to_string(),
            rate_metric: self.config.rate_metric,
            created_at_unix: SweepMeta::now_unix(),
        })
    }

    fn set_state(&mut self, op: OperatingPoint, to: OperatingPointState) -> EvalResult<()> {
        self.states
            .entry(op)
            .or_insert(OperatingPointState::Pending)
            .advance(to)
    }

    /// Run every operating point not yet in the result file.
    pub fn run(&mut self) -> EvalResult<SweepResult> {
        let output = self.config.misc.output.clone();
        let mut result = SweepResult::resume_or_new(&output, self.meta()?)?;
        let points: Vec<OperatingPoint> = self
            .config
            .codec
            .operating_points
            .iter()
            .map(|&v| OperatingPoint::new(v))
            .collect();

        self.states.clear();
        for &op in &points {
            let state = if result.entry(op).is_some() {
                OperatingPointState::Persisted
            } else {
                OperatingPointState::Pending
            };
            self.states.insert(op, state);
        }
        if self.dataset.is_empty() {
            warn!("Dataset {} is empty; every operating point will be invalid", self.dataset.name());
        }
        info!(
            "Sweep {} over {} ({} samples, {} points, {} already persisted)",
            self.codec.identity(),
            self.dataset.name(),
            self.dataset.len(),
            points.len(),
            result.entries.len()
        );

        for op in points {
            let label = self.codec.label(op);
            if self.states.get(&op).is_some_and(|s| s.is_terminal()) {
                info!("{}: already persisted, skipping", label);
                continue;
            }
            self.cancel.check("sweep")?;

            let outcome = self.run_point(op, &label);
            self.codec.release();
            let entry = outcome?;
            info!(
                "{}: rate {:.6} {}, accuracy {}{}",
                label,
                entry.rate,
                self.config.rate_metric.unit(),
                entry
                    .accuracy
                    .map(|a| format!("{:.4}", a))
                    .unwrap_or_else(|| "n/a".to_string()),
                if entry.is_valid() { "" } else { " (invalid)" }
            );
            result.entries.push(entry);
            result.persist(&output)?;
            self.set_state(op, OperatingPointState::Persisted)?;
        }
        Ok(result)
    }

    fn run_point(&mut self, op: OperatingPoint, label: &str) -> EvalResult<SweepEntry> {
        let started = Instant::now();
        self.set_state(op, OperatingPointState::EncodingEvaluating)?;
        info!("{}: encoding and evaluating", label);

        if let Err(e) = self.codec.prepare(op) {
            let e = e.with_operating_point(label);
            if classify::is_fatal(&e) {
                return Err(e);
            }
            error!("{}", e);
            self.set_state(op, OperatingPointState::Aggregated)?;
            return Ok(SweepEntry {
                operating_point: op,
                label: label.to_string(),
                rate: 0.0,
                accuracy: None,
                breakdown: BTreeMap::new(),
                status: EntryStatus::Invalid {
                    reason: format!("codec could not be prepared: {}", e),
                },
                samples_total: self.dataset.len(),
                samples_ok: 0,
                cache_hits: 0,
                failures: Vec::new(),
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        let collector = PredictionCollector::new();
        let outcomes = self.process_samples(op, label, &collector)?;
        let predictions = collector.finish();

        let mut rates = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        let mut cache_hits = 0;
        for outcome in outcomes {
            match outcome {
                Ok(rate) => {
                    cache_hits += usize::from(rate.cache_hit);
                    rates.push((rate.bits, rate.pixels));
                }
                Err(failure) => failures.push(failure),
            }
        }

        let (accuracy, breakdown, status) = match self.score(&predictions) {
            Ok(report) => (Some(report.score), report.breakdown, EntryStatus::Valid),
            Err(e) => {
                let e = e.with_operating_point(label);
                if classify::is_fatal(&e) {
                    return Err(e);
                }
                error!("{}", e);
                (None, BTreeMap::new(), EntryStatus::Invalid { reason: e.to_string() })
            }
        };
        self.set_state(op, OperatingPointState::Aggregated)?;

        Ok(SweepEntry {
            operating_point: op,
            label: label.to_string(),
            rate: self.config.rate_metric.aggregate(&rates),
            accuracy,
            breakdown,
            status,
            samples_total: self.dataset.len(),
            samples_ok: rates.len(),
            cache_hits,
            failures,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn score(&self, predictions: &PredictionSet) -> EvalResult<crate::metrics::AccuracyReport> {
        if predictions.is_empty() {
            return Err(EvalError::metric(
                self.evaluator.name(),
                "no sample survived this operating point",
            ));
        }
        debug!(
            "Scoring {} predictions ({} detections)",
            predictions.len(),
            predictions.detection_count()
        );
        self.evaluator.evaluate(predictions)
    }

    /// Results in dataset order, serially or on the worker pool.
    fn process_samples(
        &self,
        op: OperatingPoint,
        label: &str,
        collector: &PredictionCollector,
    ) -> EvalResult<Vec<Result<SampleRate, SampleFailure>>> {
        let n = self.dataset.len();
        match &self.pool {
            Some(pool) => pool.install(|| {
                (0..n)
                    .into_par_iter()
                    .map(|i| self.process_sample(i, op, label, collector))
                    .collect()
            }),
            None => (0..n)
                .map(|i| self.process_sample(i, op, label, collector))
                .collect(),
        }
    }

    fn process_sample(
        &self,
        index: usize,
        op: OperatingPoint,
        label: &str,
        collector: &PredictionCollector,
    ) -> SampleOutcome {
        self.cancel.check("sample loop")?;
        let sample = match self.dataset.load(index) {
            Ok(sample) => sample,
            Err(e) => return skip(e, &format!("#{}", index), "load", label),
        };
        let result = match self.transcoder.transcode(&sample, op, self.codec.as_ref()) {
            Ok(result) => result,
            Err(e) => return skip(e, &sample.id, "transcode", label),
        };
        if let Some(recorder) = &self.conformance {
            recorder.record(&sample, label, &result);
        }
        let detections = match self.vision.infer(&sample, &result.reconstruction) {
            Ok(detections) => detections,
            Err(e) => {
                let e = e.with_sample(&sample.id);
                return skip(e, &sample.id, "inference", label);
            }
        };
        debug!("{} {}: {} detections", sample.id, label, detections.len());
        collector.register(&sample, &result.reconstruction, detections);
        Ok(Ok(SampleRate {
            bits: result.bits,
            pixels: result.pixels,
            cache_hit: result.cache_hit,
        }))
    }
}

/// Record a per-sample failure, or hand a fatal error back up.
fn skip(e: EvalError, sample_id: &str, stage: &str, label: &str) -> SampleOutcome {
    if classify::is_fatal(&e) {
        return Err(e);
    }
    error!("{} {} failed at {}: {}", sample_id, label, stage, e);
    if let EvalError::Codec {
        stderr: Some(stderr),
        ..
    } = &e
    {
        debug!("{} {} stderr:\n{}", sample_id, label, stderr);
    }
    Ok(Err(SampleFailure {
        sample_id: sample_id.to_string(),
        stage: stage.to_string(),
        category: e.category().to_string(),
        message: e.to_string(),
    }))
}

/// Assembles a [`SweepOrchestrator`]. Components not supplied are built from
/// the configuration.
pub struct SweepOrchestratorBuilder {
    config: EvalConfig,
    dataset: Option<Box<dyn Dataset>>,
    codec: Option<Box<dyn CodecAdapter>>,
    vision: Option<Box<dyn VisionModel>>,
    evaluator: Option<Box<dyn MetricsAggregator>>,
    cancel: CancelToken,
}

impl SweepOrchestratorBuilder {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            config,
            dataset: None,
            codec: None,
            vision: None,
            evaluator: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_dataset<D: Dataset + 'static>(mut self, dataset: D) -> Self {
        self.dataset = Some(Box::new(dataset));
        self
    }

    pub fn with_codec(mut self, codec: Box<dyn CodecAdapter>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_vision_model<V: VisionModel + 'static>(mut self, vision: V) -> Self {
        self.vision = Some(Box::new(vision));
        self
    }

    pub fn with_evaluator<M: MetricsAggregator + 'static>(mut self, evaluator: M) -> Self {
        self.evaluator = Some(Box::new(evaluator));
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> EvalResult<SweepOrchestrator> {
        let config = self.config;
        config.validate()?;

        let dataset = match self.dataset {
            Some(d) => d,
            None => Box::new(AnnotatedImageFolder::open(&config.dataset, config.pipeline)?),
        };
        let codec = match self.codec {
            Some(c) => c,
            None => build_adapter(&config, self.cancel.clone())?,
        };
        let vision = match self.vision {
            Some(v) => v,
            None => Box::new(HttpVisionModel::new(&config.vision_model, &config.misc.device)?),
        };
        let evaluator = self.evaluator.unwrap_or_else(|| build_evaluator(&config.evaluator));

        let pool = if config.misc.workers > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.misc.workers)
                .thread_name(|i| format!("vcm-worker-{}", i))
                .build()
                .map_err(|e| EvalError::external("rayon", e))?;
            Some(pool)
        } else {
            None
        };

        Ok(SweepOrchestrator {
            transcoder: SampleTranscoder::new(BitstreamCache::new(
                &config.misc.cache_root,
                config.codec.conflict_policy,
            )),
            conformance: ConformanceRecorder::from_config(&config.conformance),
            dataset,
            codec,
            vision,
            evaluator,
            cancel: self.cancel,
            pool,
            states: BTreeMap::new(),
            config,
        })
    }
}
