//! # Configuration Module
//!
//! Typed configuration for one rate-accuracy sweep. Every section rejects
//! unknown fields, so a typo in a base file or an override fails at startup with
//! a `ConfigurationError` instead of being silently ignored deep in the sweep.
//!
//! ## Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `pipeline` | `image` or `video` |
//! | `codec` | codec kind, operating points, conflict policy, per-codec options |
//! | `dataset` | dataset name, root directory, annotation file |
//! | `vision_model` | architecture identity and inference endpoint |
//! | `evaluator` | metric kind and headline criteria |
//! | `rate_metric` | `mean_bpp`, `total_bits_over_pixels` or `total_bits` |
//! | `misc` | device, worker count, cache root, result file |
//! | `conformance` | artifact snapshotting for external verification |
//!
//! ## Validation
//!
//! Validation is split in two. [`EvalConfig::validate`] checks value ranges and
//! internal consistency and never touches the file system.
//! [`EvalConfig::validate_environment`] checks that the dataset and external
//! binaries referenced by the configuration are actually present.
//!
//! ## Examples
//!
//! ```rust
//! use vcm_eval::config::config::{CodecKind, EvalConfig};
//!
//! let mut config = EvalConfig::default();
//! config.codec.kind = CodecKind::Neural;
//! config.codec.operating_points = vec![1, 2, 3];
//! assert!(config.validate().is_ok());
//!
//! config.codec.operating_points = vec![3, 3];
//! assert!(config.validate().is_err());
//! ```

// Standard library imports
use std::collections::HashSet;
use std::path::{Path, PathBuf};

// External crate imports
use serde::{Deserialize, Serialize};

// Internal module imports
use crate::cache::ConflictPolicy;
use crate::codec::neural::QUALITY_LEVELS;
use crate::codec::process::resolve_binary;
use crate::codec::template::{self, Placeholder};
use crate::core::fingerprint_json;
use crate::error::{EvalError, EvalResult};
use crate::transcode::RateMetric;

/// Kind of media the sweep evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Image,
    Video,
}

/// Which codec adapter drives the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Neural,
    External,
}

/// Metric collaborator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluatorKind {
    /// COCO-style mAP over IoU 0.50:0.05:0.95
    CocoMap,
    /// Average precision at IoU 0.5 only
    Ap50,
    /// Reconstruction PSNR against the source media
    Psnr,
}

/// Which aggregate becomes the headline accuracy score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criteria {
    Map,
    Map50,
    Map75,
    Psnr,
}

impl Criteria {
    pub fn key(&self) -> &'static str {
        match self {
            Criteria::Map => "map",
            Criteria::Map50 => "map50",
            Criteria::Map75 => "map75",
            Criteria::Psnr => "psnr",
        }
    }
}

/// Configuration of the in-process learned codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NeuralCodecConfig {
    /// Model family; selects the loader
    pub model: String,
    /// Model version, part of the codec identity
    pub version: String,
    /// Directory holding per-quality weights, when the model family needs them
    pub weights_dir: Option<PathBuf>,
}

impl Default for NeuralCodecConfig {
    fn default() -> Self {
        Self {
            model: "quantized-residual".to_string(),
            version: "1".to_string(),
            weights_dir: None,
        }
    }
}

/// Configuration of an external reference encoder/decoder pair.
///
/// Argument templates may use `{config}`, `{input}`, `{output}`, `{qp}`,
/// `{width}`, `{height}`, `{frames}` and `{fps}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExternalCodecConfig {
    /// Codec name, part of the codec identity
    pub name: String,
    /// Codec release, part of the codec identity
    pub version: String,
    /// Encoder executable (bare names are searched on `PATH`)
    pub encoder: PathBuf,
    /// Decoder executable
    pub decoder: PathBuf,
    /// Encoder configuration file passed through `{config}`
    pub config_file: Option<PathBuf>,
    pub encoder_args: Vec<String>,
    pub decoder_args: Vec<String>,
    /// Rescale factor applied before encoding and inverted after decoding
    pub scale: f64,
    /// Coded dimensions are rounded to a multiple of this
    pub align: u32,
    /// Frame rate reported to the encoder for video sequences
    pub frame_rate: u32,
    /// Per-invocation wall-clock limit
    pub timeout_secs: u64,
}

impl Default for ExternalCodecConfig {
    fn default() -> Self {
        Self {
            name: "vtm".to_string(),
            version: "12.0".to_string(),
            encoder: PathBuf::from("EncoderAppStatic"),
            decoder: PathBuf::from("DecoderAppStatic"),
            config_file: Some(PathBuf::from("cfg/encoder_intra_vtm.cfg")),
            encoder_args: [
                "-c", "{config}", "-i", "{input}", "-b", "{output}", "-q", "{qp}",
                "-wdt", "{width}", "-hgt", "{height}", "-f", "{frames}", "-fr", "{fps}",
                "--InputBitDepth=8", "--InputChromaFormat=420",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            decoder_args: ["-b", "{input}", "-o", "{output}", "-d", "8"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            scale: 1.0,
            align: 2,
            frame_rate: 30,
            timeout_secs: 600,
        }
    }
}

/// Codec selection and per-codec options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecConfig {
    pub kind: CodecKind,
    /// Evaluated in the order given
    pub operating_points: Vec<i64>,
    /// What to do when a cache entry already exists for a fresh encode
    pub conflict_policy: ConflictPolicy,
    pub neural: NeuralCodecConfig,
    pub external: ExternalCodecConfig,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            kind: CodecKind::Neural,
            operating_points: vec![1, 2, 3, 4, 5, 6],
            conflict_policy: ConflictPolicy::Reuse,
            neural: NeuralCodecConfig::default(),
            external: ExternalCodecConfig::default(),
        }
    }
}

/// Dataset location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: String,
    pub root: PathBuf,
    /// Annotation file; relative paths are resolved against `root`
    pub annotations: PathBuf,
    /// Evaluate only the first N samples
    pub limit: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "coco-val2017".to_string(),
            root: PathBuf::from("data/coco/val2017"),
            annotations: PathBuf::from("annotations.json"),
            limit: None,
        }
    }
}

impl DatasetConfig {
    pub fn annotations_path(&self) -> PathBuf {
        if self.annotations.is_absolute() {
            self.annotations.clone()
        } else {
            self.root.join(&self.annotations)
        }
    }
}

/// Vision model collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisionModelConfig {
    /// Architecture identity, e.g. `faster_rcnn_X_101_32x8d_FPN_3x`
    pub architecture: String,
    /// Inference endpoint URL
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Detections scoring below this are dropped
    pub score_threshold: f64,
}

impl Default for VisionModelConfig {
    fn default() -> Self {
        Self {
            architecture: "faster_rcnn_X_101_32x8d_FPN_3x".to_string(),
            endpoint: "http://127.0.0.1:8080/v1/detect".to_string(),
            timeout_secs: 60,
            score_threshold: 0.05,
        }
    }
}

/// Metric collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub kind: EvaluatorKind,
    pub criteria: Criteria,
    /// Emit per-category AP in the breakdown
    pub classwise: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            kind: EvaluatorKind::CocoMap,
            criteria: Criteria::Map,
            classwise: true,
        }
    }
}

/// Runtime options that do not change results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiscConfig {
    /// `cpu`, `cuda` or `cuda:N`; forwarded to the vision model
    pub device: String,
    /// Worker threads for the per-sample loop; 1 runs sequentially
    pub workers: usize,
    pub cache_root: PathBuf,
    /// Sweep result file, rewritten after every operating point
    pub output: PathBuf,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            workers: 1,
            cache_root: PathBuf::from("cache/bitstreams"),
            output: PathBuf::from("results/sweep.json"),
        }
    }
}

/// Conformance artifact recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConformanceConfig {
    pub enabled: bool,
    /// Record every Nth sample (by dataset index)
    pub every_nth: usize,
    pub dir: PathBuf,
    /// Also write PNG reconstructions next to the bitstreams
    pub record_reconstructions: bool,
}

impl Default for ConformanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every_nth: 10,
            dir: PathBuf::from("results/conformance"),
            record_reconstructions: true,
        }
    }
}

/// Complete sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalConfig {
    pub pipeline: PipelineKind,
    pub codec: CodecConfig,
    pub dataset: DatasetConfig,
    pub vision_model: VisionModelConfig,
    pub evaluator: EvaluatorConfig,
    pub rate_metric: RateMetric,
    pub misc: MiscConfig,
    pub conformance: ConformanceConfig,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineKind::Image,
            codec: CodecConfig::default(),
            dataset: DatasetConfig::default(),
            vision_model: VisionModelConfig::default(),
            evaluator: EvaluatorConfig::default(),
            rate_metric: RateMetric::MeanBpp,
            misc: MiscConfig::default(),
            conformance: ConformanceConfig::default(),
        }
    }
}

impl EvalConfig {
    /// Validates value ranges and internal consistency.
    ///
    /// Time complexity: O(n) in the number of operating points and argument
    /// templates.
    ///
    /// Missing functionality: None - environment checks live in
    /// [`EvalConfig::validate_environment`].
    pub fn validate(&self) -> EvalResult<()> {
        let points = &self.codec.operating_points;
        if points.is_empty() {
            return Err(EvalError::config(
                "codec.operating_points",
                "[]",
                "at least one operating point is required",
            ));
        }
        let mut seen = HashSet::new();
        for p in points {
            if !seen.insert(*p) {
                return Err(EvalError::config(
                    "codec.operating_points",
                    p.to_string(),
                    "duplicate operating point",
                ));
            }
        }

        match self.codec.kind {
            CodecKind::Neural => self.validate_neural()?,
            CodecKind::External => self.validate_external()?,
        }

        if self.dataset.name.trim().is_empty() {
            return Err(EvalError::config("dataset.name", "", "must not be empty"));
        }
        if self.vision_model.architecture.trim().is_empty() {
            return Err(EvalError::config(
                "vision_model.architecture",
                "",
                "must not be empty",
            ));
        }
        if self.vision_model.timeout_secs == 0 {
            return Err(EvalError::config(
                "vision_model.timeout_secs",
                "0",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.vision_model.score_threshold) {
            return Err(EvalError::config(
                "vision_model.score_threshold",
                self.vision_model.score_threshold.to_string(),
                "must be within [0, 1]",
            ));
        }
        if self.evaluator.kind == EvaluatorKind::Ap50 && self.evaluator.criteria != Criteria::Map50 {
            return Err(EvalError::config(
                "evaluator.criteria",
                self.evaluator.criteria.key(),
                "the ap50 evaluator only reports map50",
            ));
        }
        if (self.evaluator.kind == EvaluatorKind::Psnr) != (self.evaluator.criteria == Criteria::Psnr) {
            return Err(EvalError::config(
                "evaluator.criteria",
                self.evaluator.criteria.key(),
                "psnr criteria and the psnr evaluator go together",
            ));
        }
        if !valid_device(&self.misc.device) {
            return Err(EvalError::config(
                "misc.device",
                &self.misc.device,
                "expected cpu, cuda or cuda:N",
            ));
        }
        if self.misc.workers == 0 {
            return Err(EvalError::config("misc.workers", "0", "must be at least 1"));
        }
        if self.conformance.every_nth == 0 {
            return Err(EvalError::config(
                "conformance.every_nth",
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn validate_neural(&self) -> EvalResult<()> {
        if self.codec.neural.model != "quantized-residual" {
            return Err(EvalError::config(
                "codec.neural.model",
                &self.codec.neural.model,
                "unknown neural codec model",
            )
            .with_recovery_suggestion("use codec.neural.model=quantized-residual"));
        }
        if let Some(p) = self
            .codec
            .operating_points
            .iter()
            .find(|p| !QUALITY_LEVELS.contains(*p))
        {
            return Err(EvalError::config(
                "codec.operating_points",
                p.to_string(),
                format!(
                    "neural quality must be within {}..={}",
                    QUALITY_LEVELS.start(),
                    QUALITY_LEVELS.end()
                ),
            ));
        }
        Ok(())
    }

    fn validate_external(&self) -> EvalResult<()> {
        let ext = &self.codec.external;
        if ext.name.trim().is_empty() || ext.version.trim().is_empty() {
            return Err(EvalError::config(
                "codec.external.name",
                format!("{}-{}", ext.name, ext.version),
                "codec name and version are both required",
            ));
        }
        if !ext.scale.is_finite() || ext.scale <= 0.0 {
            return Err(EvalError::config(
                "codec.external.scale",
                ext.scale.to_string(),
                "scale factor must be positive",
            ));
        }
        if ext.align == 0 || ext.align % 2 != 0 {
            return Err(EvalError::config(
                "codec.external.align",
                ext.align.to_string(),
                "4:2:0 input needs an even alignment",
            ));
        }
        if ext.timeout_secs == 0 {
            return Err(EvalError::config(
                "codec.external.timeout_secs",
                "0",
                "must be greater than 0",
            ));
        }
        if ext.frame_rate == 0 {
            return Err(EvalError::config(
                "codec.external.frame_rate",
                "0",
                "must be greater than 0",
            ));
        }
        if let Some(p) = self.codec.operating_points.iter().find(|p| !(0..=63).contains(*p)) {
            return Err(EvalError::config(
                "codec.operating_points",
                p.to_string(),
                "quantization parameter must be within 0..=63",
            ));
        }
        for (field, args) in [
            ("codec.external.encoder_args", &ext.encoder_args),
            ("codec.external.decoder_args", &ext.decoder_args),
        ] {
            let used = template::placeholders(args)
                .map_err(|reason| EvalError::config(field, args.join(" "), reason))?;
            for required in [Placeholder::Input, Placeholder::Output] {
                if !used.contains(&required) {
                    return Err(EvalError::config(
                        field,
                        args.join(" "),
                        format!("missing {} placeholder", required.token()),
                    ));
                }
            }
            if used.contains(&Placeholder::Config) && ext.config_file.is_none() {
                return Err(EvalError::config(
                    field,
                    args.join(" "),
                    "{config} is used but codec.external.config_file is not set",
                ));
            }
        }
        Ok(())
    }

    /// Checks that everything the configuration points at exists.
    ///
    /// Returns every problem found rather than stopping at the first one so
    /// `check-deps` can print a complete report.
    pub fn validate_environment(&self) -> Vec<EvalError> {
        let mut problems = Vec::new();
        if !self.dataset.root.is_dir() {
            problems.push(
                EvalError::config(
                    "dataset.root",
                    self.dataset.root.display().to_string(),
                    "dataset root not found",
                )
                .with_recovery_suggestion("download the dataset or override dataset.root"),
            );
        }
        let annotations = self.dataset.annotations_path();
        if !annotations.is_file() {
            problems.push(EvalError::config(
                "dataset.annotations",
                annotations.display().to_string(),
                "annotation file not found",
            ));
        }
        if self.codec.kind == CodecKind::External {
            let ext = &self.codec.external;
            for (field, binary) in [
                ("codec.external.encoder", &ext.encoder),
                ("codec.external.decoder", &ext.decoder),
            ] {
                if resolve_binary(binary).is_none() {
                    problems.push(
                        EvalError::config(
                            field,
                            binary.display().to_string(),
                            "executable not found",
                        )
                        .with_recovery_suggestion("build the reference codec or put it on PATH"),
                    );
                }
            }
            if let Some(cfg) = &ext.config_file {
                if !cfg.is_file() {
                    problems.push(EvalError::config(
                        "codec.external.config_file",
                        cfg.display().to_string(),
                        "encoder configuration file not found",
                    ));
                }
            }
        }
        if let Some(dir) = &self.codec.neural.weights_dir {
            if self.codec.kind == CodecKind::Neural && !dir.is_dir() {
                problems.push(EvalError::config(
                    "codec.neural.weights_dir",
                    dir.display().to_string(),
                    "weights directory not found",
                ));
            }
        }
        problems
    }

    /// Fingerprint of everything that changes the meaning of a sweep result.
    ///
    /// The operating point list, conflict policy and runtime options are left
    /// out so a persisted sweep can be extended with more operating points or
    /// resumed with a different worker count. Timeouts, the inference endpoint
    /// and decoder arguments are left out as well.
    pub fn sweep_fingerprint(&self) -> EvalResult<String> {
        let codec_section = match self.codec.kind {
            CodecKind::Neural => serde_json::to_value(&self.codec.neural)?,
            CodecKind::External => {
                let ext = &self.codec.external;
                serde_json::json!({
                    "name": ext.name,
                    "version": ext.version,
                    "config_file": ext.config_file,
                    "encoder_args": ext.encoder_args,
                    "scale": ext.scale,
                    "align": ext.align,
                    "frame_rate": ext.frame_rate,
                })
            }
        };
        // Endpoint and timeouts only decide where and how long, never what.
        fingerprint_json(&serde_json::json!({
            "pipeline": self.pipeline,
            "codec_kind": self.codec.kind,
            "codec": codec_section,
            "dataset": self.dataset,
            "vision_model": {
                "architecture": self.vision_model.architecture,
                "score_threshold": self.vision_model.score_threshold,
            },
            "evaluator": self.evaluator,
            "rate_metric": self.rate_metric,
        }))
    }

    /// Directory that holds the sweep result file.
    pub fn output_dir(&self) -> &Path {
        self.misc.output.parent().unwrap_or_else(|| Path::new("."))
    }
}

fn valid_device(device: &str) -> bool {
    match device {
        "cpu" | "cuda" => true,
        other => other
            .strip_prefix("cuda:")
            .is_some_and(|n| n.parse::<u32>().is_ok()),
    }
}
