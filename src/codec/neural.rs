//! # Neural Codec Adapter
//!
//! In-process learned compression. A learned codec family ships one set of
//! parameters per quality level, so the adapter loads a model instance when an
//! operating point is prepared and drops it when the point is released. Encode
//! and decode run directly on in-memory frames: no subprocess and no temporary
//! files.
//!
//! Model failures are computation errors of the operating model and are never
//! retried.
//!
//! ## Payload layout
//!
//! One length-prefixed stream per frame:
//!
//! ```text
//! ┌────────────┬──────────────┬────────────┬──────────────┬───
//! │ len: u32le │ frame 0 bits │ len: u32le │ frame 1 bits │ ...
//! └────────────┴──────────────┴────────────┴──────────────┴───
//! ```
//!
//! Frame dimensions travel in the artifact's side information, not the payload.

// Standard library imports
use std::ops::RangeInclusive;

// External crate imports
use log::debug;
use vcm_scale::cpu::rgb_len;
use vcm_scale::presets::Size;

// Internal module imports
use super::{CodecAdapter, CodecIdentity, EncodedArtifact, OperatingPoint, SideInfo};
use crate::config::NeuralCodecConfig;
use crate::core::fingerprint_json;
use crate::error::{EvalError, EvalResult};
use crate::sample::{Frame, Media, SampleHandle};

/// Quality levels understood by the built-in model family.
pub const QUALITY_LEVELS: RangeInclusive<i64> = 1..=8;

/// Quantisation step per quality level, coarsest first. Level 8 is lossless.
const QUANT_STEPS: [u8; 8] = [40, 28, 20, 14, 10, 6, 3, 1];

const ZSTD_LEVEL: i32 = 19;

/// One loaded set of model parameters.
pub trait LearnedModel: Send + Sync {
    fn quality(&self) -> i64;

    /// Compress one frame into an opaque byte stream.
    fn compress(&self, frame: &Frame) -> EvalResult<Vec<u8>>;

    /// Reconstruct a frame of `size` from a stream produced by `compress`.
    fn decompress(&self, stream: &[u8], size: Size) -> EvalResult<Frame>;
}

/// Produces model instances for a quality level.
pub trait ModelLoader: Send + Sync {
    fn identity(&self) -> CodecIdentity;

    fn load(&self, quality: i64) -> EvalResult<Box<dyn LearnedModel>>;
}

/// Deterministic reference model: uniform quantisation, left-neighbour
/// residuals and zstd entropy coding.
///
/// Coarser steps collapse more residuals to zero, so the compressed size grows
/// with the quality level on natural content.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedResidualModel {
    quality: i64,
    step: u8,
}

impl QuantizedResidualModel {
    pub fn new(quality: i64) -> EvalResult<Self> {
        if !QUALITY_LEVELS.contains(&quality) {
            return Err(EvalError::codec(
                "quantized-residual",
                "load",
                format!("no parameters for quality {}", quality),
            ));
        }
        let step = QUANT_STEPS[(quality - QUALITY_LEVELS.start()) as usize];
        Ok(Self { quality, step })
    }

    fn quantize(&self, v: u8) -> u8 {
        let step = self.step as u16;
        ((v as u16 + step / 2) / step) as u8
    }

    fn dequantize(&self, q: u8) -> u8 {
        (q as u16 * self.step as u16).min(255) as u8
    }
}

impl LearnedModel for QuantizedResidualModel {
    fn quality(&self) -> i64 {
        self.quality
    }

    fn compress(&self, frame: &Frame) -> EvalResult<Vec<u8>> {
        let row = frame.size().w as usize * 3;
        let mut residuals = Vec::with_capacity(frame.data().len());
        for line in frame.data().chunks_exact(row) {
            let mut prev = [0u8; 3];
            for px in line.chunks_exact(3) {
                for c in 0..3 {
                    let q = self.quantize(px[c]);
                    residuals.push(q.wrapping_sub(prev[c]));
                    prev[c] = q;
                }
            }
        }
        zstd::bulk::compress(&residuals, ZSTD_LEVEL)
            .map_err(|e| EvalError::codec("quantized-residual", "encode", e.to_string()))
    }

    fn decompress(&self, stream: &[u8], size: Size) -> EvalResult<Frame> {
        if size.w == 0 || size.h == 0 {
            return Err(EvalError::codec(
                "quantized-residual",
                "decode",
                format!("cannot decode a {}x{} frame", size.w, size.h),
            ));
        }
        let expected = rgb_len(size);
        let residuals = zstd::bulk::decompress(stream, expected)
            .map_err(|e| EvalError::codec("quantized-residual", "decode", e.to_string()))?;
        if residuals.len() != expected {
            return Err(EvalError::codec(
                "quantized-residual",
                "decode",
                format!("stream holds {} samples, expected {}", residuals.len(), expected),
            ));
        }
        let row = size.w as usize * 3;
        let mut data = Vec::with_capacity(expected);
        for line in residuals.chunks_exact(row) {
            let mut prev = [0u8; 3];
            for px in line.chunks_exact(3) {
                for c in 0..3 {
                    let q = prev[c].wrapping_add(px[c]);
                    data.push(self.dequantize(q));
                    prev[c] = q;
                }
            }
        }
        Frame::new(size, data)
            .map_err(|e| EvalError::codec("quantized-residual", "decode", e.to_string()))
    }
}

/// Loader for the built-in model family.
#[derive(Debug, Clone)]
pub struct BuiltinLoader {
    version: String,
}

impl ModelLoader for BuiltinLoader {
    fn identity(&self) -> CodecIdentity {
        CodecIdentity::new("quantized-residual", &self.version)
    }

    fn load(&self, quality: i64) -> EvalResult<Box<dyn LearnedModel>> {
        Ok(Box::new(QuantizedResidualModel::new(quality)?))
    }
}

/// Codec adapter over a [`ModelLoader`].
pub struct NeuralCodecAdapter {
    identity: CodecIdentity,
    fingerprint: String,
    loader: Box<dyn ModelLoader>,
    loaded: Option<Box<dyn LearnedModel>>,
}

impl NeuralCodecAdapter {
    pub fn new(loader: Box<dyn ModelLoader>, fingerprint: String) -> Self {
        Self {
            identity: loader.identity(),
            fingerprint,
            loader,
            loaded: None,
        }
    }

    pub fn from_config(config: &NeuralCodecConfig) -> EvalResult<Self> {
        let loader: Box<dyn ModelLoader> = match config.model.as_str() {
            "quantized-residual" => Box::new(BuiltinLoader {
                version: config.version.clone(),
            }),
            other => {
                return Err(EvalError::config(
                    "codec.neural.model",
                    other,
                    "unknown neural codec model",
                ));
            }
        };
        Ok(Self::new(loader, fingerprint_json(config)?))
    }

    fn model_for(&self, op: OperatingPoint) -> EvalResult<&dyn LearnedModel> {
        match &self.loaded {
            Some(model) if model.quality() == op.value => Ok(model.as_ref()),
            _ => Err(EvalError::codec(
                self.identity.to_string(),
                "model",
                format!("no model loaded for quality {}", op.value),
            )
            .with_recovery_suggestion("call prepare() for the operating point first")),
        }
    }
}

impl CodecAdapter for NeuralCodecAdapter {
    fn identity(&self) -> &CodecIdentity {
        &self.identity
    }

    fn config_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn label(&self, op: OperatingPoint) -> String {
        format!("q{}", op.value)
    }

    fn prepare(&mut self, op: OperatingPoint) -> EvalResult<()> {
        if self.loaded.as_ref().is_some_and(|m| m.quality() == op.value) {
            return Ok(());
        }
        debug!("loading {} model for quality {}", self.identity, op.value);
        self.loaded = Some(self.loader.load(op.value)?);
        Ok(())
    }

    fn release(&mut self) {
        self.loaded = None;
    }

    fn encode(&self, sample: &SampleHandle, op: OperatingPoint) -> EvalResult<EncodedArtifact> {
        let model = self.model_for(op)?;
        let size = sample
            .frame_size()
            .map_err(|e| EvalError::codec(self.identity.to_string(), "encode", e.to_string()))?;
        let mut payload = Vec::new();
        for frame in &sample.media {
            let stream = model.compress(frame)?;
            payload.extend_from_slice(&(stream.len() as u32).to_le_bytes());
            payload.extend_from_slice(&stream);
        }
        Ok(EncodedArtifact::new(
            payload,
            self.identity.clone(),
            op,
            SideInfo {
                width: size.w,
                height: size.h,
                coded_width: size.w,
                coded_height: size.h,
                frames: sample.media.len() as u32,
                scale: 1.0,
            },
        ))
    }

    fn decode(&self, artifact: &EncodedArtifact) -> EvalResult<Media> {
        let model = self.model_for(artifact.operating_point())?;
        let side = &artifact.meta().side_info;
        let malformed = |reason: &str| {
            EvalError::codec(self.identity.to_string(), "decode", reason.to_string())
        };

        let mut rest = artifact.payload();
        let mut frames = Vec::with_capacity(side.frames as usize);
        for _ in 0..side.frames {
            if rest.len() < 4 {
                return Err(malformed("truncated frame header"));
            }
            let (len, tail) = rest.split_at(4);
            let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
            if tail.len() < len {
                return Err(malformed("truncated frame stream"));
            }
            let (stream, tail) = tail.split_at(len);
            frames.push(model.decompress(stream, side.coded())?);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(malformed("trailing bytes after last frame"));
        }
        Ok(frames)
    }
}
