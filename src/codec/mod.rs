//! # Codec Adapters
//!
//! One capability, two very different backends:
//!
//! - [`neural::NeuralCodecAdapter`] runs a learned compression model in process.
//!   The model depends on the operating point, so it is loaded once per point
//!   in [`CodecAdapter::prepare`].
//! - [`external::ExternalCodecAdapter`] drives a reference encoder/decoder
//!   binary pair through raw YUV files in a scoped temporary directory.
//!
//! ## Architecture
//!
//! ```text
//! SampleHandle ──encode──▶ EncodedArtifact ──decode──▶ Media (reconstruction)
//!                               │
//!                               └──▶ BitstreamCache (keyed by identity,
//!                                    config fingerprint, sample, point)
//! ```
//!
//! Both operations must be deterministic for a fixed sample, operating point
//! and configuration: equal inputs give bit-identical artifacts. That property
//! is what makes the bitstream cache sound.

pub mod external;
pub mod neural;
pub mod process;
pub mod template;

// Standard library imports
use std::fmt;
use std::sync::Arc;

// External crate imports
use serde::{Deserialize, Serialize};
use vcm_scale::presets::Size;

// Internal module imports
use crate::config::{CodecKind, EvalConfig};
use crate::core::CancelToken;
use crate::error::{EvalError, EvalResult};
use crate::sample::{Media, SampleHandle};

/// Codec-specific quality setting: a quality level for the neural codec, a
/// quantization parameter for the external one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatingPoint {
    pub value: i64,
}

impl OperatingPoint {
    pub const fn new(value: i64) -> Self {
        Self { value }
    }
}

impl fmt::Display for OperatingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Name and version of a codec implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecIdentity {
    pub name: String,
    pub version: String,
}

impl CodecIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// `name-version`, safe to use as a directory name.
    pub fn slug(&self) -> String {
        crate::core::path_safe(&format!("{}-{}", self.name, self.version))
    }
}

impl fmt::Display for CodecIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// Auxiliary information needed to turn a payload back into a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideInfo {
    pub width: u32,
    pub height: u32,
    /// Resolution actually handed to the codec
    pub coded_width: u32,
    pub coded_height: u32,
    pub frames: u32,
    /// Rescale factor applied before encoding
    pub scale: f64,
}

impl SideInfo {
    pub fn original(&self) -> Size {
        Size {
            w: self.width,
            h: self.height,
        }
    }

    pub fn coded(&self) -> Size {
        Size {
            w: self.coded_width,
            h: self.coded_height,
        }
    }
}

/// Everything about an artifact except its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub codec: CodecIdentity,
    pub operating_point: OperatingPoint,
    pub size_bits: u64,
    pub side_info: SideInfo,
}

/// Immutable encoder output. Cloning shares the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedArtifact {
    payload: Arc<[u8]>,
    meta: ArtifactMeta,
}

impl EncodedArtifact {
    pub fn new(
        payload: Vec<u8>,
        codec: CodecIdentity,
        operating_point: OperatingPoint,
        side_info: SideInfo,
    ) -> Self {
        let size_bits = payload.len() as u64 * 8;
        Self {
            payload: payload.into(),
            meta: ArtifactMeta {
                codec,
                operating_point,
                size_bits,
                side_info,
            },
        }
    }

    /// Rebuild an artifact read back from storage, checking the recorded size.
    pub fn from_parts(payload: Vec<u8>, meta: ArtifactMeta) -> EvalResult<Self> {
        let actual = payload.len() as u64 * 8;
        if actual != meta.size_bits {
            return Err(EvalError::codec(
                meta.codec.to_string(),
                "load",
                format!(
                    "payload holds {} bits but metadata records {}",
                    actual, meta.size_bits
                ),
            ));
        }
        Ok(Self {
            payload: payload.into(),
            meta,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn meta(&self) -> &ArtifactMeta {
        &self.meta
    }

    pub fn size_bits(&self) -> u64 {
        self.meta.size_bits
    }

    pub fn operating_point(&self) -> OperatingPoint {
        self.meta.operating_point
    }
}

/// Encode/decode capability shared by every codec backend.
pub trait CodecAdapter: Send + Sync {
    fn identity(&self) -> &CodecIdentity;

    /// Hex digest over every configuration input that changes the bitstream.
    fn config_fingerprint(&self) -> &str;

    /// Human-facing operating point label, e.g. `q3` or `qp32`.
    fn label(&self, op: OperatingPoint) -> String;

    /// Select the operating point about to be swept. Called once per point,
    /// before any `encode`/`decode` for it.
    fn prepare(&mut self, _op: OperatingPoint) -> EvalResult<()> {
        Ok(())
    }

    /// Drop per-operating-point state once a point is persisted.
    fn release(&mut self) {}

    fn encode(&self, sample: &SampleHandle, op: OperatingPoint) -> EvalResult<EncodedArtifact>;

    fn decode(&self, artifact: &EncodedArtifact) -> EvalResult<Media>;
}

/// Build the adapter selected by `config.codec.kind`.
pub fn build_adapter(config: &EvalConfig, cancel: CancelToken) -> EvalResult<Box<dyn CodecAdapter>> {
    Ok(match config.codec.kind {
        CodecKind::Neural => Box::new(neural::NeuralCodecAdapter::from_config(&config.codec.neural)?),
        CodecKind::External => Box::new(external::ExternalCodecAdapter::new(
            &config.codec.external,
            cancel,
        )?),
    })
}
