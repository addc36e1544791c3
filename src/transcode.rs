//! # Sample Transcoder
//!
//! The unit of work repeated across a sweep: one sample at one operating point.
//!
//! 1. derive the [`CacheKey`] from the adapter identity, its configuration
//!    fingerprint, the sample identity and the operating point,
//! 2. ask the [`BitstreamCache`] for an existing artifact (reuse policy only),
//! 3. on a miss, encode and store,
//! 4. always decode, cache hit or not, so the reconstruction is a function of
//!    the artifact alone and cache state is unobservable in the result,
//! 5. measure the rate from the artifact size and the sample's pixel count.

// External crate imports
use log::debug;
use serde::{Deserialize, Serialize};

// Internal module imports
use crate::cache::{BitstreamCache, CacheKey, ConflictPolicy};
use crate::codec::{CodecAdapter, EncodedArtifact, OperatingPoint};
use crate::error::{EvalError, EvalResult};
use crate::sample::{Media, SampleHandle};

/// How per-sample sizes are aggregated into one rate per operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMetric {
    /// Mean of per-sample bits-per-pixel
    #[default]
    MeanBpp,
    /// Sum of bits over sum of pixels
    TotalBitsOverPixels,
    /// Sum of bits
    TotalBits,
}

impl RateMetric {
    /// Aggregate `(bits, pixels)` pairs. An empty input yields 0.
    pub fn aggregate(&self, samples: &[(u64, u64)]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        match self {
            RateMetric::MeanBpp => {
                let sum: f64 = samples
                    .iter()
                    .map(|&(bits, pixels)| bits_per_pixel(bits, pixels))
                    .sum();
                sum / samples.len() as f64
            }
            RateMetric::TotalBitsOverPixels => {
                let bits: u64 = samples.iter().map(|s| s.0).sum();
                let pixels: u64 = samples.iter().map(|s| s.1).sum();
                bits_per_pixel(bits, pixels)
            }
            RateMetric::TotalBits => samples.iter().map(|s| s.0).sum::<u64>() as f64,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            RateMetric::MeanBpp | RateMetric::TotalBitsOverPixels => "bpp",
            RateMetric::TotalBits => "bits",
        }
    }
}

fn bits_per_pixel(bits: u64, pixels: u64) -> f64 {
    if pixels == 0 {
        0.0
    } else {
        bits as f64 / pixels as f64
    }
}

/// Output of one transcode.
#[derive(Debug, Clone)]
pub struct TranscodeResult {
    pub reconstruction: Media,
    /// Bits per pixel of this sample
    pub rate: f64,
    pub bits: u64,
    pub pixels: u64,
    pub operating_point: OperatingPoint,
    pub cache_hit: bool,
    pub artifact: EncodedArtifact,
}

/// Cache-aware encode/decode of single samples.
#[derive(Debug, Clone)]
pub struct SampleTranscoder {
    cache: BitstreamCache,
}

impl SampleTranscoder {
    pub fn new(cache: BitstreamCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &BitstreamCache {
        &self.cache
    }

    pub fn key_for(
        &self,
        sample: &SampleHandle,
        op: OperatingPoint,
        adapter: &dyn CodecAdapter,
    ) -> CacheKey {
        CacheKey::new(
            adapter.identity().clone(),
            adapter.config_fingerprint(),
            &sample.id,
            op,
        )
    }

    /// Transcode `sample` at `op`. Encode and decode failures propagate as
    /// per-sample errors tagged with the sample and operating point.
    pub fn transcode(
        &self,
        sample: &SampleHandle,
        op: OperatingPoint,
        adapter: &dyn CodecAdapter,
    ) -> EvalResult<TranscodeResult> {
        let label = adapter.label(op);
        let tag = |e: EvalError| e.with_sample(&sample.id).with_operating_point(&label);
        let key = self.key_for(sample, op, adapter);

        let cached = match self.cache.policy() {
            ConflictPolicy::Reuse => self.cache.lookup(&key).map_err(tag)?,
            ConflictPolicy::Overwrite => None,
        };
        let cache_hit = cached.is_some();
        let artifact = match cached {
            Some(artifact) => artifact,
            None => {
                let artifact = adapter.encode(sample, op).map_err(tag)?;
                self.cache.store(&key, &artifact).map_err(tag)?;
                artifact
            }
        };

        let reconstruction = adapter.decode(&artifact).map_err(tag)?;
        if reconstruction.len() != sample.media.len()
            || reconstruction
                .iter()
                .zip(&sample.media)
                .any(|(r, s)| r.size() != s.size())
        {
            return Err(tag(EvalError::codec(
                adapter.identity().to_string(),
                "decode",
                "reconstruction does not match the sample's frame count or size",
            )));
        }

        let bits = artifact.size_bits();
        let pixels = sample.pixels();
        debug!(
            "{} {}: {} bits over {} px{}",
            sample.id,
            label,
            bits,
            pixels,
            if cache_hit { " (cached)" } else { "" }
        );
        Ok(TranscodeResult {
            reconstruction,
            rate: bits_per_pixel(bits, pixels),
            bits,
            pixels,
            operating_point: op,
            cache_hit,
            artifact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::neural::NeuralCodecAdapter;
    use crate::config::NeuralCodecConfig;
    use crate::sample::Frame;
    use tempfile::TempDir;
    use vcm_scale::cpu::rgb_len;
    use vcm_scale::presets::Size;

    fn sample() -> SampleHandle {
        let size = Size { w: 32, h: 16 };
        let data = (0..rgb_len(size)).map(|i| (i * 7 % 251) as u8).collect();
        SampleHandle {
            id: "000042".into(),
            index: 0,
            media: vec![Frame::new(size, data).unwrap()],
            ground_truth: serde_json::Value::Null,
        }
    }

    fn adapter(op: OperatingPoint) -> NeuralCodecAdapter {
        let mut codec = NeuralCodecAdapter::from_config(&NeuralCodecConfig::default()).unwrap();
        codec.prepare(op).unwrap();
        codec
    }

    #[test]
    fn rate_metrics_aggregate() {
        let samples = [(100, 100), (300, 100), (600, 400)];
        assert_eq!(RateMetric::MeanBpp.aggregate(&samples), (1.0 + 3.0 + 1.5) / 3.0);
        assert_eq!(RateMetric::TotalBitsOverPixels.aggregate(&samples), 1000.0 / 600.0);
        assert_eq!(RateMetric::TotalBits.aggregate(&samples), 1000.0);
        assert_eq!(RateMetric::MeanBpp.aggregate(&[]), 0.0);
    }

    #[test]
    fn rate_is_bits_over_pixels() {
        let dir = TempDir::new().unwrap();
        let op = OperatingPoint::new(3);
        let codec = adapter(op);
        let transcoder = SampleTranscoder::new(BitstreamCache::new(dir.path(), ConflictPolicy::Reuse));
        let s = sample();
        let result = transcoder.transcode(&s, op, &codec).unwrap();
        assert!(!result.cache_hit);
        assert_eq!(result.pixels, 512);
        assert_eq!(result.bits, result.artifact.size_bits());
        assert_eq!(result.rate, result.bits as f64 / 512.0);
    }

    #[test]
    fn cache_hit_is_observationally_identical() {
        let dir = TempDir::new().unwrap();
        let op = OperatingPoint::new(5);
        let codec = adapter(op);
        let transcoder = SampleTranscoder::new(BitstreamCache::new(dir.path(), ConflictPolicy::Reuse));
        let s = sample();
        let fresh = transcoder.transcode(&s, op, &codec).unwrap();
        let cached = transcoder.transcode(&s, op, &codec).unwrap();
        assert!(cached.cache_hit);
        assert_eq!(fresh.reconstruction, cached.reconstruction);
        assert_eq!(fresh.rate, cached.rate);
        assert_eq!(fresh.artifact, cached.artifact);
    }

    #[test]
    fn overwrite_policy_never_reads_the_cache() {
        let dir = TempDir::new().unwrap();
        let op = OperatingPoint::new(2);
        let codec = adapter(op);
        let transcoder =
            SampleTranscoder::new(BitstreamCache::new(dir.path(), ConflictPolicy::Overwrite));
        let s = sample();
        transcoder.transcode(&s, op, &codec).unwrap();
        assert!(!transcoder.transcode(&s, op, &codec).unwrap().cache_hit);
    }

    #[test]
    fn encode_failure_is_tagged() {
        let dir = TempDir::new().unwrap();
        let codec = adapter(OperatingPoint::new(2));
        let transcoder = SampleTranscoder::new(BitstreamCache::new(dir.path(), ConflictPolicy::Reuse));
        let err = transcoder
            .transcode(&sample(), OperatingPoint::new(6), &codec)
            .unwrap_err();
        assert_eq!(err.context().sample_id.as_deref(), Some("000042"));
        assert_eq!(err.context().operating_point.as_deref(), Some("q6"));
    }
}
