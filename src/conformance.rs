//! Conformance snapshots: raw bitstreams (and optionally reconstructions) of
//! every Nth sample, for bit-exactness checks outside this pipeline.
//!
//! Layout: `<dir>/<op label>/<stem>.bin`, a `.json` sidecar with the artifact
//! metadata, and `<stem>_f<frame>.png` per reconstructed frame. The stem is the
//! path-safe sample id followed by the first 8 hex digits of the id's SHA-256,
//! so ids that sanitise to the same text (`a/b`, `a_b`) stay apart.
//! Recording never influences the sweep result and its failures are only
//! logged.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::codec::ArtifactMeta;
use crate::config::ConformanceConfig;
use crate::core::{path_safe, sha256_hex};
use crate::error::{EvalError, EvalResult};
use crate::sample::SampleHandle;
use crate::transcode::TranscodeResult;

#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    sample_id: &'a str,
    label: &'a str,
    rate: f64,
    bits: u64,
    pixels: u64,
    cache_hit: bool,
    payload_sha256: String,
    meta: &'a ArtifactMeta,
}

#[derive(Debug, Clone)]
pub struct ConformanceRecorder {
    dir: PathBuf,
    every_nth: usize,
    record_reconstructions: bool,
}

impl ConformanceRecorder {
    /// `None` when recording is disabled.
    pub fn from_config(config: &ConformanceConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            dir: config.dir.clone(),
            every_nth: config.every_nth.max(1),
            record_reconstructions: config.record_reconstructions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn should_record(&self, sample: &SampleHandle) -> bool {
        sample.index % self.every_nth == 0
    }

    /// Snapshot one transcode if the sample is selected. Never fails.
    pub fn record(&self, sample: &SampleHandle, label: &str, result: &TranscodeResult) {
        if !self.should_record(sample) {
            return;
        }
        match self.write(sample, label, result) {
            Ok(path) => debug!("Conformance snapshot {}", path.display()),
            Err(e) => warn!("Conformance recording failed for {} at {}: {}", sample.id, label, e),
        }
    }

    fn write(&self, sample: &SampleHandle, label: &str, result: &TranscodeResult) -> EvalResult<PathBuf> {
        let dir = self.dir.join(path_safe(label));
        fs::create_dir_all(&dir).map_err(|e| EvalError::io_at("create conformance dir", &dir, e))?;
        let stem = snapshot_stem(&sample.id);

        let bin = dir.join(format!("{}.bin", stem));
        fs::write(&bin, result.artifact.payload())
            .map_err(|e| EvalError::io_at("write conformance bitstream", &bin, e))?;

        let sidecar = Sidecar {
            sample_id: &sample.id,
            label,
            rate: result.rate,
            bits: result.bits,
            pixels: result.pixels,
            cache_hit: result.cache_hit,
            payload_sha256: sha256_hex(result.artifact.payload()),
            meta: result.artifact.meta(),
        };
        let json = dir.join(format!("{}.json", stem));
        fs::write(&json, serde_json::to_vec_pretty(&sidecar)?)
            .map_err(|e| EvalError::io_at("write conformance metadata", &json, e))?;

        if self.record_reconstructions {
            for (i, frame) in result.reconstruction.iter().enumerate() {
                let png = dir.join(format!("{}_f{}.png", stem, i));
                fs::write(&png, frame.to_png()?)
                    .map_err(|e| EvalError::io_at("write conformance reconstruction", &png, e))?;
            }
        }
        Ok(bin)
    }
}

fn snapshot_stem(sample_id: &str) -> String {
    let digest = sha256_hex(sample_id.as_bytes());
    format!("{}-{}", path_safe(sample_id), &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecIdentity, EncodedArtifact, OperatingPoint, SideInfo};
    use crate::sample::Frame;
    use tempfile::TempDir;
    use vcm_scale::presets::Size;

    fn sample(index: usize) -> SampleHandle {
        let size = Size { w: 2, h: 2 };
        SampleHandle {
            id: format!("img/{}", index),
            index,
            media: vec![Frame::new(size, vec![7; 12]).unwrap()],
            ground_truth: serde_json::Value::Null,
        }
    }

    fn result(s: &SampleHandle) -> TranscodeResult {
        let op = OperatingPoint::new(4);
        let artifact = EncodedArtifact::new(
            vec![1, 2, 3],
            CodecIdentity::new("test", "1"),
            op,
            SideInfo {
                width: 2,
                height: 2,
                coded_width: 2,
                coded_height: 2,
                frames: 1,
                scale: 1.0,
            },
        );
        TranscodeResult {
            reconstruction: s.media.clone(),
            rate: 6.0,
            bits: 24,
            pixels: 4,
            operating_point: op,
            cache_hit: false,
            artifact,
        }
    }

    fn recorder(dir: &Path, enabled: bool) -> Option<ConformanceRecorder> {
        ConformanceRecorder::from_config(&ConformanceConfig {
            enabled,
            every_nth: 2,
            dir: dir.to_path_buf(),
            record_reconstructions: true,
        })
    }

    #[test]
    fn disabled_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(recorder(dir.path(), false).is_none());
    }

    #[test]
    fn records_every_nth_sample() {
        let dir = TempDir::new().unwrap();
        let rec = recorder(dir.path(), true).unwrap();
        for i in 0..4 {
            let s = sample(i);
            rec.record(&s, "q4", &result(&s));
        }
        let out = dir.path().join("q4");
        let stem = |i: usize| snapshot_stem(&format!("img/{}", i));
        assert!(stem(0).starts_with("img_0-"));
        assert_eq!(fs::read(out.join(format!("{}.bin", stem(0)))).unwrap(), vec![1, 2, 3]);
        assert!(out.join(format!("{}.json", stem(0))).is_file());
        assert!(out.join(format!("{}_f0.png", stem(0))).is_file());
        assert!(out.join(format!("{}.bin", stem(2))).is_file());
        assert!(!out.join(format!("{}.bin", stem(1))).exists());
    }

    #[test]
    fn ids_that_sanitise_alike_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let rec = recorder(dir.path(), true).unwrap();
        let mut slash = sample(0);
        slash.id = "a/b".into();
        let mut underscore = sample(2);
        underscore.id = "a_b".into();
        rec.record(&slash, "q4", &result(&slash));
        rec.record(&underscore, "q4", &result(&underscore));

        assert_ne!(snapshot_stem("a/b"), snapshot_stem("a_b"));
        let bins = fs::read_dir(dir.path().join("q4"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "bin"))
            .count();
        assert_eq!(bins, 2);
    }

    #[test]
    fn write_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let rec = recorder(&blocker, true).unwrap();
        let s = sample(0);
        rec.record(&s, "q4", &result(&s));
    }
}
