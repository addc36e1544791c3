//! Common test utilities and helpers for the vcm-eval integration tests
//!
//! Synthetic samples, in-memory collaborators and a fake reference codec made
//! of two shell scripts.

#![allow(dead_code)]

/// Synthetic samples and an in-memory dataset
pub mod fixtures {
    use serde_json::json;
    use vcm_eval::dataset::Dataset;
    use vcm_eval::error::EvalResult;
    use vcm_eval::sample::{Frame, SampleHandle};
    use vcm_scale::cpu::rgb_len;
    use vcm_scale::presets::Size;

    pub const SMALL: Size = Size { w: 16, h: 12 };

    /// Smooth gradient with a per-seed offset, so samples differ but
    /// compress well.
    pub fn gradient_frame(size: Size, seed: usize) -> Frame {
        let mut data = Vec::with_capacity(rgb_len(size));
        for y in 0..size.h as usize {
            for x in 0..size.w as usize {
                data.push(((x * 8 + seed * 5) % 256) as u8);
                data.push(((y * 8 + seed * 3) % 256) as u8);
                data.push(((x + y + seed) * 4 % 256) as u8);
            }
        }
        Frame::new(size, data).unwrap()
    }

    /// One-frame sample with a single `person` box covering the centre.
    pub fn sample(index: usize, size: Size) -> SampleHandle {
        let (w, h) = (size.w as f64, size.h as f64);
        SampleHandle {
            id: format!("{:06}", index),
            index,
            media: vec![gradient_frame(size, index)],
            ground_truth: json!({
                "annotations": [
                    {"category": "person", "bbox": [w / 4.0, h / 4.0, w / 2.0, h / 2.0]}
                ]
            }),
        }
    }

    /// Samples held in memory, handed out in insertion order.
    pub struct InMemoryDataset {
        pub samples: Vec<SampleHandle>,
    }

    impl InMemoryDataset {
        pub fn uniform(count: usize, size: Size) -> Self {
            Self {
                samples: (0..count).map(|i| sample(i, size)).collect(),
            }
        }
    }

    impl Dataset for InMemoryDataset {
        fn name(&self) -> &str {
            "in-memory"
        }

        fn len(&self) -> usize {
            self.samples.len()
        }

        fn load(&self, index: usize) -> EvalResult<SampleHandle> {
            Ok(self.samples[index].clone())
        }
    }
}

/// Vision model stand-ins
pub mod mock_vision {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vcm_eval::core::CancelToken;
    use vcm_eval::error::EvalResult;
    use vcm_eval::sample::{Frame, SampleHandle};
    use vcm_eval::vision::{Detection, VisionModel};

    /// Echoes the ground truth back as detections: a perfect model.
    #[derive(Clone, Default)]
    pub struct OracleVision {
        pub calls: Arc<AtomicUsize>,
        /// Cancel this token once `cancel_after` calls have been made
        pub cancel: Option<(CancelToken, usize)>,
    }

    impl OracleVision {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl VisionModel for OracleVision {
        fn name(&self) -> &str {
            "oracle"
        }

        fn infer(&self, sample: &SampleHandle, _: &[Frame]) -> EvalResult<Vec<Detection>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((token, after)) = &self.cancel {
                if n >= *after {
                    token.cancel();
                }
            }
            let boxes = sample.ground_truth["annotations"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            Ok(boxes
                .iter()
                .map(|b| Detection {
                    category: b["category"].as_str().unwrap_or_default().to_string(),
                    score: 0.9,
                    bbox: serde_json::from_value(b["bbox"].clone()).unwrap(),
                    frame: 0,
                })
                .collect())
        }
    }

    /// Never detects anything.
    pub struct BlindVision;

    impl VisionModel for BlindVision {
        fn name(&self) -> &str {
            "blind"
        }

        fn infer(&self, _: &SampleHandle, _: &[Frame]) -> EvalResult<Vec<Detection>> {
            Ok(Vec::new())
        }
    }
}

/// Fake reference codec: shell scripts that copy the raw file through
#[cfg(unix)]
pub mod fake_codec {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use vcm_eval::config::ExternalCodecConfig;

    pub struct FakeCodec {
        pub dir: TempDir,
        pub counter: PathBuf,
        pub config: ExternalCodecConfig,
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    impl FakeCodec {
        /// Encoder called as `enc -i <input> -b <output> -q <qp>`, logging one
        /// line per call. `extra` is shell run before the copy.
        pub fn with_encoder_body(extra: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let counter = dir.path().join("encoder.calls");
            let encoder = script(
                dir.path(),
                "enc.sh",
                &format!(
                    "echo \"$6\" >> '{}'\n{}\ncp \"$2\" \"$4\"",
                    counter.display(),
                    extra
                ),
            );
            let decoder = script(dir.path(), "dec.sh", "cp \"$2\" \"$4\"");
            let config = ExternalCodecConfig {
                name: "fake".into(),
                version: "1".into(),
                encoder,
                decoder,
                config_file: None,
                encoder_args: args(&["-i", "{input}", "-b", "{output}", "-q", "{qp}"]),
                decoder_args: args(&["-b", "{input}", "-o", "{output}"]),
                timeout_secs: 30,
                ..ExternalCodecConfig::default()
            };
            Self {
                dir,
                counter,
                config,
            }
        }

        pub fn copying() -> Self {
            Self::with_encoder_body("")
        }

        /// Encoder that exits 3 when the raw input is exactly `bytes` long.
        pub fn failing_on_input_len(bytes: usize) -> Self {
            Self::with_encoder_body(&format!(
                "if [ \"$(wc -c < \"$2\" | tr -d ' ')\" -eq {} ]; then echo 'bad input' >&2; exit 3; fi",
                bytes
            ))
        }

        pub fn encoder_calls(&self) -> usize {
            fs::read_to_string(&self.counter)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }
}
