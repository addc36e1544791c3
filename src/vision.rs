//! # Vision Model Collaborator
//!
//! The downstream machine-vision model is a black box: reconstruction in,
//! detections out. Predictions for one operating point are gathered in a
//! [`PredictionCollector`] (append-only, safe for concurrent writers) and
//! frozen into an immutable [`PredictionSet`] that is handed to the metric
//! stage. Nothing is ever attached to the dataset's own sample storage, so
//! successive operating points start from a clean slate by construction.
//!
//! ## HTTP inference
//!
//! [`HttpVisionModel`] posts each reconstruction as base64 PNG frames:
//!
//! ```json
//! {"model": "...", "device": "cuda:0", "sample_id": "397133",
//!  "frames": [{"index": 0, "width": 640, "height": 480,
//!              "image": "data:image/png;base64,..."}]}
//! ```
//!
//! and expects `{"detections": [{"category", "score", "bbox", "frame"?}]}` back,
//! with `bbox` in `[x, y, width, height]` pixels.

// Standard library imports
use std::sync::Mutex;
use std::time::Duration;

// External crate imports
use base64::{Engine as _, engine::general_purpose};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

// Internal module imports
use crate::config::VisionModelConfig;
use crate::error::{EvalError, EvalResult};
use crate::metrics::Fidelity;
use crate::sample::{Frame, SampleHandle};

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub category: String,
    pub score: f64,
    /// `[x, y, width, height]` in pixels
    pub bbox: [f64; 4],
    /// Frame index within a video sample
    #[serde(default)]
    pub frame: u32,
}

/// All detections for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub sample_id: String,
    pub detections: Vec<Detection>,
}

/// A prediction paired with the ground truth it is scored against.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub index: usize,
    pub prediction: Prediction,
    pub ground_truth: serde_json::Value,
    /// Pixel error of the reconstruction the detections were made on
    pub fidelity: Option<Fidelity>,
}

/// Immutable predictions for one operating point, in dataset order.
#[derive(Debug, Clone, Default)]
pub struct PredictionSet {
    records: Vec<PredictionRecord>,
}

impl PredictionSet {
    pub fn new(mut records: Vec<PredictionRecord>) -> Self {
        records.sort_by_key(|r| r.index);
        Self { records }
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn detection_count(&self) -> usize {
        self.records.iter().map(|r| r.prediction.detections.len()).sum()
    }
}

/// Append-only prediction registry shared by sample workers.
#[derive(Debug, Default)]
pub struct PredictionCollector {
    records: Mutex<Vec<PredictionRecord>>,
}

impl PredictionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sample: &SampleHandle, reconstruction: &[Frame], detections: Vec<Detection>) {
        let record = PredictionRecord {
            index: sample.index,
            prediction: Prediction {
                sample_id: sample.id.clone(),
                detections,
            },
            ground_truth: sample.ground_truth.clone(),
            fidelity: Fidelity::between(&sample.media, reconstruction),
        };
        // A panicking writer cannot leave a half-pushed record behind.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    /// Freeze into an immutable, dataset-ordered set.
    pub fn finish(self) -> PredictionSet {
        PredictionSet::new(
            self.records
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

/// Detection model seen as a function from reconstruction to detections.
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, sample: &SampleHandle, reconstruction: &[Frame]) -> EvalResult<Vec<Detection>>;
}

#[derive(Debug, Serialize)]
struct FramePayload {
    index: usize,
    width: u32,
    height: u32,
    image: String,
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    model: &'a str,
    device: &'a str,
    sample_id: &'a str,
    frames: Vec<FramePayload>,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    detections: Vec<Detection>,
}

/// Vision model served behind an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpVisionModel {
    client: Client,
    endpoint: String,
    architecture: String,
    device: String,
    score_threshold: f64,
}

impl HttpVisionModel {
    pub fn new(config: &VisionModelConfig, device: &str) -> EvalResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EvalError::external("reqwest", e))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            architecture: config.architecture.clone(),
            device: device.to_string(),
            score_threshold: config.score_threshold,
        })
    }

    fn inference_error(&self, sample: &SampleHandle, reason: impl Into<String>) -> EvalError {
        EvalError::inference(&self.architecture, reason).with_sample(&sample.id)
    }
}

impl VisionModel for HttpVisionModel {
    fn name(&self) -> &str {
        &self.architecture
    }

    fn infer(&self, sample: &SampleHandle, reconstruction: &[Frame]) -> EvalResult<Vec<Detection>> {
        let frames = reconstruction
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                Ok(FramePayload {
                    index,
                    width: frame.size().w,
                    height: frame.size().h,
                    image: format!(
                        "data:image/png;base64,{}",
                        general_purpose::STANDARD.encode(frame.to_png()?)
                    ),
                })
            })
            .collect::<EvalResult<Vec<_>>>()?;
        let request = InferenceRequest {
            model: &self.architecture,
            device: &self.device,
            sample_id: &sample.id,
            frames,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| self.inference_error(sample, format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(self.inference_error(
                sample,
                format!("endpoint returned {}: {}", status, body.trim()),
            ));
        }
        let parsed: InferenceResponse = response
            .json()
            .map_err(|e| self.inference_error(sample, format!("bad response: {}", e)))?;

        let frame_count = reconstruction.len() as u32;
        Ok(parsed
            .detections
            .into_iter()
            .filter(|d| d.score >= self.score_threshold && d.frame < frame_count)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(index: usize) -> SampleHandle {
        SampleHandle {
            id: format!("s{}", index),
            index,
            media: Vec::new(),
            ground_truth: serde_json::json!({"annotations": []}),
        }
    }

    fn det(category: &str) -> Detection {
        Detection {
            category: category.into(),
            score: 0.9,
            bbox: [0.0, 0.0, 10.0, 10.0],
            frame: 0,
        }
    }

    #[test]
    fn collector_orders_by_dataset_index() {
        let collector = Arc::new(PredictionCollector::new());
        let handles: Vec<_> = (0..16)
            .rev()
            .map(|i| {
                let c = Arc::clone(&collector);
                std::thread::spawn(move || c.register(&handle(i), &[], vec![det("person")]))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let set = Arc::try_unwrap(collector).unwrap().finish();
        assert_eq!(set.len(), 16);
        assert_eq!(set.detection_count(), 16);
        let order: Vec<usize> = set.records().iter().map(|r| r.index).collect();
        assert_eq!(order, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn collector_records_reconstruction_error() {
        let size = vcm_scale::presets::Size { w: 2, h: 1 };
        let mut sample = handle(0);
        sample.media = vec![Frame::new(size, vec![0; 6]).unwrap()];
        let recon = vec![Frame::new(size, vec![255; 6]).unwrap()];

        let collector = PredictionCollector::new();
        collector.register(&sample, &recon, Vec::new());
        collector.register(&handle(1), &recon, Vec::new());
        let set = collector.finish();
        assert_eq!(set.records()[0].fidelity.map(|f| f.mse), Some(1.0));
        assert!(set.records()[1].fidelity.is_none());
    }

    #[test]
    fn detection_frame_defaults_to_zero() {
        let d: Detection =
            serde_json::from_str(r#"{"category": "car", "score": 0.5, "bbox": [1, 2, 3, 4]}"#)
                .unwrap();
        assert_eq!(d.frame, 0);
        assert_eq!(d.bbox, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn unreachable_endpoint_is_an_inference_error() {
        let config = VisionModelConfig {
            endpoint: "http://127.0.0.1:9/v1/detect".into(),
            timeout_secs: 2,
            ..VisionModelConfig::default()
        };
        let model = HttpVisionModel::new(&config, "cpu").unwrap();
        let size = vcm_scale::presets::Size { w: 2, h: 2 };
        let frame = Frame::new(size, vec![0; 12]).unwrap();
        let err = model.infer(&handle(0), &[frame]).unwrap_err();
        assert_eq!(err.category(), "inference");
        assert_eq!(err.context().sample_id.as_deref(), Some("s0"));
    }
}
