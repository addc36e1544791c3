//! # Metric Collaborator
//!
//! Accuracy is defined over the whole prediction set of an operating point,
//! never sample by sample, so the orchestrator calls the aggregator once per
//! point with an immutable [`PredictionSet`].
//!
//! ## COCO-style average precision
//!
//! For each category and IoU threshold, detections are ranked by score across
//! all samples and greedily matched to unmatched ground-truth boxes of the same
//! sample and frame. Detections matching a crowd box are ignored rather than
//! counted as false positives. Precision is made monotone and sampled at 101
//! recall points. Categories without ground truth are excluded from the mean.
//!
//! | Evaluator | IoU thresholds | Breakdown keys |
//! |-----------|----------------|----------------|
//! | `coco-map` | 0.50:0.05:0.95 | `map`, `map50`, `map75`, `AP-<category>` |
//! | `ap50` | 0.50 | `map50`, `AP50-<category>` |
//!
//! Scores lie in `[0, 1]`. A set without any detections scores 0.
//!
//! ## Visual quality
//!
//! `psnr` ignores detections and scores the reconstructions themselves: the
//! mean over samples of the per-sample PSNR in dB, with pixel values on a
//! `[0, 1]` scale. A reconstruction identical to its source is capped at
//! 100 dB.

// Standard library imports
use std::collections::{BTreeMap, HashMap};

// External crate imports
use serde::Deserialize;

// Internal module imports
use crate::config::{Criteria, EvaluatorConfig, EvaluatorKind};
use crate::error::{EvalError, EvalResult};
use crate::sample::Frame;
use crate::vision::{Detection, PredictionSet};

const MAX_DETECTIONS_PER_FRAME: usize = 100;
const RECALL_POINTS: usize = 101;
const MAX_PSNR_DB: f64 = 100.0;

/// Aggregate accuracy of one operating point.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccuracyReport {
    /// Headline score selected by the evaluator's criteria
    pub score: f64,
    pub breakdown: BTreeMap<String, f64>,
}

/// Scores a full prediction set against its ground truth.
pub trait MetricsAggregator: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, predictions: &PredictionSet) -> EvalResult<AccuracyReport>;
}

/// Pixel error of one reconstruction against its source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fidelity {
    /// Mean squared error over every channel value, on a `[0, 1]` scale
    pub mse: f64,
}

impl Fidelity {
    /// `None` when frame counts or sizes differ, or there is nothing to compare.
    pub fn between(original: &[Frame], reconstruction: &[Frame]) -> Option<Self> {
        if original.is_empty() || original.len() != reconstruction.len() {
            return None;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        for (a, b) in original.iter().zip(reconstruction) {
            if a.size() != b.size() {
                return None;
            }
            for (x, y) in a.data().iter().zip(b.data()) {
                let d = (*x as f64 - *y as f64) / 255.0;
                sum += d * d;
            }
            count += a.data().len();
        }
        Some(Self {
            mse: sum / count as f64,
        })
    }

    /// Peak signal-to-noise ratio in dB, capped for lossless reconstructions.
    pub fn psnr(&self) -> f64 {
        if self.mse <= 0.0 {
            return MAX_PSNR_DB;
        }
        (-10.0 * self.mse.log10()).min(MAX_PSNR_DB)
    }
}

/// Ground-truth box as produced by the dataset collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct GroundTruthBox {
    pub category: String,
    pub bbox: [f64; 4],
    #[serde(default)]
    pub iscrowd: bool,
    #[serde(default)]
    pub frame: u32,
}

#[derive(Debug, Deserialize)]
struct GroundTruth {
    annotations: Vec<GroundTruthBox>,
}

/// Intersection over union of two `[x, y, w, h]` boxes.
pub fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let ix = (a[0] + a[2]).min(b[0] + b[2]) - a[0].max(b[0]);
    let iy = (a[1] + a[3]).min(b[1] + b[3]) - a[1].max(b[1]);
    if ix <= 0.0 || iy <= 0.0 {
        return 0.0;
    }
    let inter = ix * iy;
    let union = a[2] * a[3] + b[2] * b[3] - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Detections and ground truth of one category, grouped per (sample, frame).
#[derive(Default)]
struct CategoryData<'a> {
    /// (score, image slot, detection)
    detections: Vec<(f64, usize, &'a Detection)>,
    /// image slot -> ground-truth boxes
    ground_truth: HashMap<usize, Vec<&'a GroundTruthBox>>,
    positives: usize,
}

/// 101-point interpolated AP for one category at one IoU threshold.
fn average_precision(data: &CategoryData<'_>, threshold: f64) -> f64 {
    if data.positives == 0 {
        return 0.0;
    }
    let mut matched: HashMap<usize, Vec<bool>> = data
        .ground_truth
        .iter()
        .map(|(slot, boxes)| (*slot, vec![false; boxes.len()]))
        .collect();

    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut precision = Vec::with_capacity(data.detections.len());
    let mut recall = Vec::with_capacity(data.detections.len());
    for (_, slot, det) in &data.detections {
        let boxes = data.ground_truth.get(slot).map(Vec::as_slice).unwrap_or(&[]);
        let mut best: Option<(usize, f64)> = None;
        let mut crowd_hit = false;
        for (i, gt) in boxes.iter().enumerate() {
            let overlap = iou(&det.bbox, &gt.bbox);
            if overlap < threshold {
                continue;
            }
            if gt.iscrowd {
                crowd_hit = true;
                continue;
            }
            let taken = matched.get(slot).is_some_and(|m| m[i]);
            if !taken && best.is_none_or(|(_, b)| overlap > b) {
                best = Some((i, overlap));
            }
        }
        match best {
            Some((i, _)) => {
                if let Some(m) = matched.get_mut(slot) {
                    m[i] = true;
                }
                tp += 1;
            }
            None if crowd_hit => continue,
            None => fp += 1,
        }
        precision.push(tp as f64 / (tp + fp) as f64);
        recall.push(tp as f64 / data.positives as f64);
    }

    for i in (0..precision.len().saturating_sub(1)).rev() {
        if precision[i] < precision[i + 1] {
            precision[i] = precision[i + 1];
        }
    }
    let mut sum = 0.0;
    let mut cursor = 0;
    for step in 0..RECALL_POINTS {
        let r = step as f64 / (RECALL_POINTS - 1) as f64;
        while cursor < recall.len() && recall[cursor] < r {
            cursor += 1;
        }
        if cursor < precision.len() {
            sum += precision[cursor];
        }
    }
    sum / RECALL_POINTS as f64
}

/// COCO-style detection evaluator.
#[derive(Debug, Clone)]
pub struct CocoEvaluator {
    name: String,
    thresholds: Vec<f64>,
    criteria: Criteria,
    classwise: bool,
    category_prefix: &'static str,
}

impl CocoEvaluator {
    /// mAP over IoU 0.50:0.05:0.95.
    pub fn coco_map(criteria: Criteria, classwise: bool) -> Self {
        Self {
            name: "coco-map".to_string(),
            thresholds: (0..10).map(|i| 0.5 + 0.05 * i as f64).collect(),
            criteria,
            classwise,
            category_prefix: "AP-",
        }
    }

    /// AP at IoU 0.5.
    pub fn ap50(classwise: bool) -> Self {
        Self {
            name: "ap50".to_string(),
            thresholds: vec![0.5],
            criteria: Criteria::Map50,
            classwise,
            category_prefix: "AP50-",
        }
    }

    fn threshold_index(&self, t: f64) -> Option<usize> {
        self.thresholds.iter().position(|x| (x - t).abs() < 1e-9)
    }
}

impl MetricsAggregator for CocoEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, predictions: &PredictionSet) -> EvalResult<AccuracyReport> {
        // Parse ground truth first; borrowed boxes must outlive the category map.
        let mut parsed = Vec::with_capacity(predictions.len());
        for record in predictions.records() {
            let gt: GroundTruth = serde_json::from_value(record.ground_truth.clone()).map_err(|e| {
                EvalError::metric(
                    &self.name,
                    format!("ground truth of sample {} is malformed: {}", record.prediction.sample_id, e),
                )
            })?;
            parsed.push(gt);
        }

        let mut slots: HashMap<(usize, u32), usize> = HashMap::new();
        let mut slot_of = |record: usize, frame: u32| {
            let next = slots.len();
            *slots.entry((record, frame)).or_insert(next)
        };
        let mut categories: BTreeMap<&str, CategoryData<'_>> = BTreeMap::new();
        for (r, (record, gt)) in predictions.records().iter().zip(&parsed).enumerate() {
            for b in &gt.annotations {
                let slot = slot_of(r, b.frame);
                let data = categories.entry(b.category.as_str()).or_default();
                data.ground_truth.entry(slot).or_default().push(b);
                if !b.iscrowd {
                    data.positives += 1;
                }
            }
            let mut per_frame: HashMap<u32, Vec<&Detection>> = HashMap::new();
            for d in &record.prediction.detections {
                per_frame.entry(d.frame).or_default().push(d);
            }
            let mut frames: Vec<_> = per_frame.into_iter().collect();
            frames.sort_by_key(|(frame, _)| *frame);
            for (frame, mut dets) in frames {
                dets.sort_by(|a, b| b.score.total_cmp(&a.score));
                dets.truncate(MAX_DETECTIONS_PER_FRAME);
                let slot = slot_of(r, frame);
                for d in dets {
                    categories
                        .entry(d.category.as_str())
                        .or_default()
                        .detections
                        .push((d.score, slot, d));
                }
            }
        }
        for data in categories.values_mut() {
            // Stable sort keeps dataset order among equal scores.
            data.detections.sort_by(|a, b| b.0.total_cmp(&a.0));
        }

        let scored: Vec<(&str, Vec<f64>)> = categories
            .iter()
            .filter(|(_, data)| data.positives > 0)
            .map(|(name, data)| {
                let aps = self
                    .thresholds
                    .iter()
                    .map(|&t| average_precision(data, t))
                    .collect();
                (*name, aps)
            })
            .collect();

        let mean_at = |i: usize| -> f64 {
            if scored.is_empty() {
                0.0
            } else {
                scored.iter().map(|(_, aps)| aps[i]).sum::<f64>() / scored.len() as f64
            }
        };
        let mut breakdown = BTreeMap::new();
        if self.thresholds.len() > 1 {
            let overall = (0..self.thresholds.len()).map(mean_at).sum::<f64>()
                / self.thresholds.len() as f64;
            breakdown.insert("map".to_string(), overall);
        }
        if let Some(i) = self.threshold_index(0.5) {
            breakdown.insert("map50".to_string(), mean_at(i));
        }
        if let Some(i) = self.threshold_index(0.75) {
            breakdown.insert("map75".to_string(), mean_at(i));
        }
        if self.classwise {
            for (name, aps) in &scored {
                let ap = aps.iter().sum::<f64>() / aps.len() as f64;
                breakdown.insert(format!("{}{}", self.category_prefix, name), ap);
            }
        }

        let score = breakdown.get(self.criteria.key()).copied().ok_or_else(|| {
            EvalError::metric(
                &self.name,
                format!("criteria {} is not reported by this evaluator", self.criteria.key()),
            )
        })?;
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(EvalError::metric(
                &self.name,
                format!("score {} outside [0, 1]", score),
            ));
        }
        Ok(AccuracyReport { score, breakdown })
    }
}

/// Reconstruction quality, independent of the vision model.
#[derive(Debug, Clone, Default)]
pub struct PsnrEvaluator;

impl PsnrEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsAggregator for PsnrEvaluator {
    fn name(&self) -> &str {
        "psnr"
    }

    fn evaluate(&self, predictions: &PredictionSet) -> EvalResult<AccuracyReport> {
        if predictions.is_empty() {
            return Err(EvalError::metric("psnr", "no reconstructions to compare"));
        }
        let mut psnr = 0.0;
        let mut mse = 0.0;
        for record in predictions.records() {
            let fidelity = record.fidelity.ok_or_else(|| {
                EvalError::metric(
                    "psnr",
                    format!(
                        "sample {} has no reconstruction matching its source",
                        record.prediction.sample_id
                    ),
                )
            })?;
            psnr += fidelity.psnr();
            mse += fidelity.mse;
        }
        let n = predictions.len() as f64;
        let mut breakdown = BTreeMap::new();
        breakdown.insert("psnr".to_string(), psnr / n);
        breakdown.insert("mse".to_string(), mse / n);
        Ok(AccuracyReport {
            score: psnr / n,
            breakdown,
        })
    }
}

/// Build the evaluator selected by configuration.
pub fn build_evaluator(config: &EvaluatorConfig) -> Box<dyn MetricsAggregator> {
    match config.kind {
        EvaluatorKind::CocoMap => Box::new(CocoEvaluator::coco_map(config.criteria, config.classwise)),
        EvaluatorKind::Ap50 => Box::new(CocoEvaluator::ap50(config.classwise)),
        EvaluatorKind::Psnr => Box::new(PsnrEvaluator::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{Prediction, PredictionRecord};
    use serde_json::json;
    use vcm_scale::presets::Size;

    fn record(index: usize, gt: serde_json::Value, detections: Vec<Detection>) -> PredictionRecord {
        PredictionRecord {
            index,
            prediction: Prediction {
                sample_id: format!("s{}", index),
                detections,
            },
            ground_truth: gt,
            fidelity: None,
        }
    }

    fn solid(value: u8) -> Frame {
        Frame::new(Size { w: 4, h: 2 }, vec![value; 24]).unwrap()
    }

    fn with_fidelity(index: usize, original: u8, recon: u8) -> PredictionRecord {
        let mut r = record(index, json!({"annotations": []}), vec![]);
        r.fidelity = Fidelity::between(&[solid(original)], &[solid(recon)]);
        r
    }

    fn det(category: &str, score: f64, bbox: [f64; 4]) -> Detection {
        Detection {
            category: category.into(),
            score,
            bbox,
            frame: 0,
        }
    }

    fn gt(boxes: &[(&str, [f64; 4])]) -> serde_json::Value {
        json!({
            "annotations": boxes
                .iter()
                .map(|(c, b)| json!({"category": c, "bbox": b}))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn iou_of_boxes() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[0.0, 0.0, 10.0, 10.0]), 1.0);
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 5.0, 5.0]), 0.0);
        let half = iou(&[0.0, 0.0, 10.0, 10.0], &[5.0, 0.0, 10.0, 10.0]);
        assert!((half - 50.0 / 150.0).abs() < 1e-12);
    }

    #[test]
    fn perfect_predictions_score_one() {
        let set = PredictionSet::new(vec![
            record(0, gt(&[("person", [0.0, 0.0, 10.0, 10.0])]), vec![det("person", 0.9, [0.0, 0.0, 10.0, 10.0])]),
            record(1, gt(&[("car", [5.0, 5.0, 20.0, 10.0])]), vec![det("car", 0.8, [5.0, 5.0, 20.0, 10.0])]),
        ]);
        let report = CocoEvaluator::coco_map(Criteria::Map, true).evaluate(&set).unwrap();
        assert!((report.score - 1.0).abs() < 1e-12);
        assert!((report.breakdown["map50"] - 1.0).abs() < 1e-12);
        assert!(report.breakdown.contains_key("AP-person"));
        assert!(report.breakdown.contains_key("AP-car"));
    }

    #[test]
    fn empty_predictions_score_zero() {
        let set = PredictionSet::new(vec![
            record(0, gt(&[("person", [0.0, 0.0, 10.0, 10.0])]), vec![]),
        ]);
        let report = CocoEvaluator::coco_map(Criteria::Map, false).evaluate(&set).unwrap();
        assert_eq!(report.score, 0.0);

        let nothing = CocoEvaluator::ap50(false).evaluate(&PredictionSet::default()).unwrap();
        assert_eq!(nothing.score, 0.0);
        assert!(!nothing.score.is_nan());
    }

    #[test]
    fn false_positive_ranked_first_halves_precision() {
        let set = PredictionSet::new(vec![record(
            0,
            gt(&[("dog", [0.0, 0.0, 10.0, 10.0])]),
            vec![
                det("dog", 0.9, [50.0, 50.0, 10.0, 10.0]),
                det("dog", 0.5, [0.0, 0.0, 10.0, 10.0]),
            ],
        )]);
        let report = CocoEvaluator::ap50(false).evaluate(&set).unwrap();
        assert!((report.score - 0.5).abs() < 1e-12, "{}", report.score);
    }

    #[test]
    fn loose_boxes_pass_ap50_but_not_strict_thresholds() {
        // IoU = 0.58: a match at 0.50 and 0.55 only.
        let set = PredictionSet::new(vec![record(
            0,
            gt(&[("cat", [0.0, 0.0, 10.0, 10.0])]),
            vec![det("cat", 0.9, [0.0, 0.0, 10.0, 5.8])],
        )]);
        let report = CocoEvaluator::coco_map(Criteria::Map, false).evaluate(&set).unwrap();
        assert!((report.breakdown["map50"] - 1.0).abs() < 1e-12);
        assert_eq!(report.breakdown["map75"], 0.0);
        assert!((report.score - 0.2).abs() < 1e-12, "{}", report.score);
    }

    #[test]
    fn crowd_matches_are_ignored() {
        let set = PredictionSet::new(vec![record(
            0,
            json!({"annotations": [
                {"category": "person", "bbox": [0.0, 0.0, 10.0, 10.0]},
                {"category": "person", "bbox": [100.0, 100.0, 50.0, 50.0], "iscrowd": true}
            ]}),
            vec![
                det("person", 0.95, [100.0, 100.0, 50.0, 50.0]),
                det("person", 0.9, [0.0, 0.0, 10.0, 10.0]),
            ],
        )]);
        let report = CocoEvaluator::ap50(false).evaluate(&set).unwrap();
        assert!((report.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn malformed_ground_truth_is_a_metric_error() {
        let set = PredictionSet::new(vec![record(0, json!({"boxes": []}), vec![])]);
        let err = CocoEvaluator::ap50(false).evaluate(&set).unwrap_err();
        assert_eq!(err.category(), "metric");
    }

    #[test]
    fn scores_stay_in_range() {
        let set = PredictionSet::new(
            (0..5)
                .map(|i| {
                    let x = i as f64 * 3.0;
                    record(
                        i,
                        gt(&[("a", [x, 0.0, 10.0, 10.0]), ("b", [0.0, x, 8.0, 8.0])]),
                        vec![
                            det("a", 0.3 + 0.1 * i as f64, [x + 1.0, 0.0, 10.0, 10.0]),
                            det("b", 0.6, [40.0, 40.0, 8.0, 8.0]),
                        ],
                    )
                })
                .collect(),
        );
        for evaluator in [CocoEvaluator::coco_map(Criteria::Map75, true), CocoEvaluator::ap50(true)] {
            let report = evaluator.evaluate(&set).unwrap();
            assert!((0.0..=1.0).contains(&report.score));
            assert!(report.breakdown.values().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn fidelity_of_known_error() {
        // Every value off by 51 = 0.2 on the unit scale: MSE 0.04, PSNR ~13.98 dB.
        let f = Fidelity::between(&[solid(100)], &[solid(151)]).unwrap();
        assert!((f.mse - 0.04).abs() < 1e-12);
        assert!((f.psnr() - 13.979_400_086_720_377).abs() < 1e-9);

        let exact = Fidelity::between(&[solid(9)], &[solid(9)]).unwrap();
        assert_eq!(exact.psnr(), MAX_PSNR_DB);

        let other = Frame::new(Size { w: 2, h: 2 }, vec![0; 12]).unwrap();
        assert!(Fidelity::between(&[solid(0)], &[other]).is_none());
        assert!(Fidelity::between(&[], &[]).is_none());
    }

    #[test]
    fn psnr_is_the_mean_over_samples() {
        let set = PredictionSet::new(vec![with_fidelity(0, 100, 151), with_fidelity(1, 7, 7)]);
        let report = PsnrEvaluator::new().evaluate(&set).unwrap();
        let expected = (13.979_400_086_720_377 + MAX_PSNR_DB) / 2.0;
        assert!((report.score - expected).abs() < 1e-9, "{}", report.score);
        assert!((report.breakdown["psnr"] - expected).abs() < 1e-9);
        assert!((report.breakdown["mse"] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn psnr_needs_reconstructions() {
        let err = PsnrEvaluator::new().evaluate(&PredictionSet::default()).unwrap_err();
        assert_eq!(err.category(), "metric");

        let set = PredictionSet::new(vec![record(0, json!({"annotations": []}), vec![])]);
        let err = PsnrEvaluator::new().evaluate(&set).unwrap_err();
        assert_eq!(err.category(), "metric");
    }

    #[test]
    fn evaluator_follows_configuration() {
        let psnr = EvaluatorConfig {
            kind: EvaluatorKind::Psnr,
            criteria: Criteria::Psnr,
            classwise: false,
        };
        assert_eq!(build_evaluator(&psnr).name(), "psnr");
        assert_eq!(build_evaluator(&EvaluatorConfig::default()).name(), "coco-map");
    }
}
