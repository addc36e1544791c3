//! # Dataset Collaborator
//!
//! Datasets hand out read-only [`SampleHandle`]s in a fixed iteration order.
//! The bundled implementation reads a COCO-style annotation file:
//!
//! ```json
//! {
//!   "images": [{"id": 397133, "file_name": "000000397133.jpg"},
//!              {"id": "seq-01", "file_name": "seq-01", "frames": ["0001.png", "0002.png"]}],
//!   "annotations": [{"image_id": 397133, "category_id": 1,
//!                    "bbox": [x, y, w, h], "iscrowd": 0, "frame": 0}],
//!   "categories": [{"id": 1, "name": "person"}]
//! }
//! ```
//!
//! For video pipelines an image entry is a sequence: either an explicit
//! `frames` list (relative to `<root>/<file_name>`) or a directory whose image
//! files are taken in lexical order.
//!
//! Every referenced file is checked when the dataset is opened so a missing
//! file aborts before any encode starts. Decode failures while loading are
//! per-sample errors.

// Standard library imports
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// External crate imports
use log::{debug, info};
use serde::Deserialize;
use serde_json::{Value, json};

// Internal module imports
use crate::config::{DatasetConfig, PipelineKind};
use crate::error::{EvalError, EvalResult};
use crate::sample::{Frame, SampleHandle};

const FRAME_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

/// Source of samples for a sweep.
pub trait Dataset: Send + Sync {
    fn name(&self) -> &str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load sample `index` (0-based, dataset order).
    fn load(&self, index: usize) -> EvalResult<SampleHandle>;
}

#[derive(Debug, Deserialize)]
struct CocoFile {
    images: Vec<CocoImage>,
    #[serde(default)]
    annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    categories: Vec<CocoCategory>,
}

#[derive(Debug, Deserialize)]
struct CocoImage {
    id: Value,
    file_name: String,
    #[serde(default)]
    frames: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CocoAnnotation {
    image_id: Value,
    category_id: Value,
    bbox: [f64; 4],
    #[serde(default)]
    iscrowd: u8,
    #[serde(default)]
    frame: u32,
}

#[derive(Debug, Deserialize)]
struct CocoCategory {
    id: Value,
    name: String,
}

/// JSON ids may be numbers or strings; both map to the same key.
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    frames: Vec<PathBuf>,
    ground_truth: Value,
}

/// Images or frame sequences described by a COCO-style annotation file.
#[derive(Debug, Clone)]
pub struct AnnotatedImageFolder {
    name: String,
    entries: Vec<Entry>,
}

impl AnnotatedImageFolder {
    pub fn open(config: &DatasetConfig, pipeline: PipelineKind) -> EvalResult<Self> {
        let root = &config.root;
        if !root.is_dir() {
            return Err(EvalError::dataset(Some(root.clone()), "dataset root not found")
                .with_recovery_suggestion("download the dataset or override dataset.root"));
        }
        let annotations = config.annotations_path();
        let text = fs::read_to_string(&annotations).map_err(|e| {
            EvalError::dataset(Some(annotations.clone()), format!("cannot read annotations: {}", e))
        })?;
        let coco: CocoFile = serde_json::from_str(&text).map_err(|e| {
            EvalError::dataset(Some(annotations.clone()), format!("malformed annotations: {}", e))
        })?;

        let categories: HashMap<String, String> = coco
            .categories
            .iter()
            .map(|c| (id_key(&c.id), c.name.clone()))
            .collect();
        let mut boxes: HashMap<String, Vec<Value>> = HashMap::new();
        for ann in &coco.annotations {
            let category = categories
                .get(&id_key(&ann.category_id))
                .cloned()
                .unwrap_or_else(|| id_key(&ann.category_id));
            boxes.entry(id_key(&ann.image_id)).or_default().push(json!({
                "category": category,
                "bbox": ann.bbox,
                "iscrowd": ann.iscrowd != 0,
                "frame": ann.frame,
            }));
        }

        let take = config.limit.unwrap_or(usize::MAX);
        let mut entries = Vec::with_capacity(coco.images.len().min(take));
        for image in coco.images.into_iter().take(take) {
            let id = id_key(&image.id);
            let frames = match pipeline {
                PipelineKind::Image => vec![root.join(&image.file_name)],
                PipelineKind::Video => sequence_frames(root, &image)?,
            };
            if let Some(missing) = frames.iter().find(|p| !p.is_file()) {
                return Err(EvalError::dataset(
                    Some(missing.clone()),
                    format!("media for sample {} not found", id),
                ));
            }
            let ground_truth = json!({ "annotations": boxes.remove(&id).unwrap_or_default() });
            entries.push(Entry {
                id,
                frames,
                ground_truth,
            });
        }
        info!(
            "Dataset {}: {} samples from {}",
            config.name,
            entries.len(),
            annotations.display()
        );
        Ok(Self {
            name: config.name.clone(),
            entries,
        })
    }

    pub fn sample_id(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.id.as_str())
    }
}

fn sequence_frames(root: &Path, image: &CocoImage) -> EvalResult<Vec<PathBuf>> {
    let dir = root.join(&image.file_name);
    if let Some(frames) = &image.frames {
        if frames.is_empty() {
            return Err(EvalError::dataset(Some(dir), "sequence lists no frames"));
        }
        return Ok(frames.iter().map(|f| dir.join(f)).collect());
    }
    let listing = fs::read_dir(&dir)
        .map_err(|e| EvalError::dataset(Some(dir.clone()), format!("cannot list sequence: {}", e)))?;
    let mut frames: Vec<PathBuf> = listing
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    frames.sort();
    if frames.is_empty() {
        return Err(EvalError::dataset(Some(dir), "sequence directory holds no frames"));
    }
    Ok(frames)
}

impl Dataset for AnnotatedImageFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load(&self, index: usize) -> EvalResult<SampleHandle> {
        let entry = self.entries.get(index).ok_or_else(|| {
            EvalError::dataset(None, format!("sample index {} out of range", index))
        })?;
        let mut media = Vec::with_capacity(entry.frames.len());
        for path in &entry.frames {
            let img = image::open(path)
                .map_err(|e| {
                    EvalError::external("image", e)
                        .with_operation("load frame")
                        .with_metadata("path", path.display().to_string())
                        .with_sample(&entry.id)
                })?
                .to_rgb8();
            let frame = Frame::from_image(img).map_err(|e| {
                EvalError::external("image", e)
                    .with_operation("load frame")
                    .with_metadata("path", path.display().to_string())
                    .with_sample(&entry.id)
            })?;
            media.push(frame);
        }
        debug!("Loaded {} ({} frames)", entry.id, media.len());
        Ok(SampleHandle {
            id: entry.id.clone(),
            index,
            media,
            ground_truth: entry.ground_truth.clone(),
        })
    }
}
