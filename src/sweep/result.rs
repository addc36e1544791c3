//! Persistent sweep result.
//!
//! The file is pretty-printed JSON, rewritten whole through a temporary file
//! in the same directory and renamed into place after every operating point.
//! A reader therefore sees either the previous complete file or the new
//! complete file, never a partial entry.

// Standard library imports
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

// External crate imports
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

// Internal module imports
use crate::cache::sync_directory;
use crate::codec::OperatingPoint;
use crate::error::{EvalError, EvalResult};
use crate::transcode::RateMetric;

/// Identity of a sweep. Two runs may share a result file only when their
/// fingerprints are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMeta {
    pub sweep_fingerprint: String,
    pub codec: String,
    pub codec_config_fingerprint: String,
    pub dataset: String,
    pub pipeline: String,
    pub evaluator: String,
    pub criteria: String,
    pub rate_metric: RateMetric,
    pub created_at_unix: u64,
}

impl SweepMeta {
    pub fn now_unix() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryStatus {
    Valid,
    Invalid { reason: String },
}

/// A sample that was skipped at one operating point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFailure {
    pub sample_id: String,
    /// `load`, `transcode` or `inference`
    pub stage: String,
    /// Error category, e.g. `codec` or `codec_timeout`
    pub category: String,
    pub message: String,
}

/// One point of the rate-accuracy curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    pub operating_point: OperatingPoint,
    pub label: String,
    pub rate: f64,
    /// `None` when the metric could not be computed
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub breakdown: BTreeMap<String, f64>,
    pub status: EntryStatus,
    pub samples_total: usize,
    pub samples_ok: usize,
    #[serde(default)]
    pub cache_hits: usize,
    #[serde(default)]
    pub failures: Vec<SampleFailure>,
    #[serde(default)]
    pub elapsed_secs: f64,
}

impl SweepEntry {
    pub fn is_valid(&self) -> bool {
        self.status == EntryStatus::Valid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub meta: SweepMeta,
    pub entries: Vec<SweepEntry>,
}

impl SweepResult {
    pub fn new(meta: SweepMeta) -> Self {
        Self {
            meta,
            entries: Vec::new(),
        }
    }

    /// Read a persisted result. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> EvalResult<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EvalError::io_at("read sweep result", path, e)),
        };
        serde_json::from_str(&text).map(Some).map_err(|e| {
            EvalError::config(
                "misc.output",
                path.display().to_string(),
                format!("existing sweep result is unreadable: {}", e),
            )
            .with_recovery_suggestion("move the file away or choose another misc.output")
        })
    }

    /// Continue the sweep stored at `path`, or start a new one.
    ///
    /// A stored sweep with a different fingerprint is never extended.
    pub fn resume_or_new(path: &Path, meta: SweepMeta) -> EvalResult<Self> {
        match Self::load(path)? {
            None => Ok(Self::new(meta)),
            Some(existing) if existing.meta.sweep_fingerprint == meta.sweep_fingerprint => {
                Ok(existing)
            }
            Some(existing) => Err(EvalError::config(
                "misc.output",
                path.display().to_string(),
                format!(
                    "holds a different sweep (fingerprint {} vs {})",
                    short(&existing.meta.sweep_fingerprint),
                    short(&meta.sweep_fingerprint)
                ),
            )
            .with_recovery_suggestion("choose another misc.output for this configuration")),
        }
    }

    pub fn entry(&self, op: OperatingPoint) -> Option<&SweepEntry> {
        self.entries.iter().find(|e| e.operating_point == op)
    }

    pub fn all_valid(&self) -> bool {
        self.entries.iter().all(SweepEntry::is_valid)
    }

    /// Atomically replace the file at `path` with the current state.
    pub fn persist(&self, path: &Path) -> EvalResult<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| EvalError::io_at("create output dir", dir, e))?;
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');

        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| EvalError::io_at("create sweep temp file", dir, e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| EvalError::io_at("write sweep result", tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| EvalError::io_at("commit sweep result", path, e.error))?;
        sync_directory(dir).map_err(|e| EvalError::io_at("sync output dir", dir, e))?;
        Ok(())
    }

    /// Plain-text rate/accuracy table.
    pub fn summary_table(&self) -> String {
        let unit = self.meta.rate_metric.unit();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} on {} ({}, {})",
            self.meta.codec, self.meta.dataset, self.meta.evaluator, self.meta.criteria
        );
        let _ = writeln!(
            out,
            "{:<8} {:>12} {:>10} {:>9} {:>7}  status",
            "point", unit, "accuracy", "samples", "cached"
        );
        for e in &self.entries {
            let accuracy = e
                .accuracy
                .map(|a| format!("{:.4}", a))
                .unwrap_or_else(|| "-".to_string());
            let status = match &e.status {
                EntryStatus::Valid => "ok".to_string(),
                EntryStatus::Invalid { reason } => format!("invalid: {}", reason),
            };
            let _ = writeln!(
                out,
                "{:<8} {:>12.6} {:>10} {:>9} {:>7}  {}",
                e.label,
                e.rate,
                accuracy,
                format!("{}/{}", e.samples_ok, e.samples_total),
                e.cache_hits,
                status
            );
        }
        out
    }
}

fn short(fp: &str) -> &str {
    fp.get(..12).unwrap_or(fp)
}
